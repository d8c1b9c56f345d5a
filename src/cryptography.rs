use aes::Aes256;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};
use md5::{Digest, Md5};
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ID_SIZE, IV_SIZE, KEY_SIZE, STREAM_BUFFER_SIZE};

/// AES-256 in counter mode with a big-endian counter over the full IV.
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Generates a fresh node identifier: 32 random bytes, lowercase hex.
///
/// The identifier namespaces a node's on-disk content, so two logical
/// owners can coexist under one storage root.
pub fn new_id() -> String {
    let mut buf = [0u8; ID_SIZE];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Hashes a logical key for use on the wire, so peers never see the
/// plaintext key. MD5 here is an identifier, not a security boundary.
pub fn hash_key(key: &str) -> String {
    hex::encode(Md5::digest(key.as_bytes()))
}

/// Generates a random 32-byte symmetric key.
///
/// Every node that exchanges files must hold the same key; it is
/// provisioned out-of-band, and a mismatch decrypts to garbage silently.
pub fn new_encryption_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// Encrypts `src` into `dst`: a fresh random 16-byte IV is written first,
/// followed by the AES-256-CTR ciphertext.
///
/// Returns the total number of bytes written, IV included, so the count
/// matches what [`decrypt_stream`] will consume on the other side.
pub async fn encrypt_stream<R, W>(key: &[u8; KEY_SIZE], src: &mut R, dst: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    dst.write_all(&iv).await?;

    let cipher = Aes256Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(&iv));
    copy_stream(cipher, src, dst).await
}

/// Decrypts `src` into `dst`: reads exactly 16 IV bytes, then streams the
/// rest through the inverse CTR transform.
///
/// Returns the number of bytes consumed from `src`, IV included. This is
/// the wire length, not the plaintext length, mirroring the encrypt side.
pub async fn decrypt_stream<R, W>(key: &[u8; KEY_SIZE], src: &mut R, dst: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut iv = [0u8; IV_SIZE];
    src.read_exact(&mut iv).await?;

    let cipher = Aes256Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(&iv));
    copy_stream(cipher, src, dst).await
}

/// Copies `src` to `dst` through the keystream, 32 KiB at a time.
/// The returned count starts at the IV size already on the wire.
async fn copy_stream<R, W>(mut cipher: Aes256Ctr, src: &mut R, dst: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
    let mut written = IV_SIZE as u64;

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        written += n as u64;
    }

    dst.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================================
    // Identifier and key generation
    // ============================================================================

    #[test]
    fn test_new_id_is_64_hex_chars() {
        let id = new_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_new_id_is_unique() {
        assert_ne!(new_id(), new_id());
    }

    #[test]
    fn test_hash_key_known_vector() {
        // MD5("hello")
        assert_eq!(hash_key("hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_hash_key_empty() {
        // MD5("")
        assert_eq!(hash_key(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_new_encryption_key_is_random() {
        let k1 = new_encryption_key();
        let k2 = new_encryption_key();
        assert_eq!(k1.len(), KEY_SIZE);
        assert_ne!(k1, k2);
    }

    // ============================================================================
    // Stream encryption
    // ============================================================================

    #[tokio::test]
    async fn test_encrypt_decrypt_roundtrip() {
        let key = new_encryption_key();
        let plaintext = b"some payload worth protecting in flight";

        let mut ciphertext = Vec::new();
        let written = encrypt_stream(&key, &mut &plaintext[..], &mut ciphertext)
            .await
            .expect("encryption should succeed");

        assert_eq!(written as usize, plaintext.len() + IV_SIZE);
        assert_eq!(ciphertext.len(), plaintext.len() + IV_SIZE);

        let mut decrypted = Vec::new();
        let consumed = decrypt_stream(&key, &mut &ciphertext[..], &mut decrypted)
            .await
            .expect("decryption should succeed");

        assert_eq!(consumed as usize, plaintext.len() + IV_SIZE);
        assert_eq!(&decrypted[..], plaintext);
    }

    #[tokio::test]
    async fn test_encrypt_empty_payload() {
        let key = new_encryption_key();

        let mut ciphertext = Vec::new();
        let written = encrypt_stream(&key, &mut &b""[..], &mut ciphertext)
            .await
            .expect("encryption should succeed");

        // Only the IV crosses the wire
        assert_eq!(written, IV_SIZE as u64);
        assert_eq!(ciphertext.len(), IV_SIZE);

        let mut decrypted = Vec::new();
        decrypt_stream(&key, &mut &ciphertext[..], &mut decrypted)
            .await
            .expect("decryption should succeed");
        assert!(decrypted.is_empty());
    }

    #[tokio::test]
    async fn test_ciphertext_differs_from_plaintext() {
        let key = new_encryption_key();
        let plaintext = vec![0x41u8; 256];

        let mut ciphertext = Vec::new();
        encrypt_stream(&key, &mut &plaintext[..], &mut ciphertext)
            .await
            .expect("encryption should succeed");

        assert_ne!(&ciphertext[IV_SIZE..], &plaintext[..]);
    }

    #[tokio::test]
    async fn test_same_plaintext_encrypts_differently() {
        // A fresh IV per call means identical inputs never repeat on the wire
        let key = new_encryption_key();
        let plaintext = b"identical input";

        let mut c1 = Vec::new();
        let mut c2 = Vec::new();
        encrypt_stream(&key, &mut &plaintext[..], &mut c1).await.unwrap();
        encrypt_stream(&key, &mut &plaintext[..], &mut c2).await.unwrap();

        assert_ne!(c1, c2);
    }

    #[tokio::test]
    async fn test_wrong_key_yields_garbage() {
        // No authentication tag: a mismatched key fails silently
        let key = new_encryption_key();
        let other = new_encryption_key();
        let plaintext = vec![0x5au8; 64];

        let mut ciphertext = Vec::new();
        encrypt_stream(&key, &mut &plaintext[..], &mut ciphertext).await.unwrap();

        let mut decrypted = Vec::new();
        decrypt_stream(&other, &mut &ciphertext[..], &mut decrypted).await.unwrap();

        assert_eq!(decrypted.len(), plaintext.len());
        assert_ne!(decrypted, plaintext);
    }

    #[tokio::test]
    async fn test_roundtrip_across_buffer_boundary() {
        let key = new_encryption_key();
        let plaintext: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let mut ciphertext = Vec::new();
        encrypt_stream(&key, &mut &plaintext[..], &mut ciphertext).await.unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + IV_SIZE);

        let mut decrypted = Vec::new();
        decrypt_stream(&key, &mut &ciphertext[..], &mut decrypted).await.unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[tokio::test]
    async fn test_decrypt_truncated_input_fails() {
        let key = new_encryption_key();

        // Shorter than one IV: read_exact must error
        let mut decrypted = Vec::new();
        let result = decrypt_stream(&key, &mut &[0u8; 7][..], &mut decrypted).await;
        assert!(result.is_err());
    }
}
