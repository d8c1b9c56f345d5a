use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncRead;

use crate::{cryptography, KEY_SIZE};

pub const DEFAULT_STORAGE_ROOT: &str = "distore_data";

const PATH_SEGMENT_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found on disk")]
    NotFound,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Where an object lives relative to its owner's directory: a nested
/// directory path plus the leaf filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    pub pathname: String,
    pub filename: String,
}

impl PathKey {
    /// The first directory segment, the unit [`Store::delete`] removes.
    pub fn first_segment(&self) -> &str {
        self.pathname.split('/').next().unwrap_or("")
    }

    pub fn full_path(&self) -> PathBuf {
        Path::new(&self.pathname).join(&self.filename)
    }
}

pub type PathTransformFn = fn(&str) -> PathKey;

/// Content-addressed layout: SHA-1 of the key, hex encoded, split into
/// eight 5-character directory segments with the full digest as filename.
/// Pure; keys containing path separators are harmless because only the
/// digest reaches the filesystem.
pub fn cas_path_transform(key: &str) -> PathKey {
    let hash = hex::encode(Sha1::digest(key.as_bytes()));

    let segments: Vec<&str> = (0..hash.len())
        .step_by(PATH_SEGMENT_LEN)
        .map(|i| &hash[i..i + PATH_SEGMENT_LEN])
        .collect();

    PathKey {
        pathname: segments.join("/"),
        filename: hash,
    }
}

/// Trivial layout that uses the key verbatim as both directory and file.
pub fn identity_path_transform(key: &str) -> PathKey {
    PathKey {
        pathname: key.to_string(),
        filename: key.to_string(),
    }
}

#[derive(Clone)]
pub struct StoreOpts {
    pub root: PathBuf,
    pub path_transform: PathTransformFn,
}

impl Default for StoreOpts {
    fn default() -> Self {
        StoreOpts {
            root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            path_transform: cas_path_transform,
        }
    }
}

/// On-disk object store keyed by `(owner id, key)`.
///
/// Stateless apart from its options: concurrent calls on disjoint keys do
/// not interfere, and concurrent writers of the same key race at the byte
/// level (last writer wins).
pub struct Store {
    opts: StoreOpts,
}

impl Store {
    pub fn new(opts: StoreOpts) -> Self {
        Store { opts }
    }

    pub fn root(&self) -> &Path {
        &self.opts.root
    }

    fn object_dir(&self, id: &str, pk: &PathKey) -> PathBuf {
        self.opts.root.join(id).join(&pk.pathname)
    }

    fn object_path(&self, id: &str, pk: &PathKey) -> PathBuf {
        self.opts.root.join(id).join(pk.full_path())
    }

    /// Whether an object exists for `(id, key)`. A stat failure other than
    /// not-found reports `true` ("may exist") rather than propagating.
    pub async fn has(&self, id: &str, key: &str) -> bool {
        let pk = (self.opts.path_transform)(key);
        match fs::metadata(self.object_path(id, &pk)).await {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(_) => true,
        }
    }

    /// Opens an object for reading, returning its on-disk size and the
    /// open file. The caller owns the handle.
    pub async fn read(&self, id: &str, key: &str) -> Result<(u64, File), StoreError> {
        let pk = (self.opts.path_transform)(key);
        let file = File::open(self.object_path(id, &pk)).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound
            } else {
                StoreError::Io(e)
            }
        })?;
        let size = file.metadata().await?.len();
        Ok((size, file))
    }

    /// Writes `src` to the object for `(id, key)`, creating missing parent
    /// directories and truncating any previous content. Returns the number
    /// of bytes written.
    pub async fn write<R>(&self, id: &str, key: &str, src: &mut R) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = self.open_for_writing(id, key).await?;
        Ok(tokio::io::copy(src, &mut file).await?)
    }

    /// Like [`Store::write`], but decrypts `src` in flight: the first 16
    /// bytes are the IV, the rest AES-256-CTR ciphertext. The returned
    /// count is the bytes consumed from `src` (IV included), not the
    /// plaintext size on disk.
    pub async fn write_decrypt<R>(
        &self,
        enc_key: &[u8; KEY_SIZE],
        id: &str,
        key: &str,
        src: &mut R,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = self.open_for_writing(id, key).await?;
        Ok(cryptography::decrypt_stream(enc_key, src, &mut file).await?)
    }

    /// Removes the object's entire first-segment directory under the
    /// owner. Coarse on purpose: any sibling object sharing the same
    /// 5-character hash prefix goes with it. Missing paths are not errors.
    pub async fn delete(&self, id: &str, key: &str) -> Result<(), StoreError> {
        let pk = (self.opts.path_transform)(key);
        let prefix = self.opts.root.join(id).join(pk.first_segment());

        match fs::remove_dir_all(&prefix).await {
            Ok(()) => {
                debug!("deleted [{}] from disk", pk.filename);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes everything under the storage root, all owners included.
    pub async fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.opts.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_for_writing(&self, id: &str, key: &str) -> Result<File, StoreError> {
        let pk = (self.opts.path_transform)(key);
        fs::create_dir_all(self.object_dir(id, &pk)).await?;
        Ok(File::create(self.object_path(id, &pk)).await?)
    }
}
