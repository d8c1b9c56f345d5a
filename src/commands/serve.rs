use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use log::info;

use crate::cryptography;
use crate::server::{FileServer, FileServerOpts};
use crate::store::cas_path_transform;
use crate::transport::{nop_handshake, TcpTransport, TcpTransportOpts};
use crate::KEY_SIZE;

/// Turns a listen address into a directory-safe name, the default
/// storage-root naming scheme.
pub fn sanitize_addr(addr: &str) -> String {
    addr.replace(':', "")
}

/// Runs one storage node until ctrl-c.
pub async fn run(
    listen: String,
    bootstrap: Vec<String>,
    root: Option<PathBuf>,
    key: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let enc_key = match key {
        Some(hex_key) => parse_key(&hex_key)?,
        None => cryptography::new_encryption_key(),
    };

    let storage_root =
        root.unwrap_or_else(|| PathBuf::from(format!("{}_store", sanitize_addr(&listen))));

    let transport = TcpTransport::new(TcpTransportOpts {
        listen_addr: listen,
        handshake: nop_handshake,
    });

    let server = FileServer::new(
        FileServerOpts {
            id: String::new(),
            enc_key,
            storage_root,
            path_transform: cas_path_transform,
            bootstrap_nodes: bootstrap,
        },
        transport,
    );

    let runner = Arc::clone(&server);
    let handle = tokio::spawn(async move { runner.start().await });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.stop();
    handle.await??;

    Ok(())
}

fn parse_key(hex_key: &str) -> Result<[u8; KEY_SIZE], Box<dyn Error>> {
    let bytes = hex::decode(hex_key)?;
    let key: [u8; KEY_SIZE] = bytes.as_slice().try_into().map_err(|_| {
        format!(
            "encryption key must be {} bytes, got {}",
            KEY_SIZE,
            bytes.len()
        )
    })?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_addr() {
        assert_eq!(sanitize_addr("127.0.0.1:3000"), "127.0.0.13000");
        assert_eq!(sanitize_addr(":5000"), "5000");
    }

    #[test]
    fn test_parse_key_roundtrip() {
        let key = cryptography::new_encryption_key();
        assert_eq!(parse_key(&hex::encode(key)).unwrap(), key);
    }

    #[test]
    fn test_parse_key_rejects_wrong_length() {
        assert!(parse_key("abcd").is_err());
        assert!(parse_key("not hex at all").is_err());
    }
}
