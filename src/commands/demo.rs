use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::error;
use tokio::io::AsyncReadExt;
use tokio::time::sleep;

use crate::cryptography;
use crate::server::{FileServer, FileServerOpts};
use crate::store::cas_path_transform;
use crate::transport::{nop_handshake, TcpTransport, TcpTransportOpts};
use crate::KEY_SIZE;

use super::serve::sanitize_addr;

fn make_server(listen_addr: &str, enc_key: [u8; KEY_SIZE], bootstrap: &[&str]) -> Arc<FileServer> {
    let transport = TcpTransport::new(TcpTransportOpts {
        listen_addr: listen_addr.to_string(),
        handshake: nop_handshake,
    });

    FileServer::new(
        FileServerOpts {
            id: String::new(),
            enc_key,
            storage_root: PathBuf::from(format!("{}_store", sanitize_addr(listen_addr))),
            path_transform: cas_path_transform,
            bootstrap_nodes: bootstrap.iter().map(|s| s.to_string()).collect(),
        },
        transport,
    )
}

fn spawn_server(server: &Arc<FileServer>) {
    let runner = Arc::clone(server);
    tokio::spawn(async move {
        if let Err(e) = runner.start().await {
            error!("server error: {}", e);
        }
    });
}

/// Three in-process nodes on localhost: the third bootstraps into the
/// first two, then stores, locally deletes, and re-fetches a handful of
/// keys over the network.
pub async fn run() -> Result<(), Box<dyn Error>> {
    let enc_key = cryptography::new_encryption_key();

    let s1 = make_server("127.0.0.1:3000", enc_key, &[]);
    let s2 = make_server("127.0.0.1:7000", enc_key, &[]);
    let s3 = make_server(
        "127.0.0.1:5000",
        enc_key,
        &["127.0.0.1:3000", "127.0.0.1:7000"],
    );

    spawn_server(&s1);
    sleep(Duration::from_millis(500)).await;

    spawn_server(&s2);
    sleep(Duration::from_millis(500)).await;

    spawn_server(&s3);
    sleep(Duration::from_secs(2)).await;

    for i in 0..5 {
        let key = format!("picture_{}.png", i);
        let data = b"my big data file here!";

        // Store on the network, purge the local copy, then pull it back
        // from the peers
        s3.store(&key, &mut &data[..]).await?;
        s3.local_store().delete(s3.id(), &key).await?;

        let (_, mut file) = s3.get(&key).await?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).await?;

        println!("{}", String::from_utf8_lossy(&contents));
    }

    s1.stop();
    s2.stop();
    s3.stop();

    Ok(())
}
