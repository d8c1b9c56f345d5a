use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::sleep;

use crate::cryptography::{self, hash_key};
use crate::message::{Message, Rpc, INCOMING_MESSAGE, INCOMING_STREAM};
use crate::store::{self, PathTransformFn, Store, StoreError, StoreOpts};
use crate::transport::{FanoutWriter, Peer, TcpTransport, TransportError};
use crate::{IV_SIZE, KEY_SIZE};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("message encoding failed: {0}")]
    Codec(#[from] bincode::Error),
    #[error("peer {0} not in the peer table")]
    UnknownPeer(SocketAddr),
    #[error("cannot serve {0}: not on local disk")]
    MissingObject(String),
    #[error("server is already running")]
    AlreadyRunning,
}

pub struct FileServerOpts {
    /// Node identifier; generated when empty.
    pub id: String,
    /// Shared symmetric key for all stream encryption and decryption.
    pub enc_key: [u8; KEY_SIZE],
    pub storage_root: PathBuf,
    pub path_transform: PathTransformFn,
    /// Addresses dialed once at startup; empty entries are skipped.
    pub bootstrap_nodes: Vec<String>,
}

impl Default for FileServerOpts {
    fn default() -> Self {
        FileServerOpts {
            id: String::new(),
            enc_key: cryptography::new_encryption_key(),
            storage_root: PathBuf::from(store::DEFAULT_STORAGE_ROOT),
            path_transform: store::cas_path_transform,
            bootstrap_nodes: Vec::new(),
        }
    }
}

/// Coordinates the local store and the peer transport: keeps the peer
/// table, broadcasts control messages, and moves file streams between
/// disk and the network.
pub struct FileServer {
    id: String,
    enc_key: [u8; KEY_SIZE],
    bootstrap_nodes: Vec<String>,
    transport: Arc<TcpTransport>,
    store: Store,
    peers: Mutex<HashMap<SocketAddr, Peer>>,
    quit: Notify,
}

impl FileServer {
    pub fn new(opts: FileServerOpts, transport: Arc<TcpTransport>) -> Arc<FileServer> {
        let id = if opts.id.is_empty() {
            cryptography::new_id()
        } else {
            opts.id
        };

        let server = Arc::new(FileServer {
            id,
            enc_key: opts.enc_key,
            bootstrap_nodes: opts.bootstrap_nodes,
            transport,
            store: Store::new(StoreOpts {
                root: opts.storage_root,
                path_transform: opts.path_transform,
            }),
            peers: Mutex::new(HashMap::new()),
            quit: Notify::new(),
        });

        let admitted = Arc::downgrade(&server);
        server.transport.set_on_peer(Box::new(move |peer| match admitted.upgrade() {
            Some(server) => {
                server.on_peer(peer);
                Ok(())
            }
            None => Err(TransportError::Rejected("server shut down".to_string())),
        }));

        server
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_store(&self) -> &Store {
        &self.store
    }

    pub fn transport(&self) -> &Arc<TcpTransport> {
        &self.transport
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("peer table lock").len()
    }

    /// Stores `key` locally under this node's id, announces it to every
    /// peer, then streams the encrypted payload to all of them.
    pub async fn store<R>(&self, key: &str, src: &mut R) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin,
    {
        // Capture the payload so it can be replayed to the peers after the
        // local write
        let mut payload = Vec::new();
        src.read_to_end(&mut payload).await?;

        let size = self.store.write(&self.id, key, &mut payload.as_slice()).await?;

        let msg = Message::StoreFile {
            id: self.id.clone(),
            key: hash_key(key),
            // The stream leads with the IV
            size: size as i64 + IV_SIZE as i64,
        };
        self.broadcast(&msg).await?;

        // Give the receivers time to move their read loops into stream mode
        sleep(Duration::from_millis(5)).await;

        let peers = self.peer_list();
        let mut sinks = Vec::with_capacity(peers.len());
        for peer in &peers {
            sinks.push(peer.lock_writer().await);
        }

        let mut fanout = FanoutWriter::new(sinks);
        fanout.write_all(&[INCOMING_STREAM]).await?;
        let sent =
            cryptography::encrypt_stream(&self.enc_key, &mut payload.as_slice(), &mut fanout)
                .await?;

        info!(
            "[{}] stored {} ({} bytes on disk, {} bytes to {} peers)",
            self.transport.addr(),
            key,
            size,
            sent,
            peers.len()
        );
        Ok(())
    }

    /// Fetches `key`, serving from local disk when present and otherwise
    /// pulling it from the network.
    ///
    /// The network path requests the object from every peer and then
    /// drains one size-prefixed encrypted stream per peer. A peer that
    /// never answers blocks the fan-in indefinitely; there is no
    /// per-peer timeout.
    pub async fn get(&self, key: &str) -> Result<(u64, File), ServerError> {
        if self.store.has(&self.id, key).await {
            info!("[{}] serving {} from local disk", self.transport.addr(), key);
            return Ok(self.store.read(&self.id, key).await?);
        }

        info!(
            "[{}] {} not on local disk, fetching from network",
            self.transport.addr(),
            key
        );

        let msg = Message::GetFile {
            id: self.id.clone(),
            key: hash_key(key),
        };
        self.broadcast(&msg).await?;

        // Let the peers push their answers before draining
        sleep(Duration::from_millis(500)).await;

        for peer in self.peer_list() {
            let mut reader = peer.lock_reader().await;
            let size = reader.read_i64_le().await?;
            let n = {
                let mut limited = (&mut reader).take(size as u64);
                self.store
                    .write_decrypt(&self.enc_key, &self.id, key, &mut limited)
                    .await?
            };
            drop(reader);
            peer.close_stream();

            info!(
                "[{}] received {} bytes over the network from {}",
                self.transport.addr(),
                n,
                peer.remote_addr()
            );
        }

        Ok(self.store.read(&self.id, key).await?)
    }

    /// Binds the transport, dials the bootstrap nodes, and runs the main
    /// loop until [`FileServer::stop`] is called or the transport dies.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        info!("[{}] starting file server", self.transport.addr());

        let mut rpc_rx = self.transport.consume().ok_or(ServerError::AlreadyRunning)?;
        self.transport.listen_and_accept().await?;
        self.bootstrap_network();

        loop {
            tokio::select! {
                _ = self.quit.notified() => break,
                rpc = rpc_rx.recv() => match rpc {
                    Some(rpc) => self.dispatch(rpc).await,
                    None => break,
                },
            }
        }

        info!("[{}] file server stopped", self.transport.addr());
        self.transport.close();
        Ok(())
    }

    pub fn stop(&self) {
        self.quit.notify_one();
    }

    fn bootstrap_network(&self) {
        for addr in &self.bootstrap_nodes {
            if addr.is_empty() {
                continue;
            }

            let transport = Arc::clone(&self.transport);
            let addr = addr.clone();
            tokio::spawn(async move {
                info!("[{}] attempting to connect with remote {}", transport.addr(), addr);
                if let Err(e) = transport.dial(&addr).await {
                    error!("dial error: {}", e);
                }
            });
        }
    }

    async fn dispatch(&self, rpc: Rpc) {
        match Message::decode(&rpc.payload) {
            Ok(msg) => {
                if let Err(e) = self.handle_message(rpc.from, msg).await {
                    error!("[{}] handle message error: {}", self.transport.addr(), e);
                }
            }
            Err(e) => error!("[{}] decoding error: {}", self.transport.addr(), e),
        }
    }

    async fn handle_message(&self, from: SocketAddr, msg: Message) -> Result<(), ServerError> {
        match msg {
            Message::StoreFile { id, key, size } => {
                self.handle_store_file(from, id, key, size).await
            }
            Message::GetFile { id, key } => self.handle_get_file(from, id, key).await,
        }
    }

    /// A peer announced an object: drain exactly `size` raw bytes from its
    /// socket onto disk under the announcing owner and hashed key. What
    /// arrives is IV plus ciphertext and is stored verbatim.
    async fn handle_store_file(
        &self,
        from: SocketAddr,
        id: String,
        key: String,
        size: i64,
    ) -> Result<(), ServerError> {
        let peer = self.lookup_peer(from)?;

        let mut reader = peer.lock_reader().await;
        let n = {
            let mut limited = (&mut reader).take(size as u64);
            self.store.write(&id, &key, &mut limited).await?
        };
        drop(reader);
        peer.close_stream();

        info!("[{}] written {} bytes to disk", self.transport.addr(), n);
        Ok(())
    }

    /// A peer asked for an object: push it back on the same connection as
    /// a stream marker, an 8-byte little-endian size, and the raw file.
    async fn handle_get_file(
        &self,
        from: SocketAddr,
        id: String,
        key: String,
    ) -> Result<(), ServerError> {
        if !self.store.has(&id, &key).await {
            return Err(ServerError::MissingObject(key));
        }

        info!("[{}] serving {} over the network", self.transport.addr(), key);

        let (size, mut file) = self.store.read(&id, &key).await?;
        let peer = self.lookup_peer(from)?;

        let mut writer = peer.lock_writer().await;
        writer.write_all(&[INCOMING_STREAM]).await?;
        writer.write_i64_le(size as i64).await?;
        let n = tokio::io::copy(&mut file, &mut writer).await?;
        writer.flush().await?;

        info!(
            "[{}] written {} bytes over the network to {}",
            self.transport.addr(),
            n,
            from
        );
        Ok(())
    }

    fn on_peer(&self, peer: Peer) {
        let addr = peer.remote_addr();
        self.peers.lock().expect("peer table lock").insert(addr, peer);
        info!("[{}] connected with remote {}", self.transport.addr(), addr);
    }

    fn peer_list(&self) -> Vec<Peer> {
        self.peers
            .lock()
            .expect("peer table lock")
            .values()
            .cloned()
            .collect()
    }

    fn lookup_peer(&self, addr: SocketAddr) -> Result<Peer, ServerError> {
        self.peers
            .lock()
            .expect("peer table lock")
            .get(&addr)
            .cloned()
            .ok_or(ServerError::UnknownPeer(addr))
    }

    async fn broadcast(&self, msg: &Message) -> Result<(), ServerError> {
        let encoded = msg.encode()?;
        for peer in self.peer_list() {
            peer.send(&[INCOMING_MESSAGE]).await?;
            peer.send(&encoded).await?;
        }
        Ok(())
    }
}
