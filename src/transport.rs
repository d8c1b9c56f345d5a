use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};

use log::{debug, error, info};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify, OwnedMutexGuard};

use crate::message::{self, Frame, Rpc};
use crate::RPC_CHANNEL_CAPACITY;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("peer rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type HandshakeFn = fn(&Peer) -> Result<(), TransportError>;

pub fn nop_handshake(_: &Peer) -> Result<(), TransportError> {
    Ok(())
}

type OnPeerFn = Box<dyn Fn(Peer) -> Result<(), TransportError> + Send + Sync>;

/// Handle to one established connection, cheap to clone.
///
/// Both halves of the socket sit behind async mutexes. The connection's
/// read loop keeps the reader locked whenever it owns the input; an
/// application handler may only take it while the loop is parked in
/// stream mode, and hands it back through [`Peer::close_stream`].
#[derive(Clone)]
pub struct Peer {
    addr: SocketAddr,
    outbound: bool,
    reader: Arc<AsyncMutex<OwnedReadHalf>>,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    stream_done: Arc<Notify>,
}

impl Peer {
    fn new(stream: TcpStream, addr: SocketAddr, outbound: bool) -> Peer {
        let (read_half, write_half) = stream.into_split();
        Peer {
            addr,
            outbound,
            reader: Arc::new(AsyncMutex::new(read_half)),
            writer: Arc::new(AsyncMutex::new(write_half)),
            stream_done: Arc::new(Notify::new()),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether we dialed this connection (as opposed to accepting it).
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub async fn lock_reader(&self) -> PeerReader {
        PeerReader(self.reader.clone().lock_owned().await)
    }

    pub async fn lock_writer(&self) -> PeerWriter {
        PeerWriter(self.writer.clone().lock_owned().await)
    }

    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.lock_writer().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Releases the stream latch, resuming the connection's read loop.
    /// The release is remembered if the loop has not parked yet.
    pub fn close_stream(&self) {
        self.stream_done.notify_one();
    }

    async fn wait_stream_done(&self) {
        self.stream_done.notified().await;
    }
}

/// Exclusive read access to a peer's socket.
pub struct PeerReader(OwnedMutexGuard<OwnedReadHalf>);

impl AsyncRead for PeerReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.0).poll_read(cx, buf)
    }
}

/// Exclusive write access to a peer's socket.
pub struct PeerWriter(OwnedMutexGuard<OwnedWriteHalf>);

impl AsyncWrite for PeerWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut *self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut *self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut *self.0).poll_shutdown(cx)
    }
}

/// Writer that duplicates every byte to all of its sinks, used to
/// broadcast one encrypted stream to every connected peer.
///
/// Writes go to the sinks sequentially; a caller that sees `Pending` must
/// re-present the same buffer, which `write_all` and `copy` both do.
pub struct FanoutWriter<W> {
    sinks: Vec<W>,
    current: usize,
    offset: usize,
}

impl<W: AsyncWrite + Unpin> FanoutWriter<W> {
    pub fn new(sinks: Vec<W>) -> FanoutWriter<W> {
        FanoutWriter {
            sinks,
            current: 0,
            offset: 0,
        }
    }

    pub fn into_inner(self) -> Vec<W> {
        self.sinks
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for FanoutWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        let this = self.get_mut();

        while this.current < this.sinks.len() {
            while this.offset < buf.len() {
                match Pin::new(&mut this.sinks[this.current]).poll_write(cx, &buf[this.offset..]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::ErrorKind::WriteZero.into()))
                    }
                    Poll::Ready(Ok(n)) => this.offset += n,
                    Poll::Ready(Err(e)) => {
                        this.current = 0;
                        this.offset = 0;
                        return Poll::Ready(Err(e));
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }
            this.current += 1;
            this.offset = 0;
        }

        this.current = 0;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        for sink in &mut this.sinks {
            match Pin::new(sink).poll_flush(cx) {
                Poll::Ready(Ok(())) => {}
                other => return other,
            }
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();
        for sink in &mut this.sinks {
            match Pin::new(sink).poll_shutdown(cx) {
                Poll::Ready(Ok(())) => {}
                other => return other,
            }
        }
        Poll::Ready(Ok(()))
    }
}

pub struct TcpTransportOpts {
    pub listen_addr: String,
    pub handshake: HandshakeFn,
}

/// TCP transport: owns the listener, dials peers, runs one read loop per
/// connection, and multiplexes decoded control messages onto a single
/// bounded consumer channel.
pub struct TcpTransport {
    opts: TcpTransportOpts,
    rpc_tx: mpsc::Sender<Rpc>,
    rpc_rx: Mutex<Option<mpsc::Receiver<Rpc>>>,
    on_peer: OnceLock<OnPeerFn>,
    local_addr: OnceLock<SocketAddr>,
    shutdown: Notify,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Arc<TcpTransport> {
        let (rpc_tx, rpc_rx) = mpsc::channel(RPC_CHANNEL_CAPACITY);
        Arc::new(TcpTransport {
            opts,
            rpc_tx,
            rpc_rx: Mutex::new(Some(rpc_rx)),
            on_peer: OnceLock::new(),
            local_addr: OnceLock::new(),
            shutdown: Notify::new(),
        })
    }

    /// The configured listen address.
    pub fn addr(&self) -> &str {
        &self.opts.listen_addr
    }

    /// The address actually bound, available once listening (relevant for
    /// `:0` listeners).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Installs the peer-admission callback. Takes effect for connections
    /// established afterwards; a second installation is ignored.
    pub fn set_on_peer(&self, callback: OnPeerFn) {
        let _ = self.on_peer.set(callback);
    }

    /// Takes the sole receiver of inbound control messages. Yields `None`
    /// after the first call.
    pub fn consume(&self) -> Option<mpsc::Receiver<Rpc>> {
        self.rpc_rx.lock().expect("rpc receiver lock").take()
    }

    /// Binds the listener and spawns the accept loop. Bind errors are
    /// returned; accept errors are logged and the loop continues.
    pub async fn listen_and_accept(self: &Arc<Self>) -> io::Result<()> {
        let listener = TcpListener::bind(self.opts.listen_addr.as_str()).await?;
        let bound = listener.local_addr()?;
        let _ = self.local_addr.set(bound);

        info!("transport listening on {}", bound);

        let transport = Arc::clone(self);
        tokio::spawn(async move { transport.accept_loop(listener).await });

        Ok(())
    }

    /// Dials a remote node and spawns its connection handler.
    pub async fn dial(self: &Arc<Self>, addr: &str) -> io::Result<()> {
        let stream = TcpStream::connect(addr).await?;

        let transport = Arc::clone(self);
        tokio::spawn(async move { transport.handle_conn(stream, true).await });

        Ok(())
    }

    /// Stops the accept loop and drops the listener. Connections already
    /// established keep running until their reads fail.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    debug!("[{}] accept loop stopped", self.opts.listen_addr);
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let transport = Arc::clone(&self);
                        tokio::spawn(async move { transport.handle_conn(stream, false).await });
                    }
                    Err(e) => error!("tcp accept error: {}", e),
                }
            }
        }
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, outbound: bool) {
        let addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                debug!("dropping connection without a remote address: {}", e);
                return;
            }
        };

        let peer = Peer::new(stream, addr, outbound);

        if let Err(e) = (self.opts.handshake)(&peer) {
            debug!("dropping peer {}: {}", addr, e);
            return;
        }

        if let Some(on_peer) = self.on_peer.get() {
            if let Err(e) = on_peer(peer.clone()) {
                debug!("dropping peer {}: {}", addr, e);
                return;
            }
        }

        // The reader stays locked across decode and control dispatch, so a
        // handler can take the socket only while this loop is parked in
        // stream mode. Exactly one reader owns the peer's input at any time.
        loop {
            let mut reader = peer.lock_reader().await;
            loop {
                match message::decode_frame(&mut reader).await {
                    Ok(Some(Frame::Stream)) => {
                        debug!("[{}] incoming stream, pausing read loop", addr);
                        break;
                    }
                    Ok(Some(Frame::Message(payload))) => {
                        if self.rpc_tx.send(Rpc { from: addr, payload }).await.is_err() {
                            debug!("[{}] rpc channel closed, dropping connection", addr);
                            return;
                        }
                    }
                    Ok(None) => {
                        debug!("[{}] peer closed the connection", addr);
                        return;
                    }
                    Err(e) => {
                        debug!("dropping peer {}: {}", addr, e);
                        return;
                    }
                }
            }

            drop(reader);
            peer.wait_stream_done().await;
            debug!("[{}] stream closed, resuming read loop", addr);
        }
    }
}
