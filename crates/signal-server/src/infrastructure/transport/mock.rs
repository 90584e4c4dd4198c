//! In-memory transport for tests.
//!
//! Lets tests play the signal without opening sockets: [`MemoryTransport::connect`]
//! hands the session loop one end of a `tokio::io::duplex` pipe and returns
//! the other end to the test.  Binds and accepts can be made to fail to
//! exercise the listener recovery paths.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};

use super::{Listener, Transport};

/// Buffer size of each in-memory connection, comfortably above any frame.
const PIPE_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Inner {
    connect_tx: mpsc::UnboundedSender<DuplexStream>,
    incoming: Arc<Mutex<mpsc::UnboundedReceiver<DuplexStream>>>,
    binds: AtomicUsize,
    failing_binds: AtomicUsize,
    accepts: AtomicUsize,
    failing_accepts: AtomicUsize,
    live_listeners: AtomicUsize,
}

/// A [`Transport`] whose connections are in-memory pipes.
///
/// Cloning shares the same state, so a test keeps one clone to connect
/// "devices" while the server owns another.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (connect_tx, incoming) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                connect_tx,
                incoming: Arc::new(Mutex::new(incoming)),
                binds: AtomicUsize::new(0),
                failing_binds: AtomicUsize::new(0),
                accepts: AtomicUsize::new(0),
                failing_accepts: AtomicUsize::new(0),
                live_listeners: AtomicUsize::new(0),
            }),
        }
    }

    /// Opens a connection as the signal would.  Returns the signal's end.
    ///
    /// The connection waits until a listener accepts it.
    pub fn connect(&self) -> DuplexStream {
        let (server_end, device_end) = tokio::io::duplex(PIPE_CAPACITY);
        // The receiver lives as long as `inner`, so this cannot fail.
        let _ = self.inner.connect_tx.send(server_end);
        device_end
    }

    /// Makes the next `count` binds fail with `AddrInUse`.
    pub fn fail_next_binds(&self, count: usize) {
        self.inner.failing_binds.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` accepts fail.  A failed accept leaves pending
    /// connections queued for the next listener.
    pub fn fail_next_accepts(&self, count: usize) {
        self.inner.failing_accepts.store(count, Ordering::SeqCst);
    }

    /// Total accept calls so far, failed ones included.
    pub fn accept_attempts(&self) -> usize {
        self.inner.accepts.load(Ordering::SeqCst)
    }

    /// Total bind attempts so far, failed ones included.
    pub fn bind_attempts(&self) -> usize {
        self.inner.binds.load(Ordering::SeqCst)
    }

    /// Whether a listening endpoint currently exists.
    pub fn is_listening(&self) -> bool {
        self.inner.live_listeners.load(Ordering::SeqCst) > 0
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Listener = MemoryListener;

    async fn bind(&self, addr: SocketAddr) -> io::Result<MemoryListener> {
        self.inner.binds.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.inner.failing_binds) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("simulated bind failure on {addr}"),
            ));
        }

        self.inner.live_listeners.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryListener {
            addr,
            inner: Arc::clone(&self.inner),
        })
    }
}

/// Listening endpoint handed out by [`MemoryTransport`].
#[derive(Debug)]
pub struct MemoryListener {
    addr: SocketAddr,
    inner: Arc<Inner>,
}

#[async_trait]
impl Listener for MemoryListener {
    type Stream = DuplexStream;

    async fn accept(&mut self) -> io::Result<(DuplexStream, String)> {
        self.inner.accepts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.inner.failing_accepts) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("simulated accept failure on {}", self.addr),
            ));
        }

        let incoming = Arc::clone(&self.inner.incoming);
        let mut rx = incoming.lock().await;
        rx.recv()
            .await
            .map(|stream| (stream, "memory".to_string()))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport dropped"))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.inner.live_listeners.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Consumes one unit of an injected-failure budget, if any is left.
fn take_one(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn addr() -> SocketAddr {
        "127.0.0.1:19100".parse().unwrap()
    }

    #[tokio::test]
    async fn test_connect_then_accept_links_both_ends() {
        // Arrange
        let transport = MemoryTransport::new();
        let mut listener = transport.bind(addr()).await.unwrap();
        let mut device = transport.connect();

        // Act
        let (mut server, peer) = listener.accept().await.unwrap();
        device.write_all(b"ACK\0").await.unwrap();

        // Assert
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ACK\0");
        assert_eq!(peer, "memory");
    }

    #[tokio::test]
    async fn test_fail_next_binds_fails_exactly_that_many() {
        // Arrange
        let transport = MemoryTransport::new();
        transport.fail_next_binds(2);

        // Act
        let first = transport.bind(addr()).await;
        let second = transport.bind(addr()).await;
        let third = transport.bind(addr()).await;

        // Assert
        assert_eq!(first.unwrap_err().kind(), io::ErrorKind::AddrInUse);
        assert!(second.is_err());
        assert!(third.is_ok());
        assert_eq!(transport.bind_attempts(), 3);
    }

    #[tokio::test]
    async fn test_failed_accept_keeps_pending_connection() {
        // Arrange
        let transport = MemoryTransport::new();
        transport.fail_next_accepts(1);
        let mut device = transport.connect();

        // Act
        let mut first = transport.bind(addr()).await.unwrap();
        let failed = first.accept().await;
        drop(first);
        let mut second = transport.bind(addr()).await.unwrap();
        let (mut server, _) = second.accept().await.unwrap();

        // Assert: the connection queued before the failure is still served
        assert_eq!(failed.unwrap_err().kind(), io::ErrorKind::Other);
        assert_eq!(transport.accept_attempts(), 2);
        device.write_all(b"ACK\0").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ACK\0");
    }

    #[tokio::test]
    async fn test_dropping_listener_stops_listening() {
        let transport = MemoryTransport::new();
        let listener = transport.bind(addr()).await.unwrap();
        assert!(transport.is_listening());

        drop(listener);

        assert!(!transport.is_listening());
    }

    #[tokio::test]
    async fn test_local_addr_echoes_bind_addr() {
        let transport = MemoryTransport::new();
        let listener = transport.bind(addr()).await.unwrap();
        assert_eq!(listener.local_addr().unwrap(), addr());
    }
}
