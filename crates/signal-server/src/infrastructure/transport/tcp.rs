//! TCP implementation of [`Transport`] backed by `tokio::net`.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

use super::{Listener, Transport};

/// Binds real TCP listeners.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    type Listener = TcpListener;

    async fn bind(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        TcpListener::bind(addr).await
    }
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, String)> {
        let (stream, peer) = TcpListener::accept(self).await?;
        // Commands are a few bytes each and must reach the signal immediately.
        // Without the option the session still works, only with Nagle delays.
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to disable Nagle on connection from {peer}: {e}");
        }
        Ok((stream, peer.to_string()))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}
