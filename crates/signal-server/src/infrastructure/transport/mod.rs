//! Listening-socket abstraction for the session loop.
//!
//! The production implementation binds real TCP sockets; tests use
//! [`mock::MemoryTransport`], which hands the session loop in-memory duplex
//! streams and can be told to fail binds or accepts.
//!
//! # Testability
//!
//! The session loop only ever sees [`Transport`] and [`Listener`], so every
//! recovery path (bind failure, accept failure, reset, kill) can be driven
//! from a test without touching the network.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod mock;
pub mod tcp;

pub use mock::MemoryTransport;
pub use tcp::TcpTransport;

/// Creates listening endpoints.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Listener: Listener;

    /// Binds a new listening endpoint on `addr`.
    async fn bind(&self, addr: SocketAddr) -> io::Result<Self::Listener>;
}

/// A bound listening endpoint.  Dropping it closes the endpoint.
#[async_trait]
pub trait Listener: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Waits for the next signal to connect.  Returns the stream and a
    /// printable peer description for logging.
    async fn accept(&mut self) -> io::Result<(Self::Stream, String)>;

    /// The address the endpoint is actually bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}
