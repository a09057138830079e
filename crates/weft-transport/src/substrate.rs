//! The substrate trait the protocol core drives.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;

/// Substrate-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    /// I/O error from the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The substrate has been shut down.
    #[error("substrate closed")]
    Closed,

    /// Binding the local endpoint failed.
    #[error("failed to bind: {0}")]
    BindFailed(String),
}

/// Result type for substrate operations.
pub type SubstrateResult<T> = Result<T, SubstrateError>;

/// An unreliable datagram endpoint.
///
/// Datagrams may be dropped, duplicated, or reordered; the protocol layers
/// above assume nothing else. One substrate instance corresponds to one
/// bound local endpoint.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Send one datagram to `addr`.
    ///
    /// # Errors
    ///
    /// Fails on local I/O errors only; a lost datagram is not an error.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> SubstrateResult<()>;

    /// Receive one datagram, filling `buf`. Returns the length and sender.
    ///
    /// # Errors
    ///
    /// Fails if the substrate is closed or the socket errors.
    async fn recv_from(&self, buf: &mut [u8]) -> SubstrateResult<(usize, SocketAddr)>;

    /// The local endpoint this substrate is bound to.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot report its address.
    fn local_addr(&self) -> SubstrateResult<SocketAddr>;
}
