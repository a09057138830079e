//! UDP substrate.
//!
//! Sockets are created through socket2 so buffer sizes can be raised before
//! binding, then handed to tokio for async I/O.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::substrate::{Substrate, SubstrateError, SubstrateResult};

/// Socket buffer size requested from the kernel (2 MiB).
const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// A bound UDP socket implementing [`Substrate`].
#[derive(Clone)]
pub struct UdpSubstrate {
    socket: Arc<UdpSocket>,
}

impl UdpSubstrate {
    /// Bind to `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`SubstrateError::BindFailed`] if socket setup or binding
    /// fails.
    pub fn bind(addr: SocketAddr) -> SubstrateResult<Self> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let sock = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
            .map_err(|e| SubstrateError::BindFailed(e.to_string()))?;

        sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE)
            .map_err(|e| SubstrateError::BindFailed(e.to_string()))?;
        sock.set_send_buffer_size(SOCKET_BUFFER_SIZE)
            .map_err(|e| SubstrateError::BindFailed(e.to_string()))?;
        sock.set_nonblocking(true)
            .map_err(|e| SubstrateError::BindFailed(e.to_string()))?;

        sock.bind(&addr.into())
            .map_err(|e| SubstrateError::BindFailed(e.to_string()))?;

        let std_socket: std::net::UdpSocket = sock.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| SubstrateError::BindFailed(e.to_string()))?;

        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Bind preferring `preferred` (a previously persisted port), falling
    /// back to `default_port`, then to an OS-assigned port.
    ///
    /// # Errors
    ///
    /// Fails only if even the wildcard-port bind fails.
    pub fn bind_with_preference(
        mut addr: SocketAddr,
        preferred: Option<u16>,
        default_port: u16,
    ) -> SubstrateResult<Self> {
        if let Some(port) = preferred {
            addr.set_port(port);
            match Self::bind(addr) {
                Ok(sub) => return Ok(sub),
                Err(e) => {
                    tracing::warn!("can't bind preferred port {port} ({e}), trying default");
                }
            }
        }

        addr.set_port(default_port);
        match Self::bind(addr) {
            Ok(sub) => Ok(sub),
            Err(e) => {
                tracing::warn!("can't bind port {default_port} ({e}), trying any port");
                addr.set_port(0);
                Self::bind(addr)
            }
        }
    }
}

#[async_trait]
impl Substrate for UdpSubstrate {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> SubstrateResult<()> {
        self.socket.send_to(buf, addr).await?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> SubstrateResult<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }

    fn local_addr(&self) -> SubstrateResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn datagram_roundtrip() {
        let a = UdpSubstrate::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpSubstrate::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        a.send_to(b"ping", b.local_addr().unwrap()).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn preference_falls_back() {
        // Port 1 is privileged; binding must fall through to the wildcard.
        let sub = UdpSubstrate::bind_with_preference(
            "127.0.0.1:0".parse().unwrap(),
            Some(1),
            1,
        )
        .unwrap();
        assert_ne!(sub.local_addr().unwrap().port(), 0);
    }
}
