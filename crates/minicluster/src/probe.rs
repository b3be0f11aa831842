//! Readiness probes.
//!
//! A probe answers one question: can the service on this address serve
//! requests yet? Probes are injected per [`ServiceKind`](crate::ServiceKind)
//! so tests can replace them.

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Check that decides whether a started process is able to serve requests.
#[async_trait]
pub trait ReadinessProbe: Send + Sync + fmt::Debug {
    /// Returns `true` once the service at `addr` is ready.
    async fn check(&self, addr: SocketAddr) -> bool;
}

/// Ready as soon as a TCP connection is accepted.
#[derive(Debug, Clone)]
pub struct TcpConnectProbe {
    pub connect_timeout: Duration,
}

impl Default for TcpConnectProbe {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl ReadinessProbe for TcpConnectProbe {
    async fn check(&self, addr: SocketAddr) -> bool {
        matches!(
            timeout(self.connect_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

/// Four-letter-word handshake: send `ruok`, expect `imok`.
#[derive(Debug, Clone)]
pub struct HandshakeProbe {
    pub io_timeout: Duration,
}

impl Default for HandshakeProbe {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(1),
        }
    }
}

impl HandshakeProbe {
    async fn handshake(addr: SocketAddr) -> std::io::Result<bool> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(b"ruok\n").await?;
        stream.flush().await?;

        let mut buf = [0u8; 100];
        let mut filled = 0;
        while filled < 4 {
            let n = stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled >= 4 && &buf[..4] == b"imok")
    }
}

#[async_trait]
impl ReadinessProbe for HandshakeProbe {
    async fn check(&self, addr: SocketAddr) -> bool {
        match timeout(self.io_timeout, Self::handshake(addr)).await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => {
                tracing::trace!(%addr, error = %e, "handshake failed");
                false
            }
            Err(_) => false,
        }
    }
}
