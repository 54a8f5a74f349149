// MIT License - Copyright (c) 2021 TJForc
// Byte transports

pub mod tcp;
pub mod udp;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Duration;

use crate::error::Result;

pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// Outcome of a single receive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Raw bytes as they arrived (never empty)
    Data(Bytes),
    /// Nothing arrived within the timeout; the link is still up
    Timeout,
}

/// A raw byte link to a device.
///
/// Implementations know nothing about framing. Receiving and sending may run
/// concurrently from different tasks; callers serialise writers themselves.
/// End of stream is reported as [`SessionError::ConnectionClosed`](crate::error::SessionError::ConnectionClosed),
/// never as empty data.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the link. An already open link is closed first.
    async fn connect(&self, host: &str, port: u16) -> Result<()>;

    /// Write all of `data`.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for the next chunk of bytes.
    async fn receive_chunk(&self, timeout: Duration) -> Result<Chunk>;

    /// Close the link. Closing a closed link is a no-op.
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Which transport a session should build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Udp,
}

impl TransportKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            _ => None,
        }
    }
}

/// Build a transport of the given kind with a connect timeout.
pub fn build_transport(kind: TransportKind, connect_timeout: Duration) -> std::sync::Arc<dyn Transport> {
    match kind {
        TransportKind::Tcp => std::sync::Arc::new(TcpTransport::new(connect_timeout)),
        TransportKind::Udp => std::sync::Arc::new(UdpTransport::new()),
    }
}
