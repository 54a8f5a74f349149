// MIT License - Copyright (c) 2021 TJForc
// Datagram transport over UDP

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::{Duration, timeout};
use tracing::{debug, error, info};

use super::{Chunk, Transport};
use crate::error::{Result, SessionError};

const MAX_DATAGRAM_LEN: usize = 2048;

/// Connected UDP socket. Each datagram is delivered as one chunk.
///
/// UDP has no end-of-stream, so `receive_chunk` only fails on socket errors
/// (for example ICMP port unreachable surfacing as `ConnectionRefused`).
pub struct UdpTransport {
    socket: RwLock<Option<UdpSocket>>,
}

impl Default for UdpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpTransport {
    pub fn new() -> Self {
        Self {
            socket: RwLock::new(None),
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<()> {
        self.disconnect().await?;

        let address = format!("{}:{}", host, port);
        info!("Opening UDP socket to {}", address);

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .connect(&address)
            .await
            .map_err(|e| SessionError::ConnectFailed {
                address: address.clone(),
                reason: e.to_string(),
            })?;

        *self.socket.write().await = Some(socket);
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        let guard = self.socket.read().await;
        let Some(socket) = guard.as_ref() else {
            return Err(SessionError::NotConnected);
        };
        let sent = socket.send(data).await.map_err(|e| {
            error!("UDP send failed: {}", e);
            SessionError::Io(e)
        })?;
        if sent != data.len() {
            debug!("Datagram truncated: sent {} of {} bytes", sent, data.len());
        }
        Ok(())
    }

    async fn receive_chunk(&self, wait: Duration) -> Result<Chunk> {
        let guard = self.socket.read().await;
        let Some(socket) = guard.as_ref() else {
            return Err(SessionError::NotConnected);
        };

        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        match timeout(wait, socket.recv(&mut buf)).await {
            Err(_) => Ok(Chunk::Timeout),
            Ok(Ok(0)) => Ok(Chunk::Timeout),
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(Chunk::Data(Bytes::from(buf)))
            }
            Ok(Err(e)) => Err(SessionError::Io(e)),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        if self.socket.write().await.take().is_some() {
            debug!("UDP socket closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.socket.try_read().map(|s| s.is_some()).unwrap_or(true)
    }
}
