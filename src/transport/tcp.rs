// MIT License - Copyright (c) 2021 TJForc
// Stream transport over TCP

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::{Duration, timeout};
use tracing::{debug, error, info};

use super::{Chunk, Transport};
use crate::error::{Result, SessionError};

const READ_BUFFER_LEN: usize = 4096;

/// TCP transport. The socket is split so a blocked read never holds up a write.
pub struct TcpTransport {
    connect_timeout: Duration,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<()> {
        self.disconnect().await?;

        let address = format!("{}:{}", host, port);
        info!("Connecting to {}", address);

        let stream = match timeout(self.connect_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!("TCP connect to {} failed: {}", address, e);
                return Err(SessionError::ConnectFailed {
                    address,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                error!("TCP connect to {} timed out", address);
                return Err(SessionError::ConnectionTimeout);
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }

        let (reader, writer) = stream.into_split();
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        self.connected.store(true, Ordering::SeqCst);

        debug!("TCP socket connected");
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(SessionError::NotConnected);
        };

        if let Err(e) = stream.write_all(data).await {
            error!("Failed to write {} bytes: {}", data.len(), e);
            self.connected.store(false, Ordering::SeqCst);
            return Err(SessionError::Io(e));
        }
        stream.flush().await?;
        Ok(())
    }

    async fn receive_chunk(&self, wait: Duration) -> Result<Chunk> {
        let mut reader = self.reader.lock().await;
        let Some(stream) = reader.as_mut() else {
            return Err(SessionError::NotConnected);
        };

        let mut buf = vec![0u8; READ_BUFFER_LEN];
        match timeout(wait, stream.read(&mut buf)).await {
            Err(_) => Ok(Chunk::Timeout),
            Ok(Ok(0)) => {
                debug!("Connection closed by remote");
                self.connected.store(false, Ordering::SeqCst);
                Err(SessionError::ConnectionClosed)
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(Chunk::Data(Bytes::from(buf)))
            }
            Ok(Err(e)) => {
                error!("Read error: {}", e);
                self.connected.store(false, Ordering::SeqCst);
                Err(SessionError::Io(e))
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let writer = self.writer.lock().await.take();
        if let Some(mut stream) = writer {
            debug!("Closing TCP socket");
            let _ = stream.shutdown().await;
        }
        self.reader.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
