// MIT License - Copyright (c) 2021 TJForc
// Login, logout and keep-alive sequences

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::correlator::Correlator;
use crate::error::{Result, SessionError};
use crate::protocol;

/// The device-specific part of a session: how to log in, log out and ping.
///
/// Every exchange goes through the session's correlator, so implementations
/// never touch the transport directly.
#[async_trait]
pub trait Handshake: Send + Sync {
    /// Authenticate a freshly opened link.
    ///
    /// Rejected credentials must be reported as [`SessionError::Authentication`]
    /// so the session does not retry them.
    async fn login(&self, correlator: &Correlator) -> Result<()>;

    /// Tell the device we are leaving. Errors are logged by the caller and otherwise ignored.
    async fn logout(&self, correlator: &Correlator) -> Result<()>;

    async fn keep_alive(&self, correlator: &Correlator) -> Result<()>;
}

/// Login sequence of an IP150 module in front of an EVO panel.
///
/// 1. IP login with the module password; the first reply byte is 0 on success.
/// 2. Open the serial pass-through channel.
/// 3. Initialize communication with the panel using the PC password.
#[derive(Debug, Clone)]
pub struct Ip150Handshake {
    gateway_password: String,
    pc_password: String,
}

impl Ip150Handshake {
    pub fn new(gateway_password: impl Into<String>, pc_password: impl Into<String>) -> Self {
        Self {
            gateway_password: gateway_password.into(),
            pc_password: pc_password.into(),
        }
    }
}

#[async_trait]
impl Handshake for Ip150Handshake {
    async fn login(&self, correlator: &Correlator) -> Result<()> {
        // Validate the PC password before anything hits the wire
        let initialize = protocol::initialize_request(&self.pc_password)?;

        debug!("Logging in to IP module");
        let reply = correlator.request(&protocol::login_request(&self.gateway_password)?).await?;
        if !protocol::login_accepted(&reply) {
            warn!("IP module rejected the gateway password");
            return Err(SessionError::Authentication {
                reason: "gateway password rejected".to_string(),
            });
        }

        debug!("Opening serial channel");
        correlator.request(&protocol::serial_connect_request()?).await?;

        debug!("Initializing panel communication");
        match correlator.request(&initialize).await {
            Ok(_) => {}
            Err(SessionError::CorrelationTimeout { .. }) => {
                return Err(SessionError::Authentication {
                    reason: "panel did not accept the PC password".to_string(),
                });
            }
            Err(e) => return Err(e),
        }

        info!("Logged in to panel");
        Ok(())
    }

    async fn logout(&self, correlator: &Correlator) -> Result<()> {
        debug!("Closing panel connection");
        correlator.request(&protocol::close_connection_request()?).await?;
        Ok(())
    }

    async fn keep_alive(&self, correlator: &Correlator) -> Result<()> {
        correlator.request(&protocol::keep_alive_request()?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameCodec;
    use crate::correlator::CorrelatorConfig;
    use crate::protocol::{CMD_INITIALIZE, IP_LOGIN, IP_SERIAL_CONNECT, ip_response, serial_response};
    use crate::transport::{Chunk, Transport};
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tokio::time::{Duration, sleep};

    /// Answers each request according to what it asks for.
    struct PanelDouble {
        accept_login: bool,
        answer_initialize: bool,
        outbox: Mutex<Vec<Bytes>>,
        codec: Mutex<FrameCodec>,
    }

    impl PanelDouble {
        fn new(accept_login: bool, answer_initialize: bool) -> Arc<Self> {
            Arc::new(Self {
                accept_login,
                answer_initialize,
                outbox: Mutex::new(Vec::new()),
                codec: Mutex::new(FrameCodec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for PanelDouble {
        async fn connect(&self, _host: &str, _port: u16) -> Result<()> {
            Ok(())
        }

        async fn send(&self, data: &[u8]) -> Result<()> {
            for frame in self.codec.lock().await.push(data) {
                let command = frame.header().command;
                let reply = if command == IP_LOGIN {
                    let status = if self.accept_login { 0x00 } else { 0x01 };
                    Some(ip_response(IP_LOGIN, &[status, 0, 0, 0]).unwrap())
                } else if command == IP_SERIAL_CONNECT {
                    Some(ip_response(IP_SERIAL_CONNECT, &[0x00, 0, 0, 0]).unwrap())
                } else if frame.body().first() == Some(&CMD_INITIALIZE) {
                    self.answer_initialize
                        .then(|| serial_response(0x10, [0; 5], &[0x00]).unwrap())
                } else {
                    None
                };
                if let Some(reply) = reply {
                    self.outbox.lock().await.push(reply.encode());
                }
            }
            Ok(())
        }

        async fn receive_chunk(&self, wait: Duration) -> Result<Chunk> {
            let next = {
                let mut outbox = self.outbox.lock().await;
                (!outbox.is_empty()).then(|| outbox.remove(0))
            };
            match next {
                Some(bytes) => Ok(Chunk::Data(bytes)),
                None => {
                    sleep(wait).await;
                    Ok(Chunk::Timeout)
                }
            }
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    fn correlator(transport: Arc<PanelDouble>) -> Correlator {
        Correlator::new(
            transport,
            CorrelatorConfig {
                max_attempts: 2,
                retry_backoff: Duration::from_millis(5),
                attempt_timeout: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn test_login_sequence_succeeds() {
        let handshake = Ip150Handshake::new("paradox", "0000");
        let correlator = correlator(PanelDouble::new(true, true));
        handshake.login(&correlator).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_gateway_password() {
        let handshake = Ip150Handshake::new("wrong", "0000");
        let correlator = correlator(PanelDouble::new(false, true));
        let err = handshake.login(&correlator).await.unwrap_err();
        assert!(matches!(err, SessionError::Authentication { .. }));
    }

    #[tokio::test]
    async fn test_silent_panel_means_bad_pc_password() {
        let handshake = Ip150Handshake::new("paradox", "1234");
        let correlator = correlator(PanelDouble::new(true, false));
        let err = handshake.login(&correlator).await.unwrap_err();
        assert!(matches!(err, SessionError::Authentication { .. }));
    }

    #[tokio::test]
    async fn test_malformed_pc_password_fails_before_sending() {
        let transport = PanelDouble::new(true, true);
        let handshake = Ip150Handshake::new("paradox", "12");
        let correlator = correlator(transport.clone());
        let err = handshake.login(&correlator).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidArgument { .. }));
        assert!(transport.outbox.lock().await.is_empty());
    }
}
