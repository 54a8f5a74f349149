// MIT License - Copyright (c) 2021 TJForc
// Session error taxonomy

use crate::event::{SessionState, StatusDetail};

/// All errors that can occur in the session library.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection to {address} failed: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Connection closed by remote")]
    ConnectionClosed,

    #[error("Transport not connected")]
    NotConnected,

    #[error("Malformed frame: {details}")]
    MalformedFrame { details: String },

    #[error("No response for command 0x{command:02X} after {attempts} attempts")]
    CorrelationTimeout { command: u8, attempts: u32 },

    #[error("Authentication rejected: {reason}")]
    Authentication { reason: String },

    #[error("Session is not online (state: {state})")]
    NotOnline { state: SessionState },

    #[error("Invalid state transition: {trigger} not allowed from {from}")]
    InvalidState { from: SessionState, trigger: &'static str },

    #[error("Invalid argument: {details}")]
    InvalidArgument { details: String },

    #[error("Channel closed")]
    ChannelClosed,
}

impl SessionError {
    /// Whether this error is transient and the operation or connection may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::Io(_)
                | SessionError::ConnectFailed { .. }
                | SessionError::ConnectionTimeout
                | SessionError::ConnectionClosed
                | SessionError::NotConnected
                | SessionError::CorrelationTimeout { .. }
                | SessionError::ChannelClosed
        )
    }

    /// Whether this error means the underlying link is gone.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SessionError::Io(_)
                | SessionError::ConnectFailed { .. }
                | SessionError::ConnectionTimeout
                | SessionError::ConnectionClosed
                | SessionError::NotConnected
        )
    }

    /// The status detail reported to listeners when this error takes the session offline.
    pub fn status_detail(&self) -> StatusDetail {
        match self {
            SessionError::Authentication { .. } | SessionError::InvalidArgument { .. } => {
                StatusDetail::ConfigurationError
            }
            _ => StatusDetail::CommunicationError,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_maps_to_configuration_error() {
        let err = SessionError::Authentication {
            reason: "bad password".to_string(),
        };
        assert_eq!(err.status_detail(), StatusDetail::ConfigurationError);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(SessionError::ConnectionClosed.is_retryable());
        assert!(SessionError::ConnectionClosed.is_transport());
        assert_eq!(
            SessionError::ConnectionClosed.status_detail(),
            StatusDetail::CommunicationError
        );
    }

    #[test]
    fn test_correlation_timeout_is_not_transport() {
        let err = SessionError::CorrelationTimeout {
            command: 0x5,
            attempts: 3,
        };
        assert!(err.is_retryable());
        assert!(!err.is_transport());
        assert_eq!(err.to_string(), "No response for command 0x05 after 3 attempts");
    }
}
