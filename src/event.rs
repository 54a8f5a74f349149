// MIT License - Copyright (c) 2021 TJForc
// Session events

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::codec::Frame;
use crate::error::SessionError;

/// Lifecycle state of a session.
///
/// Transitions are linear: `Disconnected → Connecting → Authenticating → Online`,
/// and `Online → Disconnecting → Disconnected` on explicit logout. Any I/O failure
/// drops straight to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Online,
    Disconnecting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Authenticating => "AUTHENTICATING",
            Self::Online => "ONLINE",
            Self::Disconnecting => "DISCONNECTING",
        }
    }

    /// Whether a link to the device is up or being brought up.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Authenticating | Self::Online)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detail code attached to a status change, so consumers can tell
/// "wrong credentials" apart from "network unreachable".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusDetail {
    None,
    CommunicationError,
    ConfigurationError,
    BridgeOffline,
}

impl StatusDetail {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::CommunicationError => "COMMUNICATION_ERROR",
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::BridgeOffline => "BRIDGE_OFFLINE",
        }
    }
}

impl fmt::Display for StatusDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All events that can be emitted by a session.
///
/// Consumers subscribe via `session.subscribe()` to receive a
/// `tokio::sync::broadcast::Receiver<SessionEvent>`.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Session state changed
    StatusChanged {
        state: SessionState,
        detail: StatusDetail,
        message: String,
    },
    /// Device-originated frame not consumed by a pending command
    UnsolicitedFrame(Frame),
    /// A failure observed by the reader or a background task
    Error(Arc<SessionError>),
    /// The memory map finished a polling pass
    MemoryRefreshed { blocks: usize },
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<SessionEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<SessionEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}

/// Receive the next event, skipping past any the receiver lagged behind on.
///
/// Returns `None` once the session and every sender are gone.
pub async fn next_event(rx: &mut EventReceiver) -> Option<SessionEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(n)) => warn!("Event receiver lagged, missed {} events", n),
            Err(RecvError::Closed) => return None,
        }
    }
}
