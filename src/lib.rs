// MIT License - Copyright (c) 2021 TJForc
// Session manager for framed request/response devices
//
//! # paradox-lan-session
//!
//! A stateful session with devices that speak a framed binary
//! request/response protocol over TCP or UDP, modelled on Paradox IP150
//! modules in front of EVO panels.
//!
//! The library reassembles frames across segment boundaries, correlates
//! each command with its response (with retry and backoff), keeps the link
//! alive, polls device memory into a cache, reconnects after failures, and
//! broadcasts unsolicited frames and status changes to subscribers.
//!
//! ## Quick Start
//!
//! ```no_run
//! use paradox_lan_session::{Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SessionConfig::builder()
//!         .host("192.168.0.100")
//!         .gateway_password("paradox")
//!         .pc_password("0000")
//!         .build();
//!
//!     let session = Session::from_config(config);
//!
//!     let mut events = session.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     session.connect_with_retry().await?;
//!     let block = session.read_ram_block(1).await?;
//!     println!("RAM block 1: {} bytes", block.len());
//!
//!     tokio::signal::ctrl_c().await?;
//!     session.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod correlator;
pub mod error;
pub mod event;
pub mod handshake;
pub mod layout;
pub mod memory;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use codec::{CodecStats, Frame, FrameCodec, FrameHeader};
pub use config::{SessionConfig, SessionConfigBuilder};
pub use correlator::{Correlator, CorrelatorConfig, PendingRequest};
pub use error::{Result, SessionError};
pub use event::{EventReceiver, SessionEvent, SessionState, StatusDetail, next_event};
pub use handshake::{Handshake, Ip150Handshake};
pub use layout::{ZoneFlags, ZoneStateFlags};
pub use memory::{MemoryMap, MemorySnapshot};
pub use protocol::{Request, ResponseMatch};
pub use session::{Session, SessionCommand, SessionHealth};
pub use transport::{Chunk, TcpTransport, Transport, TransportKind, UdpTransport};
