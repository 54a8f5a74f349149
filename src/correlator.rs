// MIT License - Copyright (c) 2021 TJForc
// Command/response correlation with retry

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::{Duration, sleep};
use tracing::{debug, error, trace, warn};

use crate::codec::{CodecStats, Frame, FrameCodec};
use crate::error::{Result, SessionError};
use crate::protocol::{self, Request, ResponseMatch};
use crate::transport::{Chunk, Transport};

/// An item on the inbound queue between the reader and the dispatcher.
#[derive(Debug)]
pub enum Inbound {
    Frame(Frame),
    /// Terminal failure; always the last item the reader enqueues
    Failure(SessionError),
}

/// Retry policy for a single command.
#[derive(Debug, Clone, Copy)]
pub struct CorrelatorConfig {
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(100),
            attempt_timeout: Duration::from_secs(1),
        }
    }
}

/// The command currently awaiting its response.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub command: u8,
    pub submitted_at: Instant,
    pub attempts: u32,
    pub expected: ResponseMatch,
}

/// Sends one command at a time and waits for the matching response.
///
/// The inbound side (codec plus transport receive) is shared with the
/// background reader behind a single lock. A command takes that lock before
/// it sends, so the reader can never consume its response. A reader waiting
/// on an idle line gives the lock up as soon as a command asks for it. Frames that do
/// not match the pending command are forwarded to the attached sink in wire
/// order, exactly as the reader would have delivered them.
pub struct Correlator {
    transport: Arc<dyn Transport>,
    inbound: Mutex<FrameCodec>,
    /// Signalled by a command that wants the inbound side
    yield_reader: Notify,
    command_lock: Mutex<()>,
    sink: std::sync::Mutex<Option<mpsc::Sender<Inbound>>>,
    pending: std::sync::Mutex<Option<PendingRequest>>,
    stats: std::sync::Mutex<CodecStats>,
    config: CorrelatorConfig,
}

impl Correlator {
    pub fn new(transport: Arc<dyn Transport>, config: CorrelatorConfig) -> Self {
        Self {
            transport,
            inbound: Mutex::new(FrameCodec::new()),
            yield_reader: Notify::new(),
            command_lock: Mutex::new(()),
            sink: std::sync::Mutex::new(None),
            pending: std::sync::Mutex::new(None),
            stats: std::sync::Mutex::new(CodecStats::default()),
            config,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Route unmatched frames to `sink` from now on.
    pub fn attach(&self, sink: mpsc::Sender<Inbound>) {
        if let Ok(mut guard) = self.sink.lock() {
            *guard = Some(sink);
        }
    }

    /// Stop routing unmatched frames; they are dropped until the next `attach`.
    pub fn detach(&self) {
        if let Ok(mut guard) = self.sink.lock() {
            guard.take();
        }
    }

    /// Drop any partially buffered frame.
    pub async fn reset_inbound(&self) {
        self.inbound.lock().await.reset();
    }

    /// Codec counters as of the last decoded chunk.
    pub fn codec_stats(&self) -> CodecStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }

    /// The command currently waiting for a response, if any.
    pub fn in_flight(&self) -> Option<PendingRequest> {
        self.pending.lock().ok().and_then(|p| p.clone())
    }

    /// Send a serial command and return its response payload.
    pub async fn send_command(&self, command: u8, payload: &[u8]) -> Result<Bytes> {
        let request = Request::serial(command, payload)?;
        let frame = self.request(&request).await?;
        Ok(protocol::response_payload(&frame))
    }

    /// Send `request` and wait for the first frame it matches.
    pub async fn request(&self, request: &Request) -> Result<Frame> {
        let _serial = self.command_lock.lock().await;
        self.yield_reader.notify_one();
        let mut codec = self.inbound.lock().await;

        self.set_pending(Some(PendingRequest {
            command: request.command(),
            submitted_at: Instant::now(),
            attempts: 0,
            expected: request.expect,
        }));
        let result = self.exchange(&mut codec, request).await;
        self.set_pending(None);
        result
    }

    async fn exchange(&self, codec: &mut FrameCodec, request: &Request) -> Result<Frame> {
        let command = request.command();
        let max_attempts = self.config.max_attempts.max(1);

        debug!("Sending command 0x{:02X}: {}", command, request.frame.to_hex());
        self.transport.send(&request.frame.encode()).await?;

        for attempt in 1..=max_attempts {
            self.note_attempt(attempt);

            match self.transport.receive_chunk(self.config.attempt_timeout).await? {
                Chunk::Data(data) => {
                    let mut matched = None;
                    let mut others = Vec::new();
                    let frames = codec.push(&data);
                    self.record_stats(codec);
                    for frame in frames {
                        if matched.is_none() && request.expect.matches(&frame) {
                            matched = Some(frame);
                        } else {
                            others.push(frame);
                        }
                    }
                    self.forward(others).await;

                    if let Some(frame) = matched {
                        trace!("Command 0x{:02X} answered on attempt {}", command, attempt);
                        return Ok(frame);
                    }
                }
                Chunk::Timeout => {
                    debug!("Attempt {} for command 0x{:02X} timed out", attempt, command);
                }
            }

            if attempt < max_attempts {
                sleep(self.config.retry_backoff).await;
            }
        }

        error!(
            "No response for command 0x{:02X} after {} attempts",
            command, max_attempts
        );
        Err(SessionError::CorrelationTimeout {
            command,
            attempts: max_attempts,
        })
    }

    /// Read one chunk on behalf of the background reader and forward every
    /// decoded frame. Returns the number of frames forwarded.
    ///
    /// Returns early with 0 when a command needs the inbound side. Dropping
    /// an unfinished receive loses no bytes.
    pub async fn pump(&self, wait: Duration) -> Result<usize> {
        let mut codec = self.inbound.lock().await;
        let chunk = tokio::select! {
            biased;
            _ = self.yield_reader.notified() => {
                trace!("Reader yielding to a command");
                return Ok(0);
            }
            chunk = self.transport.receive_chunk(wait) => chunk?,
        };
        match chunk {
            Chunk::Data(data) => {
                let frames = codec.push(&data);
                self.record_stats(&codec);
                let count = frames.len();
                self.forward(frames).await;
                Ok(count)
            }
            Chunk::Timeout => Ok(0),
        }
    }

    async fn forward(&self, frames: Vec<Frame>) {
        if frames.is_empty() {
            return;
        }
        let sink = self.sink.lock().ok().and_then(|s| s.clone());
        let Some(sink) = sink else {
            debug!("No listener attached, dropping {} frame(s)", frames.len());
            return;
        };
        for frame in frames {
            if sink.send(Inbound::Frame(frame)).await.is_err() {
                warn!("Inbound queue closed, dropping frame");
                return;
            }
        }
    }

    fn record_stats(&self, codec: &FrameCodec) {
        if let Ok(mut guard) = self.stats.lock() {
            *guard = codec.stats();
        }
    }

    fn set_pending(&self, pending: Option<PendingRequest>) {
        if let Ok(mut guard) = self.pending.lock() {
            *guard = pending;
        }
    }

    fn note_attempt(&self, attempt: u32) {
        if let Ok(mut guard) = self.pending.lock()
            && let Some(pending) = guard.as_mut()
        {
            pending.attempts = attempt;
        }
    }
}
