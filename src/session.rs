// MIT License - Copyright (c) 2021 TJForc
// Session lifecycle: connect, login, keep-alive, polling, reconnect

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior, interval, interval_at, sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::codec::{CodecStats, Frame};
use crate::config::SessionConfig;
use crate::correlator::{Correlator, CorrelatorConfig, Inbound, PendingRequest};
use crate::error::{Result, SessionError};
use crate::event::{EventReceiver, EventSender, SessionEvent, SessionState, StatusDetail, event_channel};
use crate::handshake::{Handshake, Ip150Handshake};
use crate::layout;
use crate::memory::MemoryMap;
use crate::protocol::{self, Request};
use crate::transport::{Transport, build_transport};

/// Operator commands accepted by [`Session::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Connect and log in
    Login,
    /// Log out and disconnect
    Logout,
    /// Log out (if online) then log in again
    Reset,
    /// Re-read the configured memory blocks now
    Refresh,
}

impl SessionCommand {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "LOGIN" => Some(Self::Login),
            "LOGOUT" => Some(Self::Logout),
            "RESET" => Some(Self::Reset),
            "REFRESH" => Some(Self::Refresh),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "LOGIN",
            Self::Logout => "LOGOUT",
            Self::Reset => "RESET",
            Self::Refresh => "REFRESH",
        }
    }
}

/// Point-in-time health counters.
#[derive(Debug, Clone)]
pub struct SessionHealth {
    pub state: SessionState,
    pub codec: CodecStats,
    pub consecutive_ping_failures: u32,
    pub reconnects: u32,
    pub last_error: Option<String>,
    pub in_flight: Option<PendingRequest>,
    pub memory_blocks: usize,
}

/// Background tasks and bookkeeping owned by the current connection.
#[derive(Default)]
struct Lifecycle {
    /// Bumped on every connect and teardown; stale failure reports compare against it
    generation: u64,
    stop_tx: Option<watch::Sender<bool>>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    reconnect: Option<JoinHandle<()>>,
}

struct Shared {
    config: SessionConfig,
    correlator: Correlator,
    handshake: Arc<dyn Handshake>,
    memory: MemoryMap,
    event_tx: EventSender,
    state_tx: watch::Sender<SessionState>,
    lifecycle: Mutex<Lifecycle>,
    /// Set once when the owning `Session` is dropped; never needs the lifecycle lock
    closed: watch::Sender<bool>,
    ping_failures: AtomicU32,
    reconnects: AtomicU32,
    last_error: std::sync::Mutex<Option<String>>,
}

/// A session with a framed request/response device.
///
/// # Example
///
/// ```no_run
/// use paradox_lan_session::{Session, SessionConfig, SessionEvent};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = SessionConfig::builder()
///         .host("192.168.0.100")
///         .gateway_password("paradox")
///         .pc_password("0000")
///         .build();
///
///     let session = Session::from_config(config);
///     let mut events = session.subscribe();
///     tokio::spawn(async move {
///         while let Ok(event) = events.recv().await {
///             if let SessionEvent::StatusChanged { state, detail, message } = event {
///                 println!("{} ({}): {}", state, detail, message);
///             }
///         }
///     });
///
///     session.connect().await?;
///     println!("Zone 1: {}", session.read_zone_label(1).await?);
///
///     tokio::signal::ctrl_c().await?;
///     session.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(config: SessionConfig, transport: Arc<dyn Transport>, handshake: Arc<dyn Handshake>) -> Self {
        let (event_tx, _event_rx) = event_channel(config.event_capacity);
        let (state_tx, _state_rx) = watch::channel(SessionState::Disconnected);
        let correlator = Correlator::new(
            transport,
            CorrelatorConfig {
                max_attempts: config.max_attempts,
                retry_backoff: config.retry_backoff(),
                attempt_timeout: config.attempt_timeout(),
            },
        );

        Self {
            shared: Arc::new(Shared {
                config,
                correlator,
                handshake,
                memory: MemoryMap::new(),
                event_tx,
                state_tx,
                lifecycle: Mutex::new(Lifecycle::default()),
                closed: watch::Sender::new(false),
                ping_failures: AtomicU32::new(0),
                reconnects: AtomicU32::new(0),
                last_error: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Build the configured transport and an IP150 handshake.
    pub fn from_config(config: SessionConfig) -> Self {
        let transport = build_transport(config.transport, config.connect_timeout());
        let handshake = Arc::new(Ip150Handshake::new(
            config.gateway_password.clone(),
            config.pc_password.clone(),
        ));
        Self::new(config, transport, handshake)
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.event_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    /// A receiver that always holds the latest state.
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn memory(&self) -> &MemoryMap {
        &self.shared.memory
    }

    pub fn health(&self) -> SessionHealth {
        let shared = &self.shared;
        SessionHealth {
            state: self.state(),
            codec: shared.correlator.codec_stats(),
            consecutive_ping_failures: shared.ping_failures.load(Ordering::SeqCst),
            reconnects: shared.reconnects.load(Ordering::SeqCst),
            last_error: shared.last_error.lock().ok().and_then(|e| e.clone()),
            in_flight: shared.correlator.in_flight(),
            memory_blocks: shared.memory.len(),
        }
    }

    /// Open the link and log in. Only valid while disconnected.
    ///
    /// A pending automatic reconnect is cancelled first.
    pub async fn connect(&self) -> Result<()> {
        let mut life = self.shared.lifecycle.lock().await;
        let state = self.state();
        if state != SessionState::Disconnected {
            return Err(SessionError::InvalidState {
                from: state,
                trigger: "connect",
            });
        }
        if let Some(pending) = life.reconnect.take() {
            debug!("Cancelling scheduled reconnect");
            pending.abort();
        }
        self.shared.establish(&mut life).await
    }

    /// Connect, retrying transient failures with exponential backoff.
    ///
    /// Gives up after `max_reconnect_attempts` retries (0 = never) or on the
    /// first non-retryable error such as rejected credentials.
    pub async fn connect_with_retry(&self) -> Result<()> {
        let max_retries = self.shared.config.max_reconnect_attempts;
        let mut attempt = 0u32;

        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if max_retries > 0 && attempt > max_retries {
                        return Err(e);
                    }
                    let delay = self.shared.config.reconnect_delay(attempt);
                    warn!(
                        "Connection attempt {} failed ({}), retrying in {:.1}s...",
                        attempt,
                        e,
                        delay.as_secs_f64()
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Log out and close the link.
    ///
    /// While disconnected this only cancels a scheduled reconnect; with
    /// nothing to cancel it is an invalid transition.
    pub async fn disconnect(&self) -> Result<()> {
        let mut life = self.shared.lifecycle.lock().await;
        let state = self.state();

        if state == SessionState::Disconnected {
            return match life.reconnect.take() {
                Some(pending) => {
                    pending.abort();
                    info!("Scheduled reconnect cancelled");
                    Ok(())
                }
                None => Err(SessionError::InvalidState {
                    from: state,
                    trigger: "disconnect",
                }),
            };
        }

        self.shared
            .set_state(SessionState::Disconnecting, StatusDetail::None, "Logging out");
        if let Err(e) = self.shared.handshake.logout(&self.shared.correlator).await {
            debug!("Logout was not acknowledged: {}", e);
        }
        self.shared.teardown(&mut life).await;
        self.shared.memory.clear();
        self.shared
            .set_state(SessionState::Disconnected, StatusDetail::None, "Disconnected by request");
        Ok(())
    }

    /// Run an operator command.
    pub async fn execute(&self, command: SessionCommand) -> Result<()> {
        info!("Executing {}", command.as_str());
        match command {
            SessionCommand::Login => self.connect().await,
            SessionCommand::Logout => self.disconnect().await,
            SessionCommand::Reset => {
                match self.disconnect().await {
                    Ok(()) | Err(SessionError::InvalidState { .. }) => {}
                    Err(e) => return Err(e),
                }
                self.connect().await
            }
            SessionCommand::Refresh => self.refresh_memory().await.map(|_| ()),
        }
    }

    /// Send a serial command and return its response payload.
    pub async fn send_command(&self, command: u8, payload: &[u8]) -> Result<Bytes> {
        self.ensure_online()?;
        self.shared.correlator.send_command(command, payload).await
    }

    /// Exchange a prepared request for its matching frame.
    pub async fn request(&self, request: &Request) -> Result<Frame> {
        self.ensure_online()?;
        self.shared.correlator.request(request).await
    }

    /// Read `len` bytes (1-64) of EEPROM at `address`.
    pub async fn read_eeprom(&self, address: u16, len: u8) -> Result<Bytes> {
        let request = protocol::eeprom_read_request(address, len)?;
        let frame = self.request(&request).await?;
        Ok(protocol::response_payload(&frame))
    }

    /// Read one 64-byte RAM block.
    pub async fn read_ram_block(&self, block: u16) -> Result<Bytes> {
        self.ensure_online()?;
        self.shared.read_ram_block(block).await
    }

    /// Read a 16-byte ASCII label at `address`.
    pub async fn read_label(&self, address: u16) -> Result<String> {
        let raw = self.read_eeprom(address, layout::LABEL_LEN).await?;
        Ok(layout::decode_label(&raw))
    }

    pub async fn read_zone_label(&self, zone: u16) -> Result<String> {
        self.read_label(layout::zone_label_address(zone)?).await
    }

    pub async fn read_partition_label(&self, partition: u16) -> Result<String> {
        self.read_label(layout::partition_label_address(partition)?).await
    }

    /// Re-read every configured RAM block into the memory map.
    pub async fn refresh_memory(&self) -> Result<usize> {
        self.ensure_online()?;
        self.shared.refresh_memory().await
    }

    fn ensure_online(&self) -> Result<()> {
        match self.state() {
            SessionState::Online => Ok(()),
            state => Err(SessionError::NotOnline { state }),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.closed.send_replace(true);
        self.shared.correlator.detach();
        if let Ok(mut life) = self.shared.lifecycle.try_lock() {
            if let Some(stop) = life.stop_tx.take() {
                let _ = stop.send(true);
            }
            for (_, handle) in life.tasks.drain(..) {
                handle.abort();
            }
            if let Some(pending) = life.reconnect.take() {
                pending.abort();
            }
        }
    }
}

impl Shared {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn set_state(&self, state: SessionState, detail: StatusDetail, message: impl Into<String>) {
        let message = message.into();
        self.state_tx.send_replace(state);
        info!("Session {} ({}): {}", state, detail, message);
        let _ = self.event_tx.send(SessionEvent::StatusChanged {
            state,
            detail,
            message,
        });
    }

    fn record_error(&self, message: &str) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(message.to_string());
        }
    }

    /// Bring the link up and log in. The caller holds the lifecycle lock and
    /// has checked that the session is disconnected.
    async fn establish(self: &Arc<Self>, life: &mut Lifecycle) -> Result<()> {
        let config = &self.config;
        life.generation += 1;
        let generation = life.generation;

        self.set_state(
            SessionState::Connecting,
            StatusDetail::None,
            format!("Connecting to {}:{}", config.host, config.port),
        );

        let transport = self.correlator.transport().clone();
        if let Err(e) = transport.connect(&config.host, config.port).await {
            return Err(self.abort_establish(life, e).await);
        }
        self.correlator.reset_inbound().await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        self.correlator.attach(queue_tx.clone());
        life.stop_tx = Some(stop_tx);
        life.tasks.push(("reader", self.spawn_reader(queue_tx, stop_rx.clone())));
        life.tasks.push(("dispatcher", self.spawn_dispatcher(queue_rx, generation)));

        self.set_state(SessionState::Authenticating, StatusDetail::None, "Logging in");
        if let Err(e) = self.handshake.login(&self.correlator).await {
            return Err(self.abort_establish(life, e).await);
        }

        self.ping_failures.store(0, Ordering::SeqCst);
        self.set_state(SessionState::Online, StatusDetail::None, "Logged in");

        if let Some(every) = config.keep_alive_interval() {
            life.tasks.push(("keep-alive", self.spawn_keep_alive(every, stop_rx.clone(), generation)));
        }
        if let Some(every) = config.poll_interval() {
            life.tasks.push(("memory poll", self.spawn_poller(every, stop_rx)));
        }
        Ok(())
    }

    async fn abort_establish(&self, life: &mut Lifecycle, e: SessionError) -> SessionError {
        error!("Connection to {}:{} failed: {}", self.config.host, self.config.port, e);
        self.record_error(&e.to_string());
        self.teardown(life).await;
        self.set_state(SessionState::Disconnected, e.status_detail(), e.to_string());
        e
    }

    /// Stop every background task and close the transport.
    async fn teardown(&self, life: &mut Lifecycle) {
        life.generation += 1;
        if let Some(stop) = life.stop_tx.take() {
            let _ = stop.send(true);
        }
        // The reader's sender is the only one left once the sink is detached
        self.correlator.detach();

        let wait = self.config.shutdown_wait();
        for (name, mut handle) in life.tasks.drain(..) {
            match timeout(wait, &mut handle).await {
                Ok(_) => trace!("{} task stopped", name),
                Err(_) => {
                    warn!("Waited too long for the {} task to stop, aborting it", name);
                    handle.abort();
                }
            }
        }

        if let Err(e) = self.correlator.transport().disconnect().await {
            debug!("Error closing transport: {}", e);
        }
    }

    /// Take an active session offline after a background failure.
    async fn fail(self: &Arc<Self>, generation: u64, detail: StatusDetail, message: String) {
        let mut life = self.lifecycle.lock().await;
        let state = *self.state_tx.borrow();
        if self.is_closed() || life.generation != generation || !state.is_active() {
            debug!("Ignoring stale failure: {}", message);
            return;
        }

        warn!("Session failed: {}", message);
        self.record_error(&message);
        self.teardown(&mut life).await;
        self.memory.clear();
        self.set_state(SessionState::Disconnected, detail, message);

        if self.config.auto_reconnect && detail != StatusDetail::ConfigurationError {
            self.schedule_reconnect(&mut life);
        }
    }

    fn spawn_failure(self: &Arc<Self>, generation: u64, detail: StatusDetail, message: String) {
        let shared = self.clone();
        tokio::spawn(async move { shared.fail(generation, detail, message).await });
    }

    fn schedule_reconnect(self: &Arc<Self>, life: &mut Lifecycle) {
        if let Some(previous) = life.reconnect.take() {
            previous.abort();
        }
        if self.is_closed() {
            return;
        }

        let shared = self.clone();
        life.reconnect = Some(tokio::spawn(async move {
            let max_attempts = shared.config.max_reconnect_attempts;
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                let delay = shared.config.reconnect_delay(attempt);
                info!("Reconnecting in {:.1}s (attempt {})", delay.as_secs_f64(), attempt);
                sleep(delay).await;

                let mut life = shared.lifecycle.lock().await;
                if shared.is_closed() {
                    debug!("Session dropped, not reconnecting");
                    return;
                }
                if *shared.state_tx.borrow() != SessionState::Disconnected {
                    life.reconnect.take();
                    return;
                }

                match shared.establish(&mut life).await {
                    Ok(()) => {
                        shared.reconnects.fetch_add(1, Ordering::SeqCst);
                        life.reconnect.take();
                        return;
                    }
                    Err(e) if !e.is_retryable() => {
                        error!("Giving up reconnecting: {}", e);
                        life.reconnect.take();
                        return;
                    }
                    Err(e) if max_attempts > 0 && attempt >= max_attempts => {
                        error!("Giving up reconnecting after {} attempts: {}", attempt, e);
                        life.reconnect.take();
                        return;
                    }
                    Err(_) => {}
                }
            }
        }));
    }

    fn spawn_reader(self: &Arc<Self>, queue: mpsc::Sender<Inbound>, stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let shared = self.clone();
        let read_timeout = self.config.read_timeout();
        tokio::spawn(async move {
            debug!("Reader started");
            loop {
                if *stop_rx.borrow() || shared.is_closed() {
                    break;
                }
                match shared.correlator.pump(read_timeout).await {
                    Ok(0) => {}
                    Ok(n) => trace!("Reader forwarded {} frame(s)", n),
                    Err(e) => {
                        if *stop_rx.borrow() {
                            break;
                        }
                        debug!("Reader failed: {}", e);
                        let _ = queue.send(Inbound::Failure(e)).await;
                        break;
                    }
                }
            }
            debug!("Reader stopped");
        })
    }

    fn spawn_dispatcher(self: &Arc<Self>, mut queue: mpsc::Receiver<Inbound>, generation: u64) -> JoinHandle<()> {
        let shared = self.clone();
        tokio::spawn(async move {
            while let Some(item) = queue.recv().await {
                match item {
                    Inbound::Frame(frame) => {
                        trace!("Unsolicited frame: {}", frame.to_hex());
                        let _ = shared.event_tx.send(SessionEvent::UnsolicitedFrame(frame));
                    }
                    Inbound::Failure(e) => {
                        let detail = e.status_detail();
                        let message = e.to_string();
                        let _ = shared.event_tx.send(SessionEvent::Error(Arc::new(e)));
                        shared.spawn_failure(generation, detail, message);
                        break;
                    }
                }
            }
            debug!("Dispatcher stopped");
        })
    }

    fn spawn_keep_alive(
        self: &Arc<Self>,
        every: Duration,
        mut stop_rx: watch::Receiver<bool>,
        generation: u64,
    ) -> JoinHandle<()> {
        let shared = self.clone();
        let max_failures = self.config.max_ping_failures.max(1);
        let mut closed_rx = self.closed.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                if shared.is_closed() {
                    break;
                }
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = closed_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                match shared.handshake.keep_alive(&shared.correlator).await {
                    Ok(()) => {
                        shared.ping_failures.store(0, Ordering::SeqCst);
                        trace!("Keep-alive acknowledged");
                    }
                    Err(e) => {
                        let failures = shared.ping_failures.fetch_add(1, Ordering::SeqCst) + 1;
                        warn!("Keep-alive failed ({}/{}): {}", failures, max_failures, e);
                        if failures >= max_failures {
                            shared.spawn_failure(
                                generation,
                                StatusDetail::CommunicationError,
                                format!("{} consecutive keep-alive failures", failures),
                            );
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_poller(self: &Arc<Self>, every: Duration, mut stop_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let shared = self.clone();
        let mut closed_rx = self.closed.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                if shared.is_closed() {
                    break;
                }
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = closed_rx.changed() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = shared.refresh_memory().await {
                    warn!("Memory refresh failed: {}", e);
                }
            }
        })
    }

    async fn read_ram_block(&self, block: u16) -> Result<Bytes> {
        let frame = self.correlator.request(&protocol::ram_read_request(block)?).await?;
        Ok(protocol::response_payload(&frame))
    }

    async fn refresh_memory(&self) -> Result<usize> {
        let mut blocks = Vec::with_capacity(self.config.memory_blocks.len());
        for &block in &self.config.memory_blocks {
            trace!("Reading memory block {}", block);
            let data = self.read_ram_block(block).await?;
            blocks.push((block, Arc::from(&data[..])));
        }
        let count = blocks.len();
        self.memory.replace_blocks(blocks);
        let _ = self.event_tx.send(SessionEvent::MemoryRefreshed { blocks: count });
        Ok(count)
    }
}
