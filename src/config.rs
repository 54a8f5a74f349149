// MIT License - Copyright (c) 2021 TJForc
// Session configuration

use tokio::time::Duration;

use crate::transport::TransportKind;

/// Number of RAM blocks the panel exposes for status polling.
pub const DEFAULT_RAM_BLOCKS: u16 = 16;

/// Configuration for a session with an IP150-style module.
///
/// The retry, backoff and keep-alive values are empirical defaults. They are
/// all overridable since devices differ in how quickly they answer.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Module host name or IP address
    pub host: String,
    /// Module port (default: 10000)
    pub port: u16,
    /// Stream or datagram transport
    pub transport: TransportKind,
    /// Password of the IP module itself
    pub gateway_password: String,
    /// Panel PC password, 4 hex digits
    pub pc_password: String,
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Reader receive timeout in milliseconds; bounds how long shutdown waits for the reader
    pub read_timeout_ms: u64,
    /// Receive timeout of a single correlator attempt in milliseconds
    pub attempt_timeout_ms: u64,
    /// Attempts per command before giving up (default: 3)
    pub max_attempts: u32,
    /// Pause between attempts in milliseconds (default: 100)
    pub retry_backoff_ms: u64,
    /// Keep-alive interval in milliseconds (default: 30000)
    pub keep_alive_interval_ms: u64,
    /// Consecutive keep-alive failures that take the session offline (default: 3)
    pub max_ping_failures: u32,
    /// Memory map polling interval in milliseconds (0 = no polling)
    pub poll_interval_ms: u64,
    /// RAM blocks refreshed on each poll
    pub memory_blocks: Vec<u16>,
    /// Whether to reconnect after an unexpected disconnect
    pub auto_reconnect: bool,
    /// Base reconnect delay in milliseconds (doubles per attempt, capped at 16x)
    pub reconnect_delay_ms: u64,
    /// Maximum reconnect attempts (0 = unlimited)
    pub max_reconnect_attempts: u32,
    /// How long to wait for background tasks on shutdown, in milliseconds (default: 5000)
    pub shutdown_wait_ms: u64,
    /// Capacity of the inbound frame queue between reader and dispatcher
    pub queue_capacity: usize,
    /// Capacity of the broadcast event channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "192.168.0.100".to_string(),
            port: 10000,
            transport: TransportKind::Tcp,
            gateway_password: "paradox".to_string(),
            pc_password: "0000".to_string(),
            connect_timeout_ms: 5000,
            read_timeout_ms: 1000,
            attempt_timeout_ms: 1000,
            max_attempts: 3,
            retry_backoff_ms: 100,
            keep_alive_interval_ms: 30000,
            max_ping_failures: 3,
            poll_interval_ms: 5000,
            memory_blocks: (1..=DEFAULT_RAM_BLOCKS).collect(),
            auto_reconnect: true,
            reconnect_delay_ms: 10000,
            max_reconnect_attempts: 0,
            shutdown_wait_ms: 5000,
            queue_capacity: 50,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms.max(1))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn keep_alive_interval(&self) -> Option<Duration> {
        (self.keep_alive_interval_ms > 0).then(|| Duration::from_millis(self.keep_alive_interval_ms))
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0 && !self.memory_blocks.is_empty())
            .then(|| Duration::from_millis(self.poll_interval_ms))
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_millis(self.shutdown_wait_ms)
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(4);
        Duration::from_millis(self.reconnect_delay_ms.saturating_mul(factor))
    }
}

/// Builder for SessionConfig.
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn transport(mut self, kind: TransportKind) -> Self {
        self.config.transport = kind;
        self
    }

    pub fn gateway_password(mut self, password: impl Into<String>) -> Self {
        self.config.gateway_password = password.into();
        self
    }

    pub fn pc_password(mut self, password: impl Into<String>) -> Self {
        self.config.pc_password = password.into();
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    pub fn attempt_timeout_ms(mut self, ms: u64) -> Self {
        self.config.attempt_timeout_ms = ms;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn keep_alive_interval_ms(mut self, ms: u64) -> Self {
        self.config.keep_alive_interval_ms = ms;
        self
    }

    pub fn max_ping_failures(mut self, failures: u32) -> Self {
        self.config.max_ping_failures = failures;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn memory_blocks(mut self, blocks: impl IntoIterator<Item = u16>) -> Self {
        self.config.memory_blocks = blocks.into_iter().collect();
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    pub fn reconnect_delay_ms(mut self, ms: u64) -> Self {
        self.config.reconnect_delay_ms = ms;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    pub fn shutdown_wait_ms(mut self, ms: u64) -> Self {
        self.config.shutdown_wait_ms = ms;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity.max(1);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::builder().build();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_backoff(), Duration::from_millis(100));
        assert_eq!(config.keep_alive_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.max_ping_failures, 3);
        assert_eq!(config.shutdown_wait(), Duration::from_secs(5));
        assert_eq!(config.read_timeout(), Duration::from_secs(1));
        assert_eq!(config.queue_capacity, 50);
        assert_eq!(config.memory_blocks.len(), 16);
        assert_eq!(config.transport, TransportKind::Tcp);
    }

    #[test]
    fn test_config_builder() {
        let config = SessionConfig::builder()
            .host("10.0.0.1")
            .port(10001)
            .gateway_password("secret")
            .pc_password("1234")
            .max_attempts(5)
            .memory_blocks([1, 2])
            .build();

        assert_eq!(config.host, "10.0.0.1");
        assert_eq!(config.port, 10001);
        assert_eq!(config.gateway_password, "secret");
        assert_eq!(config.pc_password, "1234");
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.memory_blocks, vec![1, 2]);
    }

    #[test]
    fn test_reconnect_delay_backoff() {
        let config = SessionConfig::builder().reconnect_delay_ms(1000).build();
        assert_eq!(config.reconnect_delay(1), Duration::from_millis(1000));
        assert_eq!(config.reconnect_delay(2), Duration::from_millis(2000));
        assert_eq!(config.reconnect_delay(5), Duration::from_millis(16000));
        assert_eq!(config.reconnect_delay(9), Duration::from_millis(16000));
    }

    #[test]
    fn test_zero_intervals_disable_tasks() {
        let config = SessionConfig::builder()
            .keep_alive_interval_ms(0)
            .poll_interval_ms(0)
            .build();
        assert_eq!(config.keep_alive_interval(), None);
        assert_eq!(config.poll_interval(), None);

        let no_blocks = SessionConfig::builder().memory_blocks([]).build();
        assert_eq!(no_blocks.poll_interval(), None);
    }
}
