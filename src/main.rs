// MIT License - Copyright (c) 2026 Peter Wright
// MQTT bridge

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use paradox_lan_session::layout::{ZoneFlags, ZoneStateFlags};
use paradox_lan_session::{
    Session, SessionCommand, SessionConfig, SessionError, SessionEvent, SessionState, StatusDetail,
    TransportKind, next_event,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "paradox2mqtt")]
#[command(about = "Bridge between a Paradox IP150 module and MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Config {
    panel: PanelToml,
    mqtt: MqttToml,
    #[serde(default, deserialize_with = "deserialize_zone_names")]
    zone_names: HashMap<u16, String>,
}

fn deserialize_zone_names<'de, D>(deserializer: D) -> Result<HashMap<u16, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let string_map: HashMap<String, String> = HashMap::deserialize(deserializer)?;
    string_map
        .into_iter()
        .map(|(k, v)| {
            k.parse::<u16>()
                .map(|id| (id, v))
                .map_err(|_| serde::de::Error::custom(format!("invalid zone ID: {k}")))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct PanelToml {
    host: String,
    #[serde(default = "default_panel_port")]
    port: u16,
    /// "tcp" or "udp"
    #[serde(default = "default_transport")]
    transport: String,
    #[serde(default = "default_gateway_password")]
    gateway_password: String,
    #[serde(default = "default_pc_password")]
    pc_password: String,
    #[serde(default = "default_keep_alive_interval")]
    keep_alive_interval_ms: u64,
    #[serde(default = "default_poll_interval")]
    poll_interval_ms: u64,
    #[serde(default = "default_reconnect_delay")]
    reconnect_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    retry_backoff_ms: u64,
    #[serde(default = "default_attempt_timeout")]
    attempt_timeout_ms: u64,
    /// Number of zones reported in MEMORY messages
    #[serde(default = "default_zone_count")]
    zone_count: u16,
}

fn default_panel_port() -> u16 {
    10000
}
fn default_transport() -> String {
    "tcp".to_string()
}
fn default_gateway_password() -> String {
    "paradox".to_string()
}
fn default_pc_password() -> String {
    "0000".to_string()
}
fn default_keep_alive_interval() -> u64 {
    30000
}
fn default_poll_interval() -> u64 {
    5000
}
fn default_reconnect_delay() -> u64 {
    10000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff() -> u64 {
    100
}
fn default_attempt_timeout() -> u64 {
    1000
}
fn default_zone_count() -> u16 {
    48
}

#[derive(Debug, Deserialize)]
struct MqttToml {
    url: String,
    #[serde(default = "default_client_id")]
    client_id: String,
    #[serde(default = "default_subscribe_topic")]
    subscribe_topic: String,
    #[serde(default = "default_publish_topic")]
    publish_topic: String,
}

fn default_client_id() -> String {
    "paradox-bridge".to_string()
}
fn default_subscribe_topic() -> String {
    "paradox/cmd".to_string()
}
fn default_publish_topic() -> String {
    "paradox".to_string()
}

fn build_session_config(toml: &PanelToml) -> Result<SessionConfig> {
    let transport = TransportKind::from_name(&toml.transport)
        .with_context(|| format!("Unknown transport '{}', expected tcp or udp", toml.transport))?;
    if toml.zone_count == 0 || toml.zone_count > paradox_lan_session::layout::MAX_ZONES {
        anyhow::bail!(
            "zone_count must be 1 to {}",
            paradox_lan_session::layout::MAX_ZONES
        );
    }

    Ok(SessionConfig::builder()
        .host(&toml.host)
        .port(toml.port)
        .transport(transport)
        .gateway_password(&toml.gateway_password)
        .pc_password(&toml.pc_password)
        .keep_alive_interval_ms(toml.keep_alive_interval_ms)
        .poll_interval_ms(toml.poll_interval_ms)
        .reconnect_delay_ms(toml.reconnect_delay_ms)
        .max_attempts(toml.max_attempts)
        .retry_backoff_ms(toml.retry_backoff_ms)
        .attempt_timeout_ms(toml.attempt_timeout_ms)
        .auto_reconnect(true)
        .build())
}

// ---------------------------------------------------------------------------
// MQTT JSON types
// ---------------------------------------------------------------------------

// Published messages — all share {now, op, ...} flat structure

#[derive(Serialize)]
struct MqttStatus {
    now: u64,
    op: String,
    state: String,
    detail: String,
    message: String,
}

// Unsolicited frame: {now, op, messageType, command, frame}
#[derive(Serialize)]
struct MqttFrameEvent {
    now: u64,
    op: String,
    #[serde(rename = "messageType")]
    message_type: u8,
    command: u8,
    frame: String,
}

#[derive(Serialize)]
struct MqttMemory {
    now: u64,
    op: String,
    blocks: usize,
    zones: Vec<MqttZoneState>,
}

#[derive(Serialize)]
struct MqttZoneState {
    id: u16,
    name: String,
    open: bool,
    tamper: bool,
    #[serde(rename = "lowBattery")]
    low_battery: bool,
}

// CMD_ACK response
#[derive(Serialize)]
struct MqttCmdAck {
    now: u64,
    op: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    src: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

// Inbound command (subscribed)
#[derive(Deserialize)]
struct MqttCommand {
    op: String,
    #[serde(default)]
    zone: Option<u16>,
    #[serde(default)]
    partition: Option<u16>,
}

/// Everything the bridge tasks share.
struct Bridge {
    session: Session,
    client: AsyncClient,
    topic: String,
    zone_names: HashMap<u16, String>,
    zone_count: u16,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn now_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

fn zone_label(zone_id: u16, overrides: &HashMap<u16, String>) -> String {
    overrides
        .get(&zone_id)
        .cloned()
        .unwrap_or_else(|| format!("Zone {zone_id}"))
}

async fn publish_json(client: &AsyncClient, topic: &str, payload: &impl Serialize, retain: bool) {
    match serde_json::to_string(payload) {
        Ok(json) => {
            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, retain, json).await {
                error!("Failed to publish to {topic}: {e}");
            }
        }
        Err(e) => error!("Failed to serialize MQTT payload: {e}"),
    }
}

async fn publish_status(
    client: &AsyncClient,
    topic: &str,
    state: SessionState,
    detail: StatusDetail,
    message: &str,
) {
    let msg = MqttStatus {
        now: now_epoch_ms(),
        op: "STATUS".to_string(),
        state: state.as_str().to_string(),
        detail: detail.as_str().to_string(),
        message: message.to_string(),
    };
    publish_json(client, topic, &msg, true).await;
}

async fn publish_cmd_ack(
    client: &AsyncClient,
    topic: &str,
    success: bool,
    src: Option<serde_json::Value>,
    data: Option<serde_json::Value>,
) {
    let msg = MqttCmdAck {
        now: now_epoch_ms(),
        op: "CMD_ACK".to_string(),
        success,
        src,
        data,
    };
    publish_json(client, topic, &msg, false).await;
}

fn build_memory(bridge: &Bridge, blocks: usize) -> MqttMemory {
    let snapshot = bridge.session.memory().snapshot();
    let zones = match ZoneStateFlags::from_snapshot(&snapshot) {
        Some(flags) => (1..=bridge.zone_count)
            .map(|id| {
                let zone = flags.zone(id);
                MqttZoneState {
                    id,
                    name: zone_label(id, &bridge.zone_names),
                    open: zone.contains(ZoneFlags::OPENED),
                    tamper: zone.contains(ZoneFlags::TAMPERED),
                    low_battery: zone.contains(ZoneFlags::LOW_BATTERY),
                }
            })
            .collect(),
        None => Vec::new(),
    };

    MqttMemory {
        now: now_epoch_ms(),
        op: "MEMORY".to_string(),
        blocks,
        zones,
    }
}

// ---------------------------------------------------------------------------
// Session event → MQTT
// ---------------------------------------------------------------------------

async fn handle_session_event(event: SessionEvent, bridge: &Bridge) {
    let client = &bridge.client;
    let topic = bridge.topic.as_str();

    match event {
        SessionEvent::StatusChanged {
            state,
            detail,
            message,
        } => {
            publish_status(client, topic, state, detail, &message).await;
        }
        SessionEvent::UnsolicitedFrame(frame) => {
            let msg = MqttFrameEvent {
                now: now_epoch_ms(),
                op: "EVENT".to_string(),
                message_type: frame.header().message_type,
                command: frame.header().command,
                frame: frame.to_hex(),
            };
            publish_json(client, topic, &msg, false).await;
        }
        SessionEvent::MemoryRefreshed { blocks } => {
            let msg = build_memory(bridge, blocks);
            publish_json(client, topic, &msg, true).await;
        }
        SessionEvent::Error(e) => {
            warn!("Session error: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// MQTT command handler
// ---------------------------------------------------------------------------

async fn read_label(session: &Session, cmd: &MqttCommand) -> paradox_lan_session::Result<String> {
    match (cmd.zone, cmd.partition) {
        (Some(zone), None) => session.read_zone_label(zone).await,
        (None, Some(partition)) => session.read_partition_label(partition).await,
        _ => Err(SessionError::InvalidArgument {
            details: "READ_LABEL needs exactly one of zone or partition".to_string(),
        }),
    }
}

async fn handle_command(payload_str: &str, cmd: MqttCommand, bridge: &Bridge) {
    let client = &bridge.client;
    let topic = bridge.topic.as_str();
    // Parse the raw payload as a JSON value for the CMD_ACK src field
    let src_json = serde_json::from_str::<serde_json::Value>(payload_str).ok();

    match cmd.op.as_str() {
        "PING" => {
            info!("Command: PING");
            publish_cmd_ack(client, topic, true, src_json, None).await;
        }

        "READ_LABEL" => {
            match read_label(&bridge.session, &cmd).await {
                Ok(label) => {
                    info!("READ_LABEL: {label}");
                    let data = serde_json::json!({ "label": label });
                    publish_cmd_ack(client, topic, true, src_json, Some(data)).await;
                }
                Err(e) => {
                    error!("READ_LABEL failed: {e}");
                    publish_cmd_ack(client, topic, false, src_json, None).await;
                }
            }
        }

        other => match SessionCommand::from_name(other) {
            Some(command) => {
                let success = match bridge.session.execute(command).await {
                    Ok(()) => {
                        info!("{other}: success");
                        true
                    }
                    Err(e) => {
                        error!("{other} failed: {e}");
                        false
                    }
                };
                publish_cmd_ack(client, topic, success, src_json, None).await;
            }
            None => {
                warn!("Unknown command: {other}");
                publish_cmd_ack(client, topic, false, src_json, None).await;
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=paradox_lan_session=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    let mut session_config = build_session_config(&config.panel)?;
    let (mut mqtt_host, mut mqtt_port) = parse_mqtt_url(&config.mqtt.url)?;

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        // Set up MQTT
        let mut mqtt_opts = MqttOptions::new(&config.mqtt.client_id, &mqtt_host, mqtt_port);
        mqtt_opts.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 256);

        let subscribe_topic = config.mqtt.subscribe_topic.clone();
        client
            .subscribe(&subscribe_topic, QoS::AtLeastOnce)
            .await
            .context("Failed to subscribe to MQTT topic")?;
        info!("MQTT: subscribed to {subscribe_topic}");

        let bridge = Arc::new(Bridge {
            session: Session::from_config(session_config.clone()),
            client: client.clone(),
            topic: config.mqtt.publish_topic.clone(),
            zone_names: config.zone_names.clone(),
            zone_count: config.panel.zone_count,
        });

        // Task 1: Session event listener
        let bridge_events = Arc::clone(&bridge);
        let mut event_rx = bridge.session.subscribe();
        let event_handle = tokio::spawn(async move {
            while let Some(event) = next_event(&mut event_rx).await {
                handle_session_event(event, &bridge_events).await;
            }
            info!("Event channel closed");
        });

        // Task 2: MQTT event loop (receives messages, handles commands)
        let bridge_cmds = Arc::clone(&bridge);
        let sub_topic = subscribe_topic.clone();
        let mqtt_handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        // rumqttc does not resubscribe after a broker reconnect
                        info!("MQTT: connected, subscribing to {sub_topic}");
                        if let Err(e) = bridge_cmds.client.subscribe(&sub_topic, QoS::AtLeastOnce).await {
                            error!("Failed to subscribe to {sub_topic}: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(msg))) => {
                        if msg.topic == sub_topic {
                            let payload = String::from_utf8_lossy(&msg.payload);
                            match serde_json::from_str::<MqttCommand>(&payload) {
                                Ok(cmd) => {
                                    info!("MQTT command received: {payload}");
                                    // Panel round trips must not block the MQTT poll loop
                                    let bridge = Arc::clone(&bridge_cmds);
                                    let payload = payload.into_owned();
                                    tokio::spawn(async move {
                                        handle_command(&payload, cmd, &bridge).await;
                                    });
                                }
                                Err(e) => {
                                    warn!("Failed to parse MQTT command: {e}");
                                }
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT event loop error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        // Task 3: initial connection; later reconnects are handled by the session
        let bridge_connect = Arc::clone(&bridge);
        let connect_handle = tokio::spawn(async move {
            info!(
                "Connecting to panel at {}:{}",
                bridge_connect.session.config().host,
                bridge_connect.session.config().port
            );
            match bridge_connect.session.connect_with_retry().await {
                Ok(()) => info!("Panel connected"),
                Err(e) => error!("Giving up connecting to panel: {e}"),
            }
        });

        // Wait for a signal
        info!("MQTT bridge running. Send SIGHUP to restart, SIGINT/SIGTERM to stop.");
        let restart = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                false
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                false
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading config and restarting connections...");
                true
            }
        };

        connect_handle.abort();
        event_handle.abort();

        match bridge.session.disconnect().await {
            Ok(()) | Err(SessionError::InvalidState { .. }) => {}
            Err(e) => warn!("Error disconnecting panel: {e}"),
        }
        publish_status(
            &client,
            &bridge.topic,
            SessionState::Disconnected,
            StatusDetail::BridgeOffline,
            "Bridge stopped",
        )
        .await;
        // Give the event loop a moment to flush the final status
        tokio::time::sleep(Duration::from_millis(200)).await;
        mqtt_handle.abort();

        if !restart {
            break;
        }

        // Reload config from disk; keep previous config on failure
        info!("Reloading config from {}", cli.config);
        match load_config(&cli.config).and_then(|new_config| {
            let new_session_config = build_session_config(&new_config.panel)?;
            let (host, port) = parse_mqtt_url(&new_config.mqtt.url)?;
            Ok((new_config, new_session_config, host, port))
        }) {
            Ok((new_config, new_session_config, host, port)) => {
                config = new_config;
                session_config = new_session_config;
                mqtt_host = host;
                mqtt_port = port;
                info!("Config reloaded successfully");
            }
            Err(e) => warn!("Failed to reload config, keeping previous: {e}"),
        }

        debug!("Reconnecting...");
    }

    info!("Shutdown complete");
    Ok(())
}

fn load_config(path: &str) -> Result<Config> {
    let text = std::fs::read_to_string(path).context("Failed to read config file")?;
    toml::from_str(&text).context("Failed to parse config file")
}

/// Parse an MQTT URL like "mqtt://host:port" into (host, port).
fn parse_mqtt_url(url: &str) -> Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port_str) = stripped
        .rsplit_once(':')
        .context("MQTT URL must be in format mqtt://host:port")?;

    let port: u16 = port_str.parse().context("Invalid MQTT port number")?;

    Ok((host.to_string(), port))
}
