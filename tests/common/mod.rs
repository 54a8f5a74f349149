// Loopback fake panel for integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use paradox_lan_session::codec::{Frame, FrameCodec};
use paradox_lan_session::protocol::{
    CMD_CLOSE_CONNECTION, CMD_INITIALIZE, CMD_READ_MEMORY, IP_KEEP_ALIVE, IP_LOGIN, IP_SERIAL_CONNECT,
    ip_response, serial_response,
};
use paradox_lan_session::{SessionConfig, SessionEvent, SessionState, StatusDetail};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::{Duration, timeout};

pub const GATEWAY_PASSWORD: &str = "paradox";

enum Control {
    Push(Frame),
    Close,
}

/// A TCP server that answers like an IP150 module with an EVO panel behind it.
///
/// RAM block N reads back as 64 bytes of N. EEPROM reads come from a preset
/// map and default to spaces.
pub struct FakePanel {
    pub port: u16,
    connections: Arc<AtomicUsize>,
    answer_keep_alive: Arc<AtomicBool>,
    answer_login: Arc<AtomicBool>,
    current: Arc<Mutex<Option<mpsc::Sender<Control>>>>,
}

impl FakePanel {
    pub async fn start() -> Self {
        Self::start_with_eeprom(HashMap::from([(0x430u16, b"Front door      ".to_vec())])).await
    }

    pub async fn start_with_eeprom(eeprom: HashMap<u16, Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        let answer_keep_alive = Arc::new(AtomicBool::new(true));
        let answer_login = Arc::new(AtomicBool::new(true));
        let current: Arc<Mutex<Option<mpsc::Sender<Control>>>> = Arc::new(Mutex::new(None));
        let eeprom = Arc::new(eeprom);

        let (conn_count, keep_alive, login, slot) = (
            connections.clone(),
            answer_keep_alive.clone(),
            answer_login.clone(),
            current.clone(),
        );
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                conn_count.fetch_add(1, Ordering::SeqCst);
                let (tx, rx) = mpsc::channel(16);
                *slot.lock().await = Some(tx);
                tokio::spawn(serve(socket, rx, keep_alive.clone(), login.clone(), eeprom.clone()));
            }
        });

        Self {
            port,
            connections,
            answer_keep_alive,
            answer_login,
            current,
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn set_answer_keep_alive(&self, answer: bool) {
        self.answer_keep_alive.store(answer, Ordering::SeqCst);
    }

    /// Stop answering (or resume answering) IP login requests.
    pub fn set_answer_login(&self, answer: bool) {
        self.answer_login.store(answer, Ordering::SeqCst);
    }

    /// Send a frame the session did not ask for.
    pub async fn push(&self, frame: Frame) {
        if let Some(tx) = self.current.lock().await.as_ref() {
            tx.send(Control::Push(frame)).await.unwrap();
        }
    }

    /// Close the current connection from the panel side.
    pub async fn drop_connection(&self) {
        if let Some(tx) = self.current.lock().await.take() {
            let _ = tx.send(Control::Close).await;
        }
    }

    /// Session config pointing at this panel, tuned for fast tests.
    pub fn config(&self) -> paradox_lan_session::SessionConfigBuilder {
        SessionConfig::builder()
            .host("127.0.0.1")
            .port(self.port)
            .gateway_password(GATEWAY_PASSWORD)
            .pc_password("0000")
            .connect_timeout_ms(1000)
            .read_timeout_ms(100)
            .attempt_timeout_ms(200)
            .retry_backoff_ms(20)
            .poll_interval_ms(0)
            .auto_reconnect(false)
            .shutdown_wait_ms(2000)
    }
}

async fn serve(
    mut socket: tokio::net::TcpStream,
    mut control: mpsc::Receiver<Control>,
    answer_keep_alive: Arc<AtomicBool>,
    answer_login: Arc<AtomicBool>,
    eeprom: Arc<HashMap<u16, Vec<u8>>>,
) {
    let mut codec = FrameCodec::new();
    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            read = socket.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                for request in codec.push(&buf[..n]) {
                    if let Some(reply) = answer(&request, &answer_keep_alive, &answer_login, &eeprom)
                        && socket.write_all(&reply.encode()).await.is_err()
                    {
                        return;
                    }
                }
            }
            item = control.recv() => match item {
                Some(Control::Push(frame)) => {
                    if socket.write_all(&frame.encode()).await.is_err() {
                        return;
                    }
                }
                Some(Control::Close) | None => return,
            }
        }
    }
}

fn answer(
    request: &Frame,
    answer_keep_alive: &AtomicBool,
    answer_login: &AtomicBool,
    eeprom: &HashMap<u16, Vec<u8>>,
) -> Option<Frame> {
    let header = request.header();
    match header.command {
        IP_LOGIN => {
            if !answer_login.load(Ordering::SeqCst) {
                return None;
            }
            let status = if &request.body()[..] == GATEWAY_PASSWORD.as_bytes() { 0x00 } else { 0x01 };
            return ip_response(IP_LOGIN, &[status, 0x00, 0x00, 0x00]).ok();
        }
        IP_SERIAL_CONNECT => return ip_response(IP_SERIAL_CONNECT, &[0x00; 4]).ok(),
        IP_KEEP_ALIVE => {
            return answer_keep_alive
                .load(Ordering::SeqCst)
                .then(|| ip_response(IP_KEEP_ALIVE, &[0x00; 4]).ok())
                .flatten();
        }
        _ => {}
    }

    let body = request.body();
    match *body.first()? {
        CMD_INITIALIZE => serial_response(0x10, [0x00; 5], &[0x00]).ok(),
        CMD_CLOSE_CONNECTION => serial_response(CMD_CLOSE_CONNECTION, [0x00; 5], &[]).ok(),
        CMD_READ_MEMORY => {
            // [cmd, 0x00, control, 0x00, hi, lo, len, checksum]
            let control = body[2];
            let address = u16::from_be_bytes([body[4], body[5]]);
            let len = body[6] as usize;
            let payload = if control & 0x80 != 0 {
                vec![address as u8; len]
            } else {
                let mut data = eeprom.get(&address).cloned().unwrap_or_default();
                data.resize(len, b' ');
                data
            };
            let prefix = [0x00, control, 0x00, body[4], body[5]];
            serial_response(0x52, prefix, &payload).ok()
        }
        _ => None,
    }
}

/// Wait for the next status change, skipping other events.
pub async fn next_status(rx: &mut broadcast::Receiver<SessionEvent>) -> (SessionState, StatusDetail) {
    timeout(Duration::from_secs(5), async {
        loop {
            if let SessionEvent::StatusChanged { state, detail, .. } = rx.recv().await.unwrap() {
                return (state, detail);
            }
        }
    })
    .await
    .expect("no status change within 5s")
}

/// Wait until the session reaches `state`.
pub async fn wait_for_state(watch: &mut tokio::sync::watch::Receiver<SessionState>, state: SessionState) {
    timeout(Duration::from_secs(5), watch.wait_for(|s| *s == state))
        .await
        .expect("state not reached within 5s")
        .unwrap();
}
