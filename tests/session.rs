// Session lifecycle tests against a loopback fake panel

mod common;

use std::sync::Arc;

use common::{FakePanel, next_status, wait_for_state};
use paradox_lan_session::protocol::ip_response;
use paradox_lan_session::{Session, SessionCommand, SessionError, SessionEvent, SessionState, StatusDetail};
use tokio::time::{Duration, sleep, timeout};

fn session_for(config: paradox_lan_session::SessionConfig) -> Session {
    Session::from_config(config)
}

#[tokio::test]
async fn connect_read_and_logout() {
    let panel = FakePanel::start().await;
    let session = session_for(panel.config().build());
    let mut events = session.subscribe();

    session.connect().await.unwrap();
    assert_eq!(session.state(), SessionState::Online);
    assert_eq!(next_status(&mut events).await, (SessionState::Connecting, StatusDetail::None));
    assert_eq!(
        next_status(&mut events).await,
        (SessionState::Authenticating, StatusDetail::None)
    );
    assert_eq!(next_status(&mut events).await, (SessionState::Online, StatusDetail::None));

    assert_eq!(session.read_zone_label(1).await.unwrap(), "Front door");
    assert_eq!(session.read_zone_label(2).await.unwrap(), "");

    let block = session.read_ram_block(3).await.unwrap();
    assert_eq!(block.len(), 64);
    assert!(block.iter().all(|b| *b == 3));

    session.disconnect().await.unwrap();
    assert_eq!(
        next_status(&mut events).await,
        (SessionState::Disconnecting, StatusDetail::None)
    );
    assert_eq!(
        next_status(&mut events).await,
        (SessionState::Disconnected, StatusDetail::None)
    );
    assert!(matches!(
        session.read_ram_block(3).await,
        Err(SessionError::NotOnline { .. })
    ));
}

#[tokio::test]
async fn connect_only_from_disconnected() {
    let panel = FakePanel::start().await;
    let session = session_for(panel.config().build());

    session.connect().await.unwrap();
    assert!(matches!(
        session.connect().await,
        Err(SessionError::InvalidState {
            from: SessionState::Online,
            trigger: "connect"
        })
    ));
    assert_eq!(panel.connections(), 1);
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn rejected_password_is_configuration_error() {
    let panel = FakePanel::start().await;
    let session = session_for(
        panel
            .config()
            .gateway_password("wrong")
            .auto_reconnect(true)
            .reconnect_delay_ms(20)
            .build(),
    );
    let mut events = session.subscribe();

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, SessionError::Authentication { .. }));

    let mut last = None;
    while let Ok(Ok(event)) = timeout(Duration::from_millis(100), events.recv()).await {
        if let SessionEvent::StatusChanged { state, detail, .. } = event {
            last = Some((state, detail));
        }
    }
    assert_eq!(
        last,
        Some((SessionState::Disconnected, StatusDetail::ConfigurationError))
    );

    // Bad credentials are never retried
    sleep(Duration::from_millis(200)).await;
    assert_eq!(panel.connections(), 1);
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn unsolicited_frames_arrive_in_order() {
    let panel = FakePanel::start().await;
    let session = session_for(panel.config().build());
    session.connect().await.unwrap();
    let mut events = session.subscribe();

    let frames: Vec<_> = (1..=3u8)
        .map(|i| ip_response(0xE0 + i, &[i; 20]).unwrap())
        .collect();
    for frame in &frames {
        panel.push(frame.clone()).await;
    }

    for expected in &frames {
        let received = timeout(Duration::from_secs(2), async {
            loop {
                if let SessionEvent::UnsolicitedFrame(frame) = events.recv().await.unwrap() {
                    return frame;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(&received, expected);
    }

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn unanswered_command_times_out_without_dropping_session() {
    let panel = FakePanel::start().await;
    let session = session_for(panel.config().attempt_timeout_ms(50).build());
    session.connect().await.unwrap();

    // The fake panel ignores command 0x30
    let result = session.send_command(0x30, &[0x00]).await;
    assert!(matches!(
        result,
        Err(SessionError::CorrelationTimeout {
            command: 0x3,
            attempts: 3
        })
    ));
    assert_eq!(session.state(), SessionState::Online);
    assert!(session.health().in_flight.is_none());

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn remote_close_takes_session_offline() {
    let panel = FakePanel::start().await;
    let session = session_for(panel.config().build());
    session.connect().await.unwrap();
    let mut events = session.subscribe();
    let mut state = session.state_watch();

    panel.drop_connection().await;
    wait_for_state(&mut state, SessionState::Disconnected).await;

    let mut saw_error = false;
    let mut offline = Vec::new();
    while let Ok(Ok(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        match event {
            SessionEvent::Error(e) => {
                assert!(e.is_transport());
                saw_error = true;
            }
            SessionEvent::StatusChanged { state, detail, .. } => offline.push((state, detail)),
            _ => {}
        }
    }
    assert!(saw_error);
    assert_eq!(
        offline,
        vec![(SessionState::Disconnected, StatusDetail::CommunicationError)]
    );
    assert!(session.health().last_error.is_some());
}

#[tokio::test]
async fn ping_failures_take_session_offline_once() {
    let panel = FakePanel::start().await;
    let session = session_for(
        panel
            .config()
            .keep_alive_interval_ms(50)
            .max_ping_failures(3)
            .max_attempts(1)
            .attempt_timeout_ms(30)
            .build(),
    );
    session.connect().await.unwrap();
    let mut events = session.subscribe();
    let mut state = session.state_watch();

    // Pings succeed while the panel answers
    sleep(Duration::from_millis(200)).await;
    assert_eq!(session.state(), SessionState::Online);
    assert_eq!(session.health().consecutive_ping_failures, 0);

    panel.set_answer_keep_alive(false);
    wait_for_state(&mut state, SessionState::Disconnected).await;

    sleep(Duration::from_millis(300)).await;
    let mut offline = 0;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::StatusChanged { state, detail, .. } = event {
            assert_eq!(state, SessionState::Disconnected);
            assert_eq!(detail, StatusDetail::CommunicationError);
            offline += 1;
        }
    }
    assert_eq!(offline, 1);
    assert_eq!(session.health().consecutive_ping_failures, 3);
}

#[tokio::test]
async fn ping_failures_below_threshold_keep_session_online() {
    let panel = FakePanel::start().await;
    let session = session_for(
        panel
            .config()
            .keep_alive_interval_ms(100)
            .max_ping_failures(3)
            .max_attempts(1)
            .attempt_timeout_ms(30)
            .build(),
    );
    session.connect().await.unwrap();

    panel.set_answer_keep_alive(false);
    timeout(Duration::from_secs(5), async {
        while session.health().consecutive_ping_failures < 2 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    panel.set_answer_keep_alive(true);

    let health = session.health();
    assert_eq!(health.consecutive_ping_failures, 2);
    assert_eq!(health.state, SessionState::Online);

    // One acknowledged ping clears the count
    timeout(Duration::from_secs(5), async {
        while session.health().consecutive_ping_failures != 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(session.state(), SessionState::Online);

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn commands_are_not_held_up_by_idle_reader() {
    let panel = FakePanel::start().await;
    let session = session_for(panel.config().read_timeout_ms(1000).build());
    session.connect().await.unwrap();
    // Let the reader settle into a long idle receive
    sleep(Duration::from_millis(50)).await;

    let start = tokio::time::Instant::now();
    for block in 1..=8u16 {
        assert_eq!(session.read_ram_block(block).await.unwrap()[0], block as u8);
    }
    assert!(
        start.elapsed() < Duration::from_millis(800),
        "8 reads took {:?}",
        start.elapsed()
    );

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn dropped_session_stops_reconnecting_while_busy() {
    let panel = FakePanel::start().await;
    let session = session_for(
        panel
            .config()
            .auto_reconnect(true)
            .reconnect_delay_ms(20)
            .max_attempts(1)
            .attempt_timeout_ms(500)
            .build(),
    );
    session.connect().await.unwrap();
    let mut state = session.state_watch();

    // The reconnect holds the session busy while its login goes unanswered
    panel.set_answer_login(false);
    panel.drop_connection().await;
    wait_for_state(&mut state, SessionState::Authenticating).await;
    drop(session);

    sleep(Duration::from_secs(1)).await;
    let settled = panel.connections();
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(panel.connections(), settled);
}

#[tokio::test]
async fn reconnects_after_remote_close() {
    let panel = FakePanel::start().await;
    let session = session_for(
        panel
            .config()
            .auto_reconnect(true)
            .reconnect_delay_ms(50)
            .build(),
    );
    session.connect().await.unwrap();
    let mut state = session.state_watch();

    panel.drop_connection().await;
    wait_for_state(&mut state, SessionState::Disconnected).await;
    timeout(Duration::from_secs(5), async {
        while session.health().reconnects == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(session.state(), SessionState::Online);
    assert_eq!(panel.connections(), 2);
    assert_eq!(session.health().reconnects, 1);
    assert_eq!(session.read_ram_block(1).await.unwrap()[0], 1);

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn explicit_disconnect_cancels_reconnect() {
    let panel = FakePanel::start().await;
    let session = session_for(
        panel
            .config()
            .auto_reconnect(true)
            .reconnect_delay_ms(300)
            .build(),
    );
    session.connect().await.unwrap();
    let mut state = session.state_watch();

    panel.drop_connection().await;
    wait_for_state(&mut state, SessionState::Disconnected).await;
    session.disconnect().await.unwrap();

    sleep(Duration::from_millis(500)).await;
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(panel.connections(), 1);
}

#[tokio::test]
async fn memory_poll_fills_cache() {
    let panel = FakePanel::start().await;
    let session = session_for(
        panel
            .config()
            .poll_interval_ms(100)
            .memory_blocks([1, 9])
            .build(),
    );
    let mut events = session.subscribe();
    session.connect().await.unwrap();

    let blocks = timeout(Duration::from_secs(2), async {
        loop {
            if let SessionEvent::MemoryRefreshed { blocks } = events.recv().await.unwrap() {
                return blocks;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(blocks, 2);
    assert_eq!(session.memory().read_bytes(1, 0..2), Some(vec![1, 1]));
    assert_eq!(session.memory().read_bytes(9, 63..64), Some(vec![9]));
    assert_eq!(session.health().memory_blocks, 2);

    session.disconnect().await.unwrap();
    assert!(session.memory().is_empty());
}

#[tokio::test]
async fn execute_reset_and_refresh() {
    let panel = FakePanel::start().await;
    let session = Arc::new(session_for(panel.config().memory_blocks([2]).build()));

    session.execute(SessionCommand::Login).await.unwrap();
    session.execute(SessionCommand::Refresh).await.unwrap();
    assert_eq!(session.memory().read_bytes(2, 0..1), Some(vec![2]));

    session.execute(SessionCommand::Reset).await.unwrap();
    assert_eq!(session.state(), SessionState::Online);
    assert_eq!(panel.connections(), 2);

    session.execute(SessionCommand::Logout).await.unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
}
