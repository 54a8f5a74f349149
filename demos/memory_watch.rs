//! Example: Poll panel memory and print zone changes as they happen.

use std::collections::HashMap;

use paradox_lan_session::{Session, SessionConfig, SessionEvent, ZoneFlags, ZoneStateFlags, next_event};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = SessionConfig::builder()
        .host("192.168.0.100")
        .gateway_password("paradox")
        .pc_password("0000")
        .poll_interval_ms(2000)
        .memory_blocks([1, 9])
        .build();

    let session = Session::from_config(config);
    let mut events = session.subscribe();
    session.connect_with_retry().await?;

    println!("Watching zones 1-48 (Ctrl+C to stop)...\n");
    let mut last: HashMap<u16, ZoneFlags> = HashMap::new();

    loop {
        tokio::select! {
            event = next_event(&mut events) => {
                match event {
                    Some(SessionEvent::MemoryRefreshed { .. }) => {
                        let Some(flags) = ZoneStateFlags::from_snapshot(&session.memory().snapshot()) else {
                            continue;
                        };
                        for zone in 1..=48 {
                            let now = flags.zone(zone);
                            if last.insert(zone, now) != Some(now) {
                                println!("Zone {:3}: {:?}", zone, now);
                            }
                        }
                    }
                    Some(SessionEvent::StatusChanged { state, detail, message }) => {
                        println!("Session {} ({}): {}", state, detail, message);
                    }
                    Some(SessionEvent::UnsolicitedFrame(frame)) => {
                        println!("Frame: {}", frame.to_hex());
                    }
                    Some(SessionEvent::Error(e)) => println!("Error: {}", e),
                    None => {
                        println!("Event channel closed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    session.disconnect().await?;
    Ok(())
}
