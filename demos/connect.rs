//! Example: Log in to an IP150 module and print zone and partition labels.

use paradox_lan_session::{Session, SessionConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = SessionConfig::builder()
        .host("192.168.0.100")
        .port(10000)
        .gateway_password("paradox")
        .pc_password("0000")
        .poll_interval_ms(0)
        .build();

    println!("Connecting to panel...");
    let session = Session::from_config(config);
    session.connect_with_retry().await?;

    println!("\n--- Zones ---");
    for zone in 1..=16 {
        match session.read_zone_label(zone).await {
            Ok(label) if !label.is_empty() => println!("  Zone {:3}: {}", zone, label),
            Ok(_) => {}
            Err(e) => println!("  Zone {:3}: error {}", zone, e),
        }
    }

    println!("\n--- Partitions ---");
    for partition in 1..=8 {
        if let Ok(label) = session.read_partition_label(partition).await
            && !label.is_empty()
        {
            println!("  Partition {}: {}", partition, label);
        }
    }

    let health = session.health();
    println!(
        "\nFrames decoded={} bytes discarded={}",
        health.codec.frames, health.codec.discarded_bytes
    );

    session.disconnect().await?;
    Ok(())
}
