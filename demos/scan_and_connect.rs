//! Scan, connect to a peripheral and print its notifications
//!
//! Run with: cargo run --example scan_and_connect
//!
//! To connect to a specific peripheral:
//!   cargo run --example scan_and_connect -- --id AA:BB:CC:DD:EE:FF

use ble_link::{LinkConfig, LinkEvent, LinkManager, ReconnectPolicy, Result};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,ble_link=debug")
        .init();

    let args: Vec<String> = std::env::args().collect();
    let target_id = args
        .iter()
        .position(|arg| arg == "--id")
        .and_then(|i| args.get(i + 1))
        .cloned();

    let config = LinkConfig::new().reconnect(
        ReconnectPolicy::fixed_delay(Duration::from_secs(5)).backoff(2.0, Duration::from_secs(60)),
    );
    let manager = LinkManager::with_btleplug(config).await?;

    let _notifications = manager.on_notification(|event| {
        println!(
            "[notify] {}: {}",
            event.characteristic_uuid,
            event.as_text_lossy()
        );
    });

    println!("Scanning for 5 seconds...\n");
    manager.start_scan().await?;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let peripherals = manager.peripherals();
    for p in &peripherals {
        println!(
            "  {} (RSSI: {})",
            p,
            p.rssi.map_or("?".to_string(), |r| format!("{} dBm", r))
        );
    }

    let target = match target_id {
        Some(id) => peripherals.into_iter().find(|p| p.id == id),
        None => peripherals.into_iter().max_by_key(|p| p.rssi.unwrap_or(i16::MIN)),
    };

    let Some(target) = target else {
        println!("\nNo peripheral found.");
        manager.shutdown().await?;
        return Ok(());
    };

    println!("\nConnecting to {}...", target);
    manager.connect(&target.id).await?;

    let mut events = manager.subscribe();
    println!("Press Ctrl+C to stop.\n");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(LinkEvent::StateChanged { from, to, failure }) => match failure {
                    Some(failure) => println!("[state] {} -> {} ({})", from, to, failure),
                    None => println!("[state] {} -> {}", from, to),
                },
                Ok(LinkEvent::ReconnectScheduled { attempt, delay, .. }) => {
                    println!("[reconnect] attempt {} in {:?}", attempt, delay);
                }
                Ok(LinkEvent::CharacteristicRead { uuid, value }) => {
                    println!("[read] {}: {}", uuid, ble_link::payload_to_string_lossy(&value));
                }
                Ok(_) => {}
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("\nDisconnecting...");
    manager.shutdown().await?;

    Ok(())
}
