//! Basic example: List every advertising BLE peripheral nearby
//!
//! Run with: cargo run --example discover_devices

use smart_temp_ble::{DeviceManager, Result, TelemetryUpdate};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("smart_temp_ble=debug".parse().unwrap()),
        )
        .init();

    println!("Starting BLE discovery...");
    println!("Make sure the thermometer is switched on!\n");

    let manager = DeviceManager::new().await?;

    // Print the device list whenever it grows
    let _handle = manager.telemetry().on_update(|update| {
        if let TelemetryUpdate::DevicesChanged(devices) = update {
            if let Some(device) = devices.last() {
                println!(
                    "  [{}] {} - {} (RSSI: {:?} dBm)",
                    devices.len(),
                    device.display_name(),
                    device.id,
                    device.rssi
                );
            }
        }
    });

    manager.start_scan().await?;

    println!("Scanning for 30 seconds...");
    println!("Press Ctrl+C to exit early.\n");

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted!");
        }
    }

    let devices = manager.scanned_devices();
    println!("\n--- Scan Complete ---");
    println!("Total devices found: {}", devices.len());

    for device in devices {
        println!(
            "  {} - {} (RSSI: {:?})",
            device.display_name(),
            device.id,
            device.rssi
        );
    }

    manager.shutdown().await?;
    println!("\nDone!");

    Ok(())
}
