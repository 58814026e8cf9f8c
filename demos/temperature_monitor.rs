//! Real-time temperature monitoring example
//!
//! Connects to the first device whose name matches the argument (or the
//! strongest signal) and prints both probes with their alert state.
//!
//! Run with: cargo run --example temperature_monitor -- [name] [threshold °C]

use smart_temp_ble::{
    celsius_to_fahrenheit, ConnectionState, DeviceManager, Error, Probe, Result,
    TelemetrySnapshot,
};
use std::io::Write;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (minimal)
    tracing_subscriber::fmt().with_env_filter("warn").init();

    let mut args = std::env::args().skip(1);
    let name_filter = args.next();
    let threshold = args.next().and_then(|t| t.parse::<f64>().ok());

    println!("Temperature Monitor");
    println!("==================\n");
    println!("Looking for devices...\n");

    let manager = DeviceManager::new().await?;
    manager.start_scan().await?;

    // Wait for devices to be discovered
    tokio::time::sleep(Duration::from_secs(5)).await;

    let device = manager
        .scanned_devices()
        .into_iter()
        .filter(|d| match &name_filter {
            Some(name) => d.display_name().contains(name.as_str()),
            None => true,
        })
        .max_by_key(|d| d.rssi.unwrap_or(i16::MIN))
        .ok_or_else(|| Error::DeviceNotFound {
            identifier: name_filter.clone().unwrap_or_else(|| "any".to_string()),
        })?;

    println!("Found device: {} ({})", device.display_name(), device.id);
    println!("Connecting...\n");

    if let Some(threshold) = threshold {
        for probe in Probe::ALL {
            manager.set_threshold(probe, threshold).await?;
        }
    }
    manager.connect(device.id.as_str()).await?;

    let mut snapshots = manager.telemetry().watch();

    // Monitor loop
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n\nExiting...");
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                display_temperatures(&snapshot);
                if snapshot.connection_state.is_terminal() {
                    println!("\nSession ended: {}", snapshot.connection_state);
                    break;
                }
            }
        }
    }

    manager.shutdown().await?;

    Ok(())
}

fn display_temperatures(snapshot: &TelemetrySnapshot) {
    // Clear screen and move cursor to top
    print!("\x1B[2J\x1B[1;1H");

    println!("=== Temperature Monitor ===");
    println!("Connection: {}\n", snapshot.connection_state);

    if snapshot.connection_state != ConnectionState::Subscribed {
        println!("Waiting for readings...");
    }

    for probe in Probe::ALL {
        let threshold = snapshot.threshold(probe);
        let alert = if snapshot.alert(probe).is_raised() {
            "  << DONE"
        } else {
            ""
        };

        match snapshot.temperature(probe).and_then(|r| r.celsius()) {
            Some(c) => println!(
                "  {}: {:6.1}°C ({:6.1}°F)  target {:.1}°C{}",
                probe,
                c,
                celsius_to_fahrenheit(c),
                threshold.celsius(),
                alert
            ),
            None => println!("  {}: --  target {:.1}°C", probe, threshold.celsius()),
        }
    }

    if let Some(at) = snapshot.last_update {
        println!("\nLast update: {}", at.format("%H:%M:%S"));
    }

    println!("\nPress Ctrl+C to exit");
    let _ = std::io::stdout().flush();
}
