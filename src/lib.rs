// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # smart-temp-ble
//!
//! A cross-platform Rust library for reading a two-probe BBQ thermometer over
//! Bluetooth Low Energy.
//!
//! The thermometer exposes one notifying characteristic that streams both probe
//! temperatures. This crate scans for it, connects, subscribes, decodes every
//! notification and raises an alert when a probe reaches its threshold.
//!
//! ## Features
//!
//! - **Discovery**: Scan for advertising peripherals and list them in discovery order
//! - **Connection**: One session at a time, with a timeout on every connection phase
//! - **Real-time Temperatures**: Both probes decoded from each notification
//! - **Threshold Alerts**: Per-probe thresholds, re-evaluated on every change
//! - **Telemetry**: Subscribe to changes or watch a full snapshot
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use smart_temp_ble::{DeviceManager, Probe, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Create device manager and start scanning
//!     let manager = DeviceManager::new().await?;
//!     manager.start_scan().await?;
//!
//!     // Wait for devices to be discovered
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     if let Some(device) = manager.scanned_devices().first() {
//!         println!("Connecting to {} ({})", device.display_name(), device.id);
//!         manager.connect(device.id.as_str()).await?;
//!     }
//!
//!     let mut updates = manager.telemetry().subscribe();
//!     while let Ok(update) = updates.recv().await {
//!         println!("{:?}", update);
//!         if manager.telemetry().alert(Probe::P1).is_raised() {
//!             println!("Probe 1 is done!");
//!             break;
//!         }
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod data;
pub mod device_manager;
pub mod error;
pub mod protocol;
pub mod telemetry;
pub mod utils;

// Re-exports for convenience
pub use config::ManagerConfig;
pub use device_manager::DeviceManager;
pub use error::{DecodeError, Error, Result, SessionError};
pub use telemetry::{CallbackHandle, TelemetryPublisher, TelemetrySnapshot, TelemetryUpdate};
pub use utils::{celsius_to_fahrenheit, fahrenheit_to_celsius};

// Re-export commonly used types from submodules
pub use ble::connection::{ConnectionState, SessionPhase};
pub use ble::platform::BtleplugRadio;
pub use ble::radio::{Radio, RadioEvent};
pub use ble::registry::{PeripheralHandle, PeripheralId};
pub use ble::uuids::{TEMPERATURE_CHARACTERISTIC_UUID, TEMPERATURE_SERVICE_UUID};
pub use data::{
    AlertState, Probe, ProbeReadings, TemperatureReading, Threshold, DEFAULT_THRESHOLD_CELSIUS,
};
pub use protocol::{decode, RawTemperature};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<DeviceManager>();
        let _ = std::any::TypeId::of::<TelemetryPublisher>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<ProbeReadings>();
        let _ = std::any::TypeId::of::<ConnectionState>();
    }

    #[test]
    fn test_decode_from_crate_root() {
        let readings = decode(&[0, 0, 0, 65, 0, 70, 0]).unwrap();
        assert_eq!(readings.get(Probe::P1), TemperatureReading::Valid(65.0));
    }

    #[test]
    fn test_temperature_conversion() {
        assert!((celsius_to_fahrenheit(100.0) - 212.0).abs() < 0.001);
        assert!((fahrenheit_to_celsius(212.0) - 100.0).abs() < 0.001);
    }
}
