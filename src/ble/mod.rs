//! BLE communication module.
//!
//! This module provides the connection state machine, the device registry
//! and the radio abstraction the device manager drives.

pub mod connection;
pub mod platform;
pub mod radio;
pub mod registry;
pub mod uuids;

pub use connection::{BleCommand, BleEvent, ConnectionMachine, ConnectionState, SessionId};
pub use platform::BtleplugRadio;
pub use radio::{Radio, RadioEvent};
pub use registry::{DeviceRegistry, PeripheralHandle, PeripheralId};
pub use uuids::*;
