//! Platform radio abstraction.
//!
//! [`Radio`] is the seam between the device manager's event loop and the
//! platform BLE stack. [`BtleplugRadio`](crate::ble::platform::BtleplugRadio)
//! implements it over btleplug.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::ble::connection::BleEvent;
use crate::ble::registry::{PeripheralHandle, PeripheralId};
use crate::error::Result;

/// Out-of-band event from the platform stack.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// A peripheral advertised (first time or again).
    Discovered(PeripheralHandle),
    /// A peripheral's link dropped.
    Disconnected(PeripheralId),
    /// The adapter was powered on.
    PoweredOn,
    /// The adapter was powered off.
    PoweredOff,
}

impl From<RadioEvent> for BleEvent {
    fn from(event: RadioEvent) -> Self {
        match event {
            RadioEvent::Discovered(handle) => BleEvent::Discovered(handle),
            RadioEvent::Disconnected(id) => BleEvent::PeripheralDisconnected(id),
            RadioEvent::PoweredOn => BleEvent::RadioPoweredOn,
            RadioEvent::PoweredOff => BleEvent::RadioPoweredOff,
        }
    }
}

/// Stream of adapter-level events.
pub type RadioEventStream = BoxStream<'static, RadioEvent>;

/// Stream of raw values notified by one characteristic.
pub type NotificationStream = BoxStream<'static, Bytes>;

/// Central-role operations the event loop needs from the platform.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Radio: Send + Sync {
    /// Adapter-level event stream. Called once when the manager starts.
    async fn events(&self) -> Result<RadioEventStream>;

    /// Begin scanning, optionally restricted to advertisers of a service.
    async fn start_scan(&self, service_filter: Option<Uuid>) -> Result<()>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Connect to a discovered peripheral.
    async fn connect(&self, peripheral: &PeripheralId) -> Result<()>;

    /// Disconnect from a peripheral.
    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()>;

    /// Enumerate the peripheral's services.
    async fn discover_services(&self, peripheral: &PeripheralId) -> Result<Vec<Uuid>>;

    /// Enumerate the characteristics of one service.
    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
    ) -> Result<Vec<Uuid>>;

    /// Enable notifications on a characteristic.
    async fn subscribe(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()>;

    /// Values notified by a characteristic.
    async fn notifications(
        &self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
    ) -> Result<NotificationStream>;
}
