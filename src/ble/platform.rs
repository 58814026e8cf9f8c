//! btleplug-backed [`Radio`].
//!
//! Uses the first adapter reported by the platform. Peripheral objects are
//! cached by identifier as they are discovered so later calls can address them.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::ble::radio::{NotificationStream, Radio, RadioEvent, RadioEventStream};
use crate::ble::registry::{PeripheralHandle, PeripheralId};
use crate::error::{Error, Result};

type PeripheralCache = Arc<RwLock<HashMap<PeripheralId, Peripheral>>>;

/// [`Radio`] implementation over a btleplug adapter.
pub struct BtleplugRadio {
    /// The BLE adapter.
    adapter: Adapter,
    /// Peripherals seen so far.
    peripherals: PeripheralCache,
}

impl BtleplugRadio {
    /// Open the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripherals.read().get(id).cloned() {
            return Ok(peripheral);
        }

        // Not cached yet, e.g. discovered before the event stream was opened.
        let peripheral = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == id.as_str())
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: id.to_string(),
            })?;
        self.peripherals.write().insert(id.clone(), peripheral.clone());
        Ok(peripheral)
    }

    fn characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<Characteristic> {
        peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .and_then(|s| s.characteristics.into_iter().find(|c| c.uuid == characteristic))
    }

    /// Translate a btleplug central event.
    async fn translate(
        event: CentralEvent,
        adapter: &Adapter,
        peripherals: &PeripheralCache,
    ) -> Option<RadioEvent> {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                trace!("Device advertised: {:?}", id);
                let peripheral = match adapter.peripheral(&id).await {
                    Ok(p) => p,
                    Err(e) => {
                        trace!("Failed to get peripheral: {}", e);
                        return None;
                    }
                };
                let properties = peripheral.properties().await.ok().flatten()?;
                let handle =
                    PeripheralHandle::new(id.to_string(), properties.local_name, properties.rssi);
                peripherals.write().insert(handle.id.clone(), peripheral);
                Some(RadioEvent::Discovered(handle))
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                Some(RadioEvent::Disconnected(PeripheralId::new(id.to_string())))
            }
            CentralEvent::StateUpdate(state) => power_event(state),
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
                None
            }
            _ => None,
        }
    }
}

/// Map an adapter power state onto a radio event.
fn power_event(state: CentralState) -> Option<RadioEvent> {
    match state {
        CentralState::PoweredOn => Some(RadioEvent::PoweredOn),
        CentralState::PoweredOff => Some(RadioEvent::PoweredOff),
        _ => None,
    }
}

#[async_trait]
impl Radio for BtleplugRadio {
    async fn events(&self) -> Result<RadioEventStream> {
        let events = self.adapter.events().await?;
        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();

        Ok(events
            .filter_map(move |event| {
                let adapter = adapter.clone();
                let peripherals = peripherals.clone();
                async move { Self::translate(event, &adapter, &peripherals).await }
            })
            .boxed())
    }

    async fn start_scan(&self, service_filter: Option<Uuid>) -> Result<()> {
        info!("Starting BLE scan (filter: {:?})", service_filter);
        let filter = ScanFilter {
            services: service_filter.into_iter().collect(),
        };
        self.adapter.start_scan(filter).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        info!("Stopping BLE scan");
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId) -> Result<()> {
        let target = self.peripheral(peripheral).await?;
        if target.is_connected().await.unwrap_or(false) {
            info!("Peripheral {} already connected at BLE level", peripheral);
            return Ok(());
        }
        target.connect().await?;
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
        let target = self.peripheral(peripheral).await?;
        target.disconnect().await?;
        Ok(())
    }

    async fn discover_services(&self, peripheral: &PeripheralId) -> Result<Vec<Uuid>> {
        let target = self.peripheral(peripheral).await?;
        target.discover_services().await?;

        let services: Vec<Uuid> = target.services().iter().map(|s| s.uuid).collect();
        debug!("Found {} services on {}", services.len(), peripheral);
        Ok(services)
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
    ) -> Result<Vec<Uuid>> {
        let target = self.peripheral(peripheral).await?;
        let characteristics: Vec<Uuid> = target
            .services()
            .into_iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics.into_iter().map(|c| c.uuid))
            .collect();

        for uuid in &characteristics {
            debug!("Found characteristic: {} in service {}", uuid, service);
        }
        Ok(characteristics)
    }

    async fn subscribe(
        &self,
        peripheral: &PeripheralId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        let target = self.peripheral(peripheral).await?;
        let found = Self::characteristic(&target, service, characteristic).ok_or_else(|| {
            Error::Internal(format!(
                "Characteristic {} missing from service {}",
                characteristic, service
            ))
        })?;

        debug!(
            "Subscribing to {}, properties: {:?}",
            characteristic, found.properties
        );
        target.subscribe(&found).await?;
        Ok(())
    }

    async fn notifications(
        &self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
    ) -> Result<NotificationStream> {
        let target = self.peripheral(peripheral).await?;
        let notifications = target.notifications().await?;

        Ok(notifications
            .filter(move |n| futures::future::ready(n.uuid == characteristic))
            .map(|n| Bytes::from(n.value))
            .boxed())
    }
}

impl std::fmt::Debug for BtleplugRadio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugRadio")
            .field("cached_peripherals", &self.peripherals.read().len())
            .finish_non_exhaustive()
    }
}
