//! Telemetry publisher.
//!
//! Holds the last known readings, thresholds, alert states, connection state
//! and scanned devices, and pushes every change to subscribers. Writes happen
//! on the writer's context; each subscriber receives updates wherever it polls
//! its receiver.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::ble::connection::ConnectionState;
use crate::ble::registry::PeripheralHandle;
use crate::data::{
    AlertChange, AlertState, Probe, ProbeReadings, TemperatureReading, Threshold,
    ThresholdEvaluator,
};

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// A change pushed to subscribers.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TelemetryUpdate {
    /// A new reading for a probe.
    Reading {
        /// Probe the reading belongs to.
        probe: Probe,
        /// The reading.
        reading: TemperatureReading,
        /// When it was published.
        received_at: DateTime<Utc>,
    },
    /// A probe reached its threshold.
    AlertRaised {
        /// Probe that alerted.
        probe: Probe,
        /// Threshold in effect.
        threshold: Threshold,
    },
    /// A probe dropped below its threshold or lost its reading.
    AlertCleared {
        /// Probe whose alert cleared.
        probe: Probe,
    },
    /// A probe's threshold was changed.
    ThresholdChanged {
        /// Probe whose threshold changed.
        probe: Probe,
        /// The new threshold.
        threshold: Threshold,
    },
    /// The connection state changed.
    ConnectionStateChanged(ConnectionState),
    /// The scanned device list changed.
    DevicesChanged(Vec<PeripheralHandle>),
    /// Readings were discarded because a new session started.
    ReadingsCleared,
}

/// Point-in-time view of everything the presentation layer renders.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TelemetrySnapshot {
    /// Last reading per probe, `None` until the first notification.
    pub temperatures: [Option<TemperatureReading>; 2],
    /// Threshold per probe.
    pub thresholds: [Threshold; 2],
    /// Alert state per probe.
    pub alerts: [AlertState; 2],
    /// Connection state.
    pub connection_state: ConnectionState,
    /// Scanned devices in discovery order.
    pub devices: Vec<PeripheralHandle>,
    /// Time of the last reading.
    pub last_update: Option<DateTime<Utc>>,
}

impl TelemetrySnapshot {
    /// Last reading for a probe.
    pub fn temperature(&self, probe: Probe) -> Option<TemperatureReading> {
        self.temperatures[probe.index()]
    }

    /// Threshold for a probe.
    pub fn threshold(&self, probe: Probe) -> Threshold {
        self.thresholds[probe.index()]
    }

    /// Alert state for a probe.
    pub fn alert(&self, probe: Probe) -> AlertState {
        self.alerts[probe.index()]
    }
}

struct PublisherState {
    evaluator: ThresholdEvaluator,
    connection_state: ConnectionState,
    devices: Vec<PeripheralHandle>,
    last_update: Option<DateTime<Utc>>,
}

impl PublisherState {
    fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            temperatures: Probe::ALL.map(|p| self.evaluator.last_reading(p)),
            thresholds: Probe::ALL.map(|p| self.evaluator.threshold(p)),
            alerts: Probe::ALL.map(|p| self.evaluator.alert(p)),
            connection_state: self.connection_state.clone(),
            devices: self.devices.clone(),
            last_update: self.last_update,
        }
    }
}

/// Last-known-value store with change notification.
pub struct TelemetryPublisher {
    state: RwLock<PublisherState>,
    update_tx: broadcast::Sender<TelemetryUpdate>,
    snapshot_tx: watch::Sender<TelemetrySnapshot>,
    callback_counter: AtomicU64,
}

impl TelemetryPublisher {
    /// Default broadcast capacity.
    pub const DEFAULT_CAPACITY: usize = 64;

    /// Create a publisher with the default threshold on both probes.
    pub fn new() -> Self {
        Self::with_config(Threshold::default(), Self::DEFAULT_CAPACITY)
    }

    /// Create a publisher with a starting threshold and channel capacity.
    pub fn with_config(threshold: Threshold, capacity: usize) -> Self {
        let state = PublisherState {
            evaluator: ThresholdEvaluator::with_threshold(threshold),
            connection_state: ConnectionState::Idle,
            devices: Vec::new(),
            last_update: None,
        };
        let (update_tx, _) = broadcast::channel(capacity.max(1));
        let (snapshot_tx, _) = watch::channel(state.snapshot());

        Self {
            state: RwLock::new(state),
            update_tx,
            snapshot_tx,
            callback_counter: AtomicU64::new(0),
        }
    }

    /// Store a probe's latest reading and notify subscribers.
    pub fn publish(&self, probe: Probe, reading: TemperatureReading) {
        let mut state = self.state.write();
        let received_at = Utc::now();
        let change = state.evaluator.on_reading(probe, reading);
        state.last_update = Some(received_at);

        let _ = self.update_tx.send(TelemetryUpdate::Reading {
            probe,
            reading,
            received_at,
        });
        self.send_alert_change(&state, probe, change);
        self.snapshot_tx.send_replace(state.snapshot());
    }

    /// Publish both readings of a notification.
    pub fn publish_readings(&self, readings: ProbeReadings) {
        for (probe, reading) in readings.iter() {
            self.publish(probe, reading);
        }
    }

    /// Discard both readings; alerts raised by them clear.
    pub fn clear_readings(&self) {
        let mut state = self.state.write();
        let had_readings = Probe::ALL
            .iter()
            .any(|p| state.evaluator.last_reading(*p).is_some());
        if !had_readings {
            return;
        }
        let changes = state.evaluator.clear_readings();
        state.last_update = None;
        debug!("Cleared probe readings");

        let _ = self.update_tx.send(TelemetryUpdate::ReadingsCleared);
        for (probe, change) in Probe::ALL.into_iter().zip(changes) {
            self.send_alert_change(&state, probe, change);
        }
        self.snapshot_tx.send_replace(state.snapshot());
    }

    /// Change a probe's threshold; the alert is re-evaluated immediately.
    pub fn set_threshold(&self, probe: Probe, threshold: Threshold) {
        let mut state = self.state.write();
        let change = state.evaluator.set_threshold(probe, threshold);
        info!("Threshold for {} set to {:.1}°C", probe, threshold.celsius());

        let _ = self
            .update_tx
            .send(TelemetryUpdate::ThresholdChanged { probe, threshold });
        self.send_alert_change(&state, probe, change);
        self.snapshot_tx.send_replace(state.snapshot());
    }

    /// Record a connection state change.
    pub fn set_connection_state(&self, connection_state: ConnectionState) {
        let mut state = self.state.write();
        if state.connection_state == connection_state {
            return;
        }
        state.connection_state = connection_state.clone();
        let _ = self
            .update_tx
            .send(TelemetryUpdate::ConnectionStateChanged(connection_state));
        self.snapshot_tx.send_replace(state.snapshot());
    }

    /// Replace the scanned device list.
    pub fn set_devices(&self, devices: Vec<PeripheralHandle>) {
        let mut state = self.state.write();
        if state.devices == devices {
            return;
        }
        state.devices = devices.clone();
        let _ = self.update_tx.send(TelemetryUpdate::DevicesChanged(devices));
        self.snapshot_tx.send_replace(state.snapshot());
    }

    /// Last reading for a probe, `None` before the first notification.
    pub fn current_value(&self, probe: Probe) -> Option<TemperatureReading> {
        self.state.read().evaluator.last_reading(probe)
    }

    /// Current threshold for a probe.
    pub fn threshold(&self, probe: Probe) -> Threshold {
        self.state.read().evaluator.threshold(probe)
    }

    /// Current alert state for a probe.
    pub fn alert(&self, probe: Probe) -> AlertState {
        self.state.read().evaluator.alert(probe)
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().connection_state.clone()
    }

    /// Scanned devices in discovery order.
    pub fn devices(&self) -> Vec<PeripheralHandle> {
        self.state.read().devices.clone()
    }

    /// Everything at once.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.state.read().snapshot()
    }

    /// Subscribe to change events.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryUpdate> {
        self.update_tx.subscribe()
    }

    /// Watch the full snapshot; the receiver always holds the latest value.
    pub fn watch(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Register a callback for change events.
    ///
    /// The callback runs on its own tokio task, so it must be called from
    /// within a runtime.
    pub fn on_update<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&TelemetryUpdate) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.update_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(update) => callback(&update),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Telemetry callback lagged by {} updates", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    fn send_alert_change(&self, state: &PublisherState, probe: Probe, change: AlertChange) {
        let update = match change {
            AlertChange::Raised => TelemetryUpdate::AlertRaised {
                probe,
                threshold: state.evaluator.threshold(probe),
            },
            AlertChange::Cleared => TelemetryUpdate::AlertCleared { probe },
            AlertChange::Unchanged(_) => return,
        };
        info!("Alert on {}: {:?}", probe, change.state());
        let _ = self.update_tx.send(update);
    }
}

impl Default for TelemetryPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TelemetryPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryPublisher")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}
