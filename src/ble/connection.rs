//! BLE connection state machine.
//!
//! [`ConnectionMachine`] drives a single session from scanning through
//! subscription. It performs no I/O: each [`BleEvent`] is folded into the
//! current state and answered with the [`BleCommand`]s the caller must execute.
//! The machine also owns the [`DeviceRegistry`] so that every write happens on
//! the caller's single execution context.

use bytes::Bytes;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::registry::{DeviceRegistry, PeripheralHandle, PeripheralId};
use crate::ble::uuids::{
    is_temperature_characteristic, is_temperature_service, TEMPERATURE_CHARACTERISTIC_UUID,
    TEMPERATURE_SERVICE_UUID,
};
use crate::config::ManagerConfig;
use crate::data::ProbeReadings;
use crate::error::{Error, Result, SessionError};
use crate::protocol::decode;

/// Identity of one connect-to-disconnect session.
///
/// Every session-scoped callback carries the id it was issued for; callbacks
/// for any other id are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Raw numeric id.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A phase that waits on a platform callback and is bounded by a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionPhase {
    /// Waiting for the connection to be established.
    Connecting,
    /// Waiting for service enumeration.
    DiscoveringServices,
    /// Waiting for characteristic enumeration.
    DiscoveringCharacteristics,
    /// Waiting for notifications to be enabled.
    Subscribing,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::DiscoveringServices => write!(f, "discovering services"),
            Self::DiscoveringCharacteristics => write!(f, "discovering characteristics"),
            Self::Subscribing => write!(f, "subscribing"),
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Nothing in progress.
    #[default]
    Idle,
    /// Scanning for advertising peripherals.
    Scanning,
    /// Connect request issued.
    Connecting,
    /// Looking for the temperature service.
    DiscoveringServices,
    /// Looking for the temperature characteristic.
    DiscoveringCharacteristics,
    /// Enabling notifications.
    Subscribing,
    /// Notifications enabled; readings are streaming.
    Subscribed,
    /// The last session ended with a disconnect.
    Disconnected,
    /// The last session ended with an error.
    Failed(SessionError),
}

impl ConnectionState {
    /// Check if readings are streaming.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Subscribed)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        self.phase().is_some()
    }

    /// Check if the last session has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed(_))
    }

    /// The timed phase this state waits in, if any.
    pub fn phase(&self) -> Option<SessionPhase> {
        match self {
            Self::Connecting => Some(SessionPhase::Connecting),
            Self::DiscoveringServices => Some(SessionPhase::DiscoveringServices),
            Self::DiscoveringCharacteristics => Some(SessionPhase::DiscoveringCharacteristics),
            Self::Subscribing => Some(SessionPhase::Subscribing),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "Discovering services"),
            Self::DiscoveringCharacteristics => write!(f, "Discovering characteristics"),
            Self::Subscribing => write!(f, "Subscribing"),
            Self::Subscribed => write!(f, "Subscribed"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Failed(e) => write!(f, "Failed: {}", e),
        }
    }
}

/// The single active connection context.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSession {
    /// Session identity.
    pub id: SessionId,
    /// Target peripheral.
    pub peripheral: PeripheralHandle,
    /// Temperature service, once found.
    pub service: Option<Uuid>,
    /// Temperature characteristic, once found.
    pub characteristic: Option<Uuid>,
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum BleEvent {
    /// Presentation asked for a new scan.
    StartScan,
    /// A peripheral advertised.
    Discovered(PeripheralHandle),
    /// Presentation picked a peripheral to connect to.
    SelectPeripheral(PeripheralId),
    /// Presentation asked to end the session.
    Disconnect,
    /// The connect request succeeded.
    Connected {
        /// Session the request belonged to.
        session: SessionId,
    },
    /// The connect request failed.
    ConnectFailed {
        /// Session the request belonged to.
        session: SessionId,
        /// Platform error text.
        reason: String,
    },
    /// Service enumeration finished.
    ServicesDiscovered {
        /// Session the request belonged to.
        session: SessionId,
        /// Services exposed by the peripheral.
        services: Vec<Uuid>,
    },
    /// Characteristic enumeration finished.
    CharacteristicsDiscovered {
        /// Session the request belonged to.
        session: SessionId,
        /// Characteristics of the temperature service.
        characteristics: Vec<Uuid>,
    },
    /// Notifications are enabled and the value stream is open.
    SubscriptionReady {
        /// Session the subscription belonged to.
        session: SessionId,
    },
    /// A value arrived on the temperature characteristic.
    Notification {
        /// Session the subscription belonged to.
        session: SessionId,
        /// Raw payload.
        payload: Bytes,
    },
    /// The platform reported a peripheral disconnect.
    PeripheralDisconnected(PeripheralId),
    /// A session-scoped platform call failed.
    Error {
        /// Session the call belonged to.
        session: SessionId,
        /// What went wrong.
        error: SessionError,
    },
    /// A phase timer fired.
    Timeout {
        /// Session the timer was armed for.
        session: SessionId,
        /// Phase the timer was armed for.
        phase: SessionPhase,
    },
    /// The scan could not be started.
    ScanFailed {
        /// Platform error text.
        reason: String,
    },
    /// The adapter was powered on.
    RadioPoweredOn,
    /// The adapter was powered off.
    RadioPoweredOff,
}

/// Side effect requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum BleCommand {
    /// Begin scanning.
    StartScan {
        /// Optional service filter.
        service_filter: Option<Uuid>,
    },
    /// Stop scanning.
    StopScan,
    /// Issue a connect request.
    Connect {
        /// Session being opened.
        session: SessionId,
        /// Target peripheral.
        peripheral: PeripheralId,
    },
    /// Enumerate services.
    DiscoverServices {
        /// Active session.
        session: SessionId,
        /// Target peripheral.
        peripheral: PeripheralId,
        /// Service being looked for.
        service: Uuid,
    },
    /// Enumerate the characteristics of a service.
    DiscoverCharacteristics {
        /// Active session.
        session: SessionId,
        /// Target peripheral.
        peripheral: PeripheralId,
        /// Service to enumerate.
        service: Uuid,
        /// Characteristic being looked for.
        characteristic: Uuid,
    },
    /// Enable notifications and start forwarding them.
    Subscribe {
        /// Active session.
        session: SessionId,
        /// Target peripheral.
        peripheral: PeripheralId,
        /// Owning service.
        service: Uuid,
        /// Characteristic to subscribe to.
        characteristic: Uuid,
    },
    /// Drop the connection.
    Disconnect {
        /// Session being torn down.
        session: SessionId,
        /// Peripheral to disconnect.
        peripheral: PeripheralId,
    },
    /// Abort in-flight platform calls and timers of a session.
    CancelPending {
        /// Session being torn down.
        session: SessionId,
    },
    /// Schedule a [`BleEvent::Timeout`].
    ArmTimeout {
        /// Session to time out.
        session: SessionId,
        /// Phase to time out.
        phase: SessionPhase,
        /// Delay before firing.
        after: Duration,
    },
    /// Forget the previous session's readings.
    ResetReadings,
    /// New readings decoded.
    Publish(ProbeReadings),
    /// The registry contents changed.
    DevicesChanged(Vec<PeripheralHandle>),
    /// The connection state changed.
    StateChanged(ConnectionState),
}

/// Pure connection state machine.
#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    session: Option<ConnectionSession>,
    registry: DeviceRegistry,
    next_session: u64,
    phase_timeout: Duration,
    scan_filter: Option<Uuid>,
    malformed_payloads: u64,
    teardowns: u64,
    pending_disconnects: HashSet<PeripheralId>,
    scan_on_power_on: bool,
}

impl ConnectionMachine {
    /// Create a machine in the `Idle` state.
    pub fn new(phase_timeout: Duration, scan_filter: Option<Uuid>) -> Self {
        Self {
            state: ConnectionState::Idle,
            session: None,
            registry: DeviceRegistry::new(),
            next_session: 1,
            phase_timeout,
            scan_filter,
            malformed_payloads: 0,
            teardowns: 0,
            pending_disconnects: HashSet::new(),
            scan_on_power_on: false,
        }
    }

    /// Start a scan whenever the adapter powers on while nothing is active.
    pub fn with_scan_on_power_on(mut self, enabled: bool) -> Self {
        self.scan_on_power_on = enabled;
        self
    }

    /// Create a machine from manager configuration.
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self::new(config.phase_timeout, config.scan_filter)
            .with_scan_on_power_on(config.scan_on_start)
    }

    /// Current state.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// The active session, if any.
    pub fn session(&self) -> Option<&ConnectionSession> {
        self.session.as_ref()
    }

    /// Discovered peripherals.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Number of notifications dropped because they failed to decode.
    pub fn malformed_payloads(&self) -> u64 {
        self.malformed_payloads
    }

    /// Number of sessions torn down on request (new scan or disconnect).
    pub fn teardowns(&self) -> u64 {
        self.teardowns
    }

    /// Whether a requested disconnect of `id` has not been confirmed yet.
    pub fn is_disconnect_pending(&self, id: &PeripheralId) -> bool {
        self.pending_disconnects.contains(id)
    }

    /// Check whether `id` can be selected right now.
    ///
    /// # Errors
    ///
    /// [`Error::DeviceNotFound`] if the registry does not know `id`,
    /// [`Error::SessionActive`] if a session is already open.
    pub fn check_selectable(&self, id: &PeripheralId) -> Result<()> {
        if let Some(session) = &self.session {
            return Err(Error::SessionActive {
                identifier: session.peripheral.id.to_string(),
            });
        }
        if !self.registry.contains(id) {
            return Err(Error::DeviceNotFound {
                identifier: id.to_string(),
            });
        }
        Ok(())
    }

    /// Fold one event into the machine.
    pub fn handle(&mut self, event: BleEvent) -> Vec<BleCommand> {
        let mut commands = Vec::new();

        match event {
            BleEvent::StartScan => self.start_scan(&mut commands),
            BleEvent::Discovered(handle) => {
                if self.state != ConnectionState::Scanning {
                    trace!("Ignoring discovery of {} outside of a scan", handle.id);
                } else {
                    if self.registry.on_discovered(handle) {
                        debug!("Registry now holds {} devices", self.registry.len());
                    }
                    commands.push(BleCommand::DevicesChanged(self.registry.to_vec()));
                }
            }
            BleEvent::SelectPeripheral(id) => self.select(id, &mut commands),
            BleEvent::Disconnect => {
                if self.session.is_some() {
                    self.teardown(&mut commands);
                    self.set_state(ConnectionState::Disconnected, &mut commands);
                } else if self.state == ConnectionState::Scanning {
                    commands.push(BleCommand::StopScan);
                    self.set_state(ConnectionState::Idle, &mut commands);
                }
            }
            BleEvent::Connected { session } => {
                if self.expects(session, SessionPhase::Connecting) {
                    if let Some((id, peripheral)) = self.active_target() {
                        // The new link is up, so later disconnects belong to it.
                        self.pending_disconnects.remove(&peripheral);
                        info!("Connected to {} (session {})", peripheral, id);
                        commands.push(BleCommand::DiscoverServices {
                            session: id,
                            peripheral,
                            service: TEMPERATURE_SERVICE_UUID,
                        });
                        self.enter_phase(SessionPhase::DiscoveringServices, &mut commands);
                    }
                }
            }
            BleEvent::ConnectFailed { session, reason } => {
                if self.expects(session, SessionPhase::Connecting) {
                    self.fail(SessionError::ConnectFailed { reason }, &mut commands);
                }
            }
            BleEvent::ServicesDiscovered { session, services } => {
                if self.expects(session, SessionPhase::DiscoveringServices) {
                    let target = self
                        .active_target()
                        .filter(|_| services.iter().any(is_temperature_service));
                    if let Some((id, peripheral)) = target {
                        if let Some(active) = self.session.as_mut() {
                            active.service = Some(TEMPERATURE_SERVICE_UUID);
                        }
                        commands.push(BleCommand::DiscoverCharacteristics {
                            session: id,
                            peripheral,
                            service: TEMPERATURE_SERVICE_UUID,
                            characteristic: TEMPERATURE_CHARACTERISTIC_UUID,
                        });
                        self.enter_phase(SessionPhase::DiscoveringCharacteristics, &mut commands);
                    } else {
                        self.fail(
                            SessionError::ServiceNotFound {
                                uuid: TEMPERATURE_SERVICE_UUID.to_string(),
                            },
                            &mut commands,
                        );
                    }
                }
            }
            BleEvent::CharacteristicsDiscovered {
                session,
                characteristics,
            } => {
                if self.expects(session, SessionPhase::DiscoveringCharacteristics) {
                    let target = self
                        .active_target()
                        .filter(|_| characteristics.iter().any(is_temperature_characteristic));
                    if let Some((id, peripheral)) = target {
                        if let Some(active) = self.session.as_mut() {
                            active.characteristic = Some(TEMPERATURE_CHARACTERISTIC_UUID);
                        }
                        commands.push(BleCommand::Subscribe {
                            session: id,
                            peripheral,
                            service: TEMPERATURE_SERVICE_UUID,
                            characteristic: TEMPERATURE_CHARACTERISTIC_UUID,
                        });
                        self.enter_phase(SessionPhase::Subscribing, &mut commands);
                    } else {
                        self.fail(
                            SessionError::CharacteristicNotFound {
                                uuid: TEMPERATURE_CHARACTERISTIC_UUID.to_string(),
                            },
                            &mut commands,
                        );
                    }
                }
            }
            BleEvent::SubscriptionReady { session } => {
                if self.expects(session, SessionPhase::Subscribing) {
                    info!("Subscribed to temperature notifications (session {})", session);
                    self.set_state(ConnectionState::Subscribed, &mut commands);
                }
            }
            BleEvent::Notification { session, payload } => {
                if self.is_active(session) && self.state.is_connected() {
                    match decode(&payload) {
                        Ok(readings) => commands.push(BleCommand::Publish(readings)),
                        Err(e) => {
                            self.malformed_payloads += 1;
                            warn!(
                                "Dropping malformed payload {:02X?}: {} ({} dropped so far)",
                                &payload[..],
                                e,
                                self.malformed_payloads
                            );
                        }
                    }
                } else {
                    trace!("Ignoring notification for stale session {}", session);
                }
            }
            BleEvent::PeripheralDisconnected(peripheral) => {
                let matches_session = self
                    .session
                    .as_ref()
                    .map(|s| s.peripheral.id == peripheral)
                    .unwrap_or(false);
                if self.pending_disconnects.remove(&peripheral) {
                    debug!("Requested disconnect of {} confirmed", peripheral);
                } else if matches_session {
                    info!("Peripheral {} disconnected", peripheral);
                    self.end_session(ConnectionState::Disconnected, &mut commands);
                } else {
                    trace!("Ignoring disconnect of unrelated peripheral {}", peripheral);
                }
            }
            BleEvent::Error { session, error } => {
                if self.is_active(session) {
                    self.fail(error, &mut commands);
                }
            }
            BleEvent::Timeout { session, phase } => {
                if self.expects(session, phase) {
                    warn!("Session {} timed out while {}", session, phase);
                    self.fail(SessionError::Timeout { phase }, &mut commands);
                }
            }
            BleEvent::ScanFailed { reason } => {
                if self.state == ConnectionState::Scanning {
                    warn!("Scan failed to start: {}", reason);
                    self.set_state(ConnectionState::Idle, &mut commands);
                }
            }
            BleEvent::RadioPoweredOn => {
                let idle = self.session.is_none() && self.state != ConnectionState::Scanning;
                if self.scan_on_power_on && idle {
                    info!("Bluetooth adapter powered on, starting scan");
                    self.start_scan(&mut commands);
                }
            }
            BleEvent::RadioPoweredOff => {
                warn!("Bluetooth adapter powered off");
                self.pending_disconnects.clear();
                if self.session.is_some() {
                    self.end_session(ConnectionState::Disconnected, &mut commands);
                } else if self.state == ConnectionState::Scanning {
                    self.set_state(ConnectionState::Idle, &mut commands);
                }
            }
        }

        commands
    }

    fn start_scan(&mut self, commands: &mut Vec<BleCommand>) {
        if self.session.is_some() {
            self.teardown(commands);
        }
        self.registry.reset();
        commands.push(BleCommand::DevicesChanged(Vec::new()));
        commands.push(BleCommand::StartScan {
            service_filter: self.scan_filter,
        });
        self.set_state(ConnectionState::Scanning, commands);
    }

    fn select(&mut self, id: PeripheralId, commands: &mut Vec<BleCommand>) {
        if let Err(e) = self.check_selectable(&id) {
            warn!("Rejecting selection of {}: {}", id, e);
            return;
        }
        let Some(peripheral) = self.registry.get(&id).cloned() else {
            return;
        };

        if self.state == ConnectionState::Scanning {
            commands.push(BleCommand::StopScan);
        }
        commands.push(BleCommand::ResetReadings);

        let session = SessionId(self.next_session);
        self.next_session += 1;
        info!(
            "Opening session {} with {} ({})",
            session,
            peripheral.display_name(),
            id
        );

        self.session = Some(ConnectionSession {
            id: session,
            peripheral,
            service: None,
            characteristic: None,
        });
        commands.push(BleCommand::Connect {
            session,
            peripheral: id,
        });
        self.enter_phase(SessionPhase::Connecting, commands);
    }

    /// Tear down the active session on request: cancel, then disconnect.
    fn teardown(&mut self, commands: &mut Vec<BleCommand>) {
        if let Some(session) = self.session.take() {
            debug!("Tearing down session {}", session.id);
            commands.push(BleCommand::CancelPending { session: session.id });
            self.request_disconnect(session.id, session.peripheral.id, commands);
            self.teardowns += 1;
        }
    }

    fn fail(&mut self, error: SessionError, commands: &mut Vec<BleCommand>) {
        if let Some(session) = self.session.take() {
            warn!("Session {} failed: {}", session.id, error);
            commands.push(BleCommand::CancelPending { session: session.id });
            if !matches!(error, SessionError::ConnectFailed { .. }) {
                self.request_disconnect(session.id, session.peripheral.id, commands);
            }
        }
        self.set_state(ConnectionState::Failed(error), commands);
    }

    /// Disconnect and remember it, so the platform's confirmation is not
    /// mistaken for a drop of the next session to the same peripheral.
    fn request_disconnect(
        &mut self,
        session: SessionId,
        peripheral: PeripheralId,
        commands: &mut Vec<BleCommand>,
    ) {
        self.pending_disconnects.insert(peripheral.clone());
        commands.push(BleCommand::Disconnect {
            session,
            peripheral,
        });
    }

    /// End the session after the link is already gone.
    fn end_session(&mut self, state: ConnectionState, commands: &mut Vec<BleCommand>) {
        if let Some(session) = self.session.take() {
            commands.push(BleCommand::CancelPending { session: session.id });
        }
        self.set_state(state, commands);
    }

    fn enter_phase(&mut self, phase: SessionPhase, commands: &mut Vec<BleCommand>) {
        if let Some(session) = &self.session {
            commands.push(BleCommand::ArmTimeout {
                session: session.id,
                phase,
                after: self.phase_timeout,
            });
        }
        let state = match phase {
            SessionPhase::Connecting => ConnectionState::Connecting,
            SessionPhase::DiscoveringServices => ConnectionState::DiscoveringServices,
            SessionPhase::DiscoveringCharacteristics => ConnectionState::DiscoveringCharacteristics,
            SessionPhase::Subscribing => ConnectionState::Subscribing,
        };
        self.set_state(state, commands);
    }

    fn set_state(&mut self, new_state: ConnectionState, commands: &mut Vec<BleCommand>) {
        if self.state != new_state {
            debug!("Connection state changed: {} -> {}", self.state, new_state);
            self.state = new_state.clone();
            commands.push(BleCommand::StateChanged(new_state));
        }
    }

    fn is_active(&self, session: SessionId) -> bool {
        self.session.as_ref().map(|s| s.id) == Some(session)
    }

    fn expects(&self, session: SessionId, phase: SessionPhase) -> bool {
        let expected = self.is_active(session) && self.state.phase() == Some(phase);
        if !expected {
            trace!(
                "Ignoring {} callback for session {} in state {}",
                phase,
                session,
                self.state
            );
        }
        expected
    }

    /// Id and peripheral of the active session.
    fn active_target(&self) -> Option<(SessionId, PeripheralId)> {
        self.session
            .as_ref()
            .map(|s| (s.id, s.peripheral.id.clone()))
    }
}
