//! Device manager for discovering and connecting to the thermometer.
//!
//! A single background task owns the [`ConnectionMachine`] and is the only
//! writer of the registry, the session and the [`TelemetryPublisher`]. Radio
//! callbacks, timers and presentation requests are all funneled into it over
//! one channel. Session-scoped platform calls run on their own tasks, tagged
//! with the session id they were issued for, and are aborted when that session
//! ends.

use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ble::connection::{BleCommand, BleEvent, ConnectionMachine, ConnectionState, SessionId};
use crate::ble::platform::BtleplugRadio;
use crate::ble::radio::{Radio, RadioEventStream};
use crate::ble::registry::{PeripheralHandle, PeripheralId};
use crate::config::ManagerConfig;
use crate::data::{Probe, Threshold};
use crate::error::{Error, Result, SessionError};
use crate::telemetry::{TelemetryPublisher, TelemetrySnapshot};

/// Request delivered to the event loop.
#[derive(Debug)]
enum DriverMessage {
    /// Machine input from a radio callback, timer or presentation.
    Event(BleEvent),
    /// Connect request that wants to know whether it was accepted.
    Connect {
        id: PeripheralId,
        reply: oneshot::Sender<Result<()>>,
    },
    /// New threshold for one probe.
    SetThreshold { probe: Probe, threshold: Threshold },
    /// Disconnect and stop the loop.
    Shutdown { reply: oneshot::Sender<()> },
}

/// Central manager for the temperature pipeline.
pub struct DeviceManager<R: Radio + 'static = BtleplugRadio> {
    /// Event loop input.
    command_tx: mpsc::Sender<DriverMessage>,
    /// Last known values, written by the event loop only.
    telemetry: Arc<TelemetryPublisher>,
    /// Mirror of the machine's malformed payload counter.
    malformed_payloads: Arc<AtomicU64>,
    /// Configuration the manager was started with.
    config: ManagerConfig,
    /// Event loop task handle.
    driver_handle: RwLock<Option<JoinHandle<()>>>,
    _radio: std::marker::PhantomData<fn() -> R>,
}

impl DeviceManager<BtleplugRadio> {
    /// Create a manager on the first Bluetooth adapter with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        Self::with_config(ManagerConfig::default()).await
    }

    /// Create a manager on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available or the configuration is
    /// invalid.
    pub async fn with_config(config: ManagerConfig) -> Result<Self> {
        let radio = BtleplugRadio::new().await?;
        Self::with_radio(radio, config).await
    }
}

impl<R: Radio + 'static> DeviceManager<R> {
    /// Create a manager over any [`Radio`] implementation.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the radio's event
    /// stream cannot be opened.
    pub async fn with_radio(radio: R, config: ManagerConfig) -> Result<Self> {
        config.validate()?;

        let radio = Arc::new(radio);
        let radio_events = radio.events().await?;

        let telemetry = Arc::new(TelemetryPublisher::with_config(
            config.default_threshold,
            config.event_capacity,
        ));
        let malformed_payloads = Arc::new(AtomicU64::new(0));
        let (command_tx, command_rx) = mpsc::channel(config.event_capacity);

        let driver = Driver {
            radio,
            machine: ConnectionMachine::from_config(&config),
            telemetry: telemetry.clone(),
            tx: command_tx.clone(),
            pending: HashMap::new(),
            malformed_payloads: malformed_payloads.clone(),
        };
        let handle = tokio::spawn(driver.run(command_rx, radio_events));

        let manager = Self {
            command_tx,
            telemetry,
            malformed_payloads,
            config,
            driver_handle: RwLock::new(Some(handle)),
            _radio: std::marker::PhantomData,
        };

        if manager.config.scan_on_start {
            manager.start_scan().await?;
        }

        Ok(manager)
    }

    /// Start a new scan.
    ///
    /// Any active session is torn down first and the device list is cleared.
    pub async fn start_scan(&self) -> Result<()> {
        self.send(DriverMessage::Event(BleEvent::StartScan)).await
    }

    /// Connect to a scanned device.
    ///
    /// # Errors
    ///
    /// [`Error::DeviceNotFound`] if the device is not in the current scan
    /// results, [`Error::SessionActive`] if a session is already open.
    pub async fn connect(&self, identifier: &str) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(DriverMessage::Connect {
            id: PeripheralId::new(identifier),
            reply,
        })
        .await?;
        response.await.map_err(|_| Error::ChannelClosed)?
    }

    /// End the active session, or stop scanning if no session is open.
    pub async fn disconnect(&self) -> Result<()> {
        self.send(DriverMessage::Event(BleEvent::Disconnect)).await
    }

    /// Set a probe's alert threshold in degrees Celsius.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] if `celsius` is not finite.
    pub async fn set_threshold(&self, probe: Probe, celsius: f64) -> Result<()> {
        let threshold = Threshold::new(celsius)?;
        self.send(DriverMessage::SetThreshold { probe, threshold })
            .await
    }

    /// Devices found by the current scan, in discovery order.
    pub fn scanned_devices(&self) -> Vec<PeripheralHandle> {
        self.telemetry.devices()
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.telemetry.connection_state()
    }

    /// The telemetry publisher the presentation layer reads from.
    pub fn telemetry(&self) -> Arc<TelemetryPublisher> {
        self.telemetry.clone()
    }

    /// Current telemetry snapshot.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    /// Number of notifications dropped because they failed to decode.
    pub fn malformed_payloads(&self) -> u64 {
        self.malformed_payloads.load(Ordering::Relaxed)
    }

    /// Configuration in effect.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Disconnect, stop scanning and stop the event loop.
    ///
    /// Calls made after shutdown return [`Error::ChannelClosed`].
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down device manager");

        let (reply, done) = oneshot::channel();
        if self
            .command_tx
            .send(DriverMessage::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = done.await;
        }

        let handle = self.driver_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        Ok(())
    }

    async fn send(&self, message: DriverMessage) -> Result<()> {
        self.command_tx
            .send(message)
            .await
            .map_err(|_| Error::ChannelClosed)
    }
}

impl<R: Radio + 'static> Drop for DeviceManager<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.driver_handle.write().take() {
            handle.abort();
        }
    }
}

impl<R: Radio + 'static> std::fmt::Debug for DeviceManager<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("config", &self.config)
            .field("connection_state", &self.connection_state())
            .finish_non_exhaustive()
    }
}

/// The event loop. Owns the machine; executes its commands.
struct Driver<R: Radio + 'static> {
    radio: Arc<R>,
    machine: ConnectionMachine,
    telemetry: Arc<TelemetryPublisher>,
    tx: mpsc::Sender<DriverMessage>,
    pending: HashMap<SessionId, Vec<JoinHandle<()>>>,
    malformed_payloads: Arc<AtomicU64>,
}

impl<R: Radio + 'static> Driver<R> {
    async fn run(mut self, mut rx: mpsc::Receiver<DriverMessage>, radio_events: RadioEventStream) {
        let mut radio_events = radio_events.fuse();

        loop {
            tokio::select! {
                // Platform confirmations are applied before later callbacks.
                biased;
                Some(event) = radio_events.next() => self.dispatch(event.into()).await,
                message = rx.recv() => match message {
                    Some(DriverMessage::Event(event)) => self.dispatch(event).await,
                    Some(DriverMessage::Connect { id, reply }) => {
                        let result = self.machine.check_selectable(&id);
                        if result.is_ok() {
                            self.dispatch(BleEvent::SelectPeripheral(id)).await;
                        }
                        let _ = reply.send(result);
                    }
                    Some(DriverMessage::SetThreshold { probe, threshold }) => {
                        self.telemetry.set_threshold(probe, threshold);
                    }
                    Some(DriverMessage::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },
            }
        }

        for (_, handles) in self.pending.drain() {
            for handle in handles {
                handle.abort();
            }
        }
        debug!("Device manager event loop ended");
    }

    /// Run an event and every follow-up event its commands produce.
    async fn dispatch(&mut self, event: BleEvent) {
        let mut events = VecDeque::from([event]);
        while let Some(event) = events.pop_front() {
            let commands = self.machine.handle(event);
            self.malformed_payloads
                .store(self.machine.malformed_payloads(), Ordering::Relaxed);

            for command in commands {
                if let Some(follow_up) = self.execute(command).await {
                    events.push_back(follow_up);
                }
            }
        }
    }

    /// Tear down whatever is active and wait for the radio calls to finish.
    async fn shutdown(&mut self) {
        self.dispatch(BleEvent::Disconnect).await;
    }

    /// Carry out one command. Inline calls that fail return the event
    /// reporting the failure.
    async fn execute(&mut self, command: BleCommand) -> Option<BleEvent> {
        match command {
            // Scan start/stop run inline so they are applied in issue order.
            BleCommand::StartScan { service_filter } => {
                if let Err(e) = self.radio.start_scan(service_filter).await {
                    error!("Failed to start scan: {}", e);
                    return Some(BleEvent::ScanFailed {
                        reason: e.to_string(),
                    });
                }
            }
            BleCommand::StopScan => {
                if let Err(e) = self.radio.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }
            }
            BleCommand::Connect {
                session,
                peripheral,
            } => {
                let radio = self.radio.clone();
                let tx = self.tx.clone();
                self.track(
                    session,
                    tokio::spawn(async move {
                        let event = match radio.connect(&peripheral).await {
                            Ok(()) => BleEvent::Connected { session },
                            Err(e) => BleEvent::ConnectFailed {
                                session,
                                reason: e.to_string(),
                            },
                        };
                        report(&tx, event).await;
                    }),
                );
            }
            BleCommand::DiscoverServices {
                session,
                peripheral,
                ..
            } => {
                let radio = self.radio.clone();
                let tx = self.tx.clone();
                self.track(
                    session,
                    tokio::spawn(async move {
                        let event = match radio.discover_services(&peripheral).await {
                            Ok(services) => BleEvent::ServicesDiscovered { session, services },
                            Err(e) => platform_error(session, e),
                        };
                        report(&tx, event).await;
                    }),
                );
            }
            BleCommand::DiscoverCharacteristics {
                session,
                peripheral,
                service,
                ..
            } => {
                let radio = self.radio.clone();
                let tx = self.tx.clone();
                self.track(
                    session,
                    tokio::spawn(async move {
                        let event = match radio.discover_characteristics(&peripheral, service).await
                        {
                            Ok(characteristics) => BleEvent::CharacteristicsDiscovered {
                                session,
                                characteristics,
                            },
                            Err(e) => platform_error(session, e),
                        };
                        report(&tx, event).await;
                    }),
                );
            }
            BleCommand::Subscribe {
                session,
                peripheral,
                service,
                characteristic,
            } => {
                let radio = self.radio.clone();
                let tx = self.tx.clone();
                self.track(
                    session,
                    tokio::spawn(async move {
                        if let Err(e) = radio.subscribe(&peripheral, service, characteristic).await {
                            report(&tx, platform_error(session, e)).await;
                            return;
                        }
                        let mut notifications =
                            match radio.notifications(&peripheral, characteristic).await {
                                Ok(stream) => stream,
                                Err(e) => {
                                    report(&tx, platform_error(session, e)).await;
                                    return;
                                }
                            };
                        report(&tx, BleEvent::SubscriptionReady { session }).await;

                        while let Some(payload) = notifications.next().await {
                            let event = BleEvent::Notification { session, payload };
                            if tx.send(DriverMessage::Event(event)).await.is_err() {
                                break;
                            }
                        }
                        debug!("Notification stream for session {} ended", session);
                    }),
                );
            }
            // Awaited so a following connect never overlaps the teardown.
            BleCommand::Disconnect {
                session,
                peripheral,
            } => {
                if let Err(e) = self.radio.disconnect(&peripheral).await {
                    warn!(
                        "Disconnect of {} for session {} failed: {}",
                        peripheral, session, e
                    );
                }
            }
            BleCommand::CancelPending { session } => {
                if let Some(handles) = self.pending.remove(&session) {
                    debug!("Cancelling {} tasks of session {}", handles.len(), session);
                    for handle in handles {
                        handle.abort();
                    }
                }
            }
            BleCommand::ArmTimeout {
                session,
                phase,
                after,
            } => {
                let tx = self.tx.clone();
                self.track(
                    session,
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        report(&tx, BleEvent::Timeout { session, phase }).await;
                    }),
                );
            }
            BleCommand::ResetReadings => self.telemetry.clear_readings(),
            BleCommand::Publish(readings) => self.telemetry.publish_readings(readings),
            BleCommand::DevicesChanged(devices) => self.telemetry.set_devices(devices),
            BleCommand::StateChanged(state) => self.telemetry.set_connection_state(state),
        }
        None
    }

    fn track(&mut self, session: SessionId, handle: JoinHandle<()>) {
        let handles = self.pending.entry(session).or_default();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }
}

/// Feed a callback back into the event loop; a stopped loop drops it.
async fn report(tx: &mpsc::Sender<DriverMessage>, event: BleEvent) {
    if tx.send(DriverMessage::Event(event)).await.is_err() {
        debug!("Event loop gone, dropping callback");
    }
}

fn platform_error(session: SessionId, error: Error) -> BleEvent {
    BleEvent::Error {
        session,
        error: SessionError::Platform {
            reason: error.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::radio::{MockRadio, NotificationStream, RadioEvent};
    use crate::ble::uuids::{TEMPERATURE_CHARACTERISTIC_UUID, TEMPERATURE_SERVICE_UUID};
    use crate::ble::connection::SessionPhase;
    use crate::data::{AlertState, TemperatureReading};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use uuid::Uuid;

    /// Scriptable radio: events and notifications are pushed by the test.
    struct FakeRadio {
        events: Mutex<Option<UnboundedReceiver<RadioEvent>>>,
        notifications: Mutex<Option<UnboundedReceiver<Bytes>>>,
        hangs: Arc<Mutex<Vec<&'static str>>>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    struct Script {
        events: UnboundedSender<RadioEvent>,
        notifications: UnboundedSender<Bytes>,
        hangs: Arc<Mutex<Vec<&'static str>>>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    /// Records `<call>_aborted:<id>` when a hung call's task is dropped.
    struct AbortRecorder {
        calls: Arc<Mutex<Vec<String>>>,
        entry: String,
    }

    impl Drop for AbortRecorder {
        fn drop(&mut self) {
            self.calls.lock().push(std::mem::take(&mut self.entry));
        }
    }

    impl Script {
        /// Make every later `call` ("connect" or "subscribe") wait forever.
        fn hang(&self, call: &'static str) {
            self.hangs.lock().push(call);
        }

        fn radio_event(&self, event: RadioEvent) {
            self.events.unbounded_send(event).unwrap();
        }

        fn advertise(&self, id: &str) {
            let handle = PeripheralHandle::new(id, Some("BBQ".to_string()), Some(-55));
            self.events
                .unbounded_send(RadioEvent::Discovered(handle))
                .unwrap();
        }

        fn notify(&self, payload: &'static [u8]) {
            self.notifications
                .unbounded_send(Bytes::from_static(payload))
                .unwrap();
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    fn fake_radio() -> (FakeRadio, Script) {
        let (events_tx, events_rx) = unbounded();
        let (notify_tx, notify_rx) = unbounded();
        let hangs = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let radio = FakeRadio {
            events: Mutex::new(Some(events_rx)),
            notifications: Mutex::new(Some(notify_rx)),
            hangs: hangs.clone(),
            calls: calls.clone(),
        };
        let script = Script {
            events: events_tx,
            notifications: notify_tx,
            hangs,
            calls,
        };
        (radio, script)
    }

    impl FakeRadio {
        fn record(&self, call: String) {
            self.calls.lock().push(call);
        }

        async fn maybe_hang(&self, call: &'static str, peripheral: &PeripheralId) {
            let hang = self.hangs.lock().contains(&call);
            if hang {
                let _recorder = AbortRecorder {
                    calls: self.calls.clone(),
                    entry: format!("{}_aborted:{}", call, peripheral),
                };
                futures::future::pending::<()>().await;
            }
        }
    }

    #[async_trait]
    impl Radio for FakeRadio {
        async fn events(&self) -> Result<RadioEventStream> {
            let rx = self.events.lock().take().ok_or(Error::ChannelClosed)?;
            Ok(rx.boxed())
        }

        async fn start_scan(&self, _service_filter: Option<Uuid>) -> Result<()> {
            self.record("start_scan".to_string());
            Ok(())
        }

        async fn stop_scan(&self) -> Result<()> {
            self.record("stop_scan".to_string());
            Ok(())
        }

        async fn connect(&self, peripheral: &PeripheralId) -> Result<()> {
            self.record(format!("connect:{}", peripheral));
            self.maybe_hang("connect", peripheral).await;
            Ok(())
        }

        async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
            self.record(format!("disconnect:{}", peripheral));
            Ok(())
        }

        async fn discover_services(&self, _peripheral: &PeripheralId) -> Result<Vec<Uuid>> {
            Ok(vec![Uuid::new_v4(), TEMPERATURE_SERVICE_UUID])
        }

        async fn discover_characteristics(
            &self,
            _peripheral: &PeripheralId,
            _service: Uuid,
        ) -> Result<Vec<Uuid>> {
            Ok(vec![TEMPERATURE_CHARACTERISTIC_UUID])
        }

        async fn subscribe(
            &self,
            peripheral: &PeripheralId,
            _service: Uuid,
            _characteristic: Uuid,
        ) -> Result<()> {
            self.record(format!("subscribe:{}", peripheral));
            self.maybe_hang("subscribe", peripheral).await;
            Ok(())
        }

        async fn notifications(
            &self,
            _peripheral: &PeripheralId,
            _characteristic: Uuid,
        ) -> Result<NotificationStream> {
            match self.notifications.lock().take() {
                Some(rx) => Ok(rx.boxed()),
                None => Ok(futures::stream::pending().boxed()),
            }
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Start a scan and wait until the loop has entered `Scanning`.
    async fn scanning<R: Radio + 'static>(manager: &DeviceManager<R>) {
        manager.start_scan().await.unwrap();
        eventually(|| manager.connection_state() == ConnectionState::Scanning).await;
    }

    async fn subscribed_manager() -> (DeviceManager<FakeRadio>, Script) {
        let (radio, script) = fake_radio();
        let manager = DeviceManager::with_radio(radio, ManagerConfig::default())
            .await
            .unwrap();

        scanning(&manager).await;
        script.advertise("A");
        eventually(|| manager.scanned_devices().len() == 1).await;

        manager.connect("A").await.unwrap();
        eventually(|| manager.connection_state() == ConnectionState::Subscribed).await;
        (manager, script)
    }

    #[tokio::test]
    async fn test_scan_connect_and_stream_readings() {
        let (manager, script) = subscribed_manager().await;
        assert_eq!(manager.scanned_devices()[0].display_name(), "BBQ");

        script.notify(&[0, 0, 0, 65, 0, 70, 0]);
        let telemetry = manager.telemetry();
        eventually(|| telemetry.current_value(Probe::P2).is_some()).await;

        assert_eq!(
            telemetry.current_value(Probe::P1),
            Some(TemperatureReading::Valid(65.0))
        );
        assert_eq!(
            telemetry.current_value(Probe::P2),
            Some(TemperatureReading::Valid(70.0))
        );
        assert_eq!(telemetry.alert(Probe::P1), AlertState::Raised);
        assert_eq!(
            script.calls(),
            vec!["start_scan", "stop_scan", "connect:A", "subscribe:A"]
        );

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_notification_is_counted() {
        let (manager, script) = subscribed_manager().await;

        script.notify(&[1, 2, 3]);
        script.notify(&[0, 0, 0, 20, 0x50, 144, 0]);
        let telemetry = manager.telemetry();
        eventually(|| telemetry.current_value(Probe::P2).is_some()).await;

        assert_eq!(manager.malformed_payloads(), 1);
        assert_eq!(
            telemetry.current_value(Probe::P1),
            Some(TemperatureReading::Valid(20.5))
        );
        assert_eq!(
            telemetry.current_value(Probe::P2),
            Some(TemperatureReading::Absent)
        );
        assert_eq!(manager.connection_state(), ConnectionState::Subscribed);
    }

    #[tokio::test]
    async fn test_connect_rejections() {
        let (manager, script) = subscribed_manager().await;
        script.advertise("B");

        let err = tokio_test::assert_err!(manager.connect("Z").await);
        assert!(matches!(err, Error::SessionActive { .. }));

        tokio_test::assert_ok!(manager.start_scan().await);
        let err = tokio_test::assert_err!(manager.connect("Z").await);
        assert!(matches!(err, Error::DeviceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_rescan_disconnects_previous_session() {
        let (manager, script) = subscribed_manager().await;

        manager.start_scan().await.unwrap();
        eventually(|| script.calls().contains(&"disconnect:A".to_string())).await;

        assert_eq!(manager.connection_state(), ConnectionState::Scanning);
        assert!(manager.scanned_devices().is_empty());
        let disconnects = script
            .calls()
            .iter()
            .filter(|c| c.starts_with("disconnect"))
            .count();
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn test_peripheral_disconnect_event() {
        let (manager, script) = subscribed_manager().await;

        script.radio_event(RadioEvent::Disconnected("A".into()));
        eventually(|| manager.connection_state() == ConnectionState::Disconnected).await;

        // The device stays in the registry, so it can be reconnected.
        tokio_test::assert_ok!(manager.connect("A").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_phase_timeout() {
        let (radio, script) = fake_radio();
        script.hang("connect");
        let config = ManagerConfig::default().with_phase_timeout(Duration::from_millis(100));
        let manager = DeviceManager::with_radio(radio, config).await.unwrap();

        scanning(&manager).await;
        script.advertise("A");
        eventually(|| !manager.scanned_devices().is_empty()).await;
        manager.connect("A").await.unwrap();

        eventually(|| manager.connection_state().is_terminal()).await;
        assert_eq!(
            manager.connection_state(),
            ConnectionState::Failed(SessionError::Timeout {
                phase: SessionPhase::Connecting
            })
        );
    }

    #[tokio::test]
    async fn test_set_threshold() {
        let (radio, _script) = fake_radio();
        let manager = DeviceManager::with_radio(radio, ManagerConfig::default())
            .await
            .unwrap();

        assert!(matches!(
            manager.set_threshold(Probe::P1, f64::NAN).await,
            Err(Error::InvalidParameter { .. })
        ));

        manager.set_threshold(Probe::P2, 90.0).await.unwrap();
        let telemetry = manager.telemetry();
        eventually(|| telemetry.threshold(Probe::P2).celsius() == 90.0).await;
        assert_eq!(telemetry.threshold(Probe::P1).celsius(), 65.0);
    }

    #[tokio::test]
    async fn test_scan_on_start() {
        let (radio, script) = fake_radio();
        let config = ManagerConfig::default().with_scan_on_start(true);
        let manager = DeviceManager::with_radio(radio, config).await.unwrap();

        eventually(|| manager.connection_state() == ConnectionState::Scanning).await;
        assert_eq!(script.calls(), vec!["start_scan"]);
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_and_closes() {
        let (manager, script) = subscribed_manager().await;

        manager.shutdown().await.unwrap();
        assert!(script.calls().contains(&"disconnect:A".to_string()));
        assert!(matches!(
            manager.start_scan().await,
            Err(Error::ChannelClosed)
        ));
    }

    /// MockRadio that scans, connects and counts disconnects; discovery and
    /// subscription expectations are left to the test.
    fn connecting_mock() -> (MockRadio, UnboundedSender<RadioEvent>, Arc<AtomicUsize>) {
        let (events_tx, events_rx) = unbounded::<RadioEvent>();
        let events_rx = Mutex::new(Some(events_rx));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = disconnects.clone();

        let mut radio = MockRadio::new();
        radio
            .expect_events()
            .returning(move || events_rx.lock().take().map(|rx| rx.boxed()).ok_or(Error::ChannelClosed));
        radio.expect_start_scan().returning(|_| Ok(()));
        radio.expect_stop_scan().returning(|| Ok(()));
        radio.expect_connect().returning(|_| Ok(()));
        radio.expect_disconnect().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (radio, events_tx, disconnects)
    }

    /// Scan, discover "A" and connect to it; returns once the session ended.
    async fn run_failing_session(
        radio: MockRadio,
        events_tx: UnboundedSender<RadioEvent>,
    ) -> (DeviceManager<MockRadio>, Vec<ConnectionState>) {
        let manager = DeviceManager::with_radio(radio, ManagerConfig::default())
            .await
            .unwrap();
        scanning(&manager).await;
        events_tx
            .unbounded_send(RadioEvent::Discovered(PeripheralHandle::new("A", None, None)))
            .unwrap();
        eventually(|| manager.scanned_devices().len() == 1).await;
        assert_eq!(manager.scanned_devices()[0].display_name(), "Unknown Device");

        let mut rx = manager.telemetry().subscribe();
        manager.connect("A").await.unwrap();
        eventually(|| manager.connection_state().is_terminal()).await;

        let mut states = Vec::new();
        while let Ok(update) = rx.try_recv() {
            if let crate::telemetry::TelemetryUpdate::ConnectionStateChanged(state) = update {
                states.push(state);
            }
        }
        (manager, states)
    }

    #[tokio::test]
    async fn test_missing_service_fails_session() {
        let (mut radio, events_tx, disconnects) = connecting_mock();
        radio
            .expect_discover_services()
            .returning(|_| Ok(vec![Uuid::nil()]));
        radio.expect_discover_characteristics().never();

        let (manager, _) = run_failing_session(radio, events_tx).await;
        assert!(matches!(
            manager.connection_state(),
            ConnectionState::Failed(SessionError::ServiceNotFound { .. })
        ));
        eventually(|| disconnects.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_service_discovery_error_fails_session() {
        let (mut radio, events_tx, disconnects) = connecting_mock();
        radio
            .expect_discover_services()
            .returning(|_| Err(Error::Internal("GATT read failed".to_string())));
        radio.expect_discover_characteristics().never();
        radio.expect_subscribe().never();

        let (manager, _) = run_failing_session(radio, events_tx).await;
        assert_eq!(
            manager.connection_state(),
            ConnectionState::Failed(SessionError::Platform {
                reason: "Internal error: GATT read failed".to_string()
            })
        );
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribe_error_fails_session_before_subscribed() {
        let (mut radio, events_tx, disconnects) = connecting_mock();
        radio
            .expect_discover_services()
            .returning(|_| Ok(vec![TEMPERATURE_SERVICE_UUID]));
        radio
            .expect_discover_characteristics()
            .returning(|_, _| Ok(vec![TEMPERATURE_CHARACTERISTIC_UUID]));
        radio
            .expect_subscribe()
            .returning(|_, _, _| Err(Error::Internal("write rejected".to_string())));
        radio.expect_notifications().never();

        let (manager, states) = run_failing_session(radio, events_tx).await;
        assert!(matches!(
            manager.connection_state(),
            ConnectionState::Failed(SessionError::Platform { .. })
        ));
        assert!(states.contains(&ConnectionState::Subscribing));
        assert!(!states.contains(&ConnectionState::Subscribed));
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_phase_timeout() {
        let (radio, script) = fake_radio();
        script.hang("subscribe");
        let config = ManagerConfig::default().with_phase_timeout(Duration::from_millis(100));
        let manager = DeviceManager::with_radio(radio, config).await.unwrap();

        scanning(&manager).await;
        script.advertise("A");
        eventually(|| !manager.scanned_devices().is_empty()).await;
        manager.connect("A").await.unwrap();

        eventually(|| manager.connection_state().is_terminal()).await;
        assert_eq!(
            manager.connection_state(),
            ConnectionState::Failed(SessionError::Timeout {
                phase: SessionPhase::Subscribing
            })
        );
        eventually(|| script.calls().contains(&"subscribe_aborted:A".to_string())).await;
        assert!(script.calls().contains(&"disconnect:A".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescan_aborts_hung_connect() {
        let (radio, script) = fake_radio();
        script.hang("connect");
        let config = ManagerConfig::default().with_phase_timeout(Duration::from_millis(100));
        let manager = DeviceManager::with_radio(radio, config).await.unwrap();

        scanning(&manager).await;
        script.advertise("A");
        eventually(|| !manager.scanned_devices().is_empty()).await;
        manager.connect("A").await.unwrap();
        eventually(|| script.calls().contains(&"connect:A".to_string())).await;

        let mut rx = manager.telemetry().subscribe();
        scanning(&manager).await;
        eventually(|| script.calls().contains(&"connect_aborted:A".to_string())).await;

        // Well past the connect timer of the replaced session.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.connection_state(), ConnectionState::Scanning);
        while let Ok(update) = rx.try_recv() {
            assert!(!matches!(
                update,
                crate::telemetry::TelemetryUpdate::ConnectionStateChanged(ConnectionState::Failed(_))
            ));
        }
        let disconnects = script
            .calls()
            .iter()
            .filter(|c| c.starts_with("disconnect"))
            .count();
        assert_eq!(disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_disconnect_confirmation_spares_reconnect() {
        let (manager, script) = subscribed_manager().await;

        manager.disconnect().await.unwrap();
        eventually(|| manager.connection_state() == ConnectionState::Disconnected).await;
        assert!(script.calls().contains(&"disconnect:A".to_string()));

        script.hang("connect");
        manager.connect("A").await.unwrap();
        eventually(|| manager.connection_state() == ConnectionState::Connecting).await;

        // The platform reports the first link's teardown only now.
        script.radio_event(RadioEvent::Disconnected("A".into()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(manager.connection_state(), ConnectionState::Connecting);

        script.radio_event(RadioEvent::Disconnected("A".into()));
        eventually(|| manager.connection_state() == ConnectionState::Disconnected).await;
    }

    #[tokio::test]
    async fn test_new_session_starts_without_old_readings() {
        let (manager, script) = subscribed_manager().await;
        script.notify(&[0, 0, 0, 80, 0, 70, 0]);
        let telemetry = manager.telemetry();
        eventually(|| telemetry.current_value(Probe::P2).is_some()).await;
        assert_eq!(telemetry.alert(Probe::P1), AlertState::Raised);

        manager.disconnect().await.unwrap();
        eventually(|| manager.connection_state() == ConnectionState::Disconnected).await;
        manager.connect("A").await.unwrap();
        eventually(|| manager.connection_state() == ConnectionState::Subscribed).await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.temperatures, [None, None]);
        assert_eq!(snapshot.alert(Probe::P1), AlertState::Clear);
        assert_eq!(snapshot.last_update, None);
    }

    #[tokio::test]
    async fn test_power_cycle_rearms_scan() {
        let (radio, script) = fake_radio();
        let config = ManagerConfig::default().with_scan_on_start(true);
        let manager = DeviceManager::with_radio(radio, config).await.unwrap();
        eventually(|| manager.connection_state() == ConnectionState::Scanning).await;

        script.radio_event(RadioEvent::PoweredOff);
        eventually(|| manager.connection_state() == ConnectionState::Idle).await;
        script.radio_event(RadioEvent::PoweredOn);
        eventually(|| manager.connection_state() == ConnectionState::Scanning).await;
        assert_eq!(script.calls(), vec!["start_scan", "start_scan"]);
    }

    #[tokio::test]
    async fn test_scan_failure_then_rescan() {
        let (events_tx, events_rx) = unbounded::<RadioEvent>();
        let events_rx = Mutex::new(Some(events_rx));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let mut radio = MockRadio::new();
        radio
            .expect_events()
            .returning(move || events_rx.lock().take().map(|rx| rx.boxed()).ok_or(Error::ChannelClosed));
        radio.expect_start_scan().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::BluetoothUnavailable)
            } else {
                Ok(())
            }
        });

        let manager = DeviceManager::with_radio(radio, ManagerConfig::default())
            .await
            .unwrap();
        manager.start_scan().await.unwrap();
        manager.start_scan().await.unwrap();
        eventually(|| attempts.load(Ordering::SeqCst) == 2).await;
        eventually(|| manager.connection_state() == ConnectionState::Scanning).await;

        events_tx
            .unbounded_send(RadioEvent::Discovered(PeripheralHandle::new("A", None, None)))
            .unwrap();
        eventually(|| manager.scanned_devices().len() == 1).await;
        assert_eq!(manager.connection_state(), ConnectionState::Scanning);
    }

    #[tokio::test]
    async fn test_scan_failure_returns_to_idle() {
        let mut radio = MockRadio::new();
        radio
            .expect_events()
            .returning(|| Ok(futures::stream::pending().boxed()));
        radio
            .expect_start_scan()
            .returning(|_| Err(Error::BluetoothUnavailable));

        let manager = DeviceManager::with_radio(radio, ManagerConfig::default())
            .await
            .unwrap();
        let telemetry = manager.telemetry();
        let mut rx = telemetry.subscribe();
        manager.start_scan().await.unwrap();

        eventually(|| {
            matches!(
                rx.try_recv(),
                Ok(crate::telemetry::TelemetryUpdate::ConnectionStateChanged(ConnectionState::Idle))
            )
        })
        .await;
        assert_eq!(manager.connection_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let (radio, _script) = fake_radio();
        let config = ManagerConfig::default().with_event_capacity(0);
        assert!(matches!(
            DeviceManager::with_radio(radio, config).await,
            Err(Error::InvalidParameter { .. })
        ));
    }
}
