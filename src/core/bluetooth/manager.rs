//! Session manager for the light hub
//! This module provides the main interface for bluetooth operations and wires
//! the tracker, registry, serializer, supervisor and router together.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::session_config::SessionConfig;
use crate::core::bluetooth::commands::{CommandExecutor, LightMode, LightWriter, ModeLoop};
use crate::core::bluetooth::disconnect::DisconnectHandler;
use crate::core::bluetooth::listeners::Listeners;
use crate::core::bluetooth::notification::NotificationRouter;
use crate::core::bluetooth::registry::{ConnectionRegistry, ConnectionState};
use crate::core::bluetooth::serializer::WriteSerializer;
use crate::core::bluetooth::supervisor::LivenessSupervisor;
use crate::core::bluetooth::tracker::{AdvertisementTracker, AutoConnectPolicy};
use crate::core::bluetooth::transport::{
    BleTransport, FailureClass, TransportError, TransportEvent, characteristics_or_empty, classify,
};
use crate::core::bluetooth::types::{
    CharDescriptor, CharacteristicRef, ConnectionStatus, DeviceId, DeviceListChange,
    DeviceSummary, DisconnectEvent, DisconnectReason, Notification, RawAdvertisement,
    ServiceDescriptor, WriteTask,
};
use crate::error::{AdapterError, ConnError, SessionError, WriteError};
use crate::utils::lock;

/// Background tasks owned by a started session
struct Runtime {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    transport: Arc<dyn BleTransport>,
    config: SessionConfig,
    registry: ConnectionRegistry,
    tracker: AdvertisementTracker,
    router: NotificationRouter,
    disconnects: DisconnectHandler,
    serializer: WriteSerializer,
    supervisor: LivenessSupervisor,
    executor: CommandExecutor<LightWriter>,
    device_list: Listeners<DeviceListChange>,
    disconnect_listeners: Listeners<DisconnectEvent>,
    /// Read on every sighting, never captured
    policy: Mutex<AutoConnectPolicy>,
    mode_loop: tokio::sync::Mutex<Option<ModeLoop>>,
    runtime: Mutex<Option<Runtime>>,
}

/// Manages every BLE session of one adapter.
///
/// Cheap to clone; clones drive the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Creates a new SessionManager. Nothing touches the radio until
    /// [`SessionManager::start`].
    pub fn new(transport: Arc<dyn BleTransport>, config: SessionConfig) -> Result<Self, SessionError> {
        let registry = ConnectionRegistry::new();
        let tracker = AdvertisementTracker::new(
            config.name_filter()?,
            registry.clone(),
            config.stability_window(),
            config.miss_threshold,
        );
        let router = NotificationRouter::new(registry.clone());
        let device_list = Listeners::new();
        let disconnect_listeners = Listeners::new();

        let disconnects = DisconnectHandler::new(
            registry.clone(),
            tracker.clone(),
            router.clone(),
            disconnect_listeners.clone(),
            device_list.clone(),
        );
        let serializer = WriteSerializer::new(registry.clone(), transport.clone(), disconnects.clone());
        let supervisor = LivenessSupervisor::new(
            tracker.clone(),
            registry.clone(),
            transport.clone(),
            disconnects.clone(),
            device_list.clone(),
            config.presence_interval(),
            config.probe_interval(),
        );
        let executor = CommandExecutor::new(LightWriter::new(serializer.clone(), config.write_target()));

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                policy: Mutex::new(config.auto_connect_policy()),
                config,
                registry,
                tracker,
                router,
                disconnects,
                serializer,
                supervisor,
                executor,
                device_list,
                disconnect_listeners,
                mode_loop: tokio::sync::Mutex::new(None),
                runtime: Mutex::new(None),
            }),
        })
    }

    /// Opens the adapter, starts discovery and the liveness loops.
    pub async fn start(&self) -> Result<(), SessionError> {
        let cancel = CancellationToken::new();
        {
            let mut runtime = lock(&self.inner.runtime);
            if runtime.is_some() {
                return Err(SessionError::AlreadyStarted);
            }
            *runtime = Some(Runtime {
                cancel: cancel.clone(),
                tasks: Vec::new(),
            });
        }

        match self.start_tasks(&cancel).await {
            Ok(tasks) => {
                if let Some(runtime) = lock(&self.inner.runtime).as_mut() {
                    runtime.tasks = tasks;
                }
                info!("Session manager started.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to start session manager: {}", e);
                cancel.cancel();
                lock(&self.inner.runtime).take();
                Err(e.into())
            }
        }
    }

    async fn start_tasks(&self, cancel: &CancellationToken) -> Result<Vec<JoinHandle<()>>, AdapterError> {
        self.inner.transport.open_adapter().await?;
        info!("Bluetooth adapter is available.");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.inner.transport.attach_events(events_tx);
        let pump = {
            let manager = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { manager.pump_events(events_rx, cancel).await })
        };

        self.inner.transport.start_discovery(true).await?;
        info!("Discovery started.");

        let mut tasks = vec![pump];
        tasks.extend(self.inner.supervisor.start(cancel.clone()));
        Ok(tasks)
    }

    /// Stops the mode loop, the liveness loops and discovery. Connected
    /// devices stay connected; see [`SessionManager::disconnect_all`].
    pub async fn shutdown(&self) {
        self.stop_loop().await;

        let runtime = lock(&self.inner.runtime).take();
        let Some(runtime) = runtime else {
            debug!("Session manager was not running");
            return;
        };
        runtime.cancel.cancel();
        for task in runtime.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        if let Err(e) = self.inner.transport.stop_discovery().await {
            warn!("Failed to stop discovery: {}", e);
        }
        info!("Session manager stopped.");
    }

    async fn pump_events(self, mut events: mpsc::UnboundedReceiver<TransportEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        info!("Transport event stream has ended.");
                        break;
                    }
                },
            };
            self.handle_event(event);
        }
        debug!("Event pump stopped");
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Advertisements(advertisements) => self.observe(&advertisements),
            TransportEvent::Disconnected(device) => {
                self.inner
                    .disconnects
                    .handle_disconnect(&device, DisconnectReason::Remote);
            }
            TransportEvent::ValueChanged { device, payload } => {
                self.inner.router.dispatch(&device, payload);
            }
        }
    }

    fn observe(&self, advertisements: &[RawAdvertisement]) {
        let policy = *lock(&self.inner.policy);
        let observation = self.inner.tracker.observe(advertisements, policy);

        for summary in observation.discovered {
            self.inner.device_list.emit(&DeviceListChange::Discovered(summary));
        }
        for summary in observation.updated {
            self.inner.device_list.emit(&DeviceListChange::Updated(summary));
        }
        for device in observation.connect {
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.connect(&device).await {
                    warn!("Auto-connect to {} failed: {}", device, e);
                }
            });
        }
    }

    /// Connects to a device and subscribes to its notify characteristic.
    /// A no-op when the device is already connecting or connected.
    pub async fn connect(&self, device: &DeviceId) -> Result<(), ConnError> {
        let pending = self.inner.executor.active_mode();
        let Some(epoch) = self.inner.registry.insert(device, pending) else {
            debug!("Device {} already connecting or connected", device);
            return Ok(());
        };

        info!("Connecting to {}", device);
        if let Err(source) = self.inner.transport.connect(device).await {
            warn!("Failed to connect to {}: {}", device, source);
            self.inner.disconnects.discard_epoch(device, epoch);
            return Err(ConnError::Connect {
                device: device.clone(),
                source,
            });
        }

        if !self.inner.registry.mark_ready(device, epoch) {
            info!("Connection to {} was torn down while connecting", device);
            if !self.inner.registry.contains(device) {
                if let Err(e) = self.inner.transport.disconnect(device).await {
                    debug!("Closing aborted link to {} failed: {}", device, e);
                }
            }
            return Err(ConnError::Aborted(device.clone()));
        }
        info!("Device {} connected.", device);

        self.subscribe_notifications(device, epoch).await;
        let still_ready = self
            .inner
            .registry
            .get(device)
            .is_some_and(|state| state.epoch == epoch && state.status == ConnectionStatus::Ready);
        if !still_ready {
            info!("Connection to {} was lost while subscribing", device);
            return Err(ConnError::Aborted(device.clone()));
        }
        self.inner
            .device_list
            .emit(&DeviceListChange::Connected(self.summary(device)));

        if let Some(mode) = self.inner.registry.take_pending_auto_command(device, epoch) {
            if let Err(e) = self.inner.executor.send_mode(device, mode).await {
                warn!("Initial mode {} not applied to {}: {}", mode, device, e);
            }
        }
        Ok(())
    }

    async fn subscribe_notifications(&self, device: &DeviceId, epoch: u64) {
        let target = match self.find_notify_target(device).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                info!("Device {} exposes no known notify characteristic", device);
                return;
            }
            Err(e) => {
                warn!("Notify characteristic lookup on {} failed: {}", device, e);
                return;
            }
        };

        match self.inner.transport.subscribe(device, target).await {
            Ok(()) => {
                self.inner.registry.record_subscription(device, epoch, target);
                info!("Subscribed to notifications from {}", device);
            }
            Err(e) => match classify(&e) {
                FailureClass::LinkLost => {
                    warn!("Subscribing to {} lost the link: {}", device, e);
                    self.inner
                        .disconnects
                        .handle_disconnect_epoch(device, epoch, DisconnectReason::LinkLost);
                }
                FailureClass::Transport => warn!("Failed to subscribe to {}: {}", device, e),
            },
        }
    }

    async fn find_notify_target(&self, device: &DeviceId) -> Result<Option<CharacteristicRef>, TransportError> {
        let config = &self.inner.config;
        let services = self.inner.transport.list_services(device).await?;
        let Some(service) = config
            .profile_service_uuids
            .iter()
            .find(|uuid| services.iter().any(|s| s.uuid == **uuid))
        else {
            return Ok(None);
        };

        let chars = characteristics_or_empty(self.inner.transport.as_ref(), device, *service).await?;
        Ok(config
            .notify_char_uuids
            .iter()
            .find(|uuid| chars.iter().any(|c| c.uuid == **uuid))
            .map(|uuid| CharacteristicRef {
                service: *service,
                characteristic: *uuid,
            }))
    }

    /// Disconnects from a device. The device leaves the registry even if the
    /// transport fails to close the link. Cancelling a connect that has not
    /// completed publishes no disconnect.
    pub async fn disconnect(&self, device: &DeviceId) -> Result<(), ConnError> {
        let Some((epoch, previous)) = self.inner.registry.begin_disconnect(device) else {
            debug!("Device {} is not connected", device);
            return Ok(());
        };

        info!("Disconnecting from {}", device);
        let result = self.inner.transport.disconnect(device).await;
        if previous == ConnectionStatus::Connecting {
            self.inner.disconnects.discard_epoch(device, epoch);
        } else {
            self.inner
                .disconnects
                .handle_disconnect_epoch(device, epoch, DisconnectReason::Manual);
        }

        result.map_err(|source| ConnError::Disconnect {
            device: device.clone(),
            source,
        })
    }

    /// Disconnects every device in the registry, ignoring transport failures.
    pub async fn disconnect_all(&self) {
        let devices = self.inner.registry.all();
        let closes = devices.iter().map(|device| self.disconnect(device));
        for result in join_all(closes).await {
            if let Err(e) = result {
                debug!("Ignoring disconnect failure: {}", e);
            }
        }
    }

    /// Runs the idempotent disconnect cleanup for a device.
    pub fn handle_disconnect(&self, device: &DeviceId, reason: DisconnectReason) -> bool {
        self.inner.disconnects.handle_disconnect(device, reason)
    }

    /// Queues a raw characteristic write. The write holds its place in the
    /// device's queue from this call on.
    pub fn write(
        &self,
        device: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), WriteError>> + Send + use<> {
        self.inner
            .serializer
            .enqueue(device, WriteTask::new(service, characteristic, payload))
    }

    /// Applies a mode to `targets`. A running mode loop is stopped first.
    pub async fn apply_mode(
        &self,
        mode: LightMode,
        targets: &[DeviceId],
    ) -> Vec<(DeviceId, Result<(), WriteError>)> {
        self.stop_loop().await;
        self.inner.executor.apply_mode(mode, targets).await
    }

    pub async fn apply_mode_to_connected(&self, mode: LightMode) -> Vec<(DeviceId, Result<(), WriteError>)> {
        let targets = self.inner.registry.ready_ids();
        self.apply_mode(mode, &targets).await
    }

    /// Starts cycling modes on every connected device. Idempotent.
    pub async fn start_loop(&self) {
        let mut mode_loop = self.inner.mode_loop.lock().await;
        if mode_loop.as_ref().is_some_and(ModeLoop::is_running) {
            debug!("Mode loop already running");
            return;
        }
        *mode_loop = Some(
            self.inner
                .executor
                .start_mode_loop(self.inner.registry.clone(), self.inner.config.mode_cycle_interval()),
        );
    }

    pub async fn stop_loop(&self) {
        let mode_loop = self.inner.mode_loop.lock().await.take();
        if let Some(mode_loop) = mode_loop {
            mode_loop.stop().await;
            info!("Mode loop stopped.");
        }
    }

    pub async fn is_loop_running(&self) -> bool {
        self.inner
            .mode_loop
            .lock()
            .await
            .as_ref()
            .is_some_and(ModeLoop::is_running)
    }

    /// Turns auto-connect on and connects every tracked device that already
    /// qualifies.
    pub async fn enable_auto_mode(&self) -> Vec<(DeviceId, Result<(), ConnError>)> {
        let policy = {
            let mut policy = lock(&self.inner.policy);
            policy.enabled = true;
            *policy
        };
        info!("Auto mode enabled (threshold {} dBm)", policy.threshold_dbm);

        let candidates = self.inner.tracker.claim_candidates(policy);
        let connects = candidates.into_iter().map(|device| async move {
            let result = self.connect(&device).await;
            (device, result)
        });
        join_all(connects).await
    }

    /// Turns auto-connect off and disconnects every device before returning.
    pub async fn disable_auto_mode(&self) {
        lock(&self.inner.policy).enabled = false;
        info!("Auto mode disabled");
        self.disconnect_all().await;
    }

    pub fn set_auto_connect_threshold(&self, threshold_dbm: i16) {
        lock(&self.inner.policy).threshold_dbm = threshold_dbm;
        info!("Auto-connect threshold set to {} dBm", threshold_dbm);
    }

    pub fn auto_connect_policy(&self) -> AutoConnectPolicy {
        *lock(&self.inner.policy)
    }

    pub fn on_device_list_changed<F>(&self, handler: F)
    where
        F: Fn(&DeviceListChange) + Send + Sync + 'static,
    {
        self.inner.device_list.add(handler);
    }

    pub fn on_notification<F>(&self, handler: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.inner.router.set_handler(handler);
    }

    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(&DisconnectEvent) + Send + Sync + 'static,
    {
        self.inner.disconnect_listeners.add(handler);
    }

    /// Sends the device's notifications to the returned receiver instead of
    /// the session-wide handler.
    pub fn route_notifications(&self, device: &DeviceId) -> mpsc::UnboundedReceiver<Notification> {
        self.inner.router.route(device)
    }

    pub fn last_notification(&self, device: &DeviceId) -> Option<String> {
        self.inner.router.last_notification(device)
    }

    /// Ready devices, sorted by identity.
    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.inner.registry.ready_ids()
    }

    pub fn tracked_devices(&self) -> Vec<DeviceSummary> {
        self.inner.tracker.summaries()
    }

    pub fn status(&self, device: &DeviceId) -> Option<ConnectionStatus> {
        self.inner.registry.get(device).map(|state| state.status)
    }

    pub fn connection(&self, device: &DeviceId) -> Option<ConnectionState> {
        self.inner.registry.get(device)
    }

    pub fn active_mode(&self) -> Option<LightMode> {
        self.inner.executor.active_mode()
    }

    pub async fn services(&self, device: &DeviceId) -> Result<Vec<ServiceDescriptor>, TransportError> {
        self.inner.transport.list_services(device).await
    }

    pub async fn characteristics(
        &self,
        device: &DeviceId,
        service: Uuid,
    ) -> Result<Vec<CharDescriptor>, TransportError> {
        characteristics_or_empty(self.inner.transport.as_ref(), device, service).await
    }

    fn summary(&self, device: &DeviceId) -> DeviceSummary {
        let connected = self.inner.registry.contains(device);
        self.inner
            .tracker
            .get(device)
            .map(|record| record.summary(connected))
            .unwrap_or_else(|| DeviceSummary {
                id: device.clone(),
                name: None,
                rssi: None,
                is_connected: connected,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::core::bluetooth::commands::encode;
    use crate::core::bluetooth::constants::{
        UUID_LIGHT_NOTIFY_CHAR, UUID_LIGHT_SERVICE, UUID_LIGHT_WRITE_CHAR,
    };
    use crate::core::bluetooth::fake::FakeTransport;
    use crate::core::bluetooth::transport::TransportErrorKind;

    fn session(config: SessionConfig) -> (SessionManager, Arc<FakeTransport>) {
        let fake = Arc::new(FakeTransport::new());
        let manager = SessionManager::new(fake.clone(), config).unwrap();
        (manager, fake)
    }

    fn auto_config() -> SessionConfig {
        SessionConfig {
            auto_connect: true,
            ..SessionConfig::default()
        }
    }

    fn record_disconnects(manager: &SessionManager) -> Arc<Mutex<Vec<DisconnectEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.on_disconnect(move |event| sink.lock().unwrap().push(event.clone()));
        seen
    }

    fn id(s: &str) -> DeviceId {
        DeviceId::from(s)
    }

    fn record_device_list(manager: &SessionManager) -> Arc<Mutex<Vec<DeviceListChange>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.on_device_list_changed(move |change| sink.lock().unwrap().push(change.clone()));
        seen
    }

    fn spawn_connect(manager: &SessionManager, device: &str) -> JoinHandle<Result<(), ConnError>> {
        let manager = manager.clone();
        let device = id(device);
        tokio::spawn(async move { manager.connect(&device).await })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn matching_advertisement_is_connected_automatically() {
        let (manager, fake) = session(auto_config());
        manager.start().await.unwrap();
        assert!(fake.is_discovering());

        fake.emit(TransportEvent::Advertisements(vec![
            RawAdvertisement::new("D1", Some("632-X"), -55),
            RawAdvertisement::new("D2", Some("OTHER"), -40),
        ]));
        settle().await;

        assert_eq!(manager.connected_devices(), vec![id("D1")]);
        let tracked: Vec<DeviceId> = manager.tracked_devices().into_iter().map(|s| s.id).collect();
        assert_eq!(tracked, vec![id("D1")]);

        let notify = CharacteristicRef {
            service: UUID_LIGHT_SERVICE,
            characteristic: UUID_LIGHT_NOTIFY_CHAR,
        };
        assert_eq!(fake.subscriptions(), vec![(id("D1"), notify)]);
        assert!(manager.connection(&id("D1")).unwrap().subscribed.contains(&notify));

        manager.shutdown().await;
        assert!(!fake.is_discovering());
    }

    #[tokio::test(start_paused = true)]
    async fn weak_or_disabled_sightings_do_not_connect() {
        let (manager, fake) = session(SessionConfig::default());
        manager.start().await.unwrap();
        fake.emit(TransportEvent::Advertisements(vec![RawAdvertisement::new(
            "D1",
            Some("632-X"),
            -55,
        )]));
        settle().await;
        assert!(manager.connected_devices().is_empty());

        manager.set_auto_connect_threshold(-50);
        let results = manager.enable_auto_mode().await;
        assert!(results.is_empty());

        manager.set_auto_connect_threshold(-60);
        let results = manager.enable_auto_mode().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok());
        assert_eq!(manager.connected_devices(), vec![id("D1")]);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_removes_device_within_one_cycle() {
        let (manager, fake) = session(SessionConfig::default());
        let disconnects = record_disconnects(&manager);
        manager.start().await.unwrap();
        manager.connect(&id("D1")).await.unwrap();
        assert_eq!(manager.status(&id("D1")), Some(ConnectionStatus::Ready));

        fake.fail_probes(&id("D1"), TransportError::from_code(10008, "rssi failed"));
        tokio::time::sleep(Duration::from_millis(2100)).await;

        assert_eq!(manager.status(&id("D1")), None);
        assert_eq!(
            disconnects.lock().unwrap().clone(),
            vec![DisconnectEvent {
                device: id("D1"),
                reason: DisconnectReason::ProbeFailed,
            }]
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn apply_mode_reports_partial_failure() {
        let (manager, fake) = session(SessionConfig::default());
        manager.connect(&id("A")).await.unwrap();
        manager.connect(&id("B")).await.unwrap();
        fake.fail_next_write(&id("B"), TransportError::from_code(10008, "busy"));

        let results = manager.apply_mode(LightMode::Static, &[id("A"), id("B")]).await;

        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(WriteError::Transport { .. })));
        assert_eq!(manager.status(&id("B")), Some(ConnectionStatus::Ready));
        assert_eq!(fake.written_payloads(&id("A")), vec![encode(LightMode::Static)]);
    }

    #[tokio::test]
    async fn link_lost_write_disconnects() {
        let (manager, fake) = session(SessionConfig::default());
        let disconnects = record_disconnects(&manager);
        manager.connect(&id("D1")).await.unwrap();
        fake.fail_next_write(&id("D1"), TransportError::from_code(10006, "no connection"));

        let result = manager
            .write(&id("D1"), UUID_LIGHT_SERVICE, UUID_LIGHT_WRITE_CHAR, vec![0x01])
            .await;

        assert!(result.unwrap_err().is_link_lost());
        assert_eq!(manager.status(&id("D1")), None);
        assert_eq!(disconnects.lock().unwrap()[0].reason, DisconnectReason::LinkLost);
    }

    #[tokio::test]
    async fn write_to_unknown_device_is_not_connected() {
        let (manager, fake) = session(SessionConfig::default());
        let result = manager
            .write(&id("ghost"), UUID_LIGHT_SERVICE, UUID_LIGHT_WRITE_CHAR, vec![0x01])
            .await;
        assert!(matches!(result, Err(WriteError::NotConnected(_))));
        assert!(fake.write_attempts(&id("ghost")).is_empty());
    }

    #[tokio::test]
    async fn second_connect_is_a_no_op() {
        let (manager, fake) = session(SessionConfig::default());
        manager.connect(&id("D1")).await.unwrap();
        manager.connect(&id("D1")).await.unwrap();
        assert_eq!(fake.connects(), vec![id("D1")]);
    }

    #[tokio::test]
    async fn failed_connect_leaves_no_entry_and_no_event() {
        let (manager, fake) = session(SessionConfig::default());
        let disconnects = record_disconnects(&manager);
        fake.fail_connect(&id("D1"), TransportError::from_code(10003, "refused"));

        let result = manager.connect(&id("D1")).await;

        assert!(matches!(result, Err(ConnError::Connect { .. })));
        assert_eq!(manager.status(&id("D1")), None);
        assert!(disconnects.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_connect_aborts_it_silently() {
        let (manager, fake) = session(SessionConfig::default());
        let disconnects = record_disconnects(&manager);
        let changes = record_device_list(&manager);
        fake.block_connects(&id("D1"));

        let connecting = spawn_connect(&manager, "D1");
        settle().await;
        assert_eq!(manager.status(&id("D1")), Some(ConnectionStatus::Connecting));

        manager.disconnect(&id("D1")).await.unwrap();
        fake.release_connects(&id("D1"));

        assert!(matches!(connecting.await.unwrap(), Err(ConnError::Aborted(_))));
        assert_eq!(manager.status(&id("D1")), None);
        assert_eq!(fake.disconnects(), vec![id("D1"), id("D1")]);
        assert!(disconnects.lock().unwrap().is_empty());
        assert!(changes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn write_while_connecting_never_reaches_the_transport() {
        let (manager, fake) = session(SessionConfig::default());
        let disconnects = record_disconnects(&manager);
        fake.block_connects(&id("D1"));
        fake.fail_next_write(&id("D1"), TransportError::from_code(10006, "no connection"));

        let connecting = spawn_connect(&manager, "D1");
        settle().await;

        let result = manager
            .write(&id("D1"), UUID_LIGHT_SERVICE, UUID_LIGHT_WRITE_CHAR, vec![0x01])
            .await;
        assert!(matches!(result, Err(WriteError::NotConnected(_))));
        let applied = manager.apply_mode(LightMode::Static, &[id("D1")]).await;
        assert!(matches!(applied[0].1, Err(WriteError::NotConnected(_))));
        assert!(fake.write_attempts(&id("D1")).is_empty());
        assert_eq!(manager.status(&id("D1")), Some(ConnectionStatus::Connecting));

        fake.release_connects(&id("D1"));
        assert!(connecting.await.unwrap().is_ok());
        assert_eq!(manager.status(&id("D1")), Some(ConnectionStatus::Ready));
        assert!(disconnects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn link_lost_subscribe_disconnects() {
        let (manager, fake) = session(SessionConfig::default());
        let disconnects = record_disconnects(&manager);
        let changes = record_device_list(&manager);
        fake.fail_subscribe(&id("D1"), TransportError::from_code(10006, "no connection"));

        let result = manager.connect(&id("D1")).await;

        assert!(matches!(result, Err(ConnError::Aborted(_))));
        assert_eq!(manager.status(&id("D1")), None);
        assert_eq!(
            disconnects.lock().unwrap().clone(),
            vec![DisconnectEvent {
                device: id("D1"),
                reason: DisconnectReason::LinkLost,
            }]
        );
        assert!(
            !changes
                .lock()
                .unwrap()
                .iter()
                .any(|change| matches!(change, DeviceListChange::Connected(_)))
        );
    }

    #[tokio::test]
    async fn other_subscribe_failures_keep_the_connection() {
        let (manager, fake) = session(SessionConfig::default());
        let disconnects = record_disconnects(&manager);
        fake.fail_subscribe(&id("D1"), TransportError::from_code(10008, "system error"));

        manager.connect(&id("D1")).await.unwrap();

        assert_eq!(manager.status(&id("D1")), Some(ConnectionStatus::Ready));
        assert!(manager.connection(&id("D1")).unwrap().subscribed.is_empty());
        assert!(disconnects.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_subscribing_suppresses_connected() {
        let (manager, fake) = session(SessionConfig::default());
        let changes = record_device_list(&manager);
        fake.block_subscribes(&id("D1"));

        let connecting = spawn_connect(&manager, "D1");
        settle().await;
        assert_eq!(manager.status(&id("D1")), Some(ConnectionStatus::Ready));

        assert!(manager.handle_disconnect(&id("D1"), DisconnectReason::Remote));
        fake.release_subscribes(&id("D1"));

        assert!(matches!(connecting.await.unwrap(), Err(ConnError::Aborted(_))));
        assert_eq!(manager.status(&id("D1")), None);
        assert_eq!(
            changes.lock().unwrap().clone(),
            vec![DeviceListChange::Disconnected {
                id: id("D1"),
                reason: DisconnectReason::Remote,
            }]
        );
    }

    #[tokio::test]
    async fn missing_characteristics_do_not_fail_the_connection() {
        let (manager, fake) = session(SessionConfig::default());
        fake.clear_characteristics(UUID_LIGHT_SERVICE);

        manager.connect(&id("D1")).await.unwrap();

        assert_eq!(manager.status(&id("D1")), Some(ConnectionStatus::Ready));
        assert!(fake.subscriptions().is_empty());
        assert!(
            manager
                .characteristics(&id("D1"), UUID_LIGHT_SERVICE)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn active_mode_is_written_to_new_connections() {
        let (manager, fake) = session(SessionConfig::default());
        manager.apply_mode(LightMode::Rainbow, &[]).await;

        manager.connect(&id("D1")).await.unwrap();

        assert_eq!(fake.written_payloads(&id("D1")), vec![encode(LightMode::Rainbow)]);
        assert_eq!(manager.connection(&id("D1")).unwrap().pending_auto_command, None);
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_reach_one_consumer() {
        let (manager, fake) = session(SessionConfig::default());
        manager.start().await.unwrap();
        manager.connect(&id("D1")).await.unwrap();
        manager.connect(&id("D2")).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.on_notification(move |n| sink.lock().unwrap().push(n.hex.clone()));
        let mut routed = manager.route_notifications(&id("D2"));

        fake.emit(TransportEvent::ValueChanged {
            device: id("D1"),
            payload: vec![0xde, 0xad],
        });
        fake.emit(TransportEvent::ValueChanged {
            device: id("D2"),
            payload: vec![0xbe, 0xef],
        });
        settle().await;

        assert_eq!(seen.lock().unwrap().clone(), vec!["dead".to_string()]);
        assert_eq!(routed.try_recv().unwrap().hex, "beef");
        assert_eq!(manager.last_notification(&id("D1")).as_deref(), Some("dead"));
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn remote_disconnect_clears_state_and_rearms() {
        let (manager, fake) = session(auto_config());
        let disconnects = record_disconnects(&manager);
        manager.start().await.unwrap();
        let adv = vec![RawAdvertisement::new("D1", Some("632-A"), -50)];

        fake.emit(TransportEvent::Advertisements(adv.clone()));
        settle().await;
        fake.emit(TransportEvent::ValueChanged {
            device: id("D1"),
            payload: vec![1],
        });
        fake.emit(TransportEvent::Disconnected(id("D1")));
        settle().await;

        assert_eq!(manager.status(&id("D1")), None);
        assert_eq!(manager.last_notification(&id("D1")), None);
        assert_eq!(disconnects.lock().unwrap()[0].reason, DisconnectReason::Remote);

        fake.emit(TransportEvent::Advertisements(adv));
        settle().await;
        assert_eq!(manager.connected_devices(), vec![id("D1")]);
        assert_eq!(fake.connects().len(), 2);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn manual_mode_stops_the_loop() {
        let (manager, _fake) = session(SessionConfig::default());
        manager.connect(&id("D1")).await.unwrap();

        manager.start_loop().await;
        manager.start_loop().await;
        assert!(manager.is_loop_running().await);

        manager.apply_mode(LightMode::Off, &[id("D1")]).await;

        assert!(!manager.is_loop_running().await);
        assert_eq!(manager.active_mode(), Some(LightMode::Off));
    }

    #[tokio::test]
    async fn disable_auto_mode_disconnects_everything() {
        let (manager, fake) = session(auto_config());
        manager.connect(&id("A")).await.unwrap();
        manager.connect(&id("B")).await.unwrap();
        fake.fail_disconnect(&id("A"), TransportError::from_code(10006, "already gone"));

        manager.disable_auto_mode().await;

        assert!(manager.connected_devices().is_empty());
        assert!(!manager.auto_connect_policy().enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_probing() {
        let (manager, fake) = session(SessionConfig::default());
        manager.start().await.unwrap();
        manager.connect(&id("D1")).await.unwrap();

        manager.shutdown().await;
        fake.fail_probes(&id("D1"), TransportError::from_code(10006, "gone"));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(manager.status(&id("D1")), Some(ConnectionStatus::Ready));
    }

    #[tokio::test]
    async fn start_twice_is_rejected_and_adapter_failure_surfaces() {
        let (manager, fake) = session(SessionConfig::default());
        manager.start().await.unwrap();
        assert!(matches!(manager.start().await, Err(SessionError::AlreadyStarted)));
        manager.shutdown().await;

        let (manager, fake2) = session(SessionConfig::default());
        fake2.fail_open_adapter(TransportError::new(TransportErrorKind::AdapterUnavailable, "off"));
        assert!(matches!(manager.start().await, Err(SessionError::Adapter(_))));
        assert!(!fake2.is_discovering());
        drop(fake);
    }

    #[test]
    fn invalid_name_pattern_is_rejected() {
        let config = SessionConfig {
            name_pattern: "(".to_string(),
            ..SessionConfig::default()
        };
        let result = SessionManager::new(Arc::new(FakeTransport::new()), config);
        assert!(matches!(result, Err(SessionError::NamePattern(_))));
    }
}
