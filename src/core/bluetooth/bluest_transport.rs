//! Platform transport over bluest
//! This module scans, connects and talks GATT through the system adapter.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bluest::error::ErrorKind;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device, Service};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{OnceCell, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::constants::ERR_CODE_SYSTEM_ERROR;
use crate::core::bluetooth::transport::{
    BleTransport, TransportError, TransportErrorKind, TransportEvent,
};
use crate::core::bluetooth::types::{
    CharDescriptor, CharacteristicRef, DeviceId, RawAdvertisement, ServiceDescriptor,
};
use crate::utils::lock;

type EventSink = Arc<Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>>;

struct ScanTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct BluestTransport {
    adapter: OnceCell<Adapter>,
    /// Map of discovered device ids to devices
    devices: Arc<Mutex<HashMap<DeviceId, Device>>>,
    characteristics: Mutex<HashMap<(DeviceId, CharacteristicRef), Characteristic>>,
    events: EventSink,
    scan: Mutex<Option<ScanTask>>,
    /// Cancels the connection watcher and notification tasks of a device
    device_tasks: Mutex<HashMap<DeviceId, CancellationToken>>,
}

impl Default for BluestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl BluestTransport {
    pub fn new() -> Self {
        Self {
            adapter: OnceCell::new(),
            devices: Arc::new(Mutex::new(HashMap::new())),
            characteristics: Mutex::new(HashMap::new()),
            events: Arc::new(Mutex::new(None)),
            scan: Mutex::new(None),
            device_tasks: Mutex::new(HashMap::new()),
        }
    }

    fn adapter(&self) -> Result<&Adapter, TransportError> {
        self.adapter.get().ok_or_else(|| {
            TransportError::new(TransportErrorKind::AdapterUnavailable, "adapter not opened")
        })
    }

    fn device(&self, id: &DeviceId) -> Result<Device, TransportError> {
        lock(&self.devices).get(id).cloned().ok_or_else(|| {
            TransportError::new(
                TransportErrorKind::NotFound,
                format!("device {} has not been discovered", id),
            )
        })
    }

    /// Token for the device's background tasks, created on first use.
    fn device_token(&self, id: &DeviceId) -> CancellationToken {
        lock(&self.device_tasks)
            .entry(id.clone())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    async fn service(&self, id: &DeviceId, uuid: Uuid) -> Result<Service, TransportError> {
        let device = self.device(id)?;
        let services = device
            .discover_services_with_uuid(uuid)
            .await
            .map_err(map_error)?;
        services.into_iter().next().ok_or_else(|| {
            TransportError::new(
                TransportErrorKind::NoService,
                format!("service {} not found on {}", uuid, id),
            )
        })
    }

    async fn characteristic(
        &self,
        id: &DeviceId,
        target: CharacteristicRef,
    ) -> Result<Characteristic, TransportError> {
        let key = (id.clone(), target);
        if let Some(characteristic) = lock(&self.characteristics).get(&key).cloned() {
            return Ok(characteristic);
        }

        let service = self.service(id, target.service).await?;
        let characteristic = service
            .discover_characteristics_with_uuid(target.characteristic)
            .await
            .map_err(map_error)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                TransportError::new(
                    TransportErrorKind::NotFound,
                    format!("characteristic {} not found on {}", target.characteristic, id),
                )
            })?;
        lock(&self.characteristics).insert(key, characteristic.clone());
        Ok(characteristic)
    }

    fn watch_connection(&self, adapter: Adapter, id: DeviceId, device: Device) {
        let events = self.events.clone();
        let cancel = self.device_token(&id);
        tokio::spawn(async move {
            let mut stream = match adapter.device_connection_events(&device).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Cannot watch connection of {}: {}", id, e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = stream.next() => match event {
                        Some(ConnectionEvent::Disconnected) => {
                            info!("Device {} dropped the connection", id);
                            publish(&events, TransportEvent::Disconnected(id.clone()));
                            break;
                        }
                        Some(ConnectionEvent::Connected) => debug!("Device {} connected", id),
                        None => break,
                    }
                }
            }
        });
    }
}

fn publish(events: &EventSink, event: TransportEvent) {
    if let Some(tx) = lock(events).as_ref() {
        if tx.send(event).is_err() {
            debug!("Transport event dropped, no receiver");
        }
    }
}

/// Maps a bluest error onto the transport vocabulary.
fn map_error(e: bluest::Error) -> TransportError {
    let kind = match e.kind() {
        ErrorKind::NotConnected => TransportErrorKind::NoConnection,
        ErrorKind::Timeout => TransportErrorKind::OperationTimeout,
        ErrorKind::NotFound => TransportErrorKind::NotFound,
        ErrorKind::AdapterUnavailable => TransportErrorKind::AdapterUnavailable,
        _ => TransportErrorKind::Other(ERR_CODE_SYSTEM_ERROR),
    };
    TransportError::new(kind, e.to_string())
}

async fn scan_task(
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<DeviceId, Device>>>,
    events: EventSink,
    cancel: CancellationToken,
    allow_duplicates: bool,
) -> Result<(), bluest::Error> {
    let mut scan_stream = adapter.scan(&[]).await?;
    let mut reported = HashSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = scan_stream.next() => {
                let Some(discovered) = result else {
                    info!("Bluetooth scan stream has ended.");
                    break;
                };
                let id = DeviceId::new(discovered.device.id().to_string());
                let Some(rssi) = discovered.rssi else {
                    debug!("Skipping {} without RSSI", id);
                    continue;
                };
                if !allow_duplicates && !reported.insert(id.clone()) {
                    continue;
                }
                let name = discovered
                    .adv_data
                    .local_name
                    .clone()
                    .or_else(|| discovered.device.name().ok());

                lock(&devices).insert(id.clone(), discovered.device);
                publish(
                    &events,
                    TransportEvent::Advertisements(vec![RawAdvertisement { id, name, rssi }]),
                );
            }
        }
    }
    Ok(())
}

#[async_trait]
impl BleTransport for BluestTransport {
    async fn open_adapter(&self) -> Result<(), TransportError> {
        self.adapter
            .get_or_try_init(|| async {
                let adapter = Adapter::default().await.ok_or_else(|| {
                    TransportError::new(
                        TransportErrorKind::AdapterUnavailable,
                        "no bluetooth adapter found",
                    )
                })?;
                adapter.wait_available().await.map_err(map_error)?;
                Ok::<_, TransportError>(adapter)
            })
            .await?;
        Ok(())
    }

    async fn start_discovery(&self, allow_duplicates: bool) -> Result<(), TransportError> {
        let adapter = self.adapter()?.clone();
        self.stop_discovery().await?;

        let cancel = CancellationToken::new();
        let devices = self.devices.clone();
        let events = self.events.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = scan_task(adapter, devices, events, token, allow_duplicates).await {
                error!("Bluetooth scan failed: {}", e);
            }
        });

        *lock(&self.scan) = Some(ScanTask { cancel, handle });
        info!("Device scan task started.");
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), TransportError> {
        let scan = lock(&self.scan).take();
        if let Some(scan) = scan {
            scan.cancel.cancel();
            if let Err(e) = scan.handle.await {
                error!("Scan task ended abnormally: {}", e);
            }
            info!("Device scan task stopped.");
        }
        Ok(())
    }

    fn attach_events(&self, events: mpsc::UnboundedSender<TransportEvent>) {
        *lock(&self.events) = Some(events);
    }

    async fn connect(&self, id: &DeviceId) -> Result<(), TransportError> {
        let adapter = self.adapter()?.clone();
        let device = self.device(id)?;

        if !device.is_connected().await {
            info!("Initiating connection to {}...", id);
            adapter.connect_device(&device).await.map_err(map_error)?;
        }
        self.watch_connection(adapter, id.clone(), device);
        Ok(())
    }

    async fn disconnect(&self, id: &DeviceId) -> Result<(), TransportError> {
        if let Some(token) = lock(&self.device_tasks).remove(id) {
            token.cancel();
        }
        lock(&self.characteristics).retain(|(device, _), _| device != id);

        let adapter = self.adapter()?;
        let device = self.device(id)?;
        if device.is_connected().await {
            adapter.disconnect_device(&device).await.map_err(map_error)?;
        }
        Ok(())
    }

    async fn list_services(&self, id: &DeviceId) -> Result<Vec<ServiceDescriptor>, TransportError> {
        let device = self.device(id)?;
        let services = device.discover_services().await.map_err(map_error)?;
        Ok(services
            .iter()
            .map(|service| ServiceDescriptor {
                uuid: service.uuid(),
            })
            .collect())
    }

    async fn list_characteristics(
        &self,
        id: &DeviceId,
        service: Uuid,
    ) -> Result<Vec<CharDescriptor>, TransportError> {
        let handle = self.service(id, service).await?;
        let characteristics = handle.discover_characteristics().await.map_err(map_error)?;
        if characteristics.is_empty() {
            return Err(TransportError::new(
                TransportErrorKind::NoCharacteristics,
                format!("service {} on {} has no characteristics", service, id),
            ));
        }

        let mut cache = lock(&self.characteristics);
        Ok(characteristics
            .into_iter()
            .map(|characteristic| {
                let uuid = characteristic.uuid();
                let target = CharacteristicRef {
                    service,
                    characteristic: uuid,
                };
                cache.insert((id.clone(), target), characteristic);
                CharDescriptor { service, uuid }
            })
            .collect())
    }

    async fn write_characteristic(
        &self,
        id: &DeviceId,
        target: CharacteristicRef,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let characteristic = self.characteristic(id, target).await?;
        characteristic.write(payload).await.map_err(map_error)
    }

    async fn subscribe(&self, id: &DeviceId, target: CharacteristicRef) -> Result<(), TransportError> {
        let characteristic = self.characteristic(id, target).await?;
        let events = self.events.clone();
        let cancel = self.device_token(id);
        let device = id.clone();
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut stream = match characteristic.notify().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(map_error(e)));
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = stream.next() => match next {
                        Some(Ok(payload)) => {
                            publish(&events, TransportEvent::ValueChanged { device: device.clone(), payload });
                        }
                        Some(Err(e)) => {
                            warn!("Notification stream from {} failed: {}", device, e);
                            break;
                        }
                        None => break,
                    }
                }
            }
            debug!("Notification task for {} stopped", device);
        });

        ready_rx.await.unwrap_or_else(|_| {
            Err(TransportError::new(
                TransportErrorKind::Other(ERR_CODE_SYSTEM_ERROR),
                "notification task ended before subscribing",
            ))
        })
    }

    async fn read_signal_strength(&self, id: &DeviceId) -> Result<i16, TransportError> {
        let device = self.device(id)?;
        device.rssi().await.map_err(map_error)
    }
}
