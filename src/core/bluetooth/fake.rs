//! Scriptable in-memory transport for tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    UUID_LIGHT_NOTIFY_CHAR, UUID_LIGHT_SERVICE, UUID_LIGHT_WRITE_CHAR,
};
use crate::core::bluetooth::transport::{
    BleTransport, TransportError, TransportErrorKind, TransportEvent,
};
use crate::core::bluetooth::types::{CharDescriptor, CharacteristicRef, DeviceId, ServiceDescriptor};

#[derive(Default)]
struct FakeState {
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    discovering: bool,
    adapter_error: Option<TransportError>,

    connect_failures: HashMap<DeviceId, TransportError>,
    connect_gates: HashMap<DeviceId, Arc<Semaphore>>,
    disconnect_failures: HashMap<DeviceId, TransportError>,
    connects: Vec<DeviceId>,
    disconnects: Vec<DeviceId>,

    services: Vec<Uuid>,
    characteristics: HashMap<Uuid, Vec<Uuid>>,
    subscriptions: Vec<(DeviceId, CharacteristicRef)>,
    subscribe_failures: HashMap<DeviceId, TransportError>,
    subscribe_gates: HashMap<DeviceId, Arc<Semaphore>>,

    write_failures: HashMap<DeviceId, VecDeque<TransportError>>,
    write_gates: HashMap<DeviceId, Arc<Semaphore>>,
    write_attempts: Vec<(DeviceId, Vec<u8>)>,
    written: Vec<(DeviceId, Vec<u8>)>,

    probe_failures: HashMap<DeviceId, TransportError>,
    hung_probes: HashSet<DeviceId>,
    rssi: HashMap<DeviceId, i16>,
    probed: Vec<DeviceId>,
}

/// Transport double. Everything succeeds unless a test scripts otherwise.
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub fn new() -> Self {
        let state = FakeState {
            services: vec![UUID_LIGHT_SERVICE],
            characteristics: HashMap::from([(
                UUID_LIGHT_SERVICE,
                vec![UUID_LIGHT_NOTIFY_CHAR, UUID_LIGHT_WRITE_CHAR],
            )]),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Pushes an event through the attached sink, as the platform would.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.with(|s| s.events.as_ref().map(|tx| tx.send(event).is_ok()))
            .unwrap_or(false)
    }

    pub fn is_discovering(&self) -> bool {
        self.with(|s| s.discovering)
    }

    pub fn fail_open_adapter(&self, error: TransportError) {
        self.with(|s| s.adapter_error = Some(error));
    }

    pub fn fail_connect(&self, device: &DeviceId, error: TransportError) {
        self.with(|s| s.connect_failures.insert(device.clone(), error));
    }

    /// Holds `connect` for the device until [`Self::release_connects`].
    pub fn block_connects(&self, device: &DeviceId) {
        self.with(|s| s.connect_gates.insert(device.clone(), Arc::new(Semaphore::new(0))));
    }

    pub fn release_connects(&self, device: &DeviceId) {
        if let Some(gate) = self.with(|s| s.connect_gates.remove(device)) {
            gate.close();
        }
    }

    pub fn fail_disconnect(&self, device: &DeviceId, error: TransportError) {
        self.with(|s| s.disconnect_failures.insert(device.clone(), error));
    }

    pub fn connects(&self) -> Vec<DeviceId> {
        self.with(|s| s.connects.clone())
    }

    pub fn disconnects(&self) -> Vec<DeviceId> {
        self.with(|s| s.disconnects.clone())
    }

    /// Makes `service` report no characteristics at all.
    pub fn clear_characteristics(&self, service: Uuid) {
        self.with(|s| s.characteristics.insert(service, Vec::new()));
    }

    pub fn subscriptions(&self) -> Vec<(DeviceId, CharacteristicRef)> {
        self.with(|s| s.subscriptions.clone())
    }

    pub fn fail_subscribe(&self, device: &DeviceId, error: TransportError) {
        self.with(|s| s.subscribe_failures.insert(device.clone(), error));
    }

    /// Holds `subscribe` for the device until [`Self::release_subscribes`].
    pub fn block_subscribes(&self, device: &DeviceId) {
        self.with(|s| s.subscribe_gates.insert(device.clone(), Arc::new(Semaphore::new(0))));
    }

    pub fn release_subscribes(&self, device: &DeviceId) {
        if let Some(gate) = self.with(|s| s.subscribe_gates.remove(device)) {
            gate.close();
        }
    }

    /// The next write to the device fails with `error`; later writes succeed.
    pub fn fail_next_write(&self, device: &DeviceId, error: TransportError) {
        self.with(|s| {
            s.write_failures
                .entry(device.clone())
                .or_default()
                .push_back(error)
        });
    }

    /// Writes to the device hang until [`Self::release_writes`].
    pub fn block_writes(&self, device: &DeviceId) {
        self.with(|s| s.write_gates.insert(device.clone(), Arc::new(Semaphore::new(0))));
    }

    pub fn release_writes(&self, device: &DeviceId) {
        if let Some(gate) = self.with(|s| s.write_gates.remove(device)) {
            gate.close();
        }
    }

    /// Every payload the transport was asked to write, in call order.
    pub fn write_attempts(&self, device: &DeviceId) -> Vec<Vec<u8>> {
        self.with(|s| payloads_for(&s.write_attempts, device))
    }

    /// Payloads whose write succeeded, in completion order.
    pub fn written_payloads(&self, device: &DeviceId) -> Vec<Vec<u8>> {
        self.with(|s| payloads_for(&s.written, device))
    }

    pub fn fail_probes(&self, device: &DeviceId, error: TransportError) {
        self.with(|s| s.probe_failures.insert(device.clone(), error));
    }

    /// RSSI reads for the device never answer.
    pub fn hang_probes(&self, device: &DeviceId) {
        self.with(|s| s.hung_probes.insert(device.clone()));
    }

    pub fn set_rssi(&self, device: &DeviceId, rssi: i16) {
        self.with(|s| s.rssi.insert(device.clone(), rssi));
    }

    pub fn probed(&self) -> Vec<DeviceId> {
        self.with(|s| s.probed.clone())
    }
}

fn payloads_for(log: &[(DeviceId, Vec<u8>)], device: &DeviceId) -> Vec<Vec<u8>> {
    log.iter()
        .filter(|(id, _)| id == device)
        .map(|(_, payload)| payload.clone())
        .collect()
}

/// Waits until the gate is closed. Closing is the only way a gate opens.
async fn pass(gate: Option<Arc<Semaphore>>) {
    if let Some(gate) = gate {
        let _ = gate.acquire().await;
    }
}

#[async_trait]
impl BleTransport for FakeTransport {
    async fn open_adapter(&self) -> Result<(), TransportError> {
        match self.with(|s| s.adapter_error.clone()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn start_discovery(&self, _allow_duplicates: bool) -> Result<(), TransportError> {
        self.with(|s| s.discovering = true);
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), TransportError> {
        self.with(|s| s.discovering = false);
        Ok(())
    }

    fn attach_events(&self, events: mpsc::UnboundedSender<TransportEvent>) {
        self.with(|s| s.events = Some(events));
    }

    async fn connect(&self, device: &DeviceId) -> Result<(), TransportError> {
        let gate = self.with(|s| {
            s.connects.push(device.clone());
            s.connect_gates.get(device).cloned()
        });
        pass(gate).await;
        match self.with(|s| s.connect_failures.remove(device)) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<(), TransportError> {
        self.with(|s| {
            s.disconnects.push(device.clone());
            match s.disconnect_failures.remove(device) {
                Some(error) => Err(error),
                None => Ok(()),
            }
        })
    }

    async fn list_services(&self, _device: &DeviceId) -> Result<Vec<ServiceDescriptor>, TransportError> {
        Ok(self.with(|s| {
            s.services
                .iter()
                .map(|uuid| ServiceDescriptor { uuid: *uuid })
                .collect()
        }))
    }

    async fn list_characteristics(
        &self,
        _device: &DeviceId,
        service: Uuid,
    ) -> Result<Vec<CharDescriptor>, TransportError> {
        let found = self.with(|s| s.characteristics.get(&service).cloned());
        match found {
            None => Err(TransportError::new(TransportErrorKind::NoService, service.to_string())),
            Some(chars) if chars.is_empty() => Err(TransportError::new(
                TransportErrorKind::NoCharacteristics,
                service.to_string(),
            )),
            Some(chars) => Ok(chars
                .into_iter()
                .map(|uuid| CharDescriptor { service, uuid })
                .collect()),
        }
    }

    async fn write_characteristic(
        &self,
        device: &DeviceId,
        _target: CharacteristicRef,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let gate = self.with(|s| {
            s.write_attempts.push((device.clone(), payload.to_vec()));
            s.write_gates.get(device).cloned()
        });
        pass(gate).await;
        self.with(|s| {
            match s.write_failures.get_mut(device).and_then(VecDeque::pop_front) {
                Some(error) => Err(error),
                None => {
                    s.written.push((device.clone(), payload.to_vec()));
                    Ok(())
                }
            }
        })
    }

    async fn subscribe(&self, device: &DeviceId, target: CharacteristicRef) -> Result<(), TransportError> {
        let gate = self.with(|s| s.subscribe_gates.get(device).cloned());
        pass(gate).await;
        self.with(|s| match s.subscribe_failures.remove(device) {
            Some(error) => Err(error),
            None => {
                s.subscriptions.push((device.clone(), target));
                Ok(())
            }
        })
    }

    async fn read_signal_strength(&self, device: &DeviceId) -> Result<i16, TransportError> {
        let (hung, outcome) = self.with(|s| {
            s.probed.push(device.clone());
            let outcome = match s.probe_failures.get(device) {
                Some(error) => Err(error.clone()),
                None => Ok(s.rssi.get(device).copied().unwrap_or(-60)),
            };
            (s.hung_probes.contains(device), outcome)
        });
        if hung {
            std::future::pending::<()>().await;
        }
        outcome
    }
}
