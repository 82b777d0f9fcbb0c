//! Liveness supervision
//! Two independent loops: the presence loop ages out silent unconnected
//! devices, the probe loop reads RSSI from every ready device and treats any
//! failure as a lost link.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::disconnect::DisconnectHandler;
use crate::core::bluetooth::listeners::Listeners;
use crate::core::bluetooth::registry::ConnectionRegistry;
use crate::core::bluetooth::tracker::AdvertisementTracker;
use crate::core::bluetooth::transport::{BleTransport, TransportError, TransportErrorKind};
use crate::core::bluetooth::types::{DeviceId, DeviceListChange, DisconnectReason};

#[derive(Clone)]
pub struct LivenessSupervisor {
    tracker: AdvertisementTracker,
    registry: ConnectionRegistry,
    transport: Arc<dyn BleTransport>,
    disconnects: DisconnectHandler,
    device_list: Listeners<DeviceListChange>,
    presence_interval: Duration,
    probe_interval: Duration,
}

impl LivenessSupervisor {
    pub fn new(
        tracker: AdvertisementTracker,
        registry: ConnectionRegistry,
        transport: Arc<dyn BleTransport>,
        disconnects: DisconnectHandler,
        device_list: Listeners<DeviceListChange>,
        presence_interval: Duration,
        probe_interval: Duration,
    ) -> Self {
        Self {
            tracker,
            registry,
            transport,
            disconnects,
            device_list,
            presence_interval,
            probe_interval,
        }
    }

    /// Spawns both loops. They run until `cancel` fires; a probe cycle still
    /// in flight at that point is dropped without acting on its results.
    pub fn start(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let presence = {
            let supervisor = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { supervisor.presence_loop(cancel).await })
        };
        let probe = {
            let supervisor = self.clone();
            tokio::spawn(async move { supervisor.probe_loop(cancel).await })
        };
        info!(
            "Liveness supervisor started (presence every {:?}, probe every {:?})",
            self.presence_interval, self.probe_interval
        );
        vec![presence, probe]
    }

    async fn presence_loop(self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.presence_interval, self.presence_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.presence_cycle();
                }
            }
        }
        debug!("Presence loop stopped");
    }

    async fn probe_loop(self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.probe_interval, self.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = self.probe_cycle() => {}
                    }
                }
            }
        }
        debug!("Probe loop stopped");
    }

    /// Ages the advertisement set once and publishes evictions.
    pub fn presence_cycle(&self) -> Vec<DeviceId> {
        let evicted = self.tracker.age_tick();
        for id in &evicted {
            self.device_list.emit(&DeviceListChange::Evicted(id.clone()));
        }
        evicted
    }

    /// Probes every ready device concurrently. Returns the devices that were
    /// disconnected by this cycle.
    pub async fn probe_cycle(&self) -> Vec<DeviceId> {
        let targets = self.registry.ready();
        let probes = targets.into_iter().map(|(device, epoch)| async move {
            match self.probe(&device).await {
                Ok(rssi) => {
                    debug!("Probe of {} ok, RSSI: {}", device, rssi);
                    self.registry.set_rssi(&device, epoch, rssi);
                    None
                }
                Err(e) => {
                    warn!("Probe of {} failed, treating as disconnect: {}", device, e);
                    self.disconnects
                        .handle_disconnect_epoch(&device, epoch, DisconnectReason::ProbeFailed)
                        .then_some(device)
                }
            }
        });
        join_all(probes).await.into_iter().flatten().collect()
    }

    async fn probe(&self, device: &DeviceId) -> Result<i16, TransportError> {
        match timeout(self.probe_interval, self.transport.read_signal_strength(device)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::new(
                TransportErrorKind::OperationTimeout,
                format!("no RSSI reply within {:?}", self.probe_interval),
            )),
        }
    }
}
