//! Disconnect cleanup shared by every teardown path
//! Manual disconnects, link-lost writes, failed probes and unsolicited
//! transport events all end here. Removal from the registry decides which
//! caller performs the fan-out, so concurrent triggers publish once.

use log::{debug, info};

use crate::core::bluetooth::listeners::Listeners;
use crate::core::bluetooth::notification::NotificationRouter;
use crate::core::bluetooth::registry::{ConnectionRegistry, ConnectionState};
use crate::core::bluetooth::tracker::AdvertisementTracker;
use crate::core::bluetooth::types::{DeviceId, DeviceListChange, DisconnectEvent, DisconnectReason};

#[derive(Clone)]
pub struct DisconnectHandler {
    registry: ConnectionRegistry,
    tracker: AdvertisementTracker,
    router: NotificationRouter,
    disconnect_listeners: Listeners<DisconnectEvent>,
    device_list: Listeners<DeviceListChange>,
}

impl DisconnectHandler {
    pub fn new(
        registry: ConnectionRegistry,
        tracker: AdvertisementTracker,
        router: NotificationRouter,
        disconnect_listeners: Listeners<DisconnectEvent>,
        device_list: Listeners<DeviceListChange>,
    ) -> Self {
        Self {
            registry,
            tracker,
            router,
            disconnect_listeners,
            device_list,
        }
    }

    /// Tears down whatever connection `device` currently has.
    /// Returns false when there was nothing to tear down.
    pub fn handle_disconnect(&self, device: &DeviceId, reason: DisconnectReason) -> bool {
        let removed = self.registry.remove(device);
        self.finish(device, removed, reason)
    }

    /// Tears down the connection only if it is still the one identified by
    /// `epoch`; a newer connection to the same device is left alone.
    pub fn handle_disconnect_epoch(
        &self,
        device: &DeviceId,
        epoch: u64,
        reason: DisconnectReason,
    ) -> bool {
        let removed = self.registry.remove_if_epoch(device, epoch);
        self.finish(device, removed, reason)
    }

    /// Drops a connection that never became ready. Nobody is told, since
    /// nobody saw it connect.
    pub fn discard_epoch(&self, device: &DeviceId, epoch: u64) -> bool {
        let Some(state) = self.registry.remove_if_epoch(device, epoch) else {
            return false;
        };
        debug!("Discarded {:?} entry for {}", state.status, device);
        self.router.clear(device);
        self.tracker.rearm(device);
        true
    }

    fn finish(
        &self,
        device: &DeviceId,
        removed: Option<ConnectionState>,
        reason: DisconnectReason,
    ) -> bool {
        let Some(state) = removed else {
            debug!("Disconnect of {} ({:?}) already handled", device, reason);
            return false;
        };

        info!(
            "Device {} disconnected ({:?}), was {:?} with {} subscription(s)",
            device,
            reason,
            state.status,
            state.subscribed.len()
        );
        self.router.clear(device);
        self.tracker.rearm(device);

        self.disconnect_listeners.emit(&DisconnectEvent {
            device: device.clone(),
            reason,
        });
        self.device_list.emit(&DeviceListChange::Disconnected {
            id: device.clone(),
            reason,
        });
        true
    }
}
