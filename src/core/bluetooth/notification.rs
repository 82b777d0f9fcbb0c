//! Notification handling for connected devices
//! Routes characteristic value changes to exactly one consumer per event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::mpsc;

use crate::core::bluetooth::registry::ConnectionRegistry;
use crate::core::bluetooth::types::{DeviceId, Notification};
use crate::utils::lock;

type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Default)]
struct RouterState {
    /// Per-device consumers, preferred over the session-wide handler
    routes: HashMap<DeviceId, mpsc::UnboundedSender<Notification>>,
    handler: Option<NotificationHandler>,
    last_hex: HashMap<DeviceId, String>,
}

enum Consumer {
    Route(mpsc::UnboundedSender<Notification>),
    Handler(NotificationHandler),
}

/// Dispatches value-changed events. Does not coordinate with writes.
///
/// Lock order is router, then registry.
#[derive(Clone)]
pub struct NotificationRouter {
    state: Arc<Mutex<RouterState>>,
    registry: ConnectionRegistry,
}

impl NotificationRouter {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            state: Arc::default(),
            registry,
        }
    }

    /// Sets the session-wide consumer, replacing any previous one.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        lock(&self.state).handler = Some(Arc::new(handler));
    }

    /// Routes the device's notifications to a dedicated receiver.
    pub fn route(&self, device: &DeviceId) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state).routes.insert(device.clone(), tx);
        rx
    }

    /// Delivers one value change. Returns false if nobody consumed it.
    pub fn dispatch(&self, device: &DeviceId, payload: Vec<u8>) -> bool {
        let notification = Notification {
            device: device.clone(),
            hex: hex::encode(&payload),
            payload,
        };
        debug!("Received data from {}: {}", device, notification.hex);

        let consumer = {
            let mut state = lock(&self.state);
            // Late events from a torn-down link must not repopulate the cache.
            if self.registry.contains(device) {
                state
                    .last_hex
                    .insert(device.clone(), notification.hex.clone());
            }
            match state.routes.get(device) {
                Some(tx) if !tx.is_closed() => Some(Consumer::Route(tx.clone())),
                Some(_) => {
                    state.routes.remove(device);
                    state.handler.clone().map(Consumer::Handler)
                }
                None => state.handler.clone().map(Consumer::Handler),
            }
        };

        match consumer {
            Some(Consumer::Route(tx)) => tx.send(notification).is_ok(),
            Some(Consumer::Handler(handler)) => {
                handler(&notification);
                true
            }
            None => {
                debug!("No consumer for notification from {}", device);
                false
            }
        }
    }

    /// Last payload seen from the device, as hex
    pub fn last_notification(&self, device: &DeviceId) -> Option<String> {
        lock(&self.state).last_hex.get(device).cloned()
    }

    /// Forgets cached state and the dedicated route for a device.
    pub fn clear(&self, device: &DeviceId) {
        let mut state = lock(&self.state);
        state.routes.remove(device);
        state.last_hex.remove(device);
    }
}
