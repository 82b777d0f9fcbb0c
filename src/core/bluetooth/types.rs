//! Defines shared data structures for the Bluetooth module.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// Opaque peripheral handle assigned by the transport.
///
/// Stable for the lifetime of a discovery or connection, not across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One advertisement as reported by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAdvertisement {
    pub id: DeviceId,
    /// The advertised local name, if any
    pub name: Option<String>,
    /// The signal strength (RSSI) in dBm
    pub rssi: i16,
}

impl RawAdvertisement {
    pub fn new(id: impl Into<DeviceId>, name: Option<&str>, rssi: i16) -> Self {
        Self {
            id: id.into(),
            name: name.map(str::to_string),
            rssi,
        }
    }
}

/// Liveness bookkeeping for a device seen through advertisements.
#[derive(Debug, Clone)]
pub struct AdvertisementRecord {
    pub id: DeviceId,
    pub name: Option<String>,
    pub rssi: i16,
    pub last_seen: Instant,
    /// Liveness cycles in a row without a fresh sighting
    pub miss_streak: u32,
    /// Whether the next qualifying sighting may trigger an auto-connect
    pub(crate) connect_armed: bool,
}

impl AdvertisementRecord {
    pub(crate) fn first_sighting(adv: &RawAdvertisement, now: Instant) -> Self {
        Self {
            id: adv.id.clone(),
            name: adv.name.clone(),
            rssi: adv.rssi,
            last_seen: now,
            miss_streak: 0,
            connect_armed: true,
        }
    }

    /// Refreshes signal strength and resets the miss streak together.
    pub(crate) fn sighted(&mut self, adv: &RawAdvertisement, now: Instant) {
        if adv.name.is_some() {
            self.name = adv.name.clone();
        }
        self.rssi = adv.rssi;
        self.last_seen = now;
        self.miss_streak = 0;
    }

    pub fn summary(&self, is_connected: bool) -> DeviceSummary {
        DeviceSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            rssi: Some(self.rssi),
            is_connected,
        }
    }
}

/// Represents a device as shown to device-list consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    /// Platform-specific unique identifier for the device
    pub id: DeviceId,
    /// The name of the device, if available
    pub name: Option<String>,
    /// The last known signal strength (RSSI) of the device
    pub rssi: Option<i16>,
    /// Whether the device is connected
    pub is_connected: bool,
}

/// Per-device connection lifecycle. A disconnected device has no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    Connecting,
    Ready,
    Disconnecting,
}

/// Why a connection was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisconnectReason {
    /// `disconnect` was called
    Manual,
    /// A write failed with a link-lost classification
    LinkLost,
    /// A liveness probe failed
    ProbeFailed,
    /// The transport reported the link down on its own
    Remote,
}

/// Published exactly once per torn-down connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisconnectEvent {
    pub device: DeviceId,
    pub reason: DisconnectReason,
}

/// Changes published to device-list consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum DeviceListChange {
    Discovered(DeviceSummary),
    Updated(DeviceSummary),
    Connected(DeviceSummary),
    Disconnected { id: DeviceId, reason: DisconnectReason },
    Evicted(DeviceId),
}

/// Addresses one characteristic within one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

/// A queued characteristic write. Immutable once enqueued.
#[derive(Debug, Clone)]
pub struct WriteTask {
    pub target: CharacteristicRef,
    pub payload: Vec<u8>,
    pub enqueued_at: Instant,
}

impl WriteTask {
    pub fn new(service: Uuid, characteristic: Uuid, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            target: CharacteristicRef {
                service,
                characteristic,
            },
            payload: payload.into(),
            enqueued_at: Instant::now(),
        }
    }
}

/// A characteristic value pushed by a connected device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub device: DeviceId,
    pub payload: Vec<u8>,
    /// Lowercase hex rendering of `payload`
    pub hex: String,
}

/// A GATT service exposed by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
}

/// A GATT characteristic exposed by a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharDescriptor {
    pub service: Uuid,
    pub uuid: Uuid,
}
