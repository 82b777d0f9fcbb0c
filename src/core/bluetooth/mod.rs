//! Bluetooth functionality for the light hub
//! This module handles all bluetooth operations including discovery,
//! connection lifecycle, liveness, notifications and serialized writes.

pub mod bluest_transport;
pub mod commands;
pub mod constants;
mod disconnect;
#[cfg(test)]
pub(crate) mod fake;
pub mod listeners;
pub mod manager;
mod notification;
pub mod registry;
mod serializer;
mod supervisor;
pub mod tracker;
pub mod transport;
pub mod types;

// Re-export types that should be publicly accessible
pub use bluest_transport::BluestTransport;
pub use commands::{CommandExecutor, CommandSender, LightMode, MODE_CYCLE, encode};
pub use manager::SessionManager;
pub use registry::ConnectionState;
pub use tracker::AutoConnectPolicy;
pub use transport::{BleTransport, FailureClass, TransportError, TransportErrorKind, TransportEvent, classify};
pub use types::{
    CharacteristicRef, ConnectionStatus, DeviceId, DeviceListChange, DeviceSummary,
    DisconnectEvent, DisconnectReason, Notification, RawAdvertisement,
};
