//! Error taxonomy for the session layer

use thiserror::Error;

use crate::core::bluetooth::transport::TransportError;
use crate::core::bluetooth::types::DeviceId;

/// The adapter could not be opened or discovery could not start.
/// Fatal to discovery, never retried.
#[derive(Debug, Clone, Error)]
#[error("bluetooth adapter error: {0}")]
pub struct AdapterError(#[from] pub TransportError);

/// A connect or disconnect attempt failed. Not retried automatically.
#[derive(Debug, Clone, Error)]
pub enum ConnError {
    #[error("failed to connect to {device}: {source}")]
    Connect {
        device: DeviceId,
        #[source]
        source: TransportError,
    },
    #[error("failed to disconnect from {device}: {source}")]
    Disconnect {
        device: DeviceId,
        #[source]
        source: TransportError,
    },
    #[error("connection to {0} was torn down before it became ready")]
    Aborted(DeviceId),
}

/// The outcome of one queued write that did not succeed
#[derive(Debug, Clone, Error)]
pub enum WriteError {
    /// The failure code means the link is gone; the device was disconnected
    #[error("link to {device} lost: {source}")]
    LinkLost {
        device: DeviceId,
        #[source]
        source: TransportError,
    },
    /// Any other transport failure; the device stays connected
    #[error("write to {device} failed: {source}")]
    Transport {
        device: DeviceId,
        #[source]
        source: TransportError,
    },
    #[error("device {0} is not connected")]
    NotConnected(DeviceId),
    #[error("write queue for {0} closed before the write resolved")]
    QueueClosed(DeviceId),
}

impl WriteError {
    pub fn device(&self) -> &DeviceId {
        match self {
            Self::LinkLost { device, .. } | Self::Transport { device, .. } => device,
            Self::NotConnected(device) | Self::QueueClosed(device) => device,
        }
    }

    pub fn is_link_lost(&self) -> bool {
        matches!(self, Self::LinkLost { .. })
    }
}

/// Umbrella error for session manager calls
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Conn(#[from] ConnError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("invalid device name pattern: {0}")]
    NamePattern(#[from] regex::Error),
    #[error("session manager is already running")]
    AlreadyStarted,
}
