//! Boundary to the platform BLE stack
//! The session layer only talks to the radio through [`BleTransport`]. Error
//! codes from the platform are folded into two classes by [`classify`].

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    ERR_CODE_ADAPTER_UNAVAILABLE, ERR_CODE_CONNECTION_FAILED, ERR_CODE_NO_CHARACTERISTIC,
    ERR_CODE_NO_CONNECTION, ERR_CODE_NO_SERVICE, ERR_CODE_OPERATION_TIMEOUT,
};
use crate::core::bluetooth::types::{
    CharDescriptor, CharacteristicRef, DeviceId, RawAdvertisement, ServiceDescriptor,
};

/// What went wrong inside the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    AdapterUnavailable,
    ConnectionFailed,
    NoConnection,
    OperationTimeout,
    NoService,
    /// The service exposes no characteristics. Callers treat this as empty.
    NoCharacteristics,
    NotFound,
    Other(i32),
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdapterUnavailable => f.write_str("adapter unavailable"),
            Self::ConnectionFailed => f.write_str("connection failed"),
            Self::NoConnection => f.write_str("no connection"),
            Self::OperationTimeout => f.write_str("operation timed out"),
            Self::NoService => f.write_str("service not found"),
            Self::NoCharacteristics => f.write_str("no characteristics"),
            Self::NotFound => f.write_str("not found"),
            Self::Other(code) => write!(f, "transport error {}", code),
        }
    }
}

/// A failure reported by the transport, with its original detail preserved
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub detail: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Maps a numeric platform error code onto a [`TransportErrorKind`].
    pub fn from_code(code: i32, detail: impl Into<String>) -> Self {
        let kind = match code {
            ERR_CODE_ADAPTER_UNAVAILABLE => TransportErrorKind::AdapterUnavailable,
            ERR_CODE_CONNECTION_FAILED => TransportErrorKind::ConnectionFailed,
            ERR_CODE_NO_SERVICE => TransportErrorKind::NoService,
            ERR_CODE_NO_CHARACTERISTIC => TransportErrorKind::NoCharacteristics,
            ERR_CODE_NO_CONNECTION => TransportErrorKind::NoConnection,
            ERR_CODE_OPERATION_TIMEOUT => TransportErrorKind::OperationTimeout,
            other => TransportErrorKind::Other(other),
        };
        Self::new(kind, detail)
    }
}

/// The two categories session logic decides on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The device must be considered disconnected
    LinkLost,
    /// The operation failed but the link is presumed alive
    Transport,
}

/// The single mapping from transport vocabulary to session decisions.
pub fn classify(error: &TransportError) -> FailureClass {
    match error.kind {
        TransportErrorKind::NoConnection
        | TransportErrorKind::OperationTimeout
        | TransportErrorKind::ConnectionFailed => FailureClass::LinkLost,
        _ => FailureClass::Transport,
    }
}

/// Events the transport pushes without being asked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Advertisements(Vec<RawAdvertisement>),
    /// The platform reported a link down on its own (not always delivered)
    Disconnected(DeviceId),
    ValueChanged { device: DeviceId, payload: Vec<u8> },
}

/// Platform BLE operations consumed by the session layer.
///
/// Every async method suspends the caller until the platform answers.
#[async_trait]
pub trait BleTransport: Send + Sync {
    async fn open_adapter(&self) -> Result<(), TransportError>;

    async fn start_discovery(&self, allow_duplicates: bool) -> Result<(), TransportError>;

    async fn stop_discovery(&self) -> Result<(), TransportError>;

    /// Registers the sink for advertisements, unsolicited disconnects and
    /// value changes. Sending must never block the event source.
    fn attach_events(&self, events: mpsc::UnboundedSender<TransportEvent>);

    async fn connect(&self, device: &DeviceId) -> Result<(), TransportError>;

    async fn disconnect(&self, device: &DeviceId) -> Result<(), TransportError>;

    async fn list_services(&self, device: &DeviceId) -> Result<Vec<ServiceDescriptor>, TransportError>;

    /// May fail with [`TransportErrorKind::NoCharacteristics`] when the
    /// service exposes none.
    async fn list_characteristics(
        &self,
        device: &DeviceId,
        service: Uuid,
    ) -> Result<Vec<CharDescriptor>, TransportError>;

    async fn write_characteristic(
        &self,
        device: &DeviceId,
        target: CharacteristicRef,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    async fn subscribe(&self, device: &DeviceId, target: CharacteristicRef) -> Result<(), TransportError>;

    async fn read_signal_strength(&self, device: &DeviceId) -> Result<i16, TransportError>;
}

/// Lists a service's characteristics, reporting "none" as an empty list.
pub async fn characteristics_or_empty(
    transport: &dyn BleTransport,
    device: &DeviceId,
    service: Uuid,
) -> Result<Vec<CharDescriptor>, TransportError> {
    match transport.list_characteristics(device, service).await {
        Err(e) if e.kind == TransportErrorKind::NoCharacteristics => Ok(Vec::new()),
        other => other,
    }
}
