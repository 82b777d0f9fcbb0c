//! Light peripheral commands
//! This module contains the mode table for the light peripherals and the
//! executor that fans a mode out to many devices.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::registry::ConnectionRegistry;
use crate::core::bluetooth::serializer::WriteSerializer;
use crate::core::bluetooth::types::{CharacteristicRef, DeviceId, WriteTask};
use crate::error::WriteError;
use crate::utils::lock;

/// Light modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LightMode {
    Off,
    /// Solid color
    Static,
    Breathe,
    Rainbow,
    Strobe,
    Fade,
}

struct ModeEntry {
    mode: LightMode,
    key: &'static str,
    bytes: &'static [u8],
}

/// Frame: 0x7E, length, opcode, payload..., 0xEF
const MODE_TABLE: [ModeEntry; 6] = [
    ModeEntry {
        mode: LightMode::Off,
        key: "off",
        bytes: &[0x7E, 0x04, 0x04, 0x00, 0x00, 0x00, 0xFF, 0x00, 0xEF],
    },
    ModeEntry {
        mode: LightMode::Static,
        key: "static",
        bytes: &[0x7E, 0x07, 0x05, 0x03, 0xFF, 0x00, 0x00, 0x10, 0xEF],
    },
    ModeEntry {
        mode: LightMode::Breathe,
        key: "breathe",
        bytes: &[0x7E, 0x05, 0x03, 0x8A, 0x03, 0xFF, 0xFF, 0x00, 0xEF],
    },
    ModeEntry {
        mode: LightMode::Rainbow,
        key: "rainbow",
        bytes: &[0x7E, 0x05, 0x03, 0x87, 0x03, 0xFF, 0xFF, 0x00, 0xEF],
    },
    ModeEntry {
        mode: LightMode::Strobe,
        key: "strobe",
        bytes: &[0x7E, 0x05, 0x03, 0x96, 0x03, 0xFF, 0xFF, 0x00, 0xEF],
    },
    ModeEntry {
        mode: LightMode::Fade,
        key: "fade",
        bytes: &[0x7E, 0x05, 0x03, 0x88, 0x03, 0xFF, 0xFF, 0x00, 0xEF],
    },
];

/// Order the mode loop walks through
pub const MODE_CYCLE: [LightMode; 4] = [
    LightMode::Static,
    LightMode::Breathe,
    LightMode::Rainbow,
    LightMode::Strobe,
];

impl LightMode {
    fn entry(&self) -> &'static ModeEntry {
        // Every variant has exactly one row.
        let index = MODE_TABLE
            .iter()
            .position(|entry| entry.mode == *self)
            .unwrap_or_default();
        &MODE_TABLE[index]
    }

    pub fn key(&self) -> &'static str {
        self.entry().key
    }

    /// Convert the mode to its byte representation
    pub fn to_bytes(&self) -> Vec<u8> {
        self.entry().bytes.to_vec()
    }
}

impl fmt::Display for LightMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown light mode: {0}")]
pub struct UnknownMode(pub String);

impl FromStr for LightMode {
    type Err = UnknownMode;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        MODE_TABLE
            .iter()
            .find(|entry| entry.key.eq_ignore_ascii_case(key))
            .map(|entry| entry.mode)
            .ok_or_else(|| UnknownMode(key.to_string()))
    }
}

/// Static lookup from mode to its opaque command bytes.
pub fn encode(mode: LightMode) -> Vec<u8> {
    mode.to_bytes()
}

/// Walks [`MODE_CYCLE`] forever
#[derive(Debug, Default)]
pub struct ModeCycle {
    position: usize,
}

impl ModeCycle {
    pub fn next_mode(&mut self) -> LightMode {
        let mode = MODE_CYCLE[self.position % MODE_CYCLE.len()];
        self.position = (self.position + 1) % MODE_CYCLE.len();
        mode
    }
}

/// Command sender trait
#[async_trait::async_trait]
pub trait CommandSender: Send + Sync {
    /// Send a mode command to one device
    async fn send_command(&self, device: &DeviceId, mode: LightMode) -> Result<(), WriteError>;
}

/// Sends commands through the per-device write queues
#[derive(Clone)]
pub struct LightWriter {
    serializer: WriteSerializer,
    target: CharacteristicRef,
}

impl LightWriter {
    pub fn new(serializer: WriteSerializer, target: CharacteristicRef) -> Self {
        Self { serializer, target }
    }
}

#[async_trait::async_trait]
impl CommandSender for LightWriter {
    async fn send_command(&self, device: &DeviceId, mode: LightMode) -> Result<(), WriteError> {
        debug!("Sending {} to {}", mode, device);
        let task = WriteTask::new(self.target.service, self.target.characteristic, mode.to_bytes());
        self.serializer.enqueue(device, task).await
    }
}

/// Command executor for the light peripherals
pub struct CommandExecutor<T: CommandSender> {
    command_sender: T,
    active_mode: Arc<Mutex<Option<LightMode>>>,
}

impl<T: CommandSender + Clone> Clone for CommandExecutor<T> {
    fn clone(&self) -> Self {
        Self {
            command_sender: self.command_sender.clone(),
            active_mode: self.active_mode.clone(),
        }
    }
}

impl<T: CommandSender> CommandExecutor<T> {
    /// Create a new CommandExecutor
    pub fn new(command_sender: T) -> Self {
        Self {
            command_sender,
            active_mode: Arc::new(Mutex::new(None)),
        }
    }

    /// The mode most recently applied, if any
    pub fn active_mode(&self) -> Option<LightMode> {
        *lock(&self.active_mode)
    }

    pub async fn send_mode(&self, device: &DeviceId, mode: LightMode) -> Result<(), WriteError> {
        self.command_sender.send_command(device, mode).await
    }

    /// Writes `mode` to every target concurrently and waits for all of them.
    /// Individual failures are reported per device and never abort the rest.
    pub async fn apply_mode(
        &self,
        mode: LightMode,
        targets: &[DeviceId],
    ) -> Vec<(DeviceId, Result<(), WriteError>)> {
        *lock(&self.active_mode) = Some(mode);
        info!("Applying mode {} to {} device(s)", mode, targets.len());

        let sends = targets.iter().map(|device| async move {
            (device.clone(), self.command_sender.send_command(device, mode).await)
        });
        let results = join_all(sends).await;

        for (device, result) in &results {
            if let Err(e) = result {
                warn!("Mode {} not applied to {}: {}", mode, device, e);
            }
        }
        results
    }
}

impl<T: CommandSender + Clone + 'static> CommandExecutor<T> {
    /// Start cycling through [`MODE_CYCLE`], reapplying each mode to every
    /// ready device in `registry`.
    pub fn start_mode_loop(&self, registry: ConnectionRegistry, interval: Duration) -> ModeLoop {
        let executor = self.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut cycle = ModeCycle::default();
            loop {
                let mode = cycle.next_mode();
                let targets = registry.ready_ids();
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = executor.apply_mode(mode, &targets) => {}
                }
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("Mode loop stopped");
        });

        info!("Mode loop started with interval of {:?}", interval);
        ModeLoop { cancel, handle }
    }
}

/// Handle to a running mode loop
pub struct ModeLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ModeLoop {
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Mode loop ended abnormally: {}", e);
        }
    }
}
