use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    DEFAULT_AUTO_CONNECT_THRESHOLD_DBM, DEFAULT_NAME_PATTERN, MISS_THRESHOLD,
    MODE_CYCLE_INTERVAL_MS, PRESENCE_INTERVAL_MS, PROBE_INTERVAL_MS, STABILITY_WINDOW_MS,
    UUID_LIGHT_NOTIFY_CHAR, UUID_LIGHT_NOTIFY_CHAR_ALT, UUID_LIGHT_SERVICE,
    UUID_LIGHT_SERVICE_ALT, UUID_LIGHT_WRITE_CHAR,
};
use crate::core::bluetooth::tracker::{AutoConnectPolicy, NameFilter};
use crate::core::bluetooth::types::CharacteristicRef;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Regex an advertised name must match for the device to be tracked.
    pub name_pattern: String,

    /// Connect automatically to tracked devices with a strong enough signal.
    pub auto_connect: bool,

    /// Minimum RSSI (dBm) for auto-connect.
    pub auto_connect_threshold_dbm: i16,

    pub presence_interval_ms: u64,
    pub probe_interval_ms: u64,

    /// A device unseen for longer than this misses the current cycle.
    pub stability_window_ms: u64,

    /// Missed cycles before an unconnected device is dropped.
    pub miss_threshold: u32,

    pub mode_cycle_interval_ms: u64,

    /// Services searched, in order, for a notify characteristic after connect.
    pub profile_service_uuids: Vec<Uuid>,
    pub notify_char_uuids: Vec<Uuid>,

    /// Where light mode commands are written.
    pub light_service_uuid: Uuid,
    pub light_write_char_uuid: Uuid,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            name_pattern: DEFAULT_NAME_PATTERN.to_string(),
            auto_connect: false,
            auto_connect_threshold_dbm: DEFAULT_AUTO_CONNECT_THRESHOLD_DBM,
            presence_interval_ms: PRESENCE_INTERVAL_MS,
            probe_interval_ms: PROBE_INTERVAL_MS,
            stability_window_ms: STABILITY_WINDOW_MS,
            miss_threshold: MISS_THRESHOLD,
            mode_cycle_interval_ms: MODE_CYCLE_INTERVAL_MS,
            profile_service_uuids: vec![UUID_LIGHT_SERVICE, UUID_LIGHT_SERVICE_ALT],
            notify_char_uuids: vec![UUID_LIGHT_NOTIFY_CHAR, UUID_LIGHT_NOTIFY_CHAR_ALT],
            light_service_uuid: UUID_LIGHT_SERVICE,
            light_write_char_uuid: UUID_LIGHT_WRITE_CHAR,
        }
    }
}

impl SessionConfig {
    pub fn name_filter(&self) -> Result<NameFilter, regex::Error> {
        NameFilter::new(&self.name_pattern)
    }

    pub fn auto_connect_policy(&self) -> AutoConnectPolicy {
        AutoConnectPolicy {
            enabled: self.auto_connect,
            threshold_dbm: self.auto_connect_threshold_dbm,
        }
    }

    pub fn write_target(&self) -> CharacteristicRef {
        CharacteristicRef {
            service: self.light_service_uuid,
            characteristic: self.light_write_char_uuid,
        }
    }

    pub fn presence_interval(&self) -> Duration {
        Duration::from_millis(self.presence_interval_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms)
    }

    pub fn mode_cycle_interval(&self) -> Duration {
        Duration::from_millis(self.mode_cycle_interval_ms)
    }
}
