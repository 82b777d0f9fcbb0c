//! Constants used throughout the session layer
//! This module contains the constant values shared by the session components,
//! such as UUIDs, liveness timings, and transport error codes.

use uuid::Uuid;

/// Default advertised-name pattern for supported light peripherals
pub const DEFAULT_NAME_PATTERN: &str = "^632";

/// Default RSSI (dBm) an armed sighting must reach to be auto-connected
pub const DEFAULT_AUTO_CONNECT_THRESHOLD_DBM: i16 = -80;

/// The UUID of the light controller service (16-bit 0xFFF0 family)
pub const UUID_LIGHT_SERVICE: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);

/// The UUID of the light notification characteristic
pub const UUID_LIGHT_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x0000fff4_0000_1000_8000_00805f9b34fb);

/// The UUID of the light write characteristic
pub const UUID_LIGHT_WRITE_CHAR: Uuid = Uuid::from_u128(0x0000fff3_0000_1000_8000_00805f9b34fb);

/// Alternate vendor profile used by older firmware (0xFFE0 / 0xFFE1)
pub const UUID_LIGHT_SERVICE_ALT: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
pub const UUID_LIGHT_NOTIFY_CHAR_ALT: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Period of the advertisement age-out loop in milliseconds
pub const PRESENCE_INTERVAL_MS: u64 = 2000;

/// Period of the connected-device probe loop in milliseconds
pub const PROBE_INTERVAL_MS: u64 = 2000;

/// A device not seen for longer than this is counted as missed for the cycle
pub const STABILITY_WINDOW_MS: u64 = 2000;

/// Consecutive missed cycles before an unconnected device is evicted
pub const MISS_THRESHOLD: u32 = 3;

/// Delay between two steps of the mode loop in milliseconds
pub const MODE_CYCLE_INTERVAL_MS: u64 = 3000;

/// Mini-program style transport error codes
pub const ERR_CODE_ADAPTER_UNAVAILABLE: i32 = 10001;
pub const ERR_CODE_CONNECTION_FAILED: i32 = 10003;
pub const ERR_CODE_NO_SERVICE: i32 = 10004;
pub const ERR_CODE_NO_CHARACTERISTIC: i32 = 10005;
pub const ERR_CODE_NO_CONNECTION: i32 = 10006;
pub const ERR_CODE_OPERATION_TIMEOUT: i32 = 10012;
/// Catch-all code for platform failures with no finer classification
pub const ERR_CODE_SYSTEM_ERROR: i32 = 10008;
