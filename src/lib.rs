//! BLE light hub library
//! Concurrent session management for BLE light peripherals that share one
//! GATT profile.

// Module declarations
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod utils;
