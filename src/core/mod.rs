//! Core functionality for the light hub

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{DeviceId, LightMode, SessionManager};
