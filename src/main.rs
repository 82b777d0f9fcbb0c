use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use ble_light_hub_lib::config::{AppConfig, CONFIG_FILE_NAME};
use ble_light_hub_lib::core::bluetooth::{
    BluestTransport, DeviceListChange, LightMode, SessionManager,
};
use ble_light_hub_lib::logging;

/// Usage: `ble-light-hub [config.json] [mode]`
///
/// Without a mode the hub cycles through the light modes on every connected
/// device; with one, every device is held on that mode.
#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    let fixed_mode = args
        .next()
        .map(|key| key.parse::<LightMode>())
        .transpose()?;

    let config = AppConfig::load_config(&config_path).await?;
    logging::init(logging::parse_level(&config.log_level));
    info!("Using config from {:?}", config_path);

    let manager = SessionManager::new(Arc::new(BluestTransport::new()), config.session.clone())?;
    manager.on_device_list_changed(|change| match change {
        DeviceListChange::Discovered(device) => {
            info!("Discovered {} ({:?}) at {:?} dBm", device.id, device.name, device.rssi)
        }
        DeviceListChange::Connected(device) => info!("Connected {}", device.id),
        DeviceListChange::Disconnected { id, reason } => info!("Lost {} ({:?})", id, reason),
        DeviceListChange::Evicted(id) => info!("{} went out of range", id),
        DeviceListChange::Updated(_) => {}
    });
    manager.on_notification(|notification| {
        info!("Notification from {}: {}", notification.device, notification.hex)
    });

    manager.start().await.context("Failed to start BLE session")?;
    if config.session.auto_connect {
        manager.enable_auto_mode().await;
    }
    match fixed_mode {
        Some(mode) => {
            manager.apply_mode_to_connected(mode).await;
        }
        None => manager.start_loop().await,
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    manager.shutdown().await;
    manager.disconnect_all().await;
    Ok(())
}
