//! Entry points used by the agent's clients (web UI bridge, updater, CLI).
//!
//! Errors are flattened to strings for transport.

use std::path::PathBuf;
use std::time::Duration;

use crate::device::{DeviceManager, DeviceSummary};
use crate::serial::protocol;
use crate::update;

/// List devices that can be claimed
pub async fn enumerate_devices(device_manager: &DeviceManager) -> Result<Vec<String>, String> {
    device_manager
        .list_available_devices()
        .await
        .map_err(|e| format!("Failed to enumerate devices: {}", e))
}

/// Make a device the active device
pub async fn set_active_device(device_manager: &DeviceManager, device_name: String) -> Result<(), String> {
    device_manager
        .claim(&device_name)
        .await
        .map_err(|e| format!("Failed to set active device: {}", e))
}

pub async fn release_active_device(device_manager: &DeviceManager) -> Result<(), String> {
    device_manager.release().await;
    Ok(())
}

pub async fn get_active_device(device_manager: &DeviceManager) -> Result<Option<DeviceSummary>, String> {
    Ok(device_manager.active_device().await)
}

/// Send a text frame to the active device and return its reply
pub async fn write_read(
    device_manager: &DeviceManager,
    frame: String,
    timeout_ms: Option<u64>,
) -> Result<String, String> {
    let reply = device_manager
        .write_read(&protocol::text_frame(&frame), timeout_ms.map(Duration::from_millis))
        .await
        .map_err(|e| format!("Request failed: {}", e))?;
    Ok(String::from_utf8_lossy(&reply).into_owned())
}

/// Flash a firmware image onto the active device
pub async fn update_firmware(
    device_manager: &DeviceManager,
    hex_path: String,
    enter_bootloader: bool,
) -> Result<(), String> {
    device_manager
        .update_firmware(&PathBuf::from(hex_path), enter_bootloader)
        .await
        .map_err(|e| format!("Firmware update failed: {}", e))
}

/// Check a firmware image against an expected SHA-256 digest
pub async fn verify_firmware_image(file_path: String, expected_hash: Option<String>) -> Result<bool, String> {
    update::verify_firmware(&PathBuf::from(file_path), expected_hash.as_deref())
        .await
        .map_err(|e| format!("Failed to verify firmware: {}", e))
}

pub fn get_version() -> String {
    crate::agent_version().to_string()
}
