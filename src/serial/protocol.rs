use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Result, SerialError};

/// Every frame sent to the device ends with this
pub const LINE_ENDING: &str = "\r\n";

#[derive(Debug, Serialize)]
struct ModeRequest<'a> {
    mode: &'a str,
}

#[derive(Debug, Serialize)]
struct DeviceRequest<'a> {
    device: [DeviceCommand<'a>; 1],
}

#[derive(Debug, Serialize)]
struct DeviceCommand<'a> {
    command: &'a str,
}

/// Reply to an enter-bootloader request.
///
/// Only the wait time of the first entry matters here; anything else the
/// device includes is ignored.
#[derive(Debug, Deserialize)]
pub struct BootloaderReply {
    pub device: Vec<BootloaderEntry>,
}

#[derive(Debug, Deserialize)]
pub struct BootloaderEntry {
    pub wait: u64,
}

fn frame<T: Serialize>(request: &T) -> Vec<u8> {
    // Plain structs of string fields always serialize
    let mut bytes = serde_json::to_vec(request).unwrap_or_default();
    bytes.extend_from_slice(LINE_ENDING.as_bytes());
    bytes
}

fn device_command(command: &str) -> Vec<u8> {
    frame(&DeviceRequest {
        device: [DeviceCommand { command }],
    })
}

/// Switches the device into JSON request/response mode
pub fn mode_switch_frame() -> Vec<u8> {
    frame(&ModeRequest { mode: "JSON" })
}

/// Liveness probe
pub fn soft_reset_frame() -> Vec<u8> {
    device_command("softReset")
}

pub fn enter_bootloader_frame() -> Vec<u8> {
    device_command("enterBootloader")
}

/// Terminate a caller-supplied text frame, leaving already terminated frames alone
pub fn text_frame(text: &str) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    if !text.ends_with('\n') {
        bytes.extend_from_slice(LINE_ENDING.as_bytes());
    }
    bytes
}

/// Extract how long the device needs to settle into its bootloader
pub fn parse_bootloader_wait(reply: &[u8]) -> Result<Duration> {
    let reply: BootloaderReply = serde_json::from_slice(reply)?;
    let entry = reply
        .device
        .first()
        .ok_or_else(|| SerialError::ProtocolError("Bootloader reply has no device entry".to_string()))?;
    Ok(Duration::from_millis(entry.wait))
}
