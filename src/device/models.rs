use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::serial::{protocol, LineOpener, SerialDevice};
use super::Result;

/// How a device is attached to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DeviceKind {
    Uart,
}

impl DeviceKind {
    pub fn supports_firmware_update(&self) -> bool {
        matches!(self, DeviceKind::Uart)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Uart => write!(f, "UART"),
        }
    }
}

/// Snapshot of the claimed device handed to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub name: String,
    pub kind: DeviceKind,
    pub open: bool,
}

/// The device currently claimed by the agent, together with its session
pub struct ActiveDevice {
    name: String,
    kind: DeviceKind,
    session: SerialDevice,
}

impl ActiveDevice {
    /// Open a session on `name`; nothing is claimed if the port cannot be opened
    pub fn open(name: &str, opener: Arc<dyn LineOpener>, quiescence: Duration) -> Result<Self> {
        let session = SerialDevice::open(name, opener, quiescence).map_err(|source| {
            super::DeviceError::OpenFailed {
                name: name.to_string(),
                source,
            }
        })?;

        Ok(Self {
            name: name.to_string(),
            kind: DeviceKind::Uart,
            session,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            name: self.name.clone(),
            kind: self.kind,
            open: self.is_open(),
        }
    }

    /// Put the device into JSON mode.
    ///
    /// Returns once the frame is staged; the next request on this device
    /// goes out only after it has been written.
    pub async fn enter_json_mode(&mut self, timeout: Duration) {
        self.session.submit(&protocol::mode_switch_frame(), timeout).await;
    }

    /// Soft reset the device to confirm it still answers us
    pub async fn probe(&mut self, timeout: Duration) -> Result<()> {
        let reply = self.session.write_read(&protocol::soft_reset_frame(), timeout).await?;
        log::debug!("{} answered soft reset with {} bytes", self.name, reply.len());
        Ok(())
    }

    pub async fn write_read(&mut self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        Ok(self.session.write_read(payload, timeout).await?)
    }

    /// Shut the session down, waiting for the worker thread to exit
    pub async fn close(self) {
        let name = self.name;
        let session = self.session;
        if tokio::task::spawn_blocking(move || drop(session)).await.is_err() {
            log::error!("Session teardown for {} panicked", name);
        }
    }
}
