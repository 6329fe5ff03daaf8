use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::{DeviceError, DeviceKind};

/// Where a firmware update currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdatePhase {
    Idle,
    BootloaderEntryRequested,
    AwaitingBootloaderWindow,
    Released,
    ExternalProgramRunning,
    Reclaiming,
    Done,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("No active device")]
    NoActiveDevice,

    #[error("Firmware updates are not supported for {0} devices")]
    Unsupported(DeviceKind),

    #[error("Firmware image not found: {}", .0.display())]
    ImageNotFound(PathBuf),

    #[error("Bootloader handshake failed: {0}")]
    BootloaderHandshake(String),

    #[error("Programming firmware on {port} failed")]
    ProgrammingFailed { port: String },

    #[error("Firmware written but {port} could not be claimed again: {source}")]
    ReclaimFailed {
        port: String,
        #[source]
        source: DeviceError,
    },

    #[error("Invalid firmware signature")]
    InvalidSignature,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type UpdateResult<T> = Result<T, UpdateError>;
