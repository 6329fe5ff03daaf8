pub mod manager;
pub mod models;

pub use manager::DeviceManager;
pub use models::*;

use crate::serial::SerialError;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device {0} is not available")]
    NotAvailable(String),

    #[error("Device {name} was released: {reason}")]
    Stale { name: String, reason: String },

    #[error("Failed to open {name}: {source}")]
    OpenFailed {
        name: String,
        #[source]
        source: SerialError,
    },

    #[error("Device not connected")]
    NotConnected,

    #[error("Serial communication error: {0}")]
    SerialError(#[from] SerialError),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
