pub mod interface;
pub mod protocol;
pub mod session;

pub use interface::{
    LineOpener, PortEnumerator, SerialDevice, SerialLine, SystemPortEnumerator, SystemSerialOpener,
};
pub use session::{SessionEvent, SessionOutcome, SessionWorker};

use serde::{Deserialize, Serialize};

/// A candidate port as reported by the enumeration source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub port_name: String,
    pub busy: bool,
}

impl PortInfo {
    pub fn new(port_name: impl Into<String>, busy: bool) -> Self {
        Self {
            port_name: port_name.into(),
            busy,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Can't open {port}: {reason}")]
    OpenFailed { port: String, reason: String },

    #[error("Communication timeout: {0}")]
    Timeout(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
