pub mod models;
pub mod service;

pub use models::{UpdateError, UpdatePhase, UpdateResult};
pub use service::{verify_firmware, ExternalProgrammer, FirmwareProgrammer};
