use std::path::Path;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::models::{UpdateError, UpdateResult};
use crate::config::ProgrammerConfig;

/// Writes a firmware image to the device behind a serial port.
///
/// The port must not be held open by anyone else while this runs.
#[async_trait]
pub trait FirmwareProgrammer: Send + Sync {
    async fn program(&self, image: &Path, port_name: &str) -> bool;
}

/// Runs an external programming utility and trusts its exit status
pub struct ExternalProgrammer {
    config: ProgrammerConfig,
}

impl ExternalProgrammer {
    pub fn new(config: ProgrammerConfig) -> Self {
        Self { config }
    }

    fn args(&self, image: &Path, port_name: &str) -> Vec<String> {
        let image = image.to_string_lossy();
        self.config
            .args
            .iter()
            .map(|arg| arg.replace("{image}", &image).replace("{port}", port_name))
            .collect()
    }
}

#[async_trait]
impl FirmwareProgrammer for ExternalProgrammer {
    async fn program(&self, image: &Path, port_name: &str) -> bool {
        let args = self.args(image, port_name);
        info!("Running {} {}", self.config.program, args.join(" "));

        let status = tokio::process::Command::new(&self.config.program)
            .args(&args)
            .kill_on_drop(true)
            .status()
            .await;

        match status {
            Ok(status) if status.success() => true,
            Ok(status) => {
                warn!("{} exited with {}", self.config.program, status);
                false
            }
            Err(e) => {
                error!("Failed to run {}: {}", self.config.program, e);
                false
            }
        }
    }
}

/// Verify firmware file integrity (if hash is provided)
pub async fn verify_firmware(file_path: &Path, expected_hash: Option<&str>) -> UpdateResult<bool> {
    let Some(expected) = expected_hash else {
        debug!("No hash provided, skipping verification");
        return Ok(true);
    };

    let mut file = File::open(file_path)
        .await
        .map_err(|_| UpdateError::ImageNotFound(file_path.to_path_buf()))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let computed = hex::encode(hasher.finalize());
    let expected = expected.trim().to_lowercase();

    if computed == expected {
        info!("Firmware verification successful: {}", computed);
        Ok(true)
    } else {
        error!("Firmware verification failed - expected: {}, computed: {}", expected, computed);
        Err(UpdateError::InvalidSignature)
    }
}
