use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};

use crate::config::AgentConfig;
use crate::serial::{protocol, LineOpener, PortEnumerator, SystemPortEnumerator, SystemSerialOpener};
use crate::update::{ExternalProgrammer, FirmwareProgrammer, UpdateError, UpdatePhase, UpdateResult};
use super::{ActiveDevice, DeviceError, DeviceSummary, Result};

const IDENTITY_CHANNEL_CAPACITY: usize = 256;

/// Central device management.
///
/// Owns at most one claimed device at a time and runs firmware updates
/// against it. Every successful claim and every release is announced on the
/// identity channel: the device name, or an empty string once released.
pub struct DeviceManager {
    config: AgentConfig,
    enumerator: Arc<dyn PortEnumerator>,
    opener: Arc<dyn LineOpener>,
    programmer: Arc<dyn FirmwareProgrammer>,
    active_device: Mutex<Option<ActiveDevice>>,
    identity_tx: broadcast::Sender<String>,
    update_phase: watch::Sender<UpdatePhase>,
}

impl DeviceManager {
    /// Manager backed by the system's serial ports and the configured programmer
    pub fn new(config: AgentConfig) -> Self {
        let enumerator = Arc::new(SystemPortEnumerator::new(config.baud_rate));
        let opener = Arc::new(SystemSerialOpener::new(config.baud_rate));
        let programmer = Arc::new(ExternalProgrammer::new(config.programmer.clone()));
        Self::with_backends(config, enumerator, opener, programmer)
    }

    pub fn with_backends(
        config: AgentConfig,
        enumerator: Arc<dyn PortEnumerator>,
        opener: Arc<dyn LineOpener>,
        programmer: Arc<dyn FirmwareProgrammer>,
    ) -> Self {
        let (identity_tx, _) = broadcast::channel(IDENTITY_CHANNEL_CAPACITY);
        let (update_phase, _) = watch::channel(UpdatePhase::Idle);
        Self {
            config,
            enumerator,
            opener,
            programmer,
            active_device: Mutex::new(None),
            identity_tx,
            update_phase,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Receive identity changes from now on.
    ///
    /// A subscriber more than 256 changes behind gets `RecvError::Lagged`
    /// and misses the oldest ones.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.identity_tx.subscribe()
    }

    /// Follow the phases of firmware updates
    pub fn update_progress(&self) -> watch::Receiver<UpdatePhase> {
        self.update_phase.subscribe()
    }

    /// Ports that can be claimed, plus the claimed one even though the OS reports it busy
    pub async fn list_available_devices(&self) -> Result<Vec<String>> {
        let active_guard = self.active_device.lock().await;
        self.available_names(active_guard.as_ref())
    }

    pub async fn active_device(&self) -> Option<DeviceSummary> {
        let active_guard = self.active_device.lock().await;
        active_guard.as_ref().map(ActiveDevice::summary)
    }

    /// Claim a device by port name.
    ///
    /// Claiming the device that is already active checks it still answers;
    /// claiming another one releases the active device first.
    pub async fn claim(&self, name: &str) -> Result<()> {
        let mut active_guard = self.active_device.lock().await;
        self.claim_locked(&mut active_guard, name).await
    }

    /// Release the active device, if any
    pub async fn release(&self) {
        let mut active_guard = self.active_device.lock().await;
        self.release_locked(&mut active_guard).await;
    }

    /// Send a frame to the active device and wait for its reply
    pub async fn write_read(&self, payload: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut active_guard = self.active_device.lock().await;
        let device = active_guard.as_mut().ok_or(DeviceError::NotConnected)?;
        device
            .write_read(payload, timeout.unwrap_or_else(|| self.config.transaction_timeout()))
            .await
    }

    /// Flash `image` onto the active device with the external programmer.
    ///
    /// The device is released for the duration of the programming run and
    /// claimed again afterwards.
    pub async fn update_firmware(&self, image: &Path, enter_bootloader: bool) -> UpdateResult<()> {
        let mut active_guard = self.active_device.lock().await;

        let port_name = match active_guard.as_ref() {
            None => return Err(UpdateError::NoActiveDevice),
            Some(device) if !device.kind().supports_firmware_update() => {
                log::warn!("Unable to program {} devices", device.kind());
                return Err(UpdateError::Unsupported(device.kind()));
            }
            Some(device) => device.name().to_string(),
        };

        if tokio::fs::metadata(image).await.is_err() {
            return Err(UpdateError::ImageNotFound(image.to_path_buf()));
        }

        self.set_phase(UpdatePhase::Idle);
        let result = self
            .run_update(&mut active_guard, &port_name, image, enter_bootloader)
            .await;

        match &result {
            Ok(()) => {
                log::info!("Firmware on {} updated", port_name);
                self.set_phase(UpdatePhase::Done);
            }
            Err(e) => {
                log::error!("Firmware update on {} failed: {}", port_name, e);
                self.set_phase(UpdatePhase::Failed);
            }
        }
        result
    }

    async fn run_update(
        &self,
        active: &mut Option<ActiveDevice>,
        port_name: &str,
        image: &Path,
        enter_bootloader: bool,
    ) -> UpdateResult<()> {
        if enter_bootloader {
            self.set_phase(UpdatePhase::BootloaderEntryRequested);
            let device = active.as_mut().ok_or(UpdateError::NoActiveDevice)?;
            let reply = device
                .write_read(&protocol::enter_bootloader_frame(), self.config.bootloader_timeout())
                .await
                .map_err(|e| UpdateError::BootloaderHandshake(e.to_string()))?;
            let wait = protocol::parse_bootloader_wait(&reply)
                .map_err(|e| UpdateError::BootloaderHandshake(e.to_string()))?;

            self.set_phase(UpdatePhase::AwaitingBootloaderWindow);
            log::info!("Waiting {:?} for {} to enter its bootloader", wait, port_name);
            tokio::time::sleep_until(tokio::time::Instant::now() + wait).await;
        }

        // The programmer needs the port to itself
        self.release_locked(active).await;
        self.set_phase(UpdatePhase::Released);

        self.set_phase(UpdatePhase::ExternalProgramRunning);
        if !self.programmer.program(image, port_name).await {
            return Err(UpdateError::ProgrammingFailed {
                port: port_name.to_string(),
            });
        }

        self.set_phase(UpdatePhase::Reclaiming);
        self.claim_locked(active, port_name)
            .await
            .map_err(|source| UpdateError::ReclaimFailed {
                port: port_name.to_string(),
                source,
            })
    }

    async fn claim_locked(&self, active: &mut Option<ActiveDevice>, name: &str) -> Result<()> {
        let available = self.available_names(active.as_ref())?;
        let listed = available.iter().any(|candidate| candidate == name);

        if let Some(device) = active.as_mut() {
            if device.name() == name {
                if !listed {
                    log::warn!("Active device {} is no longer available", name);
                    self.release_locked(active).await;
                    return Err(DeviceError::Stale {
                        name: name.to_string(),
                        reason: "no longer listed".to_string(),
                    });
                }

                let probed = device.probe(self.config.probe_timeout()).await;
                return match probed {
                    Ok(()) => {
                        log::debug!("{} is already active and responding", name);
                        Ok(())
                    }
                    Err(e) => {
                        // Something else has the port open
                        log::warn!("Active device {} did not answer soft reset: {}", name, e);
                        self.release_locked(active).await;
                        Err(DeviceError::Stale {
                            name: name.to_string(),
                            reason: e.to_string(),
                        })
                    }
                };
            }
        }

        // An unavailable target leaves any active device claimed
        if !listed {
            return Err(DeviceError::NotAvailable(name.to_string()));
        }
        self.release_locked(active).await;

        let device = active.insert(ActiveDevice::open(name, self.opener.clone(), self.config.quiescence())?);
        log::info!("Claimed {}", name);
        self.notify(name);
        device.enter_json_mode(self.config.transaction_timeout()).await;
        Ok(())
    }

    async fn release_locked(&self, active: &mut Option<ActiveDevice>) {
        if let Some(device) = active.take() {
            let name = device.name().to_string();
            device.close().await;
            log::info!("Released {}", name);
            self.notify("");
        }
    }

    fn available_names(&self, active: Option<&ActiveDevice>) -> Result<Vec<String>> {
        let active_name = active.map(ActiveDevice::name);
        let ports = self.enumerator.available_ports()?;

        Ok(ports
            .into_iter()
            .filter(|port| !port.busy || Some(port.port_name.as_str()) == active_name)
            .map(|port| port.port_name)
            .collect())
    }

    fn notify(&self, name: &str) {
        if self.identity_tx.send(name.to_string()).is_err() {
            log::debug!("No identity subscribers");
        }
    }

    fn set_phase(&self, phase: UpdatePhase) {
        log::debug!("Firmware update phase: {:?}", phase);
        self.update_phase.send_replace(phase);
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new(AgentConfig::default())
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if let Some(device) = self.active_device.get_mut().take() {
            log::debug!("Freeing active device {}", device.name());
            drop(device);
            self.notify("");
        }
    }
}
