#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;

use instrument_agent_lib::serial::{self, LineOpener, PortEnumerator, PortInfo, SerialError, SerialLine};
use instrument_agent_lib::update::FirmwareProgrammer;
use instrument_agent_lib::{AgentConfig, DeviceManager};

#[derive(Debug, Clone)]
pub struct Entry {
    pub at: Instant,
    pub what: String,
}

#[derive(Default)]
struct State {
    ports: Mutex<Vec<PortInfo>>,
    unresponsive: Mutex<HashSet<String>>,
    ignores_mode_switch: Mutex<HashSet<String>>,
    unopenable: Mutex<HashSet<String>>,
    bootloader_reply: Mutex<String>,
    journal: Mutex<Vec<Entry>>,
}

/// Simulated host: the port list, the instruments behind the ports and a
/// journal of everything that happened to them
#[derive(Clone, Default)]
pub struct Bench {
    state: Arc<State>,
}

impl Bench {
    pub fn with_ports(names: &[&str]) -> Self {
        let bench = Self::default();
        bench.set_ports(&names.iter().map(|name| (*name, false)).collect::<Vec<_>>());
        bench.set_bootloader_reply(r#"{"device":[{"command":"enterBootloader","statusCode":0,"wait":100}],"statusCode":0}"#);
        bench
    }

    pub fn set_ports(&self, ports: &[(&str, bool)]) {
        *self.state.ports.lock().unwrap() = ports.iter().map(|(name, busy)| PortInfo::new(*name, *busy)).collect();
    }

    pub fn set_unresponsive(&self, name: &str) {
        self.state.unresponsive.lock().unwrap().insert(name.to_string());
    }

    /// The instrument on `name` stays silent when asked to switch modes
    pub fn set_ignores_mode_switch(&self, name: &str) {
        self.state.ignores_mode_switch.lock().unwrap().insert(name.to_string());
    }

    pub fn set_unopenable(&self, name: &str) {
        self.state.unopenable.lock().unwrap().insert(name.to_string());
    }

    pub fn set_bootloader_reply(&self, reply: &str) {
        *self.state.bootloader_reply.lock().unwrap() = reply.to_string();
    }

    pub fn record(&self, what: String) {
        self.state.journal.lock().unwrap().push(Entry { at: Instant::now(), what });
    }

    pub fn journal(&self) -> Vec<String> {
        self.state.journal.lock().unwrap().iter().map(|e| e.what.clone()).collect()
    }

    /// When the first journal entry containing `needle` was recorded
    pub fn first(&self, needle: &str) -> Option<(usize, Instant)> {
        self.state
            .journal
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .find(|(_, e)| e.what.contains(needle))
            .map(|(i, e)| (i, e.at))
    }

    /// Wait for a journal entry containing `needle` to show up
    pub async fn wait_for(&self, needle: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if self.first(needle).is_some() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    pub fn programmer(&self, succeed: bool) -> Arc<RecordingProgrammer> {
        Arc::new(RecordingProgrammer {
            bench: self.clone(),
            succeed,
            ports_after: Mutex::new(None),
            identities: Mutex::new(None),
            seen_identities: Mutex::new(Vec::new()),
        })
    }
}

impl PortEnumerator for Bench {
    fn available_ports(&self) -> serial::Result<Vec<PortInfo>> {
        Ok(self.state.ports.lock().unwrap().clone())
    }
}

impl LineOpener for Bench {
    fn open(&self, port_name: &str) -> serial::Result<Box<dyn SerialLine>> {
        if self.state.unopenable.lock().unwrap().contains(port_name) {
            return Err(SerialError::OpenFailed {
                port: port_name.to_string(),
                reason: "Access denied".to_string(),
            });
        }
        self.record(format!("open {}", port_name));
        Ok(Box::new(BenchLine {
            port_name: port_name.to_string(),
            bench: self.clone(),
            pending: VecDeque::new(),
        }))
    }
}

struct BenchLine {
    port_name: String,
    bench: Bench,
    pending: VecDeque<Vec<u8>>,
}

impl BenchLine {
    fn reply_to(&self, text: &str) -> Option<String> {
        if self.bench.state.unresponsive.lock().unwrap().contains(&self.port_name) {
            return None;
        }
        let reply = if text.contains("\"mode\"") {
            if self.bench.state.ignores_mode_switch.lock().unwrap().contains(&self.port_name) {
                return None;
            }
            r#"{"mode":"JSON","statusCode":0}"#.to_string()
        } else if text.contains("softReset") {
            r#"{"device":[{"command":"softReset","statusCode":0}],"statusCode":0}"#.to_string()
        } else if text.contains("enterBootloader") {
            self.bench.state.bootloader_reply.lock().unwrap().clone()
        } else {
            text.trim_end().to_string()
        };
        Some(format!("{}\r\n", reply))
    }
}

impl SerialLine for BenchLine {
    fn write_within(&mut self, data: &[u8], _timeout: Duration) -> std::io::Result<bool> {
        let text = String::from_utf8_lossy(data).to_string();
        self.bench.record(format!("write {} {}", self.port_name, text.trim_end()));
        if let Some(reply) = self.reply_to(&text) {
            // Deliver in two pieces like a real UART would
            let bytes = reply.into_bytes();
            let split = bytes.len() / 2;
            self.pending.push_back(bytes[..split].to_vec());
            self.pending.push_back(bytes[split..].to_vec());
        }
        Ok(true)
    }

    fn read_within(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        match self.pending.pop_front() {
            Some(chunk) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => {
                std::thread::sleep(timeout);
                Ok(0)
            }
        }
    }
}

impl Drop for BenchLine {
    fn drop(&mut self) {
        self.bench.record(format!("close {}", self.port_name));
    }
}

/// Programmer that journals its invocation and which identity changes had
/// been announced by then
pub struct RecordingProgrammer {
    bench: Bench,
    succeed: bool,
    ports_after: Mutex<Option<Vec<(String, bool)>>>,
    identities: Mutex<Option<broadcast::Receiver<String>>>,
    pub seen_identities: Mutex<Vec<String>>,
}

impl RecordingProgrammer {
    pub fn watch(&self, identities: broadcast::Receiver<String>) {
        *self.identities.lock().unwrap() = Some(identities);
    }

    /// Replace the port list when programming runs, as a re-enumerating device would
    pub fn change_ports_to(&self, ports: &[(&str, bool)]) {
        *self.ports_after.lock().unwrap() = Some(ports.iter().map(|(n, b)| (n.to_string(), *b)).collect());
    }
}

#[async_trait]
impl FirmwareProgrammer for RecordingProgrammer {
    async fn program(&self, image: &Path, port_name: &str) -> bool {
        if let Some(rx) = self.identities.lock().unwrap().as_mut() {
            self.seen_identities.lock().unwrap().extend(drain(rx));
        }
        self.bench.record(format!("program {} {}", port_name, image.display()));
        if let Some(ports) = self.ports_after.lock().unwrap().take() {
            let ports: Vec<(&str, bool)> = ports.iter().map(|(n, b)| (n.as_str(), *b)).collect();
            self.bench.set_ports(&ports);
        }
        self.succeed
    }
}

pub fn test_config() -> AgentConfig {
    AgentConfig {
        transaction_timeout_ms: 300,
        probe_timeout_ms: 200,
        bootloader_timeout_ms: 300,
        quiescence_ms: 10,
        ..AgentConfig::default()
    }
}

pub fn manager(bench: &Bench, programmer: Arc<RecordingProgrammer>) -> DeviceManager {
    manager_with(bench, programmer, test_config())
}

pub fn manager_with(bench: &Bench, programmer: Arc<RecordingProgrammer>, config: AgentConfig) -> DeviceManager {
    DeviceManager::with_backends(config, Arc::new(bench.clone()), Arc::new(bench.clone()), programmer)
}

/// Everything announced on an identity channel so far
pub fn drain(rx: &mut broadcast::Receiver<String>) -> Vec<String> {
    let mut names = Vec::new();
    while let Ok(name) = rx.try_recv() {
        names.push(name);
    }
    names
}
