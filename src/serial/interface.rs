use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::sync::mpsc;

use super::session::{SessionEvent, SessionOutcome, SessionWorker};
use super::{PortInfo, Result, SerialError};

pub const DEFAULT_BAUD_RATE: u32 = 1_250_000;

// Extra time granted on top of the worker's own deadlines before a caller
// stops waiting for an outcome
const OUTCOME_GRACE: Duration = Duration::from_secs(1);

/// Raw byte access to an open serial line
pub trait SerialLine: Send {
    /// Write and flush `data`, returning `false` if that did not finish within `timeout`.
    fn write_within(&mut self, data: &[u8], timeout: Duration) -> std::io::Result<bool>;

    /// Read whatever arrives first, returning 0 if nothing arrived within `timeout`.
    fn read_within(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize>;
}

/// Opens serial lines by port name
pub trait LineOpener: Send + Sync {
    fn open(&self, port_name: &str) -> Result<Box<dyn SerialLine>>;
}

/// Source of candidate ports, queried fresh on every call
pub trait PortEnumerator: Send + Sync {
    fn available_ports(&self) -> Result<Vec<PortInfo>>;
}

/// Opens OS serial ports at a fixed baud rate, 8N1 without flow control
pub struct SystemSerialOpener {
    baud_rate: u32,
}

impl SystemSerialOpener {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl Default for SystemSerialOpener {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATE)
    }
}

impl LineOpener for SystemSerialOpener {
    fn open(&self, port_name: &str) -> Result<Box<dyn SerialLine>> {
        let port = serialport::new(port_name, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(1000))
            .open()
            .map_err(|e| SerialError::OpenFailed {
                port: port_name.to_string(),
                reason: e.to_string(),
            })?;

        log::info!("Opened serial port {} at {} baud", port_name, self.baud_rate);
        Ok(Box::new(SystemLine { port }))
    }
}

struct SystemLine {
    port: Box<dyn SerialPort>,
}

impl SerialLine for SystemLine {
    fn write_within(&mut self, data: &[u8], timeout: Duration) -> std::io::Result<bool> {
        self.port.set_timeout(timeout).map_err(std::io::Error::from)?;
        let result = self.port.write_all(data).and_then(|()| self.port.flush());
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn read_within(&mut self, buf: &mut [u8], timeout: Duration) -> std::io::Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(0);
            }
            self.port.set_timeout(remaining).map_err(std::io::Error::from)?;
            match self.port.read(buf) {
                Ok(0) => continue,
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Lists the system's serial ports.
///
/// A port counts as busy when a trial open fails, which is also what happens
/// to a port this process already holds open.
///
/// Every call trial-opens every port. Opening toggles DTR/RTS on many
/// USB-UART bridges, which resets some instruments; only hosts whose other
/// ports tolerate that should list devices while those ports are in use.
pub struct SystemPortEnumerator {
    baud_rate: u32,
}

impl SystemPortEnumerator {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl PortEnumerator for SystemPortEnumerator {
    fn available_ports(&self) -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports()?;
        let devices = ports
            .into_iter()
            .map(|port| {
                let busy = serialport::new(&port.port_name, self.baud_rate)
                    .timeout(Duration::from_millis(10))
                    .open()
                    .is_err();
                log::trace!("Found port {} (busy: {})", port.port_name, busy);
                PortInfo {
                    port_name: port.port_name,
                    busy,
                }
            })
            .collect();
        Ok(devices)
    }
}

/// Request/response access to a device through its session worker.
///
/// Requests are serialized: a request waits for the outcome of any earlier
/// submission before staging its own, so nothing staged is overwritten
/// before the worker has written it.
pub struct SerialDevice {
    port_name: String,
    worker: SessionWorker,
    outcomes: mpsc::UnboundedReceiver<SessionOutcome>,
    quiescence: Duration,
    in_flight: Option<InFlight>,
}

// A submission whose outcome has not been received yet
struct InFlight {
    submission: u64,
    deadline: tokio::time::Instant,
}

impl SerialDevice {
    /// Open `port_name` and hand the line to a fresh session worker
    pub fn open(port_name: &str, opener: Arc<dyn LineOpener>, quiescence: Duration) -> Result<Self> {
        let line = opener.open(port_name)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = SessionWorker::with_line(opener, tx, port_name, line).quiescence(quiescence);

        Ok(Self {
            port_name: port_name.to_string(),
            worker,
            outcomes: rx,
            quiescence,
            in_flight: None,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn is_open(&self) -> bool {
        self.worker.is_running()
    }

    /// Send a request without waiting for its reply.
    ///
    /// The next `write_read` waits for this request to finish before its own
    /// is staged; the reply itself is discarded.
    pub async fn submit(&mut self, payload: &[u8], timeout: Duration) -> u64 {
        self.settle().await;
        let submission = self.stage(payload, timeout);
        self.in_flight = Some(InFlight {
            submission,
            deadline: tokio::time::Instant::now() + self.outcome_limit(timeout),
        });
        submission
    }

    /// Send a request and wait for its reply
    pub async fn write_read(&mut self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        self.settle().await;
        let submission = self.stage(payload, timeout);
        let deadline = tokio::time::Instant::now() + self.outcome_limit(timeout);
        self.wait_outcome(submission, deadline).await
    }

    fn stage(&mut self, payload: &[u8], timeout: Duration) -> u64 {
        self.worker.submit(&self.port_name, duration_ms(timeout), payload)
    }

    // Write wait + first byte wait + trailing silence
    fn outcome_limit(&self, timeout: Duration) -> Duration {
        timeout * 2 + self.quiescence + OUTCOME_GRACE
    }

    async fn settle(&mut self) {
        let Some(earlier) = self.in_flight.take() else {
            return;
        };
        match self.wait_outcome(earlier.submission, earlier.deadline).await {
            Ok(reply) => log::debug!("{} answered earlier request with {} bytes", self.port_name, reply.len()),
            Err(e) => log::debug!("Earlier request on {} ended without reply: {}", self.port_name, e),
        }
    }

    async fn wait_outcome(&mut self, submission: u64, deadline: tokio::time::Instant) -> Result<Vec<u8>> {
        loop {
            let outcome = match tokio::time::timeout_at(deadline, self.outcomes.recv()).await {
                Ok(Some(outcome)) => outcome,
                Ok(None) => return Err(SerialError::SessionClosed),
                Err(_) => {
                    return Err(SerialError::Timeout(format!(
                        "No reply from {} for request {}",
                        self.port_name, submission
                    )))
                }
            };

            if outcome.submission < submission {
                log::debug!("Discarding outcome of earlier request on {}", self.port_name);
                continue;
            }

            return match outcome.event {
                SessionEvent::Response(bytes) => Ok(bytes),
                SessionEvent::Timeout(message) => Err(SerialError::Timeout(message)),
                SessionEvent::Error(message) => Err(SerialError::Session(message)),
            };
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
