//! Background worker owning a single serial line.
//!
//! Callers stage a transaction in a single-slot mailbox and the worker thread
//! executes it: write the payload, wait for the first byte of a reply, then
//! keep reading until the line has been quiet for the quiescence window.
//! A submission made while a transaction is running overwrites the staged
//! parameters; earlier submissions that were never picked up are dropped.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc;

use super::interface::{LineOpener, SerialLine};

/// Silence on the line after which a reply is considered complete
pub const QUIESCENCE_WINDOW: Duration = Duration::from_millis(50);

const READ_CHUNK: usize = 1024;

/// Result of one transaction attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Response(Vec<u8>),
    Timeout(String),
    Error(String),
}

/// An event tagged with the mailbox submission it answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub submission: u64,
    pub event: SessionEvent,
}

#[derive(Debug, Clone)]
struct Transaction {
    port_name: String,
    timeout: Duration,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Mailbox {
    port_name: String,
    timeout: Duration,
    payload: Vec<u8>,
    submissions: u64,
    shutdown: bool,
}

impl Mailbox {
    fn snapshot(&self) -> Transaction {
        Transaction {
            port_name: self.port_name.clone(),
            timeout: self.timeout,
            payload: self.payload.clone(),
        }
    }
}

struct Shared {
    mailbox: Mutex<Mailbox>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Mailbox> {
        self.mailbox.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type OpenLine = (String, Box<dyn SerialLine>);

pub struct SessionWorker {
    shared: Arc<Shared>,
    opener: Arc<dyn LineOpener>,
    quiescence: Duration,
    // Moved into the worker thread when it starts
    events: Option<mpsc::UnboundedSender<SessionOutcome>>,
    initial_line: Option<OpenLine>,
    handle: Option<JoinHandle<()>>,
}

impl SessionWorker {
    pub fn new(opener: Arc<dyn LineOpener>, events: mpsc::UnboundedSender<SessionOutcome>) -> Self {
        Self {
            shared: Arc::new(Shared {
                mailbox: Mutex::new(Mailbox::default()),
                wake: Condvar::new(),
            }),
            opener,
            quiescence: QUIESCENCE_WINDOW,
            events: Some(events),
            initial_line: None,
            handle: None,
        }
    }

    /// Create a worker that starts out owning an already opened line.
    ///
    /// The first transaction addressed to `port_name` reuses the line instead
    /// of opening the port a second time.
    pub fn with_line(
        opener: Arc<dyn LineOpener>,
        events: mpsc::UnboundedSender<SessionOutcome>,
        port_name: &str,
        line: Box<dyn SerialLine>,
    ) -> Self {
        let mut worker = Self::new(opener, events);
        worker.initial_line = Some((port_name.to_string(), line));
        worker
    }

    pub fn quiescence(mut self, window: Duration) -> Self {
        self.quiescence = window;
        self
    }

    /// Stage a transaction and wake (or start) the worker thread.
    ///
    /// Returns the submission number the eventual outcome will carry.
    pub fn submit(&mut self, port_name: &str, timeout_ms: u64, payload: &[u8]) -> u64 {
        let submission = {
            let mut mailbox = self.shared.lock();
            mailbox.port_name = port_name.to_string();
            mailbox.timeout = Duration::from_millis(timeout_ms);
            mailbox.payload = payload.to_vec();
            mailbox.submissions += 1;
            mailbox.submissions
        };

        if self.handle.is_none() {
            self.start();
        } else {
            self.shared.wake.notify_one();
        }
        submission
    }

    /// True until the worker thread has exited.
    ///
    /// A worker that has not started yet counts as running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(true, |handle| !handle.is_finished())
    }

    fn start(&mut self) {
        let Some(events) = self.events.take() else {
            return;
        };
        let shared = self.shared.clone();
        let opener = self.opener.clone();
        let quiescence = self.quiescence;
        let line = self.initial_line.take();

        let spawned = std::thread::Builder::new()
            .name("serial-session".to_string())
            .spawn({
                let events = events.clone();
                move || run(shared, opener, events, quiescence, line)
            });

        match spawned {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => {
                log::error!("Failed to spawn serial session thread: {}", e);
                let submission = self.shared.lock().submissions;
                let _ = events.send(SessionOutcome {
                    submission,
                    event: SessionEvent::Error(format!("Can't start session thread: {}", e)),
                });
            }
        }
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.wake.notify_one();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Serial session thread panicked");
            }
        }
    }
}

fn run(
    shared: Arc<Shared>,
    opener: Arc<dyn LineOpener>,
    events: mpsc::UnboundedSender<SessionOutcome>,
    quiescence: Duration,
    mut line: Option<OpenLine>,
) {
    let (mut request, mut seen) = {
        let mailbox = shared.lock();
        if mailbox.shutdown {
            return;
        }
        (mailbox.snapshot(), mailbox.submissions)
    };

    loop {
        let port_changed = line
            .as_ref()
            .map_or(true, |(open_name, _)| *open_name != request.port_name);

        if port_changed {
            if let Some((previous, _)) = line.take() {
                log::debug!("Closing {}", previous);
            }
            match opener.open(&request.port_name) {
                Ok(opened) => {
                    log::debug!("Opened {}", request.port_name);
                    line = Some((request.port_name.clone(), opened));
                }
                Err(e) => {
                    log::error!("Session worker stopping: {}", e);
                    let _ = events.send(SessionOutcome {
                        submission: seen,
                        event: SessionEvent::Error(e.to_string()),
                    });
                    return;
                }
            }
        }

        let Some((_, port)) = line.as_mut() else {
            return;
        };
        let event = execute(port.as_mut(), &request, quiescence);
        if events.send(SessionOutcome { submission: seen, event }).is_err() {
            log::debug!("Session outcome dropped, receiver is gone");
        }

        let mailbox = shared
            .wake
            .wait_while(shared.lock(), |m| !m.shutdown && m.submissions == seen)
            .unwrap_or_else(PoisonError::into_inner);
        if mailbox.shutdown {
            break;
        }
        request = mailbox.snapshot();
        seen = mailbox.submissions;
    }

    if let Some((name, _)) = line {
        log::debug!("Session on {} shut down", name);
    }
}

fn execute(line: &mut dyn SerialLine, request: &Transaction, quiescence: Duration) -> SessionEvent {
    match line.write_within(&request.payload, request.timeout) {
        Ok(true) => {}
        Ok(false) => {
            return SessionEvent::Timeout(format!("Wait write request timeout {}", timestamp()));
        }
        Err(e) => {
            return SessionEvent::Error(format!("Write to {} failed: {}", request.port_name, e));
        }
    }

    let mut buffer = [0u8; READ_CHUNK];
    let mut response = match line.read_within(&mut buffer, request.timeout) {
        Ok(0) => {
            return SessionEvent::Timeout(format!("Wait read response timeout {}", timestamp()));
        }
        Ok(n) => buffer[..n].to_vec(),
        Err(e) => {
            return SessionEvent::Error(format!("Read from {} failed: {}", request.port_name, e));
        }
    };

    // Replies are not length delimited, keep reading until the line goes quiet
    loop {
        match line.read_within(&mut buffer, quiescence) {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&buffer[..n]),
            Err(e) => {
                log::warn!("Read from {} failed mid-reply: {}", request.port_name, e);
                break;
            }
        }
    }

    log::trace!("{} replied: {}", request.port_name, String::from_utf8_lossy(&response));
    SessionEvent::Response(response)
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}
