//! In-memory device for integration tests.
#![allow(dead_code)]

use gwflash::config::Timeouts;
use gwflash::error::SessionError;
use gwflash::log::MemoryLog;
use gwflash::transport::{AbortHandle, Connector, RemoteConnection, RemoteProcess};
use gwflash::DeviceSession;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Scripted answer for commands starting with a given prefix.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
    /// How long the command "runs".
    pub delay: Duration,
    /// Never exits on its own.
    pub hang: bool,
    /// The link breaks once the command has run.
    pub reset: bool,
}

impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            ..Default::default()
        }
    }

    pub fn status(status: i32) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    /// Prints `stdout`, then the device drops off the network.
    pub fn reset(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            reset: true,
            ..Default::default()
        }
    }
}

#[derive(Default)]
pub struct DeviceState {
    pub connects: AtomicUsize,
    pub live: AtomicUsize,
    pub keepalives: AtomicUsize,
    pub fail_dial: AtomicBool,
    pub fail_keepalive: AtomicBool,
    /// Keepalives block until the connection is closed.
    pub stall_keepalive: AtomicBool,
    pub fail_exec: AtomicBool,
    pub commands: Mutex<Vec<String>>,
    pub uploads: Mutex<Vec<(PathBuf, String)>>,
    replies: Mutex<Vec<(String, Reply)>>,
}

impl DeviceState {
    pub fn reply(&self, prefix: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .push((prefix.to_string(), reply));
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.uploads.lock().unwrap().clone()
    }

    fn reply_for(&self, command: &str) -> Reply {
        self.replies
            .lock()
            .unwrap()
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, r)| r.clone())
            .unwrap_or_default()
    }
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    pub state: Arc<DeviceState>,
}

impl Connector for FakeConnector {
    fn connect(&self, addr: &str) -> Result<Arc<dyn RemoteConnection>, SessionError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_dial.load(Ordering::SeqCst) {
            return Err(SessionError::DialFailed {
                addr: addr.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            });
        }
        self.state.live.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeConnection {
            state: self.state.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct FakeConnection {
    state: Arc<DeviceState>,
    closed: Arc<AtomicBool>,
}

impl RemoteConnection for FakeConnection {
    fn keepalive(&self) -> Result<(), SessionError> {
        self.state.keepalives.fetch_add(1, Ordering::SeqCst);
        while self.state.stall_keepalive.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
        if self.closed.load(Ordering::SeqCst) || self.state.fail_keepalive.load(Ordering::SeqCst) {
            return Err(SessionError::ProbeFailed("peer gone".to_string()));
        }
        Ok(())
    }

    fn exec(&self, command: &str) -> Result<Box<dyn RemoteProcess>, SessionError> {
        if self.state.fail_exec.load(Ordering::SeqCst) {
            return Err(SessionError::SessionFailed("channel refused".to_string()));
        }
        self.state.commands.lock().unwrap().push(command.to_string());
        let reply = self.state.reply_for(command);
        Ok(Box::new(FakeProcess {
            stdout: Some(reply.stdout.clone().into_bytes()),
            stderr: Some(reply.stderr.clone().into_bytes()),
            reply,
            command: command.to_string(),
            aborted: Arc::new(AtomicBool::new(false)),
            link_closed: self.closed.clone(),
        }))
    }

    fn upload(&self, local: &Path, remote: &str) -> Result<(), SessionError> {
        if !local.is_file() {
            return Err(SessionError::CopyFailed {
                local: local.to_path_buf(),
                remote: remote.to_string(),
                reason: "no such file".to_string(),
            });
        }
        self.state
            .uploads
            .lock()
            .unwrap()
            .push((local.to_path_buf(), remote.to_string()));
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct FakeProcess {
    stdout: Option<Vec<u8>>,
    stderr: Option<Vec<u8>>,
    reply: Reply,
    command: String,
    aborted: Arc<AtomicBool>,
    link_closed: Arc<AtomicBool>,
}

impl RemoteProcess for FakeProcess {
    fn stdout(&mut self) -> Box<dyn Read + Send> {
        Box::new(Cursor::new(self.stdout.take().unwrap_or_default()))
    }

    fn stderr(&mut self) -> Box<dyn Read + Send> {
        Box::new(Cursor::new(self.stderr.take().unwrap_or_default()))
    }

    fn abort_handle(&self) -> AbortHandle {
        let aborted = self.aborted.clone();
        AbortHandle::new(move || aborted.store(true, Ordering::SeqCst))
    }

    fn wait(self: Box<Self>) -> Result<i32, SessionError> {
        let step = Duration::from_millis(5);
        let mut waited = Duration::ZERO;
        while self.reply.hang || waited < self.reply.delay {
            if self.aborted.load(Ordering::SeqCst) {
                return Err(SessionError::Cancelled(self.command));
            }
            if self.link_closed.load(Ordering::SeqCst) {
                return Err(SessionError::SessionFailed("connection closed".to_string()));
            }
            thread::sleep(step);
            waited += step;
        }
        if self.reply.reset {
            return Err(SessionError::SessionFailed("transport read".to_string()));
        }
        Ok(self.reply.status)
    }
}

/// Short timings so liveness tests finish quickly.
pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        read: Duration::from_millis(150),
        write: Duration::from_millis(150),
        keepalive: Duration::from_millis(40),
        reconnect_grace: Duration::from_millis(10),
        ..Timeouts::default()
    }
}

pub fn session() -> (DeviceSession, FakeConnector, Arc<MemoryLog>) {
    let connector = FakeConnector::default();
    let log = Arc::new(MemoryLog::new());
    let session = DeviceSession::new(Arc::new(connector.clone()), fast_timeouts(), log.clone());
    (session, connector, log)
}
