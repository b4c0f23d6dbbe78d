//! libssh2-backed transport.
//!
//! The handshake runs with the full read/write deadline. After that the
//! session timeout drops to [`POLL_SLICE`], so no libssh2 call holds the
//! session lock for long, and every operation goes through [`Link`] to get its
//! own re-armed deadline.
//!
//! Host keys are NOT verified. Gateways are re-imaged by this tool and come up
//! with fresh keys, so the trust boundary is the provisioning network itself.

use crate::config::{DeviceConfig, Timeouts};
use crate::error::SessionError;
use crate::transport::{AbortHandle, Connector, Link, OpError, RemoteConnection, RemoteProcess};
use ssh2::{Channel, ErrorCode, Session};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// libssh2's LIBSSH2_ERROR_TIMEOUT
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
/// libssh2's LIBSSH2_ERROR_EAGAIN
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

/// Longest a single libssh2 call may block once the session is up.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// How often `wait` re-checks for EOF while the readers drain the channel.
const EOF_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Password-authenticated SSH connector.
#[derive(Debug, Clone)]
pub struct SshConnector {
    username: String,
    password: String,
    timeouts: Timeouts,
}

impl SshConnector {
    pub fn new(username: impl Into<String>, password: impl Into<String>, timeouts: Timeouts) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            timeouts,
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(&config.username, &config.password, config.timeouts())
    }
}

impl Connector for SshConnector {
    fn connect(&self, addr: &str) -> Result<Arc<dyn RemoteConnection>, SessionError> {
        let dial_err = |source: io::Error| SessionError::DialFailed {
            addr: addr.to_string(),
            source,
        };
        let handshake_err = |reason: String| SessionError::HandshakeFailed {
            addr: addr.to_string(),
            reason,
        };

        let sock_addr = addr
            .to_socket_addrs()
            .map_err(dial_err)?
            .next()
            .ok_or_else(|| dial_err(io::Error::new(io::ErrorKind::NotFound, "address did not resolve")))?;

        let tcp = TcpStream::connect_timeout(&sock_addr, self.timeouts.dial).map_err(dial_err)?;
        tcp.set_nodelay(true).map_err(dial_err)?;
        let link = Arc::new(Link::new(self.timeouts.read, self.timeouts.write));

        let mut session = Session::new().map_err(|e| handshake_err(e.to_string()))?;
        session.set_timeout(millis(self.timeouts.read.max(self.timeouts.write)));
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| handshake_err(e.to_string()))?;
        session
            .userauth_password(&self.username, &self.password)
            .map_err(|e| handshake_err(e.to_string()))?;
        if !session.authenticated() {
            return Err(handshake_err("authentication rejected".to_string()));
        }
        session.set_timeout(millis(POLL_SLICE));
        link.heard();

        tracing::debug!(%addr, "ssh session established");
        Ok(Arc::new(SshConnection {
            session,
            addr: addr.to_string(),
            link,
        }))
    }
}

fn millis(d: Duration) -> u32 {
    d.as_millis().min(u32::MAX as u128) as u32
}

fn is_retryable(e: &ssh2::Error) -> bool {
    matches!(
        e.code(),
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) | ErrorCode::Session(LIBSSH2_ERROR_EAGAIN)
    )
}

fn io_is_retryable(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
        || e.get_ref()
            .and_then(|inner| inner.downcast_ref::<ssh2::Error>())
            .is_some_and(is_retryable)
}

struct SshConnection {
    session: Session,
    addr: String,
    link: Arc<Link>,
}

impl RemoteConnection for SshConnection {
    fn keepalive(&self) -> Result<(), SessionError> {
        let keepalive_err = |e: OpError<ssh2::Error>| SessionError::ProbeFailed(e.to_string());

        // Opening a channel needs the peer's confirmation
        let mut channel = self
            .link
            .read(is_retryable, || self.session.channel_session())
            .map_err(keepalive_err)?;
        self.link
            .write(is_retryable, || channel.close())
            .map_err(keepalive_err)?;
        self.link
            .read(is_retryable, || channel.wait_close())
            .map_err(keepalive_err)
    }

    fn exec(&self, command: &str) -> Result<Box<dyn RemoteProcess>, SessionError> {
        let failed = |e: OpError<ssh2::Error>| SessionError::SessionFailed(e.to_string());

        let mut channel = self
            .link
            .read(is_retryable, || self.session.channel_session())
            .map_err(failed)?;
        self.link
            .write(is_retryable, || channel.exec(command))
            .map_err(failed)?;

        Ok(Box::new(SshProcess {
            channel,
            command: command.to_string(),
            link: self.link.clone(),
            state: Arc::new(ProcessState::default()),
        }))
    }

    fn upload(&self, local: &Path, remote: &str) -> Result<(), SessionError> {
        let copy_err = |reason: String| SessionError::CopyFailed {
            local: local.to_path_buf(),
            remote: remote.to_string(),
            reason,
        };

        let mut file = File::open(local).map_err(|e| copy_err(e.to_string()))?;
        let meta = file.metadata().map_err(|e| copy_err(e.to_string()))?;
        let mode = file_mode(&meta);

        let mut channel = self
            .link
            .write(is_retryable, || {
                self.session
                    .scp_send(Path::new(remote), mode, meta.len(), None)
            })
            .map_err(|e| SessionError::SessionFailed(e.to_string()))?;

        let mut buf = vec![0u8; 32 * 1024];
        loop {
            let n = file.read(&mut buf).map_err(|e| copy_err(e.to_string()))?;
            if n == 0 {
                break;
            }
            let mut chunk = &buf[..n];
            while !chunk.is_empty() {
                let written = self
                    .link
                    .write(io_is_retryable, || channel.write(chunk))
                    .map_err(|e| copy_err(e.to_string()))?;
                if written == 0 {
                    return Err(copy_err("peer accepted no data".to_string()));
                }
                chunk = &chunk[written..];
            }
        }

        let finish = |e: OpError<ssh2::Error>| copy_err(e.to_string());
        self.link
            .write(is_retryable, || channel.send_eof())
            .map_err(finish)?;
        self.link
            .read(is_retryable, || channel.wait_eof())
            .map_err(finish)?;
        self.link
            .write(is_retryable, || channel.close())
            .map_err(finish)?;
        self.link
            .read(is_retryable, || channel.wait_close())
            .map_err(finish)
    }

    fn close(&self) {
        if !self.link.close() {
            return;
        }
        if let Err(e) = self.session.disconnect(None, "closing", None) {
            tracing::debug!(addr = %self.addr, "ssh disconnect: {}", e);
        }
    }
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> i32 {
    use std::os::unix::fs::PermissionsExt;
    (meta.permissions().mode() & 0o777) as i32
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> i32 {
    0o644
}

/// Shared between a process, its two readers and its abort handle.
#[derive(Default)]
struct ProcessState {
    aborted: AtomicBool,
    /// First transport failure seen by a reader.
    failure: Mutex<Option<String>>,
}

impl ProcessState {
    fn fail(&self, reason: String) {
        let mut failure = self.failure.lock().unwrap_or_else(|e| e.into_inner());
        failure.get_or_insert(reason);
    }

    fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

struct SshProcess {
    channel: Channel,
    command: String,
    link: Arc<Link>,
    state: Arc<ProcessState>,
}

impl SshProcess {
    fn reader(&self, inner: ssh2::Stream) -> Box<dyn Read + Send> {
        Box::new(ChannelReader {
            inner,
            link: self.link.clone(),
            state: self.state.clone(),
        })
    }
}

impl RemoteProcess for SshProcess {
    fn stdout(&mut self) -> Box<dyn Read + Send> {
        self.reader(self.channel.stream(0))
    }

    fn stderr(&mut self) -> Box<dyn Read + Send> {
        self.reader(self.channel.stderr())
    }

    fn abort_handle(&self) -> AbortHandle {
        let state = self.state.clone();
        AbortHandle::new(move || state.aborted.store(true, Ordering::Release))
    }

    fn wait(self: Box<Self>) -> Result<i32, SessionError> {
        let SshProcess {
            mut channel,
            command,
            link,
            state,
        } = *self;

        // The readers consume the data; EOF is observed through them.
        while !channel.eof() {
            if state.is_aborted() {
                if let Err(e) = channel.close() {
                    tracing::debug!("closing aborted channel: {}", e);
                }
                return Err(SessionError::Cancelled(command));
            }
            if link.is_closed() {
                return Err(SessionError::SessionFailed("connection closed".to_string()));
            }
            if let Some(reason) = state.failure() {
                return Err(SessionError::SessionFailed(reason));
            }
            thread::sleep(EOF_POLL_INTERVAL);
        }

        link.read(is_retryable, || channel.wait_close())
            .map_err(|e| SessionError::SessionFailed(e.to_string()))?;
        channel
            .exit_status()
            .map_err(|e| SessionError::SessionFailed(e.to_string()))
    }
}

/// Channel stream that waits through poll slices until data, EOF, an abort,
/// a closed link or a silent peer.
struct ChannelReader {
    inner: ssh2::Stream,
    link: Arc<Link>,
    state: Arc<ProcessState>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.state.is_aborted() {
                return Ok(0);
            }
            if self.link.is_closed() {
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed"));
            }
            match self.inner.read(buf) {
                Ok(n) => {
                    self.link.heard();
                    return Ok(n);
                }
                Err(e) if io_is_retryable(&e) => {
                    let silent = self.link.silent_for();
                    if silent > self.link.read_timeout() {
                        let reason = format!("no data from peer for {}ms", silent.as_millis());
                        self.state.fail(reason.clone());
                        return Err(io::Error::new(io::ErrorKind::TimedOut, reason));
                    }
                    // Let the other reader and the keepalive take the session lock
                    thread::yield_now();
                }
                Err(e) => {
                    self.state.fail(e.to_string());
                    return Err(e);
                }
            }
        }
    }
}
