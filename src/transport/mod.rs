//! Remote shell transport.
//!
//! The session layer talks to a device only through these traits. All methods
//! are blocking; `DeviceSession` runs them on the blocking pool.
//!
//! ```text
//! Connector --connect--> RemoteConnection --exec--> RemoteProcess
//!                              |                     stdout / stderr / wait
//!                              +--upload (scp)
//!                              +--keepalive
//! ```

pub mod timeout;

#[cfg(feature = "ssh")]
pub mod ssh;

use crate::error::SessionError;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

pub use timeout::{Link, OpError};

#[cfg(feature = "ssh")]
pub use ssh::SshConnector;

/// Dials and authenticates a device.
pub trait Connector: Send + Sync {
    /// `addr` is `host:port`.
    fn connect(&self, addr: &str) -> Result<Arc<dyn RemoteConnection>, SessionError>;
}

/// One authenticated connection. Every `exec`/`upload` opens a fresh channel.
pub trait RemoteConnection: Send + Sync {
    /// Round-trip a request to prove the peer is still answering. Bounded by
    /// the read deadline.
    fn keepalive(&self) -> Result<(), SessionError>;

    fn exec(&self, command: &str) -> Result<Box<dyn RemoteProcess>, SessionError>;

    /// Push a single file to `remote` (scp semantics, overwrites).
    fn upload(&self, local: &Path, remote: &str) -> Result<(), SessionError>;

    /// Tear the connection down. Must be idempotent.
    fn close(&self);
}

/// A command running on the device.
pub trait RemoteProcess: Send {
    /// Standard output. Called once; later calls may return an empty reader.
    fn stdout(&mut self) -> Box<dyn Read + Send>;

    /// Standard error. Called once; later calls may return an empty reader.
    fn stderr(&mut self) -> Box<dyn Read + Send>;

    /// Handle that closes the channel from another thread.
    fn abort_handle(&self) -> AbortHandle;

    /// Block until the remote process exits and return its exit status.
    /// Returns early with `Cancelled` once aborted, and with `SessionFailed`
    /// once the connection is closed or the output stream breaks.
    fn wait(self: Box<Self>) -> Result<i32, SessionError>;
}

/// Cloneable "close this channel" trigger.
#[derive(Clone)]
pub struct AbortHandle(Arc<dyn Fn() + Send + Sync>);

impl AbortHandle {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn abort(&self) {
        (self.0)()
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AbortHandle")
    }
}
