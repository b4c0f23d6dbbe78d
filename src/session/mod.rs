//! Device session: the one live connection of a tool instance.
//!
//! ```text
//!              connect()                 handshake ok
//! Disconnected ---------> Connecting ---------------> Connected
//!      ^                      | dial/handshake error      |
//!      +----------------------+---------------------------+
//!        disconnect(), reconnect, failed keepalive, broken channel
//! ```
//!
//! The slot holding the connection is guarded by an async mutex. `connect`
//! holds it for the whole teardown + dial, the keepalive holds it while
//! probing, and commands take it briefly to grab the current connection.

mod exec;
mod monitor;

use crate::config::Timeouts;
use crate::error::SessionError;
use crate::log::{LogExt, SharedLog};
use crate::transport::{Connector, RemoteConnection};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

/// Connection state published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Supervises a single remote-shell connection and serializes commands on it.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    timeouts: Timeouts,
    log: SharedLog,
    slot: Mutex<Option<LiveConnection>>,
    /// Held for the whole duration of a command.
    command_lock: Mutex<()>,
    state: watch::Sender<ConnectionState>,
    next_id: AtomicU64,
}

struct LiveConnection {
    id: u64,
    addr: String,
    conn: Arc<dyn RemoteConnection>,
    monitor: CancellationToken,
}

impl DeviceSession {
    pub fn new(connector: Arc<dyn Connector>, timeouts: Timeouts, log: SharedLog) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                timeouts,
                log,
                slot: Mutex::new(None),
                command_lock: Mutex::new(()),
                state,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Replace the current connection (if any) with a fresh one to `addr`.
    pub async fn connect(&self, addr: &str) -> Result<(), SessionError> {
        let mut slot = self.inner.slot.lock().await;

        if let Some(old) = slot.take() {
            let old_addr = old.addr.clone();
            self.inner.teardown(old).await;
            self.append_log(format!("Closed previous connection to {old_addr}"));
            // Give the device a moment to release the old session
            tokio::time::sleep(self.inner.timeouts.reconnect_grace).await;
        }

        self.inner.state.send_replace(ConnectionState::Connecting);
        self.append_log(format!("Connecting to {addr}"));

        let connector = self.inner.connector.clone();
        let target = addr.to_string();
        let dialed = tokio::task::spawn_blocking(move || connector.connect(&target))
            .await
            .map_err(|e| SessionError::Task(e.to_string()))
            .and_then(|r| r);

        let conn = match dialed {
            Ok(conn) => conn,
            Err(e) => {
                self.inner.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        *slot = Some(LiveConnection {
            id,
            addr: addr.to_string(),
            conn,
            monitor: token.clone(),
        });
        self.inner.state.send_replace(ConnectionState::Connected);
        drop(slot);

        tokio::spawn(monitor::run(
            Arc::downgrade(&self.inner),
            id,
            token,
            self.inner.timeouts.keepalive,
        ));

        self.append_log(format!("Connected to {addr}"));
        Ok(())
    }

    /// Close the current connection. No-op when already disconnected.
    pub async fn disconnect(&self) {
        let mut slot = self.inner.slot.lock().await;
        if let Some(live) = slot.take() {
            let addr = live.addr.clone();
            self.inner.teardown(live).await;
            self.append_log(format!("Disconnected from {addr}"));
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state.borrow() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state changes (e.g. for a status indicator).
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn append_log(&self, line: impl Into<String>) {
        self.inner.log.line(line);
    }

    pub fn log(&self) -> &SharedLog {
        &self.inner.log
    }

    /// Current connection, without holding the slot lock afterwards.
    async fn current(&self) -> Option<(u64, Arc<dyn RemoteConnection>)> {
        let slot = self.inner.slot.lock().await;
        slot.as_ref().map(|live| (live.id, live.conn.clone()))
    }

    /// Drop connection `id` after a transport failure, unless it was already replaced.
    async fn demote(&self, id: u64, reason: &str) {
        let mut slot = self.inner.slot.lock().await;
        if slot.as_ref().is_some_and(|live| live.id == id) {
            if let Some(live) = slot.take() {
                self.inner.teardown(live).await;
                self.append_log(format!("Connection dropped: {reason}"));
            }
        }
    }
}

impl Inner {
    /// Cancel the monitor, close the handle, publish `Disconnected`.
    async fn teardown(&self, live: LiveConnection) {
        live.monitor.cancel();
        close_blocking(live.conn).await;
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(live) = self.slot.get_mut().take() {
            live.monitor.cancel();
            live.conn.close();
        }
    }
}

async fn close_blocking(conn: Arc<dyn RemoteConnection>) {
    if let Err(e) = tokio::task::spawn_blocking(move || conn.close()).await {
        tracing::warn!("closing connection panicked: {}", e);
    }
}
