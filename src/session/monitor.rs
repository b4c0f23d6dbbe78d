//! Liveness monitor.
//!
//! One task per connection. It sends a keepalive on a fixed period and exits
//! silently as soon as its token is cancelled, which happens whenever the
//! connection is replaced or closed. A keepalive that fails or goes unanswered closes the
//! connection, which in turn fails any command still running on it.

use super::{close_blocking, ConnectionState, Inner};
use crate::log::LogExt;
use std::sync::Weak;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub(super) async fn run(inner: Weak<Inner>, id: u64, token: CancellationToken, period: Duration) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!(connection = id, "liveness monitor stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        // Session dropped
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !keepalive(&inner, id, &token).await {
            return;
        }
    }
}

/// Returns false once this monitor should stop.
async fn keepalive(inner: &Inner, id: u64, token: &CancellationToken) -> bool {
    let mut slot = inner.slot.lock().await;

    // Superseded while waiting for the lock
    if token.is_cancelled() {
        return false;
    }
    let conn = match slot.as_ref() {
        Some(live) if live.id == id => live.conn.clone(),
        _ => return false,
    };

    // The transport bounds its own keepalive; this covers one that does not.
    let deadline = inner.timeouts.read + inner.timeouts.write;
    let request = tokio::task::spawn_blocking(move || conn.keepalive());
    let reason = match time::timeout(deadline, request).await {
        Ok(Ok(Ok(()))) => return true,
        Ok(Ok(Err(e))) => e.to_string(),
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("no keepalive reply within {}ms", deadline.as_millis()),
    };

    tracing::warn!(connection = id, "keepalive failed: {}", reason);
    if let Some(live) = slot.take() {
        live.monitor.cancel();
        close_blocking(live.conn).await;
    }
    inner.state.send_replace(ConnectionState::Disconnected);
    inner.log.line(format!("Connection lost: {reason}"));
    false
}
