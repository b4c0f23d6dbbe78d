//! Per-operation deadlines for the SSH transport.
//!
//! libssh2 reads and writes the socket fd itself in non-blocking mode, so
//! timeouts set on the `TcpStream` are never consulted. Instead every libssh2
//! call blocks for at most one short poll slice, and [`Link::attempt`] retries
//! it until the operation's deadline runs out. The deadline is re-armed for
//! every read and every write.
//!
//! A `Link` also records when the peer last answered. The keepalive is a
//! round trip every keepalive period, so a reader that has heard nothing for a
//! whole read timeout is looking at a stalled peer, not a quiet command.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Why a deadline-bounded operation did not complete.
#[derive(Debug)]
pub enum OpError<E> {
    /// The operation itself failed.
    Failed(E),
    /// No result before the deadline.
    TimedOut(Duration),
    /// The link was closed locally.
    Closed,
}

impl<E: fmt::Display> fmt::Display for OpError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::Failed(e) => write!(f, "{e}"),
            OpError::TimedOut(after) => write!(f, "no response within {}ms", after.as_millis()),
            OpError::Closed => f.write_str("connection closed"),
        }
    }
}

/// Shared state of one connection: deadlines, closed flag, last activity.
#[derive(Debug)]
pub struct Link {
    epoch: Instant,
    last_heard_ms: AtomicU64,
    closed: AtomicBool,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Link {
    pub fn new(read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            last_heard_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            read_timeout,
            write_timeout,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Record that the peer just answered.
    pub fn heard(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_heard_ms.fetch_max(now, Ordering::AcqRel);
    }

    /// Time since the peer last answered.
    pub fn silent_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_heard_ms.load(Ordering::Acquire));
        self.epoch.elapsed().saturating_sub(last)
    }

    /// Mark the link closed. Returns true for the first caller only.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// [`attempt`](Self::attempt) bounded by the read timeout.
    pub fn read<T, E>(
        &self,
        retryable: impl Fn(&E) -> bool,
        op: impl FnMut() -> Result<T, E>,
    ) -> Result<T, OpError<E>> {
        self.attempt(self.read_timeout, retryable, op)
    }

    /// [`attempt`](Self::attempt) bounded by the write timeout.
    pub fn write<T, E>(
        &self,
        retryable: impl Fn(&E) -> bool,
        op: impl FnMut() -> Result<T, E>,
    ) -> Result<T, OpError<E>> {
        self.attempt(self.write_timeout, retryable, op)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, the link
    /// is closed, or `deadline` has passed since the first try.
    pub fn attempt<T, E>(
        &self,
        deadline: Duration,
        retryable: impl Fn(&E) -> bool,
        mut op: impl FnMut() -> Result<T, E>,
    ) -> Result<T, OpError<E>> {
        let started = Instant::now();
        loop {
            if self.is_closed() {
                return Err(OpError::Closed);
            }
            match op() {
                Ok(value) => {
                    self.heard();
                    return Ok(value);
                }
                Err(e) if retryable(&e) => {
                    if started.elapsed() >= deadline {
                        return Err(OpError::TimedOut(deadline));
                    }
                    thread::yield_now();
                }
                Err(e) => return Err(OpError::Failed(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug, PartialEq)]
    enum Fake {
        Slice,
        Broken,
    }

    fn link() -> Link {
        Link::new(Duration::from_millis(100), Duration::from_millis(100))
    }

    #[test]
    fn test_retries_through_slices() {
        let link = link();
        let tries = Cell::new(0);
        let got = link.read(
            |e: &Fake| *e == Fake::Slice,
            || {
                tries.set(tries.get() + 1);
                if tries.get() < 3 {
                    Err(Fake::Slice)
                } else {
                    Ok(7)
                }
            },
        );
        assert_eq!(got.unwrap(), 7);
        assert_eq!(tries.get(), 3);
    }

    #[test]
    fn test_deadline_expires() {
        let link = link();
        let start = Instant::now();
        let err = link
            .write(|e: &Fake| *e == Fake::Slice, || Err::<(), _>(Fake::Slice))
            .unwrap_err();
        assert!(matches!(err, OpError::TimedOut(d) if d == Duration::from_millis(100)));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_hard_failure_is_not_retried() {
        let link = link();
        let tries = Cell::new(0);
        let err = link
            .read(
                |e: &Fake| *e == Fake::Slice,
                || {
                    tries.set(tries.get() + 1);
                    Err::<(), _>(Fake::Broken)
                },
            )
            .unwrap_err();
        assert!(matches!(err, OpError::Failed(Fake::Broken)));
        assert_eq!(tries.get(), 1);
    }

    #[test]
    fn test_closed_link_refuses_work() {
        let link = link();
        assert!(link.close());
        assert!(!link.close());

        let err = link.read(|_: &Fake| true, || Ok::<_, Fake>(1)).unwrap_err();
        assert!(matches!(err, OpError::Closed));
        assert_eq!(OpError::<String>::Closed.to_string(), "connection closed");
    }

    #[test]
    fn test_success_resets_silence() {
        let link = link();
        thread::sleep(Duration::from_millis(30));
        assert!(link.silent_for() >= Duration::from_millis(30));

        link.read(|_: &Fake| false, || Ok::<_, Fake>(())).unwrap();
        assert!(link.silent_for() < Duration::from_millis(30));
    }
}
