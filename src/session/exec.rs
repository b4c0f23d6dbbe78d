//! Command execution and file transfer over the live connection.

use super::DeviceSession;
use crate::error::SessionError;
use crate::log::{LogExt, SharedLog};
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

enum Outcome {
    Exited(Result<i32, SessionError>),
    Cancelled,
}

impl DeviceSession {
    /// Run `command` on the device and return its combined output.
    ///
    /// Fails fast with `NotConnected` or `AlreadyRunning`; commands never
    /// queue. Every output line is forwarded to the log as it arrives.
    /// Cancelling `cancel` closes the channel and yields `Cancelled`.
    pub async fn run(&self, command: &str, cancel: &CancellationToken) -> Result<String, SessionError> {
        let (id, conn) = self.current().await.ok_or(SessionError::NotConnected)?;
        let _running = self
            .inner
            .command_lock
            .try_lock()
            .map_err(|_| SessionError::AlreadyRunning)?;

        self.append_log(format!("Executing: {command}"));

        let cmd = command.to_string();
        let opened = tokio::task::spawn_blocking(move || conn.exec(&cmd))
            .await
            .map_err(|e| SessionError::Task(e.to_string()))
            .and_then(|r| r);
        let mut process = match opened {
            Ok(p) => p,
            Err(e) => {
                if matches!(e, SessionError::SessionFailed(_)) {
                    self.demote(id, &e.to_string()).await;
                }
                return Err(e);
            }
        };

        let output = Arc::new(Mutex::new(String::new()));
        let abort = process.abort_handle();
        let readers = [
            spawn_line_reader(process.stdout(), self.log().clone(), output.clone()),
            spawn_line_reader(process.stderr(), self.log().clone(), output.clone()),
        ];
        let mut wait = tokio::task::spawn_blocking(move || process.wait());

        let outcome = tokio::select! {
            res = &mut wait => Outcome::Exited(
                res.map_err(|e| SessionError::Task(e.to_string())).and_then(|r| r),
            ),
            _ = cancel.cancelled() => {
                abort.abort();
                // Drain the wait task so it does not outlive the command
                if let Err(e) = (&mut wait).await {
                    tracing::warn!("wait task failed after cancel: {}", e);
                }
                Outcome::Cancelled
            }
        };

        // Readers end at EOF, or once the channel has been closed
        if !matches!(outcome, Outcome::Exited(Ok(_))) {
            abort.abort();
        }
        for reader in readers {
            if let Err(e) = reader.await {
                tracing::warn!("output reader failed: {}", e);
            }
        }

        match outcome {
            Outcome::Cancelled => {
                self.append_log(format!("Command cancelled: {command}"));
                Err(SessionError::Cancelled(command.to_string()))
            }
            Outcome::Exited(Ok(0)) => {
                let mut output = output.lock().unwrap_or_else(|e| e.into_inner());
                Ok(std::mem::take(&mut *output))
            }
            Outcome::Exited(Ok(status)) => Err(SessionError::RemoteNonZeroExit {
                command: command.to_string(),
                status,
            }),
            Outcome::Exited(Err(e)) => {
                if matches!(e, SessionError::SessionFailed(_)) {
                    self.demote(id, &e.to_string()).await;
                }
                Err(e)
            }
        }
    }

    /// `run` without an external cancellation signal.
    pub async fn run_and_wait(&self, command: &str) -> Result<String, SessionError> {
        self.run(command, &CancellationToken::new()).await
    }

    /// Copy one local file to `remote` on the device.
    pub async fn transfer(&self, local: impl AsRef<Path>, remote: &str) -> Result<(), SessionError> {
        let (_, conn) = self.current().await.ok_or(SessionError::NotConnected)?;

        let local = local.as_ref().to_path_buf();
        let src = local.clone();
        let dst = remote.to_string();
        tokio::task::spawn_blocking(move || conn.upload(&src, &dst))
            .await
            .map_err(|e| SessionError::Task(e.to_string()))??;

        self.append_log(format!("Uploaded {} -> {}", local.display(), remote));
        Ok(())
    }
}

/// Drain `reader` line by line on the blocking pool.
fn spawn_line_reader(
    reader: Box<dyn Read + Send>,
    log: SharedLog,
    output: Arc<Mutex<String>>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let line = text.trim_end_matches(['\n', '\r']);
                    log.line(line);
                    let mut out = output.lock().unwrap_or_else(|e| e.into_inner());
                    out.push_str(line);
                    out.push('\n');
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log.line(format!("Error reading output: {e}"));
                    break;
                }
            }
        }
    })
}
