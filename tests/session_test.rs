mod common;

#[cfg(test)]
mod tests {
    use super::common::{session, Reply};
    use gwflash::{ConnectionState, SessionError};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_reconnect_keeps_one_live_connection() -> anyhow::Result<()> {
        let (session, device, log) = session();

        session.connect("10.0.0.1:22").await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
        session.connect("10.0.0.1:22").await?;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(device.state.connects.load(Ordering::SeqCst), 2);
        assert_eq!(device.state.live.load(Ordering::SeqCst), 1);
        assert!(session.is_connected());
        assert!(log.contains("Closed previous connection to 10.0.0.1:22"));

        // The surviving connection is usable
        let out = session.run_and_wait("uname").await?;
        assert_eq!(out, "");
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_dial_leaves_disconnected() {
        let (session, device, _log) = session();
        device.state.fail_dial.store(true, Ordering::SeqCst);

        let err = session.connect("10.0.0.1:22").await.unwrap_err();
        assert!(matches!(err, SessionError::DialFailed { .. }));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(device.state.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_without_connection() {
        let (session, device, _log) = session();

        let err = session.run_and_wait("ls").await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
        assert!(device.state.commands().is_empty());

        let err = session.transfer("Cargo.toml", "/tmp/x").await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
    }

    #[tokio::test]
    async fn test_output_is_collected_and_logged() -> anyhow::Result<()> {
        let (session, device, log) = session();
        device.state.reply(
            "cat",
            Reply {
                stdout: "line one\r\nline two\n".to_string(),
                stderr: "warning: x\n".to_string(),
                ..Default::default()
            },
        );
        session.connect("10.0.0.1:22").await?;

        let out = session.run_and_wait("cat /etc/version").await?;
        let mut lines: Vec<&str> = out.lines().collect();
        lines.sort();
        assert_eq!(lines, vec!["line one", "line two", "warning: x"]);

        assert!(log.contains("Executing: cat /etc/version"));
        let messages = log.messages();
        let one = messages.iter().position(|m| m == "line one").unwrap();
        let two = messages.iter().position(|m| m == "line two").unwrap();
        assert!(one < two);
        assert!(log.contains("warning: x"));
        Ok(())
    }

    #[tokio::test]
    async fn test_second_command_is_rejected_while_running() -> anyhow::Result<()> {
        let (session, device, _log) = session();
        device.state.reply(
            "long",
            Reply {
                stdout: "done\n".to_string(),
                delay: Duration::from_millis(300),
                ..Default::default()
            },
        );
        session.connect("10.0.0.1:22").await?;

        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.run_and_wait("long task").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = session.run_and_wait("short").await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyRunning));

        let out = first.await??;
        assert_eq!(out, "done\n");
        assert_eq!(device.state.commands(), vec!["long task"]);

        // Free again afterwards
        session.run_and_wait("short").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_non_zero_exit_keeps_connection() -> anyhow::Result<()> {
        let (session, device, _log) = session();
        device.state.reply("false", Reply::status(2));
        session.connect("10.0.0.1:22").await?;

        match session.run_and_wait("false").await {
            Err(SessionError::RemoteNonZeroExit { command, status }) => {
                assert_eq!(command, "false");
                assert_eq!(status, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(session.is_connected());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_in_flight_command() -> anyhow::Result<()> {
        let (session, device, log) = session();
        device.state.reply("tail -f", Reply::hanging());
        session.connect("10.0.0.1:22").await?;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = session
            .run("tail -f /var/log/messages", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Cancelled(_)));
        assert!(log.contains("Command cancelled"));

        // The command slot is released and the connection survives
        assert!(session.is_connected());
        session.run_and_wait("echo ok").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_broken_channel_demotes_connection() -> anyhow::Result<()> {
        let (session, device, _log) = session();
        session.connect("10.0.0.1:22").await?;
        device.state.fail_exec.store(true, Ordering::SeqCst);

        let err = session.run_and_wait("ls").await.unwrap_err();
        assert!(matches!(err, SessionError::SessionFailed(_)));
        assert!(!session.is_connected());
        assert_eq!(device.state.live.load(Ordering::SeqCst), 0);

        let err = session.run_and_wait("ls").await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
        Ok(())
    }

    #[tokio::test]
    async fn test_keepalive_failure_disconnects_once() -> anyhow::Result<()> {
        let (session, device, log) = session();
        let mut states = session.subscribe();
        session.connect("10.0.0.1:22").await?;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(device.state.keepalives.load(Ordering::SeqCst) >= 1);
        assert!(session.is_connected());

        device.state.fail_keepalive.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(2), async {
            while *states.borrow_and_update() != ConnectionState::Disconnected {
                states.changed().await.unwrap();
            }
        })
        .await?;
        assert!(!session.is_connected());

        // No keepalives after the monitor stopped
        let sent = device.state.keepalives.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(device.state.keepalives.load(Ordering::SeqCst), sent);

        let lost = log
            .messages()
            .iter()
            .filter(|m| m.starts_with("Connection lost"))
            .count();
        assert_eq!(lost, 1);
        assert_eq!(device.state.live.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_superseded_monitor_stops_probing() -> anyhow::Result<()> {
        let (session, device, _log) = session();
        session.connect("10.0.0.1:22").await?;
        session.disconnect().await;
        // Idempotent
        session.disconnect().await;

        let sent = device.state.keepalives.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(device.state.keepalives.load(Ordering::SeqCst), sent);
        assert_eq!(session.state(), ConnectionState::Disconnected);
        Ok(())
    }

    #[tokio::test]
    async fn test_transfer_logs_both_paths() -> anyhow::Result<()> {
        let (session, device, log) = session();
        let dir = tempfile::TempDir::new()?;
        let local = dir.path().join("fw.tar.gz");
        std::fs::write(&local, b"payload")?;
        session.connect("10.0.0.1:22").await?;

        session.transfer(&local, "/tmpcf/fw.tar.gz").await?;
        assert_eq!(
            device.state.uploads(),
            vec![(local.clone(), "/tmpcf/fw.tar.gz".to_string())]
        );
        assert!(log.contains(&format!("Uploaded {} -> /tmpcf/fw.tar.gz", local.display())));

        let err = session
            .transfer(dir.path().join("missing"), "/tmpcf/x")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::CopyFailed { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_disconnect_fails_running_command() -> anyhow::Result<()> {
        let (session, device, _log) = session();
        device.state.reply("tail -f", Reply::hanging());
        session.connect("10.0.0.1:22").await?;

        let running = {
            let session = session.clone();
            tokio::spawn(async move { session.run_and_wait("tail -f /var/log/messages").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        session.disconnect().await;

        let err = tokio::time::timeout(Duration::from_secs(2), running)
            .await??
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionFailed(_)), "{err}");

        let err = session.run_and_wait("ls").await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
        Ok(())
    }

    #[tokio::test]
    async fn test_stalled_peer_is_dropped_mid_command() -> anyhow::Result<()> {
        let (session, device, log) = session();
        device.state.reply("reboot", Reply::hanging());
        let mut states = session.subscribe();
        session.connect("10.0.0.1:22").await?;

        let running = {
            let session = session.clone();
            tokio::spawn(async move { session.run_and_wait("reboot").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Keepalives stop being answered, nothing else changes
        device.state.stall_keepalive.store(true, Ordering::SeqCst);

        let err = tokio::time::timeout(Duration::from_secs(3), running)
            .await??
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionFailed(_)), "{err}");

        assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);
        assert!(!session.is_connected());
        assert!(log
            .messages()
            .iter()
            .any(|m| m.starts_with("Connection lost: no keepalive reply")));
        assert_eq!(device.state.live.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_link_reset_mid_command_demotes() -> anyhow::Result<()> {
        let (session, device, log) = session();
        device.state.reply("reboot", Reply::reset("going down\n"));
        session.connect("10.0.0.1:22").await?;

        let err = tokio::time::timeout(Duration::from_secs(2), session.run_and_wait("reboot"))
            .await?
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionFailed(_)), "{err}");
        assert!(log.contains("going down"));
        assert!(log.contains("Connection dropped: "));
        assert!(!session.is_connected());
        assert_eq!(device.state.live.load(Ordering::SeqCst), 0);
        Ok(())
    }
}
