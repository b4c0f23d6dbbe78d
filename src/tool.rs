//! The capability surface front ends talk to.
//!
//! [`Toolkit`] is the direct API. [`ToolHandle`] offers the same operations by
//! message passing: each call becomes a [`Request`] on an mpsc channel and the
//! answer comes back on a oneshot. Requests are served concurrently, so the
//! in-progress guards of the session and the pipelines still apply.

use crate::config::{DeviceConfig, Profile, ToolConfig};
use crate::error::{
    ConfigError, ConfigFetchError, RolloutError, SessionError, SettingsError, SyncError, ToolError,
};
use crate::firmware::SyncReport;
use crate::http;
use crate::log::SharedLog;
use crate::rollout::Rollout;
use crate::session::{ConnectionState, DeviceSession};
use crate::settings::{DeviceSettings, SettingsRequest};
use crate::transport::Connector;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const REQUEST_QUEUE: usize = 32;

pub struct Toolkit {
    device: DeviceConfig,
    session: DeviceSession,
    rollout: Rollout,
    settings: DeviceSettings,
}

impl Toolkit {
    /// Build a toolkit for `profile` (or the configured default).
    pub fn new(
        config: &ToolConfig,
        profile: Option<&str>,
        connector: Arc<dyn Connector>,
        log: SharedLog,
    ) -> Result<Self, ConfigError> {
        let profile = Arc::new(config.profile(profile)?.clone());
        let client =
            http::build_client(&config.http).map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        let session = DeviceSession::new(connector, config.device.timeouts(), log);
        Ok(Self::from_parts(config.device.clone(), session, client, profile))
    }

    pub fn from_parts(
        device: DeviceConfig,
        session: DeviceSession,
        client: reqwest::Client,
        profile: Arc<Profile>,
    ) -> Self {
        Self {
            device,
            rollout: Rollout::new(session.clone(), client, profile),
            settings: DeviceSettings::new(session.clone()),
            session,
        }
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn rollout(&self) -> &Rollout {
        &self.rollout
    }

    /// `host` may omit the port; the configured SSH port is used then.
    pub async fn connect(&self, host: &str) -> Result<(), SessionError> {
        let result = self.session.connect(&self.device.address(host)).await;
        if let Err(e) = &result {
            self.session.append_log(format!("Connect failed: {e}"));
        }
        result
    }

    pub async fn disconnect(&self) {
        self.session.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.session.subscribe()
    }

    pub fn append_log(&self, line: impl Into<String>) {
        self.session.append_log(line)
    }

    pub async fn run_command(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<String, SessionError> {
        let result = self.session.run(command, cancel).await;
        if let Err(e) = &result {
            self.session.append_log(format!("Command failed: {e}"));
        }
        result
    }

    pub async fn upload_file(&self, local: PathBuf, remote: &str) -> Result<(), SessionError> {
        let result = self.session.transfer(&local, remote).await;
        if let Err(e) = &result {
            self.session.append_log(format!("Upload failed: {e}"));
        }
        result
    }

    pub async fn check_versions(&self) -> Result<SyncReport, SyncError> {
        self.rollout.check_versions().await
    }

    pub async fn download_config(&self, device_id: &str) -> Result<PathBuf, ConfigFetchError> {
        self.rollout.download_config(device_id).await
    }

    pub async fn flash_firmware(&self, device_id: &str, force: bool) -> Result<(), RolloutError> {
        self.rollout.flash_firmware(device_id, force).await
    }

    pub async fn apply_settings(&self, request: &SettingsRequest) -> Result<(), SettingsError> {
        self.settings.apply(request).await
    }

    async fn handle(&self, request: Request) {
        // A dropped reply receiver just means the caller stopped waiting
        match request {
            Request::Connect { host, reply } => {
                let _ = reply.send(self.connect(&host).await);
            }
            Request::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Request::RunCommand {
                command,
                cancel,
                reply,
            } => {
                let _ = reply.send(self.run_command(&command, &cancel).await);
            }
            Request::UploadFile {
                local,
                remote,
                reply,
            } => {
                let _ = reply.send(self.upload_file(local, &remote).await);
            }
            Request::AppendLog { line } => self.append_log(line),
            Request::CheckVersions { reply } => {
                let _ = reply.send(self.check_versions().await);
            }
            Request::DownloadConfig { device_id, reply } => {
                let _ = reply.send(self.download_config(&device_id).await);
            }
            Request::FlashFirmware {
                device_id,
                force,
                reply,
            } => {
                let _ = reply.send(self.flash_firmware(&device_id, force).await);
            }
            Request::ApplySettings { request, reply } => {
                let _ = reply.send(self.apply_settings(&request).await);
            }
        }
    }
}

type Reply<T, E> = oneshot::Sender<Result<T, E>>;

/// One call on the capability surface.
pub enum Request {
    Connect {
        host: String,
        reply: Reply<(), SessionError>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    RunCommand {
        command: String,
        cancel: CancellationToken,
        reply: Reply<String, SessionError>,
    },
    UploadFile {
        local: PathBuf,
        remote: String,
        reply: Reply<(), SessionError>,
    },
    AppendLog {
        line: String,
    },
    CheckVersions {
        reply: Reply<SyncReport, SyncError>,
    },
    DownloadConfig {
        device_id: String,
        reply: Reply<PathBuf, ConfigFetchError>,
    },
    FlashFirmware {
        device_id: String,
        force: bool,
        reply: Reply<(), RolloutError>,
    },
    ApplySettings {
        request: SettingsRequest,
        reply: Reply<(), SettingsError>,
    },
}

/// Cloneable sender side of the request loop.
#[derive(Clone)]
pub struct ToolHandle {
    tx: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionState>,
}

impl ToolHandle {
    /// Start the request loop. It ends once every handle is dropped.
    pub fn spawn(toolkit: Arc<Toolkit>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let state = toolkit.subscribe();
        let task = tokio::spawn(serve(toolkit, rx));
        (Self { tx, state }, task)
    }

    pub async fn connect(&self, host: &str) -> Result<(), ToolError> {
        self.call(|reply| Request::Connect {
            host: host.to_string(),
            reply,
        })
        .await?
        .map_err(Into::into)
    }

    pub async fn disconnect(&self) -> Result<(), ToolError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Disconnect { reply }).await?;
        rx.await.map_err(|_| ToolError::Closed)
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn run_command(
        &self,
        command: &str,
        cancel: CancellationToken,
    ) -> Result<String, ToolError> {
        self.call(|reply| Request::RunCommand {
            command: command.to_string(),
            cancel,
            reply,
        })
        .await?
        .map_err(Into::into)
    }

    pub async fn upload_file(&self, local: impl Into<PathBuf>, remote: &str) -> Result<(), ToolError> {
        let local = local.into();
        self.call(|reply| Request::UploadFile {
            local,
            remote: remote.to_string(),
            reply,
        })
        .await?
        .map_err(Into::into)
    }

    pub async fn append_log(&self, line: impl Into<String>) -> Result<(), ToolError> {
        self.send(Request::AppendLog { line: line.into() }).await
    }

    pub async fn check_versions(&self) -> Result<SyncReport, ToolError> {
        self.call(|reply| Request::CheckVersions { reply })
            .await?
            .map_err(Into::into)
    }

    pub async fn download_config(&self, device_id: &str) -> Result<PathBuf, ToolError> {
        self.call(|reply| Request::DownloadConfig {
            device_id: device_id.to_string(),
            reply,
        })
        .await?
        .map_err(Into::into)
    }

    pub async fn flash_firmware(&self, device_id: &str, force: bool) -> Result<(), ToolError> {
        self.call(|reply| Request::FlashFirmware {
            device_id: device_id.to_string(),
            force,
            reply,
        })
        .await?
        .map_err(Into::into)
    }

    pub async fn apply_settings(&self, request: SettingsRequest) -> Result<(), ToolError> {
        self.call(|reply| Request::ApplySettings { request, reply })
            .await?
            .map_err(Into::into)
    }

    async fn send(&self, request: Request) -> Result<(), ToolError> {
        self.tx.send(request).await.map_err(|_| ToolError::Closed)
    }

    async fn call<T, E>(
        &self,
        build: impl FnOnce(Reply<T, E>) -> Request,
    ) -> Result<Result<T, E>, ToolError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| ToolError::Closed)
    }
}

async fn serve(toolkit: Arc<Toolkit>, mut rx: mpsc::Receiver<Request>) {
    while let Some(request) = rx.recv().await {
        let toolkit = toolkit.clone();
        tokio::spawn(async move { toolkit.handle(request).await });
    }
    tracing::debug!("tool request loop finished");
}
