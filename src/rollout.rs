//! Flashing pipeline and per-device config download.
//!
//! One `Rollout` serves one profile (gateway generation). The version strategy
//! comes from the profile; everything else is shared.

use crate::archive;
use crate::config::{is_valid_device_id, ConfigFormat, Profile};
use crate::crypto;
use crate::error::{ConfigFetchError, RolloutError, SyncError};
use crate::firmware::store::write_atomic;
use crate::firmware::{SyncReport, VersionSync};
use crate::session::DeviceSession;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What `package_firmware` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageOutcome {
    /// An archive from an earlier run was kept.
    Reused,
    Packed { sha256: String },
}

/// Holds an in-progress flag for as long as it lives.
pub(crate) struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    /// `None` when the flag is already set.
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Rollout {
    session: DeviceSession,
    client: reqwest::Client,
    profile: Arc<Profile>,
    sync: VersionSync,
    flashing: AtomicBool,
}

impl Rollout {
    pub fn new(session: DeviceSession, client: reqwest::Client, profile: Arc<Profile>) -> Self {
        let sync = VersionSync::new(client.clone(), profile.clone(), session.log().clone());
        Self {
            session,
            client,
            profile,
            sync,
            flashing: AtomicBool::new(false),
        }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn is_flashing(&self) -> bool {
        self.flashing.load(Ordering::Acquire)
    }

    pub async fn check_versions(&self) -> Result<SyncReport, SyncError> {
        let result = self.sync.check_versions().await;
        if let Err(e) = &result {
            self.session.append_log(format!("Version check failed: {e}"));
        }
        result
    }

    /// Build the firmware archive, or reuse the existing one unless `force`.
    pub async fn package_firmware(&self, force: bool) -> Result<PackageOutcome, RolloutError> {
        let archive_path = self.profile.archive.clone();
        self.session.append_log("Packaging firmware...");

        if force {
            match tokio::fs::remove_file(&archive_path).await {
                Ok(()) => self.session.append_log("Removed old archive, repackaging"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(RolloutError::PackagingFailed(e.to_string())),
            }
        }

        if tokio::fs::try_exists(&archive_path).await.unwrap_or(false) {
            self.session
                .append_log("Archive already exists, no need to package again");
            tokio::time::sleep(self.profile.package_settle()).await;
            return Ok(PackageOutcome::Reused);
        }

        let root = self.profile.package_root.clone();
        let dirs = self.profile.package_dirs.clone();
        let target = archive_path.clone();
        let sha256 = tokio::task::spawn_blocking(move || {
            archive::pack(&target, &root, &dirs)?;
            archive::sha256_file(&target)
        })
        .await
        .map_err(|e| RolloutError::PackagingFailed(e.to_string()))?
        .map_err(|e| RolloutError::PackagingFailed(e.to_string()))?;

        self.session.append_log(format!(
            "Packed {} (sha256 {})",
            archive_path.display(),
            sha256
        ));
        Ok(PackageOutcome::Packed { sha256 })
    }

    /// Package, push and install firmware on the connected device.
    ///
    /// Rejected while another flash runs. The in-progress flag is released on
    /// every exit path.
    pub async fn flash_firmware(&self, device_id: &str, force: bool) -> Result<(), RolloutError> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(RolloutError::MissingDeviceId);
        }
        if !is_valid_device_id(device_id) {
            return Err(RolloutError::InvalidDeviceId(device_id.to_string()));
        }

        let Some(_in_flight) = InFlight::acquire(&self.flashing) else {
            tracing::warn!(%device_id, "flash requested while another is running");
            self.session.append_log("A flash is already in progress!");
            return Err(RolloutError::AlreadyFlashing);
        };

        self.session.append_log(format!(
            "Flashing {device_id}, do not close the tool until it finishes"
        ));

        let result = self.flash_steps(device_id, force).await;
        match &result {
            Ok(()) => self.session.append_log("Flash succeeded!"),
            Err(e) => self.session.append_log(format!("Flash failed: {e}")),
        }
        result
    }

    async fn flash_steps(&self, device_id: &str, force: bool) -> Result<(), RolloutError> {
        let profile = &self.profile;
        let remote_dir = profile.remote_dir.trim_end_matches('/');

        // 1. Archive
        self.package_firmware(force).await?;
        self.session.append_log("Packaging done");

        // 2. Fresh remote scratch dir
        let dir = quote(remote_dir);
        self.session.run_and_wait(&format!("rm -rf {dir}")).await?;
        self.session.run_and_wait(&format!("mkdir -p {dir}")).await?;

        // 3. Payload
        let archive_name = file_name(&profile.archive)?;
        let script_name = file_name(&profile.install_script)?;
        self.session
            .transfer(&profile.archive, &format!("{remote_dir}/{archive_name}"))
            .await?;
        self.session
            .transfer(&profile.install_script, &format!("{remote_dir}/{script_name}"))
            .await?;

        // 4. Install
        self.session
            .run_and_wait(&format!(
                "cd {dir} && sh {} {}",
                quote(&script_name),
                quote(device_id)
            ))
            .await?;

        // 5. Device config; the device fetches it itself once online
        let config = profile.settings_file(device_id);
        match self
            .session
            .transfer(&config, &profile.remote_config_path)
            .await
        {
            Ok(()) => self.session.append_log("Initial config uploaded"),
            Err(e) => {
                tracing::warn!(%device_id, "config upload failed: {}", e);
                self.session
                    .append_log(format!("Initial config upload failed: {e}"));
                self.session.append_log(
                    "The device will fetch its config once it has network access",
                );
            }
        }

        Ok(())
    }

    /// Fetch the device's config document and store it under the settings
    /// directory. Returns the stored path.
    pub async fn download_config(&self, device_id: &str) -> Result<PathBuf, ConfigFetchError> {
        let result = self.fetch_config(device_id).await;
        if let Err(e) = &result {
            self.session
                .append_log(format!("Config download failed: {e}"));
        }
        result
    }

    async fn fetch_config(&self, device_id: &str) -> Result<PathBuf, ConfigFetchError> {
        if !is_valid_device_id(device_id) {
            return Err(ConfigFetchError::InvalidDeviceId(device_id.to_string()));
        }
        let profile = &self.profile;
        let url = format!("{}/{}", profile.config_url.trim_end_matches('/'), device_id);
        self.session
            .append_log(format!("Downloading config, request URL: {url}"));

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ConfigFetchError::HttpFailed(e.to_string()))?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(ConfigFetchError::BadStatus(response.status().as_u16()));
        }
        let body = response
            .text()
            .await
            .map_err(|e| ConfigFetchError::HttpFailed(e.to_string()))?;

        let envelope: ConfigEnvelope = serde_json::from_str(&body)
            .map_err(|e| ConfigFetchError::ParseFailed(e.to_string()))?;
        if envelope.success != 1 {
            return Err(ConfigFetchError::Rejected(envelope.msg));
        }

        let document = match profile.config_format {
            ConfigFormat::Raw => body,
            ConfigFormat::Payload => {
                let data = match envelope.data {
                    Some(serde_json::Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => {
                        return Err(ConfigFetchError::ParseFailed(
                            "response has no `data` field".to_string(),
                        ))
                    }
                };
                let plain = match envelope.encrypt.as_deref() {
                    Some(iv) if !iv.is_empty() => {
                        let key = crypto::derive_key(device_id, &profile.key_suffix);
                        crypto::decrypt(&data, &key, iv)?
                    }
                    _ => data,
                };
                self.log_summary(&plain);
                plain
            }
        };

        let path = profile.settings_file(device_id);
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, document.as_bytes()))
            .await
            .map_err(|e| ConfigFetchError::Store {
                path: path.clone(),
                source: io::Error::other(e.to_string()),
            })?
            .map_err(|source| ConfigFetchError::Store {
                path: path.clone(),
                source,
            })?;

        self.session
            .append_log(format!("Config saved to {}", path.display()));
        Ok(path)
    }

    /// Log broker endpoints and enabled apps. Credentials are left out.
    fn log_summary(&self, document: &str) {
        match serde_json::from_str::<DeviceSummary>(document) {
            Ok(summary) => match serde_json::to_string(&summary) {
                Ok(line) => self.session.append_log(line),
                Err(e) => tracing::warn!("config summary: {}", e),
            },
            Err(e) => {
                tracing::warn!("config payload is not the expected document: {}", e);
                self.session
                    .append_log(format!("Warning: could not summarize config: {e}"));
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigEnvelope {
    #[serde(default)]
    success: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    encrypt: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct DeviceSummary {
    erp: Broker,
    pro: Broker,
    app: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Broker {
    #[serde(skip_serializing_if = "String::is_empty")]
    url: String,
    mqtt_ip: String,
    mqtt_port: u16,
    tls: i64,
}

fn quote(s: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(s))
}

fn file_name(path: &Path) -> Result<String, RolloutError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| RolloutError::PackagingFailed(format!("{} has no file name", path.display())))
}
