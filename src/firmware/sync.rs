//! Version check pass: manifest vs local store, then download, extract and
//! install whatever differs.

use super::manifest::fetch_manifest;
use super::store::{store_for, VersionStore};
use crate::archive;
use crate::config::Profile;
use crate::error::SyncError;
use crate::log::{LogExt, SharedLog};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Result for one component of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentOutcome {
    pub name: String,
    pub local: i64,
    pub remote: i64,
    pub updated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub components: Vec<ComponentOutcome>,
    /// Configured components the manifest did not list.
    pub missing: Vec<String>,
}

impl SyncReport {
    pub fn updated(&self) -> impl Iterator<Item = &ComponentOutcome> {
        self.components.iter().filter(|c| c.updated)
    }

    pub fn is_up_to_date(&self) -> bool {
        self.updated().next().is_none()
    }
}

/// Keeps one profile's local firmware tree in step with the manifest.
pub struct VersionSync {
    client: reqwest::Client,
    profile: Arc<Profile>,
    store: Arc<dyn VersionStore>,
    log: SharedLog,
}

impl VersionSync {
    pub fn new(client: reqwest::Client, profile: Arc<Profile>, log: SharedLog) -> Self {
        let store = store_for(&profile);
        Self::with_store(client, profile, store, log)
    }

    pub fn with_store(
        client: reqwest::Client,
        profile: Arc<Profile>,
        store: Arc<dyn VersionStore>,
        log: SharedLog,
    ) -> Self {
        Self {
            client,
            profile,
            store,
            log,
        }
    }

    /// Run one pass. The first failing component ends the pass; the scratch
    /// directory is removed however it ends.
    pub async fn check_versions(&self) -> Result<SyncReport, SyncError> {
        tokio::fs::create_dir_all(&self.profile.scratch_root)
            .await
            .map_err(SyncError::Scratch)?;
        let scratch = tempfile::Builder::new()
            .prefix(".gwflash-")
            .tempdir_in(&self.profile.scratch_root)
            .map_err(SyncError::Scratch)?;

        let manifest = fetch_manifest(&self.client, &self.profile.manifest_url).await?;

        let mut report = SyncReport::default();
        for component in &self.profile.components {
            let Some(entry) = manifest.entry(&component.name) else {
                tracing::warn!(component = %component.name, "not listed in manifest");
                self.log
                    .line(format!("`{}` is missing from the manifest, skipped", component.name));
                report.missing.push(component.name.clone());
                continue;
            };

            let store = self.store.clone();
            let spec = component.clone();
            let local = tokio::task::spawn_blocking(move || store.local_version(&spec))
                .await
                .map_err(|e| SyncError::LocalVersion {
                    component: component.name.clone(),
                    source: std::io::Error::other(e.to_string()),
                })??;
            let local = match local {
                Some(v) => v,
                None => {
                    self.log
                        .line(format!("No local version recorded for `{}`", component.name));
                    0
                }
            };

            if local == entry.version {
                self.log
                    .line(format!("`{}` is up to date: {}", component.name, local));
                report.components.push(ComponentOutcome {
                    name: component.name.clone(),
                    local,
                    remote: entry.version,
                    updated: false,
                });
                continue;
            }

            self.log.line(format!(
                "`{}` new version available: {} -> {}",
                component.name, local, entry.version
            ));

            let archive_path = scratch
                .path()
                .join(format!("{}-{}.tar.gz", component.name, entry.version));
            download(&self.client, &component.name, &entry.url, &archive_path).await?;

            let extract_dir = scratch.path().join(&component.name);
            extract(&component.name, &archive_path, &extract_dir).await?;

            let store = self.store.clone();
            let spec = component.clone();
            let remote = entry.version;
            let dir = extract_dir.clone();
            tokio::task::spawn_blocking(move || store.install(&spec, &dir, local, remote))
                .await
                .map_err(|e| SyncError::InstallFailed {
                    component: component.name.clone(),
                    reason: e.to_string(),
                })??;

            self.log.line(format!("`{}` upgraded to {}", component.name, remote));
            report.components.push(ComponentOutcome {
                name: component.name.clone(),
                local,
                remote,
                updated: true,
            });
        }

        if let Err(e) = scratch.close() {
            tracing::warn!("failed to remove scratch directory: {}", e);
        }
        Ok(report)
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }
}

/// Stream `url` into `dest`.
pub async fn download(
    client: &reqwest::Client,
    component: &str,
    url: &str,
    dest: &Path,
) -> Result<u64, SyncError> {
    let download_err = |reason: String| SyncError::DownloadFailed {
        component: component.to_string(),
        reason,
    };

    tracing::debug!(%url, dest = %dest.display(), "downloading");
    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|e| download_err(format!("Request failed: {e}")))?;

    if !response.status().is_success() {
        return Err(download_err(format!("HTTP {}", response.status())));
    }

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| download_err(e.to_string()))?;
    let mut written = 0u64;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| download_err(format!("Failed to read body: {e}")))?
    {
        file.write_all(&chunk)
            .await
            .map_err(|e| download_err(e.to_string()))?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| download_err(e.to_string()))?;

    Ok(written)
}

/// Unpack a downloaded release into `dest` on the blocking pool.
pub async fn extract(component: &str, archive_path: &Path, dest: &Path) -> Result<PathBuf, SyncError> {
    let extract_err = |reason: String| SyncError::ExtractFailed {
        component: component.to_string(),
        reason,
    };

    let src = archive_path.to_path_buf();
    let out = dest.to_path_buf();
    tokio::task::spawn_blocking(move || archive::unpack(&src, &out))
        .await
        .map_err(|e| extract_err(e.to_string()))?
        .map_err(|e| extract_err(e.to_string()))?;
    Ok(dest.to_path_buf())
}
