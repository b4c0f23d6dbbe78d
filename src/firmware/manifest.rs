//! Remote firmware manifest.
//!
//! ```json
//! {"success": 1, "data": {"cgService": {"url": "https://...", "version": 7}}}
//! ```

use crate::error::SyncError;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    /// Not checked; the service sends `data` regardless.
    #[serde(default)]
    pub success: i64,
    #[serde(default)]
    pub data: HashMap<String, ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestEntry {
    pub url: String,
    pub version: i64,
}

impl Manifest {
    pub fn parse(body: &str) -> Result<Self, SyncError> {
        serde_json::from_str(body).map_err(|e| SyncError::ManifestFetchFailed(e.to_string()))
    }

    /// Look up a component by name. The portal is not consistent about key
    /// casing (`cgBox` vs `CgBox`), so an exact match wins and a
    /// case-insensitive one is the fallback.
    pub fn entry(&self, component: &str) -> Option<&ManifestEntry> {
        self.data.get(component).or_else(|| {
            self.data
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(component))
                .map(|(_, v)| v)
        })
    }
}

pub async fn fetch_manifest(client: &reqwest::Client, url: &str) -> Result<Manifest, SyncError> {
    tracing::debug!(%url, "fetching manifest");
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| SyncError::ManifestFetchFailed(format!("Request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(SyncError::ManifestFetchFailed(format!("HTTP {status}")));
    }

    let body = response
        .text()
        .await
        .map_err(|e| SyncError::ManifestFetchFailed(format!("Failed to read response: {e}")))?;
    Manifest::parse(&body)
}
