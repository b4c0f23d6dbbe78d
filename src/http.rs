//! Shared HTTP client for the manifest, firmware downloads and device configs.

use crate::config::HttpConfig;
use std::time::Duration;

pub fn build_client(config: &HttpConfig) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_secs(config.timeout_secs))
        .danger_accept_invalid_certs(config.accept_invalid_certs)
        .build()
}
