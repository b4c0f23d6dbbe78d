//! Tool configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file (or no
//! file at all) yields a working setup for the two gateway generations.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub device: DeviceConfig,
    pub http: HttpConfig,
    pub default_profile: String,
    pub profiles: BTreeMap<String, Profile>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert("v2".to_string(), Profile::v2());
        profiles.insert("v3".to_string(), Profile::v3());
        Self {
            device: DeviceConfig::default(),
            http: HttpConfig::default(),
            default_profile: "v3".to_string(),
            profiles,
        }
    }
}

impl ToolConfig {
    /// Default config location (`~/.config/gwflash/config.toml` on Linux).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("gwflash").join("config.toml"))
    }

    /// Load from `path`, or from the default location when `path` is `None`.
    /// A missing default file is not an error; a missing explicit file is.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !explicit && !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: ToolConfig = toml::from_str(content)?;
        // Profiles named in the file replace the built-in one of the same name,
        // built-ins not mentioned stay available.
        for (name, profile) in ToolConfig::default().profiles {
            config.profiles.entry(name).or_insert(profile);
        }
        Ok(config)
    }

    pub fn profile(&self, name: Option<&str>) -> Result<&Profile, ConfigError> {
        let name = name.unwrap_or(&self.default_profile);
        self.profiles
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))
    }
}

/// SSH credentials and connection timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub username: String,
    pub password: String,
    pub port: u16,
    pub dial_timeout_ms: u64,
    /// Longest the device may stay silent, keepalive replies included.
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Keep below `read_timeout_ms`: keepalive replies are what keep a quiet
    /// command from looking like a stalled peer.
    pub keepalive_interval_ms: u64,
    /// Pause after tearing down a superseded connection.
    pub reconnect_grace_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            password: "root".to_string(),
            port: 22,
            dial_timeout_ms: 1_000,
            read_timeout_ms: 5_000,
            write_timeout_ms: 5_000,
            keepalive_interval_ms: 3_000,
            reconnect_grace_ms: 500,
        }
    }
}

impl DeviceConfig {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            dial: Duration::from_millis(self.dial_timeout_ms),
            read: Duration::from_millis(self.read_timeout_ms),
            write: Duration::from_millis(self.write_timeout_ms),
            keepalive: Duration::from_millis(self.keepalive_interval_ms),
            reconnect_grace: Duration::from_millis(self.reconnect_grace_ms),
        }
    }

    /// Append the configured SSH port to a bare host.
    pub fn address(&self, host: &str) -> String {
        if host.parse::<SocketAddr>().is_ok() {
            return host.to_string();
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return SocketAddr::new(ip, self.port).to_string();
        }
        // hostname:port
        if host
            .rsplit_once(':')
            .is_some_and(|(_, port)| port.parse::<u16>().is_ok())
        {
            return host.to_string();
        }
        format!("{}:{}", host, self.port)
    }
}

/// Resolved connection timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub dial: Duration,
    pub read: Duration,
    pub write: Duration,
    pub keepalive: Duration,
    pub reconnect_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        DeviceConfig::default().timeouts()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// The firmware portal serves a certificate that does not validate.
    pub accept_invalid_certs: bool,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            accept_invalid_certs: true,
            timeout_secs: 300,
            user_agent: format!("gwflash/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// How a generation records installed component versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// `<pattern>.version` holds the integer; archives unpack into the firmware dir.
    MarkerFile,
    /// The version is embedded in the binary name: `<pattern>_<version>_<suffix>`.
    VersionedBinary,
}

/// How the config endpoint wraps the device document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigFormat {
    /// Store the response body as-is.
    Raw,
    /// Store the `data` field, decrypting it when `encrypt` carries an IV.
    Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// Key in the manifest and name of the binary inside the release archive.
    pub name: String,
    /// Local naming pattern (marker file stem, or binary name prefix).
    pub pattern: String,
    /// Trailing part of a versioned binary name.
    #[serde(default)]
    pub suffix: String,
}

impl ComponentSpec {
    pub fn new(name: &str, pattern: &str, suffix: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            suffix: suffix.to_string(),
        }
    }
}

/// Paths, endpoints and strategies of one gateway generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub layout: Layout,
    pub manifest_url: String,
    pub config_url: String,
    pub config_format: ConfigFormat,
    /// Appended to the serial number before hashing into the payload key.
    #[serde(default)]
    pub key_suffix: String,
    /// Local firmware directory the version markers live in.
    pub firmware_dir: PathBuf,
    /// Scratch directories are created here; keep it on the same filesystem
    /// as `firmware_dir` so installs are plain renames.
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,
    pub components: Vec<ComponentSpec>,
    pub archive: PathBuf,
    /// `package_dirs` are relative to this directory.
    #[serde(default = "default_package_root")]
    pub package_root: PathBuf,
    pub package_dirs: Vec<PathBuf>,
    pub install_script: PathBuf,
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
    pub settings_dir: PathBuf,
    pub remote_config_path: String,
    #[serde(default = "default_settle_ms")]
    pub package_settle_ms: u64,
}

fn default_scratch_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_package_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_remote_dir() -> String {
    "/tmpcf".to_string()
}

fn default_settle_ms() -> u64 {
    3_000
}

impl Profile {
    pub fn v2() -> Self {
        Self {
            layout: Layout::MarkerFile,
            manifest_url: "https://erp.2cifang.cn/api/api/box/pkg?sn=star800".to_string(),
            config_url: "http://box.2cifang.cn/boxinit".to_string(),
            config_format: ConfigFormat::Raw,
            key_suffix: String::new(),
            firmware_dir: PathBuf::from("v2_install"),
            scratch_root: default_scratch_root(),
            components: vec![ComponentSpec::new("cgBox", "cgBox", "")],
            archive: PathBuf::from("v2_init.tar.gz"),
            package_root: default_package_root(),
            package_dirs: vec![PathBuf::from("v2_install"), PathBuf::from("share")],
            install_script: PathBuf::from("v2_install.sh"),
            remote_dir: default_remote_dir(),
            settings_dir: PathBuf::from("setting/v2"),
            remote_config_path: "/datas/cf_go_v2/data/init/setting.json".to_string(),
            package_settle_ms: default_settle_ms(),
        }
    }

    pub fn v3() -> Self {
        Self {
            layout: Layout::VersionedBinary,
            manifest_url: "https://erp.2cifang.cn/api/api/box/pkg?sn=arm7v3".to_string(),
            config_url: "https://erp.2cifang.cn/api/box/erp".to_string(),
            config_format: ConfigFormat::Payload,
            key_suffix: "2cifang".to_string(),
            firmware_dir: PathBuf::from("v3_install/bin"),
            scratch_root: default_scratch_root(),
            components: vec![
                ComponentSpec::new("cgManager", "cgManager_main", "app"),
                ComponentSpec::new("cgService", "cgService", "parent"),
                ComponentSpec::new("cgProtocol", "cgProtocol", "parent"),
            ],
            archive: PathBuf::from("v3_init.tar.gz"),
            package_root: default_package_root(),
            package_dirs: vec![PathBuf::from("v3_install"), PathBuf::from("share")],
            install_script: PathBuf::from("v3_install.sh"),
            remote_dir: default_remote_dir(),
            settings_dir: PathBuf::from("setting/v3"),
            remote_config_path: "/datas/cf_go_v3/data/cache/settings.json".to_string(),
            package_settle_ms: default_settle_ms(),
        }
    }

    pub fn package_settle(&self) -> Duration {
        Duration::from_millis(self.package_settle_ms)
    }

    /// Local path of the persisted config for a device.
    ///
    /// Callers check the id with [`is_valid_device_id`] first.
    pub fn settings_file(&self, device_id: &str) -> PathBuf {
        self.settings_dir.join(format!("{device_id}.json"))
    }
}

/// A device id names a file under the settings directory, so it must be a
/// single plain path component.
pub fn is_valid_device_id(device_id: &str) -> bool {
    !device_id.is_empty()
        && device_id != "."
        && !device_id.contains("..")
        && !device_id
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
}
