use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the device connection and of commands run over it.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to reach {addr}: {source}")]
    DialFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("SSH handshake with {addr} failed: {reason}")]
    HandshakeFailed { addr: String, reason: String },

    #[error("Not connected to a device, connect first")]
    NotConnected,

    #[error("Another command is still running")]
    AlreadyRunning,

    #[error("Remote command exited with status {status}: {command}")]
    RemoteNonZeroExit { command: String, status: i32 },

    #[error("Command cancelled: {0}")]
    Cancelled(String),

    #[error("Failed to open remote channel: {0}")]
    SessionFailed(String),

    #[error("Failed to copy {local} to {remote}: {reason}")]
    CopyFailed {
        local: PathBuf,
        remote: String,
        reason: String,
    },

    #[error("Keepalive failed: {0}")]
    ProbeFailed(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

/// Failures of a version check pass.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Failed to fetch firmware manifest: {0}")]
    ManifestFetchFailed(String),

    #[error("Failed to download `{component}`: {reason}")]
    DownloadFailed { component: String, reason: String },

    #[error("Failed to extract `{component}`: {reason}")]
    ExtractFailed { component: String, reason: String },

    #[error("Failed to install `{component}`: {reason}")]
    InstallFailed { component: String, reason: String },

    #[error("Failed to read local version of `{component}`: {source}")]
    LocalVersion {
        component: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to prepare scratch directory: {0}")]
    Scratch(#[source] io::Error),
}

/// Failures of a device configuration download.
#[derive(Error, Debug)]
pub enum ConfigFetchError {
    #[error("Invalid device serial number: {0:?}")]
    InvalidDeviceId(String),

    #[error("Config request failed: {0}")]
    HttpFailed(String),

    #[error("Config request returned HTTP {0}")]
    BadStatus(u16),

    #[error("No configuration available for this device: {0}")]
    Rejected(String),

    #[error("Failed to decrypt config payload: {0}")]
    DecryptFailed(#[from] CryptoError),

    #[error("Malformed config response: {0}")]
    ParseFailed(String),

    #[error("Failed to store config at {path}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failures of the flashing pipeline.
#[derive(Error, Debug)]
pub enum RolloutError {
    #[error("Device serial number must not be empty")]
    MissingDeviceId,

    #[error("Invalid device serial number: {0:?}")]
    InvalidDeviceId(String),

    #[error("A flash is already in progress")]
    AlreadyFlashing,

    #[error("Failed to package firmware: {0}")]
    PackagingFailed(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Failures while applying device settings.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("A settings update is already in progress")]
    AlreadyUpdating,

    #[error("Both network ports must be configured together")]
    PartialNetwork,

    #[error("LAN port {0} needs an address and a netmask")]
    IncompleteLan(&'static str),

    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid base64 ciphertext: {0}")]
    Base64(String),

    #[error("IV must be 16 bytes, got {0}")]
    InvalidIv(usize),

    #[error("Ciphertext length {0} is not a multiple of the block size")]
    InvalidLength(usize),

    #[error("Invalid padding")]
    InvalidPadding,

    #[error("Plaintext is not valid UTF-8")]
    Utf8,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Unknown profile `{0}`")]
    UnknownProfile(String),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Errors seen through a `ToolHandle`.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool service has stopped")]
    Closed,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    ConfigFetch(#[from] ConfigFetchError),

    #[error(transparent)]
    Rollout(#[from] RolloutError),

    #[error(transparent)]
    Settings(#[from] SettingsError),
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
