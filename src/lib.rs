//! gwflash - provisioning and firmware rollout for embedded gateways.
//!
//! ```text
//!   Toolkit / ToolHandle
//!     |-- DeviceSession ----- transport (ssh2) ---> device
//!     |     run / transfer / liveness monitor
//!     |-- Rollout
//!     |     package -> push -> install -> upload config
//!     |     VersionSync: manifest -> download -> extract -> install
//!     +-- DeviceSettings: clock, network, reboot
//! ```

pub mod archive;
pub mod config;
pub mod crypto;
pub mod error;
pub mod firmware;
pub mod http;
pub mod log;
pub mod rollout;
pub mod session;
pub mod settings;
pub mod tool;
pub mod transport;

pub use config::{Profile, ToolConfig};
pub use error::{
    ConfigError, ConfigFetchError, CryptoError, RolloutError, SessionError, SettingsError,
    SyncError, ToolError,
};
pub use log::{ConsoleLog, LogLine, LogSink, MemoryLog, SharedLog};
pub use rollout::{PackageOutcome, Rollout};
pub use session::{ConnectionState, DeviceSession};
pub use settings::{DeviceSettings, NetPort, SettingsRequest};
pub use tool::{ToolHandle, Toolkit};
