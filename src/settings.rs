//! Device clock and network settings.
//!
//! Network changes rewrite `/etc/network/interfaces` and reboot the device,
//! which drops the connection.

use crate::error::{SessionError, SettingsError};
use crate::rollout::InFlight;
use crate::session::DeviceSession;
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

pub const INTERFACES_PATH: &str = "/etc/network/interfaces";

/// Role of one ethernet port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetPort {
    /// DHCP client.
    Wan,
    /// Static address.
    Lan {
        address: String,
        netmask: String,
        gateway: Option<String>,
    },
}

impl NetPort {
    fn validate(&self, port: &'static str) -> Result<(), SettingsError> {
        match self {
            NetPort::Wan => Ok(()),
            NetPort::Lan {
                address, netmask, ..
            } => {
                if address.trim().is_empty() || netmask.trim().is_empty() {
                    Err(SettingsError::IncompleteLan(port))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// `/etc/network/interfaces` stanza for `iface`.
    pub fn stanza(&self, iface: &str) -> String {
        match self {
            NetPort::Wan => format!("auto {iface}\niface {iface} inet dhcp"),
            NetPort::Lan {
                address,
                netmask,
                gateway,
            } => {
                let mut s = format!(
                    "auto {iface}\niface {iface} inet static\naddress {}\nnetmask {}",
                    address.trim(),
                    netmask.trim()
                );
                if let Some(gw) = gateway.as_deref().map(str::trim).filter(|g| !g.is_empty()) {
                    s.push_str(&format!("\ngateway {gw}"));
                }
                s
            }
        }
    }
}

/// Parses `wan` or `lan,<address>,<netmask>[,<gateway>]`.
impl FromStr for NetPort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',').map(str::trim);
        match parts.next().map(str::to_ascii_lowercase).as_deref() {
            Some("wan") => Ok(NetPort::Wan),
            Some("lan") => {
                let address = parts.next().unwrap_or_default().to_string();
                let netmask = parts.next().unwrap_or_default().to_string();
                let gateway = parts.next().filter(|g| !g.is_empty()).map(str::to_string);
                Ok(NetPort::Lan {
                    address,
                    netmask,
                    gateway,
                })
            }
            _ => Err(format!(
                "expected `wan` or `lan,<address>,<netmask>[,<gateway>]`, got `{s}`"
            )),
        }
    }
}

impl fmt::Display for NetPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetPort::Wan => f.write_str("WAN (dhcp)"),
            NetPort::Lan {
                address, netmask, ..
            } => write!(f, "LAN {address}/{netmask}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsRequest {
    /// Set the device clock from this host and persist it to the RTC.
    pub sync_time: bool,
    pub eth0: Option<NetPort>,
    pub eth1: Option<NetPort>,
}

impl SettingsRequest {
    /// Both ports, or neither.
    pub fn validate(&self) -> Result<(), SettingsError> {
        match (&self.eth0, &self.eth1) {
            (None, None) => Ok(()),
            (Some(a), Some(b)) => {
                a.validate("eth0")?;
                b.validate("eth1")
            }
            _ => Err(SettingsError::PartialNetwork),
        }
    }

    /// Full interfaces file, or `None` when the network is left alone.
    pub fn interfaces_file(&self) -> Option<String> {
        match (&self.eth0, &self.eth1) {
            (Some(a), Some(b)) => Some(format!("{}\n\n{}", a.stanza("eth0"), b.stanza("eth1"))),
            _ => None,
        }
    }
}

pub struct DeviceSettings {
    session: DeviceSession,
    updating: AtomicBool,
}

impl DeviceSettings {
    pub fn new(session: DeviceSession) -> Self {
        Self {
            session,
            updating: AtomicBool::new(false),
        }
    }

    pub fn is_updating(&self) -> bool {
        self.updating.load(Ordering::Acquire)
    }

    pub async fn apply(&self, request: &SettingsRequest) -> Result<(), SettingsError> {
        let Some(_in_flight) = InFlight::acquire(&self.updating) else {
            self.session.append_log("Settings update already in progress!");
            return Err(SettingsError::AlreadyUpdating);
        };

        let result = self.apply_steps(request).await;
        match &result {
            Ok(()) => self.session.append_log("Settings updated"),
            Err(e) => self.session.append_log(format!("Settings update failed: {e}")),
        }
        result
    }

    async fn apply_steps(&self, request: &SettingsRequest) -> Result<(), SettingsError> {
        request.validate()?;

        if request.sync_time {
            self.session.append_log("Syncing device clock with this host...");
            let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
            self.session
                .run_and_wait(&format!("date -s {}", quote(&now)))
                .await?;
            self.session.run_and_wait("hwclock -w").await?;
        }

        let Some(interfaces) = request.interfaces_file() else {
            return Ok(());
        };

        self.session
            .run_and_wait(&format!(
                "cp {INTERFACES_PATH} {INTERFACES_PATH}.bak.$(date +%Y%m%d%H%M%S)"
            ))
            .await?;
        self.session
            .run_and_wait(&format!(
                "printf '%s\\n' {} > {INTERFACES_PATH}",
                quote(&interfaces)
            ))
            .await?;

        self.session
            .append_log("Network settings written, rebooting device...");
        match self.session.run_and_wait("reboot").await {
            Ok(_) => Ok(()),
            // The device may go away before the channel reports an exit status
            Err(SessionError::SessionFailed(reason)) => {
                tracing::debug!("reboot closed the channel: {}", reason);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn quote(s: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(s))
}
