use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use gwflash::config::ToolConfig;
use gwflash::firmware::SyncReport;
use gwflash::log::ConsoleLog;
use gwflash::settings::{NetPort, SettingsRequest};
use gwflash::transport::SshConnector;
use gwflash::{ToolHandle, Toolkit};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "gwflash")]
#[command(version, about = "Provision and flash embedded gateways over SSH", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/gwflash/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Gateway generation profile (v2, v3, ...)
    #[arg(short, long, global = true)]
    profile: Option<String>,

    /// Device SSH password, overrides the config file
    #[arg(long, env = "GWFLASH_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sync the local firmware tree with the manifest
    Check,

    /// Download and store the config of a device
    Config {
        /// Device serial number
        sn: String,
    },

    /// Flash firmware onto a device
    Flash {
        /// Device address (port optional)
        #[arg(long)]
        host: String,
        /// Device serial number
        sn: String,
        /// Keep an existing firmware archive instead of repackaging
        #[arg(long)]
        reuse_archive: bool,
        /// Download the device config before flashing
        #[arg(long)]
        fetch_config: bool,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Run a shell command on a device (Ctrl-C cancels it)
    Exec {
        #[arg(long)]
        host: String,
        command: String,
    },

    /// Copy a file to a device
    Upload {
        #[arg(long)]
        host: String,
        local: PathBuf,
        remote: String,
    },

    /// Sync the device clock and/or reconfigure its network ports
    Settings {
        #[arg(long)]
        host: String,
        /// Set the device clock from this host
        #[arg(long)]
        sync_time: bool,
        /// `wan` or `lan,<address>,<netmask>[,<gateway>]`
        #[arg(long)]
        eth0: Option<NetPort>,
        /// `wan` or `lan,<address>,<netmask>[,<gateway>]`
        #[arg(long)]
        eth1: Option<NetPort>,
        #[arg(short, long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("gwflash=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = ToolConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(password) = cli.password {
        config.device.password = password;
    }

    let connector = Arc::new(SshConnector::from_config(&config.device));
    let toolkit = Toolkit::new(&config, cli.profile.as_deref(), connector, Arc::new(ConsoleLog))
        .context("Failed to set up toolkit")?;
    let (tool, service) = ToolHandle::spawn(Arc::new(toolkit));

    let result = dispatch(&tool, cli.command).await;

    if tool.is_connected() {
        tool.disconnect().await.ok();
    }
    drop(tool);
    if let Err(e) = service.await {
        tracing::warn!("request loop ended abnormally: {}", e);
    }
    result
}

async fn dispatch(tool: &ToolHandle, command: Command) -> Result<()> {
    match command {
        Command::Check => {
            let report = tool.check_versions().await.context("Version check failed")?;
            print_report(&report);
        }

        Command::Config { sn } => {
            let path = tool
                .download_config(&sn)
                .await
                .with_context(|| format!("Failed to download config for {sn}"))?;
            println!("{} {}", "Saved".green(), path.display());
        }

        Command::Flash {
            host,
            sn,
            reuse_archive,
            fetch_config,
            yes,
        } => {
            if sn.trim().is_empty() {
                bail!("Device serial number must not be empty");
            }
            if !yes && !confirm(&format!("Initialize {sn}? Its firmware will be replaced"))? {
                return Ok(());
            }
            if fetch_config {
                tool.download_config(&sn)
                    .await
                    .with_context(|| format!("Failed to download config for {sn}"))?;
            }
            tool.connect(&host)
                .await
                .with_context(|| format!("Failed to connect to {host}"))?;
            tool.flash_firmware(&sn, !reuse_archive)
                .await
                .with_context(|| format!("Failed to flash {sn}"))?;
        }

        Command::Exec { host, command } => {
            tool.connect(&host)
                .await
                .with_context(|| format!("Failed to connect to {host}"))?;

            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            let watcher = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_ctrl_c.cancel();
                }
            });
            let result = tool.run_command(&command, cancel).await;
            watcher.abort();
            result.with_context(|| format!("`{command}` failed"))?;
        }

        Command::Upload {
            host,
            local,
            remote,
        } => {
            tool.connect(&host)
                .await
                .with_context(|| format!("Failed to connect to {host}"))?;
            tool.upload_file(local, &remote).await.context("Upload failed")?;
        }

        Command::Settings {
            host,
            sync_time,
            eth0,
            eth1,
            yes,
        } => {
            let request = SettingsRequest {
                sync_time,
                eth0,
                eth1,
            };
            request.validate()?;
            if request.interfaces_file().is_none() && !request.sync_time {
                bail!("Nothing to change: pass --sync-time and/or --eth0/--eth1");
            }
            if !yes && !confirm("Update device settings? Network changes reboot the device")? {
                return Ok(());
            }
            tool.connect(&host)
                .await
                .with_context(|| format!("Failed to connect to {host}"))?;
            tool.apply_settings(request)
                .await
                .context("Settings update failed")?;
        }
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    for c in &report.components {
        if c.updated {
            println!("  {} {} {} -> {}", "updated".green(), c.name, c.local, c.remote);
        } else {
            println!("  {} {} {}", "current".dimmed(), c.name, c.local);
        }
    }
    for name in &report.missing {
        println!("  {} {} (not in manifest)", "skipped".yellow(), name);
    }
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
