//! usbip-monitor: attach one remote USB/IP device and keep it attached.
//!
//! Exit codes: 0 graceful shutdown, 1 invalid or unresolvable input,
//! 2 cancelled before the device was attached, 3 any other fatal error.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use usbip_monitor::{
    check_executable, AttachmentMonitor, BinaryLocator, MonitorConfig, MonitorError, RemoteHost,
    TargetSpec, UsbIpDriver, HOSTFS_PREFIX_ENV,
};

const EXIT_INVALID_INPUT: u8 = 1;
const EXIT_CANCELLED: u8 = 2;
const EXIT_FATAL: u8 = 3;

const CONFIG_FILE: &str = "usbip-monitor.toml";

/// Attach a remotely exported USB device over USB/IP and keep it attached until terminated.
#[derive(Parser)]
#[command(name = "usbip-monitor", version)]
struct Cli {
    /// Remote host exporting the device (a `:port` suffix is ignored, usbip always uses 3240)
    #[arg(short = 'H', long)]
    host: String,
    /// Remote bus id of the device to attach, e.g. 1-7
    #[arg(short, long)]
    bus_id: Option<String>,
    /// Remote device id, passed through to `usbip attach --device`
    #[arg(short, long)]
    device_id: Option<String>,
    /// Attach the single exported device with this vendor:product id, e.g. 0403:6001
    #[arg(short, long, value_name = "VID:PID")]
    find_by_id: Option<String>,
    /// Path to the usbip executable [default: search linux-tools and PATH]
    #[arg(short = 'p', long)]
    usb_ip_path: Option<PathBuf>,
    /// Path to usbip-monitor.toml [default: ./usbip-monitor.toml or ~/.config/usbip-monitor/usbip-monitor.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Log level when RUST_LOG is not set (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // Usage errors are invalid input; help and version are not errors.
            return if e.use_stderr() {
                ExitCode::from(EXIT_INVALID_INPUT)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let config = load_effective_config(&cli).await;
    init_tracing(match &config {
        Ok(config) => config.log_level.as_str(),
        Err(_) => cli.log_level.as_deref().unwrap_or("info"),
    });

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "USB/IP monitor starting");

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration");
            return ExitCode::from(EXIT_INVALID_INPUT);
        }
    };

    let (remote, target, executable) = match validate(&cli, &config) {
        Ok(validated) => validated,
        Err(errors) => {
            tracing::error!("Failed to validate options");
            for error in errors {
                tracing::error!("{}", error);
            }
            return ExitCode::from(EXIT_INVALID_INPUT);
        }
    };

    let executable = match executable {
        Some(path) => path,
        None => match BinaryLocator::new(&config.usbip.hostfs_prefix).locate() {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(error = %e, "Cannot run without usbip");
                return ExitCode::from(EXIT_INVALID_INPUT);
            }
        },
    };
    tracing::info!(path = %executable.display(), "Using usbip executable");

    let cancel = CancellationToken::new();

    // Signal handler cancels the root token once for graceful shutdown
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        let signal = shutdown_signal().await;
        tracing::info!(signal, "Received termination signal");
        cancel_for_signal.cancel();
    });

    let driver = UsbIpDriver::new(executable, remote);
    let monitor = AttachmentMonitor::new(driver, target, config.timings());

    match monitor.run(&cancel).await {
        Ok(report) => {
            tracing::info!(
                bus_id = %report.bus_id,
                last_port = report.last_port.as_deref().unwrap_or("<none>"),
                "USB/IP monitor stopped"
            );
            ExitCode::SUCCESS
        }
        Err(e) => ExitCode::from(exit_code(&e)),
    }
}

fn exit_code(error: &MonitorError) -> u8 {
    match error {
        MonitorError::Cancelled => EXIT_CANCELLED,
        MonitorError::DeviceNotFound(_)
        | MonitorError::AmbiguousDevice { .. }
        | MonitorError::InvalidConfig(_)
        | MonitorError::ExecutableNotFound(_) => EXIT_INVALID_INPUT,
        _ => EXIT_FATAL,
    }
}

/// Check every command-line input, collecting all problems at once.
fn validate(
    cli: &Cli,
    config: &MonitorConfig,
) -> std::result::Result<(RemoteHost, TargetSpec, Option<PathBuf>), Vec<String>> {
    let mut errors = Vec::new();

    let remote = RemoteHost::parse(&cli.host).map_err(|e| errors.push(e.to_string())).ok();

    let target = TargetSpec::from_selection(
        cli.bus_id.clone(),
        cli.device_id.clone(),
        cli.find_by_id.clone(),
    )
    .map_err(|e| errors.push(e.to_string()))
    .ok();

    let executable = cli.usb_ip_path.clone().or_else(|| config.usbip.path.clone());
    if let Some(path) = &executable {
        if let Err(e) = check_executable(path) {
            errors.push(e.to_string());
        }
    }

    match (remote, target) {
        (Some(remote), Some(target)) if errors.is_empty() => Ok((remote, target, executable)),
        _ => Err(errors),
    }
}

/// Config file merged with environment and command-line overrides.
async fn load_effective_config(cli: &Cli) -> Result<MonitorConfig> {
    let mut config = match resolve_config(cli.config.clone()) {
        Some(path) => load_config(&path).await?,
        None => MonitorConfig::default(),
    };

    config.apply_env(std::env::var(HOSTFS_PREFIX_ENV).ok());
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    Ok(config)
}

/// Resolve config file path: explicit flag → ./usbip-monitor.toml → ~/.config/usbip-monitor/usbip-monitor.toml.
fn resolve_config(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path);
    }

    let local = Path::new(CONFIG_FILE);
    if local.exists() {
        return Some(local.to_path_buf());
    }

    let xdg = dirs::config_dir()?.join("usbip-monitor").join(CONFIG_FILE);
    xdg.exists().then_some(xdg)
}

/// Load and parse a usbip-monitor.toml config file.
async fn load_config(config_path: &Path) -> Result<MonitorConfig> {
    let content = tokio::fs::read_to_string(config_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", config_path, e))?;
    let config: MonitorConfig = content
        .parse()
        .map_err(|e| anyhow::anyhow!("Failed to parse config file {:?}: {}", config_path, e))?;
    Ok(config)
}

/// Initialize tracing with env filter (RUST_LOG wins over the configured level).
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.to_ascii_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Wait for Ctrl-C or, on Unix, SIGTERM. Returns the signal's name.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                return tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                };
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM, only Ctrl-C will stop the monitor");
            }
        }
    }

    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}
