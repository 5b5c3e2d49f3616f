//! CLI for Android device provisioning and automation-server checks.
//!
//! Reads the same settings file as the library (`~/.droidrig/config.json`,
//! or `$DROIDRIG_CONFIG`).
//!
//! # Usage
//!
//! ```bash
//! # Show the resolved configuration
//! droidrig config
//!
//! # List devices attached to adb
//! droidrig devices
//!
//! # Check that the Appium server is up
//! droidrig status
//!
//! # Install the app if missing and grant runtime permissions
//! droidrig prepare
//!
//! # Live snapshot of device and app state
//! droidrig --format json record
//!
//! # Control the configured app
//! droidrig app start
//! droidrig app clear
//!
//! # Open a session, wait for an element, close the session
//! droidrig wait-for id com.example.app:id/login
//! droidrig wait-for aid "Sign In" -t 30
//! ```

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use droidrig_core::config::{config_path, CapabilityConfig};
use droidrig_core::device::{DeviceError, DeviceProvisioner};
use droidrig_core::element::{Locator, RemoteElement};
use droidrig_core::session::{SessionError, SessionManager};
use droidrig_core::wait::Waiter;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Android UI automation helper.
#[derive(Parser)]
#[command(name = "droidrig")]
#[command(about = "Provision Android devices and check Appium sessions")]
#[command(version)]
struct Cli {
    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Print the resolved configuration
    Config,

    /// List devices attached to adb
    Devices,

    /// Probe the automation server status endpoint
    Status,

    /// Install the app if missing and grant runtime permissions
    Prepare,

    /// Print a live snapshot of device connectivity and app state
    Record,

    /// Control the configured app
    App {
        #[command(subcommand)]
        action: AppAction,
    },

    /// Open a session and wait for an element to become visible
    WaitFor {
        /// Locator strategy: id, aid, xpath, class, uiautomator
        strategy: String,
        /// Locator value
        value: String,
        /// Timeout in seconds (defaults to the configured explicit wait)
        #[arg(short, long, env = "DROIDRIG_TIMEOUT")]
        timeout: Option<u64>,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum AppAction {
    /// Launch the configured entry point
    Start,
    /// Force-stop the app
    Stop,
    /// Clear the app's data
    Clear,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

#[derive(Debug)]
enum CliError {
    Connection(String),
    ActionFailed(String),
    Protocol(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Connection(_) => ExitCode::from(2),
            CliError::ActionFailed(_) => ExitCode::from(1),
            CliError::Protocol(_) => ExitCode::from(3),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Connection(msg) => write!(f, "Connection error: {}", msg),
            CliError::ActionFailed(msg) => write!(f, "Action failed: {}", msg),
            CliError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl From<DeviceError> for CliError {
    fn from(e: DeviceError) -> Self {
        CliError::ActionFailed(e.to_string())
    }
}

impl From<SessionError> for CliError {
    fn from(e: SessionError) -> Self {
        let message = match std::error::Error::source(&e) {
            Some(cause) => format!("{}: {}", e, cause),
            None => e.to_string(),
        };
        match e {
            SessionError::ServerUnavailable { .. } | SessionError::DriverInitialization(_) => {
                CliError::Connection(message)
            }
            SessionError::NotInitialized => CliError::Protocol(message),
        }
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<(), CliError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| CliError::Protocol(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = CapabilityConfig::global();
    debug!(path = %config_path().display(), server = %config.server_url(), "configuration resolved");

    match cli.command {
        Command::Config => {
            if cli.format == OutputFormat::Text {
                eprintln!("# {}", config_path().display());
            }
            print_json(config)
        }
        Command::Devices => {
            let devices = DeviceProvisioner::from_config(config).list_devices();
            if cli.format == OutputFormat::Json {
                print_json(&devices)
            } else {
                if devices.is_empty() {
                    eprintln!("No Android devices found");
                }
                for device in &devices {
                    println!("{}\t{}", device.serial, device.state);
                }
                Ok(())
            }
        }
        Command::Status => {
            let manager = SessionManager::new(Arc::new(config.clone()));
            let start = Instant::now();
            manager.probe().await?;
            let elapsed_ms = start.elapsed().as_millis() as u64;
            if cli.format == OutputFormat::Json {
                print_json(&serde_json::json!({
                    "ready": true,
                    "endpoint": config.server_url().as_str(),
                    "elapsed_ms": elapsed_ms,
                }))
            } else {
                println!("Automation server at {} is ready ({}ms)", config.server_url(), elapsed_ms);
                Ok(())
            }
        }
        Command::Prepare => {
            DeviceProvisioner::from_config(config).prepare_device()?;
            if cli.format == OutputFormat::Json {
                print_json(&serde_json::json!({ "success": true, "package": config.app_package() }))
            } else {
                eprintln!("Device ready for {}", config.app_package());
                Ok(())
            }
        }
        Command::Record => {
            let record = DeviceProvisioner::from_config(config).device_record(config.app_package());
            if cli.format == OutputFormat::Json {
                print_json(&record)
            } else {
                println!("connected:     {}", record.connected);
                println!("app installed: {}", record.app_installed);
                println!("granted:       {}", record.granted_permissions.len());
                for permission in &record.granted_permissions {
                    println!("  {}", permission);
                }
                Ok(())
            }
        }
        Command::App { action } => {
            let provisioner = DeviceProvisioner::from_config(config);
            let label = match action {
                AppAction::Start => {
                    provisioner.start_configured_app()?;
                    "started"
                }
                AppAction::Stop => {
                    provisioner.stop_configured_app();
                    "stopped"
                }
                AppAction::Clear => {
                    provisioner.clear_configured_app();
                    "cleared"
                }
            };
            if cli.format == OutputFormat::Json {
                print_json(&serde_json::json!({ "success": true, "package": config.app_package(), "action": label }))
            } else {
                eprintln!("{} {}", config.app_package(), label);
                Ok(())
            }
        }
        Command::WaitFor {
            ref strategy,
            ref value,
            timeout,
        } => {
            let locator = Locator::parse(strategy, value.as_str())
                .ok_or_else(|| CliError::Protocol(format!("Unknown locator strategy '{}'", strategy)))?;
            let waiter = match timeout {
                Some(secs) => Waiter::new(Duration::from_secs(secs)),
                None => Waiter::from_config(config),
            };
            wait_for(config, locator, waiter, cli.format).await
        }
    }
}

async fn wait_for(
    config: &CapabilityConfig,
    locator: Locator,
    waiter: Waiter,
    format: OutputFormat,
) -> Result<(), CliError> {
    let manager = SessionManager::new(Arc::new(config.clone()));
    let mut worker = manager.register();
    let session = worker.initialize().await?;

    let element = RemoteElement::new(session, locator.clone());
    let start = Instant::now();
    let result = waiter.wait_visible(&element).await.map(|_| ());
    let elapsed_ms = start.elapsed().as_millis() as u64;
    worker.teardown().await;

    result.map_err(|e| CliError::ActionFailed(e.to_string()))?;
    if format == OutputFormat::Json {
        print_json(&serde_json::json!({
            "visible": true,
            "locator": locator,
            "elapsed_ms": elapsed_ms,
        }))
    } else {
        println!("{} visible after {}ms", locator, elapsed_ms);
        Ok(())
    }
}
