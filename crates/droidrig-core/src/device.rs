//! Device provisioning through the Android device bridge (`adb`).
//!
//! [`DeviceProvisioner`] brings exactly one physical or virtual device into a
//! state where an automation session can be opened against the configured
//! application: connected, app installed, runtime permissions granted.
//!
//! Every query is fail-closed and re-runs its shell command on each call.
//! Nothing about the device is cached, since app and device state can change
//! between test runs.
//!
//! All methods are synchronous and block on the child process. There is no
//! timeout on individual commands; callers in async code should wrap them with
//! `tokio::task::spawn_blocking`.
//!
//! # Example
//!
//! ```no_run
//! use droidrig_core::config::CapabilityConfig;
//! use droidrig_core::device::DeviceProvisioner;
//!
//! let provisioner = DeviceProvisioner::from_config(CapabilityConfig::global());
//! provisioner.prepare_device()?;
//! # Ok::<(), droidrig_core::device::DeviceError>(())
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::CapabilityConfig;

/// Runtime permissions granted to the app under test before each run.
pub const DEFAULT_PERMISSIONS: &[&str] = &[
    "android.permission.READ_PHONE_STATE",
    "android.permission.CALL_PHONE",
    "android.permission.READ_CONTACTS",
    "android.permission.WRITE_CONTACTS",
    "android.permission.READ_CALL_LOG",
    "android.permission.WRITE_CALL_LOG",
    "android.permission.READ_SMS",
    "android.permission.RECEIVE_SMS",
    "android.permission.CAMERA",
    "android.permission.RECORD_AUDIO",
    "android.permission.ACCESS_FINE_LOCATION",
    "android.permission.ACCESS_COARSE_LOCATION",
];

/// Marker `adb install` prints on success, regardless of its exit code.
const INSTALL_SUCCESS_MARKER: &str = "Success";

const DEVICES_HEADER: &str = "List of devices attached";

/// Errors raised by provisioning operations that cannot degrade to a boolean.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// No device reported the `device` state.
    #[error("No Android device connected. Connect a device or start an emulator")]
    NotConnected,

    /// `adb install` neither exited 0 nor printed the success marker.
    #[error("Failed to install app: {output}")]
    AppInstallFailed {
        /// Combined stdout and stderr of the install command.
        output: String,
    },

    /// `am start` could not launch the entry point.
    #[error("Failed to start app: {0}")]
    AppStartFailed(String),
}

/// Captured result of one device bridge invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exit code, `None` if terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true if the process exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout and stderr joined for diagnostics.
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{}\n{}", out, err),
        }
    }
}

/// One synchronous round trip to the device bridge.
///
/// `args` are the bridge arguments without the program name, e.g.
/// `["shell", "pm", "clear", "com.example.app"]`.
pub trait DeviceBridge: Send + Sync {
    fn run(&self, args: &[&str]) -> std::io::Result<CommandOutput>;
}

/// [`DeviceBridge`] backed by the `adb` executable.
#[derive(Debug, Clone)]
pub struct Adb {
    program: PathBuf,
    serial: Option<String>,
}

impl Adb {
    /// Creates a bridge invoking `program`, optionally pinned to one device.
    pub fn new(program: impl Into<PathBuf>, serial: Option<String>) -> Self {
        Self {
            program: program.into(),
            serial,
        }
    }
}

impl Default for Adb {
    fn default() -> Self {
        Self::new("adb", None)
    }
}

impl DeviceBridge for Adb {
    fn run(&self, args: &[&str]) -> std::io::Result<CommandOutput> {
        let mut command = Command::new(&self.program);
        if let Some(serial) = &self.serial {
            command.args(["-s", serial]);
        }
        let output = command.args(args).output()?;
        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// A device line from `adb devices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedDevice {
    /// Device serial, e.g. `emulator-5554`.
    pub serial: String,
    /// Bridge state: `device`, `offline`, `unauthorized`, ...
    pub state: String,
}

impl AttachedDevice {
    /// Returns true if the device is ready for commands.
    pub fn is_online(&self) -> bool {
        self.state == "device"
    }
}

/// Live snapshot of device state. Recomputed on every call, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub connected: bool,
    pub app_installed: bool,
    pub granted_permissions: BTreeSet<String>,
    pub checked_at: DateTime<Utc>,
}

/// Outcome of a best-effort permission grant pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionGrants {
    pub granted: Vec<String>,
    pub failed: Vec<String>,
}

/// Orchestrates device readiness for one application.
pub struct DeviceProvisioner<B = Adb> {
    bridge: B,
    app_package: String,
    app_activity: String,
    app_path: Option<PathBuf>,
}

impl DeviceProvisioner<Adb> {
    /// Builds a provisioner for the configured app, device serial and adb path.
    pub fn from_config(config: &CapabilityConfig) -> Self {
        let bridge = Adb::new(config.adb_path(), config.device_udid().map(str::to_string));
        Self::with_bridge(bridge, config)
    }
}

impl<B: DeviceBridge> DeviceProvisioner<B> {
    /// Builds a provisioner over any [`DeviceBridge`].
    pub fn with_bridge(bridge: B, config: &CapabilityConfig) -> Self {
        Self {
            bridge,
            app_package: config.app_package().to_string(),
            app_activity: config.app_activity().to_string(),
            app_path: config.app_path().map(Path::to_path_buf),
        }
    }

    /// Returns the underlying bridge.
    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    /// The package identifier this provisioner targets.
    pub fn app_package(&self) -> &str {
        &self.app_package
    }

    /// Lists attached devices. Empty on any bridge failure.
    pub fn list_devices(&self) -> Vec<AttachedDevice> {
        match self.bridge.run(&["devices"]) {
            Ok(output) if output.success() => parse_adb_devices(&output.stdout),
            Ok(output) => {
                warn!(output = %output.combined(), "adb devices failed");
                Vec::new()
            }
            Err(e) => {
                error!(error = %e, "error checking device connectivity");
                Vec::new()
            }
        }
    }

    /// Returns true iff at least one device reports the `device` state.
    pub fn is_device_connected(&self) -> bool {
        let online: Vec<_> = self
            .list_devices()
            .into_iter()
            .filter(AttachedDevice::is_online)
            .collect();
        for device in &online {
            info!(serial = %device.serial, "found connected device");
        }
        !online.is_empty()
    }

    /// Returns true iff `package` appears in the installed package list.
    pub fn is_app_installed(&self, package: &str) -> bool {
        let installed = match self.bridge.run(&["shell", "pm", "list", "packages", package]) {
            Ok(output) => output
                .stdout
                .lines()
                .any(|line| line.trim().strip_prefix("package:") == Some(package)),
            Err(e) => {
                error!(package, error = %e, "error checking app installation");
                false
            }
        };
        info!(
            package,
            status = if installed { "INSTALLED" } else { "NOT INSTALLED" },
            "app installation status"
        );
        installed
    }

    /// Installs (or replaces) the app from `binary_path`.
    ///
    /// A blank path is a no-op. Success is an exit code of 0 *or* the
    /// `Success` marker on stdout; `adb` is not consistent about its exit code
    /// across platforms, so both are checked. Not retried.
    ///
    /// # Errors
    ///
    /// - [`DeviceError::AppInstallFailed`] with the combined command output
    pub fn install_app(&self, binary_path: &Path) -> Result<(), DeviceError> {
        let path = binary_path.to_string_lossy();
        if path.trim().is_empty() {
            warn!("no app path provided, skipping installation");
            return Ok(());
        }

        info!(path = %path, "installing app");
        let output = self
            .bridge
            .run(&["install", "-r", path.trim()])
            .map_err(|e| DeviceError::AppInstallFailed {
                output: e.to_string(),
            })?;

        if output.success() || output.stdout.contains(INSTALL_SUCCESS_MARKER) {
            info!(path = %path, "app installed");
            Ok(())
        } else {
            let output = output.combined();
            error!(path = %path, output = %output, "app installation failed");
            Err(DeviceError::AppInstallFailed { output })
        }
    }

    /// Grants every permission in [`DEFAULT_PERMISSIONS`] to `package`.
    ///
    /// Best effort: each grant is attempted exactly once and a failure is
    /// logged without affecting the others. Some permissions do not exist on
    /// every platform version.
    pub fn grant_app_permissions(&self, package: &str) -> PermissionGrants {
        let mut grants = PermissionGrants::default();
        for &permission in DEFAULT_PERMISSIONS {
            match self.bridge.run(&["shell", "pm", "grant", package, permission]) {
                Ok(output) if output.success() => {
                    debug!(permission, "granted permission");
                    grants.granted.push(permission.to_string());
                }
                Ok(output) => {
                    debug!(permission, output = %output.combined(), "could not grant permission");
                    grants.failed.push(permission.to_string());
                }
                Err(e) => {
                    debug!(permission, error = %e, "could not grant permission");
                    grants.failed.push(permission.to_string());
                }
            }
        }
        info!(
            package,
            granted = grants.granted.len(),
            failed = grants.failed.len(),
            "app permissions processed"
        );
        grants
    }

    /// Force-stops `package`. Failures are logged only.
    pub fn stop_app(&self, package: &str) {
        self.best_effort("stop app", package, &["shell", "am", "force-stop", package]);
    }

    /// Clears the data of `package`. Failures are logged only.
    pub fn clear_app_data(&self, package: &str) {
        self.best_effort("clear app data", package, &["shell", "pm", "clear", package]);
    }

    /// Launches `package/entry_point`.
    ///
    /// # Errors
    ///
    /// - [`DeviceError::AppStartFailed`] if the command cannot run, exits
    ///   non-zero, or `am` reports an `Error:` line
    pub fn start_app(&self, package: &str, entry_point: &str) -> Result<(), DeviceError> {
        let component = format!("{}/{}", package, entry_point);
        let output = self
            .bridge
            .run(&["shell", "am", "start", "-n", &component])
            .map_err(|e| {
                error!(component = %component, error = %e, "error starting app");
                DeviceError::AppStartFailed(e.to_string())
            })?;

        for line in output.stdout.lines() {
            debug!(line, "start app output");
        }
        let reported_error = output
            .stdout
            .lines()
            .chain(output.stderr.lines())
            .any(|line| line.trim_start().starts_with("Error"));
        if !output.success() || reported_error {
            let combined = output.combined();
            error!(component = %component, output = %combined, "app failed to start");
            return Err(DeviceError::AppStartFailed(combined));
        }

        info!(component = %component, "app started");
        Ok(())
    }

    /// Brings the device to a testable state for the configured app.
    ///
    /// Checks connectivity, installs the app if missing, then grants
    /// permissions unconditionally (the package may already exist from a
    /// previous run).
    ///
    /// # Errors
    ///
    /// - [`DeviceError::NotConnected`] if no device is online; nothing else runs
    /// - [`DeviceError::AppInstallFailed`] if a required install fails
    pub fn prepare_device(&self) -> Result<(), DeviceError> {
        info!("preparing device for testing");

        if !self.is_device_connected() {
            return Err(DeviceError::NotConnected);
        }

        if !self.is_app_installed(&self.app_package) {
            info!("app not installed, installing from app path");
            match &self.app_path {
                Some(path) => self.install_app(path)?,
                None => warn!("no app path configured, skipping installation"),
            }
        } else {
            info!("app is already installed on device");
        }

        self.grant_app_permissions(&self.app_package);

        info!("device preparation completed");
        Ok(())
    }

    /// Force-stops the configured app.
    pub fn stop_configured_app(&self) {
        self.stop_app(&self.app_package);
    }

    /// Clears the configured app's data.
    pub fn clear_configured_app(&self) {
        self.clear_app_data(&self.app_package);
    }

    /// Launches the configured app entry point.
    pub fn start_configured_app(&self) -> Result<(), DeviceError> {
        self.start_app(&self.app_package, &self.app_activity)
    }

    /// Queries live connectivity, install state and granted permissions.
    pub fn device_record(&self, package: &str) -> DeviceRecord {
        let connected = self.is_device_connected();
        let (app_installed, granted_permissions) = if connected {
            let installed = self.is_app_installed(package);
            let granted = if installed {
                self.granted_permissions(package)
            } else {
                BTreeSet::new()
            };
            (installed, granted)
        } else {
            (false, BTreeSet::new())
        };

        DeviceRecord {
            connected,
            app_installed,
            granted_permissions,
            checked_at: Utc::now(),
        }
    }

    fn granted_permissions(&self, package: &str) -> BTreeSet<String> {
        match self.bridge.run(&["shell", "dumpsys", "package", package]) {
            Ok(output) if output.success() => parse_granted_permissions(&output.stdout),
            Ok(output) => {
                warn!(package, output = %output.combined(), "dumpsys package failed");
                BTreeSet::new()
            }
            Err(e) => {
                warn!(package, error = %e, "error reading granted permissions");
                BTreeSet::new()
            }
        }
    }

    fn best_effort(&self, what: &str, package: &str, args: &[&str]) {
        match self.bridge.run(args) {
            Ok(output) if output.success() => info!(package, "{} succeeded", what),
            Ok(output) => warn!(package, output = %output.combined(), "{} failed", what),
            Err(e) => warn!(package, error = %e, "error during {}", what),
        }
    }
}

/// Parses `adb devices` output into attached devices, skipping the header.
pub fn parse_adb_devices(output: &str) -> Vec<AttachedDevice> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with(DEVICES_HEADER) && !line.starts_with('*'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            let state = fields.next()?;
            Some(AttachedDevice {
                serial: serial.to_string(),
                state: state.to_string(),
            })
        })
        .collect()
}

/// Extracts permissions marked `granted=true` from `dumpsys package` output.
pub fn parse_granted_permissions(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.contains("granted=true"))
        .filter_map(|line| line.split(':').next())
        .map(str::trim)
        .filter(|name| name.contains('.'))
        .map(str::to_string)
        .collect()
}
