//! Capability configuration for droidrig.
//!
//! Settings live in a flat key→string JSON object, by default at
//! `~/.droidrig/config.json` (override with `DROIDRIG_CONFIG`). Every key has
//! a built-in default, so resolution never fails: a missing file produces a
//! warning and a fully defaulted configuration, and a malformed individual
//! value falls back to the default for that key only.
//!
//! # Example
//!
//! ```no_run
//! use droidrig_core::config::CapabilityConfig;
//!
//! // Resolved once per process, shared read-only afterwards.
//! let config = CapabilityConfig::global();
//! println!("{} -> {}", config.app_package(), config.server_url());
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

const CONFIG_FILENAME: &str = "config.json";

/// Environment variable pointing at an alternative settings file.
pub const CONFIG_ENV: &str = "DROIDRIG_CONFIG";

/// Prefix marking settings that go straight into the capability bag.
const CAPABILITY_PREFIX: &str = "capability.";

/// Documented setting keys.
pub mod keys {
    pub const PLATFORM_NAME: &str = "platform.name";
    pub const DEVICE_NAME: &str = "device.name";
    pub const DEVICE_UDID: &str = "device.udid";
    pub const APP_PACKAGE: &str = "app.package";
    pub const APP_ACTIVITY: &str = "app.activity";
    pub const AUTOMATION_NAME: &str = "automation.name";
    pub const SERVER_URL: &str = "server.url";
    /// Older spelling of [`SERVER_URL`], read when the latter is absent.
    pub const APPIUM_SERVER_URL: &str = "appium.server.url";
    pub const APP_PATH: &str = "app.path";
    pub const IMPLICIT_WAIT: &str = "implicit.wait";
    pub const EXPLICIT_WAIT: &str = "explicit.wait";
    pub const RESET_POLICY: &str = "reset.policy";
    pub const ADB_PATH: &str = "adb.path";
}

const DEFAULT_PLATFORM_NAME: &str = "Android";
const DEFAULT_DEVICE_NAME: &str = "Android Emulator";
const DEFAULT_APP_PACKAGE: &str = "com.example.app";
const DEFAULT_APP_ACTIVITY: &str = "com.example.app.MainActivity";
const DEFAULT_AUTOMATION_NAME: &str = "UiAutomator2";
const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:4723";
const DEFAULT_APP_PATH: &str = "apps/app.apk";
const DEFAULT_IMPLICIT_WAIT_SECS: u64 = 10;
const DEFAULT_EXPLICIT_WAIT_SECS: u64 = 20;
const DEFAULT_ADB_PATH: &str = "adb";

static GLOBAL: OnceLock<CapabilityConfig> = OnceLock::new();

/// Returns the droidrig home directory (`~/.droidrig`).
pub fn droidrig_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".droidrig")
}

/// Returns the settings file path, honoring [`CONFIG_ENV`].
pub fn config_path() -> PathBuf {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => droidrig_dir().join(CONFIG_FILENAME),
    }
}

/// How much app state the automation server wipes when a session opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ResetPolicy {
    /// Uninstall and reinstall the app around every session.
    Full,
    /// Stop the app and clear its data, keep it installed.
    #[default]
    Fast,
    /// Leave the app and its data untouched.
    NoReset,
}

impl ResetPolicy {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "full" => Some(Self::Full),
            "fast" => Some(Self::Fast),
            "no-reset" | "noreset" | "none" => Some(Self::NoReset),
            _ => None,
        }
    }

    /// The `(fullReset, noReset)` capability pair for this policy.
    pub fn flags(self) -> (bool, bool) {
        match self {
            Self::Full => (true, false),
            Self::Fast => (false, false),
            Self::NoReset => (false, true),
        }
    }
}

/// A single engine-specific capability value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CapabilityValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl CapabilityValue {
    /// Infers the value type from its textual setting.
    fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            _ => {}
        }
        trimmed
            .parse::<i64>()
            .map(Self::Int)
            .unwrap_or_else(|_| Self::Str(raw.to_string()))
    }
}

impl From<bool> for CapabilityValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for CapabilityValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for CapabilityValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for CapabilityValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Resolved automation parameters.
///
/// Immutable after resolution; all accessors are pure projections.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityConfig {
    platform_name: String,
    device_name: String,
    device_udid: Option<String>,
    automation_name: String,
    server_url: Url,
    app_package: String,
    app_activity: String,
    app_path: Option<PathBuf>,
    #[serde(with = "duration_secs")]
    implicit_wait: Duration,
    #[serde(with = "duration_secs")]
    explicit_wait: Duration,
    reset_policy: ResetPolicy,
    adb_path: String,
    extra_capabilities: BTreeMap<String, CapabilityValue>,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self::from_settings(&HashMap::new())
    }
}

impl CapabilityConfig {
    /// Returns the process-wide configuration, resolving it on first use.
    pub fn global() -> &'static CapabilityConfig {
        GLOBAL.get_or_init(Self::resolve)
    }

    /// Resolves the configuration from [`config_path`].
    ///
    /// Never fails: a missing or unreadable file logs a warning and yields
    /// the defaults.
    pub fn resolve() -> Self {
        Self::resolve_from(&config_path())
    }

    /// Resolves the configuration from an explicit settings file.
    pub fn resolve_from(path: &Path) -> Self {
        let settings = match std::fs::read_to_string(path) {
            Ok(contents) => match parse_settings(&contents) {
                Some(settings) => {
                    debug!(path = %path.display(), entries = settings.len(), "loaded settings");
                    settings
                }
                None => {
                    warn!(path = %path.display(), "settings file is not a flat JSON object, using defaults");
                    HashMap::new()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "settings file not found, using defaults");
                HashMap::new()
            }
        };
        Self::from_settings(&settings)
    }

    /// Builds a configuration from a flat key→string map.
    ///
    /// Missing keys take their built-in default; malformed values log a
    /// warning and take the default as well.
    pub fn from_settings(settings: &HashMap<String, String>) -> Self {
        let text = |key: &str, default: &str| -> String {
            settings
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
                .to_string()
        };
        let optional = |key: &str| -> Option<String> {
            settings
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let server_url = match optional(keys::SERVER_URL).or_else(|| optional(keys::APPIUM_SERVER_URL)) {
            Some(raw) => match Url::parse(&raw) {
                Ok(url) if url.has_host() => url,
                _ => {
                    warn!(value = %raw, "invalid server url, using default");
                    default_server_url()
                }
            },
            None => default_server_url(),
        };

        let reset_policy = match optional(keys::RESET_POLICY) {
            Some(raw) => ResetPolicy::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unknown {}, using default", keys::RESET_POLICY);
                ResetPolicy::default()
            }),
            None => ResetPolicy::default(),
        };

        let app_path = match settings.get(keys::APP_PATH) {
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => Some(PathBuf::from(raw.trim())),
            None => Some(PathBuf::from(DEFAULT_APP_PATH)),
        };

        let extra_capabilities = settings
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(CAPABILITY_PREFIX)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name.to_string(), CapabilityValue::infer(value)))
            })
            .collect();

        Self {
            platform_name: text(keys::PLATFORM_NAME, DEFAULT_PLATFORM_NAME),
            device_name: text(keys::DEVICE_NAME, DEFAULT_DEVICE_NAME),
            device_udid: optional(keys::DEVICE_UDID),
            automation_name: text(keys::AUTOMATION_NAME, DEFAULT_AUTOMATION_NAME),
            server_url,
            app_package: text(keys::APP_PACKAGE, DEFAULT_APP_PACKAGE),
            app_activity: text(keys::APP_ACTIVITY, DEFAULT_APP_ACTIVITY),
            app_path,
            implicit_wait: seconds(settings, keys::IMPLICIT_WAIT, DEFAULT_IMPLICIT_WAIT_SECS),
            explicit_wait: seconds(settings, keys::EXPLICIT_WAIT, DEFAULT_EXPLICIT_WAIT_SECS),
            reset_policy,
            adb_path: text(keys::ADB_PATH, DEFAULT_ADB_PATH),
            extra_capabilities,
        }
    }

    pub fn platform_name(&self) -> &str {
        &self.platform_name
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Serial of the target device, when more than one may be attached.
    pub fn device_udid(&self) -> Option<&str> {
        self.device_udid.as_deref()
    }

    pub fn automation_name(&self) -> &str {
        &self.automation_name
    }

    /// Base URL of the automation server.
    pub fn server_url(&self) -> &Url {
        &self.server_url
    }

    pub fn app_package(&self) -> &str {
        &self.app_package
    }

    pub fn app_activity(&self) -> &str {
        &self.app_activity
    }

    /// Path to the application binary, if one is configured.
    pub fn app_path(&self) -> Option<&Path> {
        self.app_path.as_deref()
    }

    /// Session-wide lookup timeout applied by the automation server.
    pub fn implicit_wait(&self) -> Duration {
        self.implicit_wait
    }

    /// Timeout applied by the synchronization engine to a single condition.
    pub fn explicit_wait(&self) -> Duration {
        self.explicit_wait
    }

    pub fn reset_policy(&self) -> ResetPolicy {
        self.reset_policy
    }

    /// Program used to reach the device bridge.
    pub fn adb_path(&self) -> &str {
        &self.adb_path
    }

    /// Engine-specific capabilities from `capability.*` settings.
    pub fn extra_capabilities(&self) -> &BTreeMap<String, CapabilityValue> {
        &self.extra_capabilities
    }
}

fn default_server_url() -> Url {
    Url::parse(DEFAULT_SERVER_URL).expect("default server url is valid")
}

fn seconds(settings: &HashMap<String, String>, key: &str, default: u64) -> Duration {
    let secs = match settings.get(key).map(|v| v.trim()) {
        None | Some("") => default,
        Some(raw) => raw.parse::<u64>().unwrap_or_else(|_| {
            warn!(value = %raw, "invalid {}, expected non-negative seconds, using {}", key, default);
            default
        }),
    };
    Duration::from_secs(secs)
}

/// Parses a flat JSON object, stringifying scalar values.
///
/// Returns `None` when the document is not an object. Nested values are
/// skipped with a warning.
fn parse_settings(contents: &str) -> Option<HashMap<String, String>> {
    let raw: HashMap<String, serde_json::Value> = serde_json::from_str(contents).ok()?;
    let settings = raw
        .into_iter()
        .filter_map(|(key, value)| match value {
            serde_json::Value::String(s) => Some((key, s)),
            serde_json::Value::Bool(b) => Some((key, b.to_string())),
            serde_json::Value::Number(n) => Some((key, n.to_string())),
            serde_json::Value::Null => None,
            other => {
                warn!(key = %key, value = %other, "ignoring non-scalar setting");
                None
            }
        })
        .collect();
    Some(settings)
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}
