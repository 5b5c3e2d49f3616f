//! Per-worker automation session management.
//!
//! This module provides [`SessionManager`], which owns one remote session per
//! worker, and [`Worker`], the key a worker uses to reach its own session.
//!
//! # Isolation
//!
//! The manager keeps a map from [`WorkerId`] to session slot. A [`Worker`] is
//! handed out by [`SessionManager::register`], cannot be cloned, and is the
//! only way to read or write its slot, so one worker can never observe another
//! worker's session. Dropping a `Worker` releases its slot.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized --initialize--> Initializing --ok--> Ready --teardown--> Terminated
//!                                    |
//!                                    +--error--> Uninitialized
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use droidrig_core::config::CapabilityConfig;
//! use droidrig_core::session::SessionManager;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = SessionManager::new(Arc::new(CapabilityConfig::resolve()));
//!     let mut worker = manager.register();
//!
//!     let session = worker.initialize().await?;
//!     println!("session {}", session.id());
//!
//!     worker.teardown().await;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::CapabilityConfig;
use crate::webdriver::{self, DriverError, RemoteSession, STATUS_TIMEOUT};

/// Server-side UiAutomator2 launch and install timeout, in milliseconds.
const SERVER_LAUNCH_TIMEOUT_MS: i64 = 60_000;

/// Idle time after which the server closes a session, in seconds.
const NEW_COMMAND_TIMEOUT_SECS: i64 = 300;

/// Errors from the session lifecycle.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The automation server did not answer its status probe with HTTP 200.
    #[error("Automation server unavailable at {endpoint}")]
    ServerUnavailable {
        endpoint: String,
        #[source]
        source: DriverError,
    },

    /// Opening the remote session or configuring it failed.
    #[error("Failed to initialize driver session")]
    DriverInitialization(#[source] DriverError),

    /// The worker has no Ready session. Call [`Worker::initialize`] first.
    #[error("Session not initialized; call initialize() before use")]
    NotInitialized,
}

/// Identity of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WorkerId(Uuid);

impl WorkerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Observable state of a worker's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    /// The last session was torn down. A new one may be initialized.
    Terminated,
}

enum Slot {
    Initializing,
    Ready(Arc<RemoteSession>),
}

/// Owns the per-worker session slots.
pub struct SessionManager {
    config: Arc<CapabilityConfig>,
    http: Client,
    status_timeout: Duration,
    slots: Mutex<HashMap<WorkerId, Slot>>,
}

impl SessionManager {
    pub fn new(config: Arc<CapabilityConfig>) -> Arc<Self> {
        Self::with_client(config, Client::new())
    }

    /// Creates a manager that sends requests through `http`.
    pub fn with_client(config: Arc<CapabilityConfig>, http: Client) -> Arc<Self> {
        Arc::new(Self {
            config,
            http,
            status_timeout: STATUS_TIMEOUT,
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &CapabilityConfig {
        &self.config
    }

    /// Hands out a new worker key with an empty slot.
    pub fn register(self: &Arc<Self>) -> Worker {
        let id = WorkerId::new();
        debug!(worker = %id, "worker registered");
        Worker {
            id,
            manager: Arc::clone(self),
            torn_down: false,
        }
    }

    /// Number of workers currently holding a Ready session.
    pub fn active_sessions(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Checks that the automation server answers its status endpoint.
    pub async fn probe(&self) -> Result<(), SessionError> {
        let endpoint = self.config.server_url();
        webdriver::probe_status(&self.http, endpoint, self.status_timeout)
            .await
            .map_err(|source| SessionError::ServerUnavailable {
                endpoint: endpoint.to_string(),
                source,
            })
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<WorkerId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ready(&self, id: WorkerId) -> Option<Arc<RemoteSession>> {
        match self.slots().get(&id) {
            Some(Slot::Ready(session)) => Some(Arc::clone(session)),
            _ => None,
        }
    }

    async fn open_session(&self) -> Result<RemoteSession, DriverError> {
        let capabilities = build_capabilities(&self.config);
        let session = RemoteSession::open(self.http.clone(), self.config.server_url(), &capabilities).await?;

        if let Err(e) = session.set_implicit_wait(self.config.implicit_wait()).await {
            if let Err(quit_err) = session.quit().await {
                warn!(error = %quit_err, "failed to close half-initialized session");
            }
            return Err(e);
        }
        Ok(session)
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("server_url", &self.config.server_url().as_str())
            .field("workers", &self.slots().len())
            .finish()
    }
}

/// Builds the capability set sent when opening a session.
///
/// Configuration values come first, then the fixed stability capabilities,
/// then the app binary if it exists, then the engine-specific capability bag,
/// which may override any of the above.
pub fn build_capabilities(config: &CapabilityConfig) -> Map<String, Value> {
    let mut caps = Map::new();
    let mut set = |key: &str, value: Value| {
        caps.insert(key.to_string(), value);
    };

    set("platformName", config.platform_name().into());
    set("appium:deviceName", config.device_name().into());
    if let Some(udid) = config.device_udid() {
        set("appium:udid", udid.into());
    }
    set("appium:automationName", config.automation_name().into());

    let (full_reset, no_reset) = config.reset_policy().flags();
    set("appium:fullReset", full_reset.into());
    set("appium:noReset", no_reset.into());

    set("appium:disableWindowAnimation", true.into());
    set("appium:autoGrantPermissions", true.into());
    set("appium:uiautomator2ServerLaunchTimeout", SERVER_LAUNCH_TIMEOUT_MS.into());
    set("appium:uiautomator2ServerInstallTimeout", SERVER_LAUNCH_TIMEOUT_MS.into());
    set("appium:newCommandTimeout", NEW_COMMAND_TIMEOUT_SECS.into());
    set("appium:ignoreUnimportantViews", false.into());
    set("appium:skipServerInstallation", true.into());
    set("appium:skipDeviceInitialization", false.into());
    set("appium:autoLaunch", true.into());
    set("appium:appPackage", config.app_package().into());
    set("appium:appActivity", config.app_activity().into());

    if let Some(path) = config.app_path() {
        if path.is_file() {
            let app = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
            info!(app = %app.display(), "launching from app binary");
            set("appium:app", app.display().to_string().into());
        } else {
            warn!(
                app = %path.display(),
                package = config.app_package(),
                "app binary not found, using package identity only"
            );
        }
    }

    for (key, value) in config.extra_capabilities() {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        caps.insert(key.clone(), value);
    }
    caps
}

/// A worker's key to its own session slot.
///
/// Not `Clone`: exactly one owner per slot.
pub struct Worker {
    id: WorkerId,
    manager: Arc<SessionManager>,
    torn_down: bool,
}

impl Worker {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Opens this worker's session.
    ///
    /// Probes the server first; a failed probe returns
    /// [`SessionError::ServerUnavailable`] without attempting a connection.
    /// If the worker already has a Ready session it is returned unchanged.
    pub async fn initialize(&mut self) -> Result<Arc<RemoteSession>, SessionError> {
        if let Some(session) = self.manager.ready(self.id) {
            debug!(worker = %self.id, session_id = session.id(), "session already initialized");
            return Ok(session);
        }

        // A failed attempt leaves the worker Uninitialized, even after a teardown.
        self.torn_down = false;

        if let Err(e) = self.manager.probe().await {
            error!(worker = %self.id, error = %e, "automation server probe failed");
            return Err(e);
        }

        self.manager.slots().insert(self.id, Slot::Initializing);
        let _pending = PendingSlot {
            manager: &self.manager,
            id: self.id,
        };
        let span = info_span!("session_init", worker = %self.id);
        match self.manager.open_session().instrument(span).await {
            Ok(session) => {
                let session = Arc::new(session);
                self.manager
                    .slots()
                    .insert(self.id, Slot::Ready(Arc::clone(&session)));
                info!(worker = %self.id, session_id = session.id(), "session initialized");
                Ok(session)
            }
            Err(e) => {
                self.manager.slots().remove(&self.id);
                error!(worker = %self.id, error = %e, "session initialization failed");
                Err(SessionError::DriverInitialization(e))
            }
        }
    }

    /// Returns this worker's Ready session.
    pub fn active_session(&self) -> Result<Arc<RemoteSession>, SessionError> {
        self.manager.ready(self.id).ok_or(SessionError::NotInitialized)
    }

    /// Closes this worker's session, if any. Never fails.
    ///
    /// The slot is cleared before the close request is sent, so it is
    /// released even if closing fails.
    pub async fn teardown(&mut self) {
        let slot = self.manager.slots().remove(&self.id);
        match slot {
            Some(Slot::Ready(session)) => {
                self.torn_down = true;
                match session.quit().await {
                    Ok(()) => info!(worker = %self.id, session_id = session.id(), "session closed"),
                    Err(e) => warn!(
                        worker = %self.id,
                        session_id = session.id(),
                        error = %e,
                        "error closing session"
                    ),
                }
            }
            Some(Slot::Initializing) => {
                self.torn_down = true;
                debug!(worker = %self.id, "cleared pending session slot");
            }
            None => debug!(worker = %self.id, "teardown with no session"),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.manager.ready(self.id).is_some()
    }

    pub fn state(&self) -> SessionState {
        match self.manager.slots().get(&self.id) {
            Some(Slot::Ready(_)) => SessionState::Ready,
            Some(Slot::Initializing) => SessionState::Initializing,
            None if self.torn_down => SessionState::Terminated,
            None => SessionState::Uninitialized,
        }
    }
}

/// Clears an `Initializing` slot if `initialize` is dropped before it finishes.
struct PendingSlot<'a> {
    manager: &'a SessionManager,
    id: WorkerId,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        let mut slots = self.manager.slots();
        if matches!(slots.get(&self.id), Some(Slot::Initializing)) {
            slots.remove(&self.id);
            debug!(worker = %self.id, "cleared abandoned session initialization");
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let slot = self.manager.slots().remove(&self.id);
        if let Some(Slot::Ready(session)) = slot {
            warn!(worker = %self.id, session_id = session.id(), "worker dropped with live session");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = session.quit().await {
                        warn!(session_id = session.id(), error = %e, "error closing abandoned session");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keys;
    use std::collections::HashMap;

    fn config_with(pairs: &[(&str, &str)]) -> CapabilityConfig {
        let settings: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CapabilityConfig::from_settings(&settings)
    }

    #[test]
    fn capabilities_include_identity_and_stability_settings() {
        let config = config_with(&[
            (keys::APP_PACKAGE, "com.acme.shop"),
            (keys::APP_ACTIVITY, "com.acme.shop.Main"),
            (keys::APP_PATH, ""),
        ]);
        let caps = build_capabilities(&config);

        assert_eq!(caps["platformName"], "Android");
        assert_eq!(caps["appium:automationName"], "UiAutomator2");
        assert_eq!(caps["appium:appPackage"], "com.acme.shop");
        assert_eq!(caps["appium:appActivity"], "com.acme.shop.Main");
        assert_eq!(caps["appium:disableWindowAnimation"], true);
        assert_eq!(caps["appium:autoGrantPermissions"], true);
        assert_eq!(caps["appium:uiautomator2ServerLaunchTimeout"], 60000);
        assert_eq!(caps["appium:uiautomator2ServerInstallTimeout"], 60000);
        assert_eq!(caps["appium:newCommandTimeout"], 300);
        assert_eq!(caps["appium:skipDeviceInitialization"], false);
        assert!(!caps.contains_key("appium:app"));
        assert!(!caps.contains_key("appium:udid"));
    }

    #[test]
    fn missing_app_binary_falls_back_to_identity() {
        let config = config_with(&[(keys::APP_PATH, "/nonexistent/droidrig/app.apk")]);
        let caps = build_capabilities(&config);
        assert!(!caps.contains_key("appium:app"));
        assert!(caps.contains_key("appium:appPackage"));
        assert!(caps.contains_key("appium:appActivity"));
    }

    #[test]
    fn existing_app_binary_is_set_alongside_identity() {
        let path = std::env::temp_dir().join(format!("droidrig-{}.apk", Uuid::new_v4()));
        std::fs::write(&path, b"apk").unwrap();
        let config = config_with(&[(keys::APP_PATH, path.to_str().unwrap())]);
        let caps = build_capabilities(&config);
        std::fs::remove_file(&path).ok();

        let app = caps["appium:app"].as_str().unwrap();
        assert!(app.ends_with(".apk"));
        assert!(caps.contains_key("appium:appPackage"));
    }

    #[test]
    fn reset_policy_and_bag_flow_into_capabilities() {
        let config = config_with(&[
            (keys::RESET_POLICY, "full"),
            (keys::DEVICE_UDID, "emulator-5554"),
            ("capability.appium:newCommandTimeout", "600"),
            ("capability.appium:locale", "de_DE"),
        ]);
        let caps = build_capabilities(&config);
        assert_eq!(caps["appium:fullReset"], true);
        assert_eq!(caps["appium:noReset"], false);
        assert_eq!(caps["appium:udid"], "emulator-5554");
        assert_eq!(caps["appium:newCommandTimeout"], 600);
        assert_eq!(caps["appium:locale"], "de_DE");
    }

    #[test]
    fn fresh_worker_is_uninitialized() {
        let manager = SessionManager::new(Arc::new(CapabilityConfig::default()));
        let worker = manager.register();
        assert_eq!(worker.state(), SessionState::Uninitialized);
        assert!(!worker.is_initialized());
        assert!(matches!(worker.active_session(), Err(SessionError::NotInitialized)));
        assert_eq!(manager.active_sessions(), 0);
    }

    #[test]
    fn workers_have_distinct_ids() {
        let manager = SessionManager::new(Arc::new(CapabilityConfig::default()));
        let a = manager.register();
        let b = manager.register();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn session_error_display() {
        assert!(SessionError::NotInitialized.to_string().contains("initialize()"));
        let err = SessionError::ServerUnavailable {
            endpoint: "http://127.0.0.1:4723/".into(),
            source: DriverError::InvalidResponse("x".into()),
        };
        assert!(err.to_string().contains("127.0.0.1:4723"));
    }
}
