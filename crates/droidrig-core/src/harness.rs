//! Per-test setup and teardown.
//!
//! [`Harness`] ties device provisioning and the session manager together the
//! way a test runner needs them: prepare the device, open the worker's
//! session, run the test, close the session no matter what happened.
//!
//! ```no_run
//! use droidrig_core::config::CapabilityConfig;
//! use droidrig_core::harness::Harness;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let harness = Harness::from_config(CapabilityConfig::global().clone());
//!     let mut worker = harness.worker();
//!
//!     harness.set_up(&mut worker).await?;
//!     // ... drive the app ...
//!     harness.tear_down(&mut worker).await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::CapabilityConfig;
use crate::device::{Adb, DeviceBridge, DeviceError, DeviceProvisioner};
use crate::session::{SessionError, SessionManager, Worker};
use crate::wait::Waiter;
use crate::webdriver::RemoteSession;

/// Errors from test setup.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// Device preparation failed.
    #[error("Device preparation failed: {0}")]
    Device(#[from] DeviceError),

    /// The worker's session could not be opened.
    #[error("Session setup failed: {0}")]
    Session(#[from] SessionError),

    /// The blocking provisioning task panicked or was cancelled.
    #[error("Provisioning task failed: {0}")]
    Join(String),
}

/// Setup and teardown for test workers.
pub struct Harness<B = Adb> {
    sessions: Arc<SessionManager>,
    provisioner: Arc<DeviceProvisioner<B>>,
    waiter: Waiter,
}

impl Harness<Adb> {
    /// Builds a harness that provisions through `adb` and connects to the
    /// configured automation server.
    pub fn from_config(config: CapabilityConfig) -> Self {
        let provisioner = DeviceProvisioner::from_config(&config);
        Self::new(SessionManager::new(Arc::new(config)), provisioner)
    }
}

impl<B: DeviceBridge + 'static> Harness<B> {
    pub fn new(sessions: Arc<SessionManager>, provisioner: DeviceProvisioner<B>) -> Self {
        let waiter = Waiter::from_config(sessions.config());
        Self {
            sessions,
            provisioner: Arc::new(provisioner),
            waiter,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn provisioner(&self) -> &DeviceProvisioner<B> {
        &self.provisioner
    }

    /// A waiter using the configured explicit wait.
    pub fn waiter(&self) -> Waiter {
        self.waiter
    }

    /// Registers a new worker with the session manager.
    pub fn worker(&self) -> Worker {
        self.sessions.register()
    }

    /// Prepares the device, then opens the worker's session.
    ///
    /// Provisioning shells out synchronously, so it runs on the blocking pool.
    pub async fn set_up(&self, worker: &mut Worker) -> Result<Arc<RemoteSession>, HarnessError> {
        info!(worker = %worker.id(), "test setup started");

        let provisioner = Arc::clone(&self.provisioner);
        tokio::task::spawn_blocking(move || provisioner.prepare_device())
            .await
            .map_err(|e| HarnessError::Join(e.to_string()))?
            .inspect_err(|e| error!(worker = %worker.id(), error = %e, "device preparation failed"))?;

        let session = worker.initialize().await?;
        info!(worker = %worker.id(), session_id = session.id(), "test setup completed");
        Ok(session)
    }

    /// Closes the worker's session. Never fails.
    pub async fn tear_down(&self, worker: &mut Worker) {
        if !worker.is_initialized() {
            warn!(worker = %worker.id(), "session was not initialized, skipping quit");
        }
        worker.teardown().await;
        info!(worker = %worker.id(), "test teardown completed");
    }
}
