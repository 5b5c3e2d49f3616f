//! # droidrig-core
//!
//! Core library for Android UI automation against an Appium-compatible server.
//!
//! This crate coordinates the three external, non-deterministic resources a UI
//! test depends on: the automation server process, the target device, and the
//! asynchronously rendered UI.
//!
//! ## Modules
//!
//! - [`config`] - Capability configuration, resolved once per process
//! - [`device`] - Device provisioning through `adb` (install, grants, app control)
//! - [`webdriver`] - Minimal W3C WebDriver client and server status probe
//! - [`element`] - Element locators and the [`element::UiElement`] trait
//! - [`session`] - Per-worker session lifecycle with isolated slots
//! - [`wait`] - Explicit waits and the wait-guarded action family
//! - [`harness`] - Per-test setup and teardown
//!
//! ## External Dependencies
//!
//! - **Android platform tools** (for `adb`) - device provisioning
//! - **Appium 2** with the UiAutomator2 driver - remote automation sessions
//!
//! ## Example
//!
//! ```no_run
//! use droidrig_core::config::CapabilityConfig;
//! use droidrig_core::element::{Locator, RemoteElement};
//! use droidrig_core::harness::Harness;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let harness = Harness::from_config(CapabilityConfig::global().clone());
//!     let mut worker = harness.worker();
//!     let session = harness.set_up(&mut worker).await?;
//!
//!     let login = RemoteElement::new(session, Locator::AccessibilityId("Login".into()));
//!     harness.waiter().safe_click(&login).await?;
//!
//!     harness.tear_down(&mut worker).await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod element;
pub mod harness;
pub mod session;
pub mod wait;
pub mod webdriver;
