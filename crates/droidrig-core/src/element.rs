//! Element locators and the element capability trait.
//!
//! The synchronization engine in [`crate::wait`] depends only on the
//! [`UiElement`] trait, which keeps it independent of the remote protocol.
//! [`RemoteElement`] is the production implementation: a locator bound to a
//! live session.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::webdriver::{DriverError, RemoteSession};

/// How to find an element in the Android UI tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "value", rename_all = "snake_case")]
pub enum Locator {
    /// Android resource id, e.g. `com.example:id/login`.
    Id(String),
    /// Content description.
    AccessibilityId(String),
    XPath(String),
    /// Widget class, e.g. `android.widget.Button`.
    ClassName(String),
    /// A `UiSelector` expression evaluated by UiAutomator2.
    UiAutomator(String),
}

impl Locator {
    /// Parses a strategy name as typed on the command line.
    ///
    /// Accepts both the W3C names (`accessibility id`) and the short forms
    /// (`accessibility-id`, `aid`).
    pub fn parse(strategy: &str, value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let locator = match strategy.to_ascii_lowercase().as_str() {
            "id" => Self::Id(value),
            "accessibility id" | "accessibility-id" | "aid" => Self::AccessibilityId(value),
            "xpath" => Self::XPath(value),
            "class name" | "class-name" | "class" => Self::ClassName(value),
            "-android uiautomator" | "uiautomator" => Self::UiAutomator(value),
            _ => return None,
        };
        Some(locator)
    }

    /// The W3C `using` value for this locator.
    pub fn strategy(&self) -> &'static str {
        match self {
            Self::Id(_) => "id",
            Self::AccessibilityId(_) => "accessibility id",
            Self::XPath(_) => "xpath",
            Self::ClassName(_) => "class name",
            Self::UiAutomator(_) => "-android uiautomator",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Id(v)
            | Self::AccessibilityId(v)
            | Self::XPath(v)
            | Self::ClassName(v)
            | Self::UiAutomator(v) => v,
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.strategy(), self.value())
    }
}

/// An element reference that can be queried and acted on.
///
/// Implementations resolve the element lazily; an element that is absent
/// reports [`DriverError::NoSuchElement`] rather than `false` so callers can
/// tell "hidden" from "missing".
#[async_trait]
pub trait UiElement: Send + Sync {
    /// Human-readable description used in logs and errors.
    fn describe(&self) -> String;

    async fn is_displayed(&self) -> Result<bool, DriverError>;

    async fn is_enabled(&self) -> Result<bool, DriverError>;

    async fn text(&self) -> Result<String, DriverError>;

    async fn click(&self) -> Result<(), DriverError>;

    async fn clear(&self) -> Result<(), DriverError>;

    async fn send_keys(&self, text: &str) -> Result<(), DriverError>;
}

/// A locator bound to a session.
///
/// Every call re-runs the lookup, so a poll never holds on to a stale
/// reference after the screen re-renders.
#[derive(Debug, Clone)]
pub struct RemoteElement {
    session: Arc<RemoteSession>,
    locator: Locator,
}

impl RemoteElement {
    pub fn new(session: Arc<RemoteSession>, locator: Locator) -> Self {
        Self { session, locator }
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    async fn resolve(&self) -> Result<String, DriverError> {
        self.session.find_element(&self.locator).await
    }
}

#[async_trait]
impl UiElement for RemoteElement {
    fn describe(&self) -> String {
        self.locator.to_string()
    }

    async fn is_displayed(&self) -> Result<bool, DriverError> {
        let id = self.resolve().await?;
        self.session.element_displayed(&id).await
    }

    async fn is_enabled(&self) -> Result<bool, DriverError> {
        let id = self.resolve().await?;
        self.session.element_enabled(&id).await
    }

    async fn text(&self) -> Result<String, DriverError> {
        let id = self.resolve().await?;
        self.session.element_text(&id).await
    }

    async fn click(&self) -> Result<(), DriverError> {
        let id = self.resolve().await?;
        self.session.element_click(&id).await
    }

    async fn clear(&self) -> Result<(), DriverError> {
        let id = self.resolve().await?;
        self.session.element_clear(&id).await
    }

    async fn send_keys(&self, text: &str) -> Result<(), DriverError> {
        let id = self.resolve().await?;
        self.session.element_send_keys(&id, text).await
    }
}
