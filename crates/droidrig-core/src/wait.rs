//! Explicit-wait synchronization for UI interactions.
//!
//! A [`Waiter`] polls an element until it is visible (or visible and enabled)
//! or the explicit-wait timeout elapses. Every probe is bounded by the time
//! remaining, so a slow server-side lookup cannot push a wait past its
//! deadline by more than one poll interval.
//!
//! Two families of operations live here:
//!
//! - Actions ([`Waiter::safe_click`], [`Waiter::safe_type`],
//!   [`Waiter::safe_get_text`]) return a typed [`WaitError`]. A failed click
//!   always surfaces.
//! - Queries ([`Waiter::is_displayed`], [`Waiter::all_displayed`]) return a
//!   plain `bool` and never fail; any fault reads as "not displayed".

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{self, Instant};
use tracing::{debug, debug_span, error, info, Instrument};

use crate::config::CapabilityConfig;
use crate::element::UiElement;
use crate::webdriver::DriverError;

/// Default time between probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Shortest allowed time between probes.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Stand-in deadline for timeouts too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// What a wait is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    /// Present and rendered.
    Visible,
    /// Present, rendered and enabled.
    Clickable,
}

/// An action dispatched after a successful wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Click,
    Type,
    GetText,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Click => "click",
            Self::Type => "type",
            Self::GetText => "get text",
        };
        f.write_str(name)
    }
}

/// Errors from waits and the actions built on them.
#[derive(Error, Debug)]
pub enum WaitError {
    /// The element was not visible before the deadline.
    #[error("Element {element} not visible after {timeout:?}")]
    ElementNotVisible {
        element: String,
        timeout: Duration,
        /// The last error seen while polling, if any.
        #[source]
        cause: Option<DriverError>,
    },

    /// The element was not visible and enabled before the deadline.
    #[error("Element {element} not clickable after {timeout:?}")]
    ElementNotInteractable {
        element: String,
        timeout: Duration,
        #[source]
        cause: Option<DriverError>,
    },

    /// An action failed, either in its wait or in the dispatch itself.
    #[error("Failed to {action} element {element}")]
    ActionFailed {
        action: Action,
        element: String,
        #[source]
        source: ActionFailure,
    },
}

/// The underlying cause of [`WaitError::ActionFailed`].
#[derive(Error, Debug)]
pub enum ActionFailure {
    #[error(transparent)]
    Wait(Box<WaitError>),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

impl From<WaitError> for ActionFailure {
    fn from(err: WaitError) -> Self {
        Self::Wait(Box::new(err))
    }
}

impl WaitError {
    /// Returns true for the deadline-class variants.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ElementNotVisible { .. } | Self::ElementNotInteractable { .. }
        )
    }
}

/// A single synchronization request.
///
/// Built by [`Waiter`] and consumed by [`WaitCondition::wait`].
pub struct WaitCondition<'a, E: UiElement + ?Sized> {
    pub element: &'a E,
    pub kind: WaitKind,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl<'a, E: UiElement + ?Sized> WaitCondition<'a, E> {
    pub fn new(element: &'a E, kind: WaitKind, timeout: Duration) -> Self {
        Self {
            element,
            kind,
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL.min(timeout),
        }
    }

    /// Sets the poll interval, clamped to [`MIN_POLL_INTERVAL`] and the timeout.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = clamp_poll_interval(interval, self.timeout);
        self
    }

    /// Polls until the condition holds or the timeout elapses.
    pub async fn wait(self) -> Result<&'a E, WaitError> {
        let span = debug_span!(
            "wait",
            element = %self.element.describe(),
            kind = ?self.kind,
            timeout_ms = self.timeout.as_millis() as u64,
        );
        self.poll().instrument(span).await
    }

    async fn poll(self) -> Result<&'a E, WaitError> {
        let start = Instant::now();
        let deadline = start
            .checked_add(self.timeout)
            .unwrap_or_else(|| start + FAR_FUTURE);
        let mut last_error = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match time::timeout(remaining, self.probe()).await {
                Ok(Ok(true)) => return Ok(self.element),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => {
                    debug!(element = %self.element.describe(), error = %e, "probe failed");
                    last_error = Some(e);
                }
                Err(_) => debug!(element = %self.element.describe(), "probe cut off at deadline"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.expired(last_error));
            }
            time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn probe(&self) -> Result<bool, DriverError> {
        let displayed = self.element.is_displayed().await?;
        match self.kind {
            WaitKind::Visible => Ok(displayed),
            WaitKind::Clickable if !displayed => Ok(false),
            WaitKind::Clickable => self.element.is_enabled().await,
        }
    }

    fn expired(&self, cause: Option<DriverError>) -> WaitError {
        let element = self.element.describe();
        let timeout = self.timeout;
        match self.kind {
            WaitKind::Visible => WaitError::ElementNotVisible { element, timeout, cause },
            WaitKind::Clickable => WaitError::ElementNotInteractable { element, timeout, cause },
        }
    }
}

/// Runs waits and wait-guarded actions with a fixed timeout.
#[derive(Debug, Clone, Copy)]
pub struct Waiter {
    timeout: Duration,
    poll_interval: Duration,
}

impl Waiter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL.min(timeout),
        }
    }

    /// A waiter using the configured explicit-wait duration.
    pub fn from_config(config: &CapabilityConfig) -> Self {
        Self::new(config.explicit_wait())
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = clamp_poll_interval(interval, self.timeout);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn condition<'a, E: UiElement + ?Sized>(&self, element: &'a E, kind: WaitKind) -> WaitCondition<'a, E> {
        WaitCondition::new(element, kind, self.timeout).with_poll_interval(self.poll_interval)
    }

    /// Waits until `element` is displayed.
    pub async fn wait_visible<'a, E: UiElement + ?Sized>(&self, element: &'a E) -> Result<&'a E, WaitError> {
        self.condition(element, WaitKind::Visible).wait().await.map_err(|e| {
            error!(element = %element.describe(), error = %e, "element not visible");
            e
        })
    }

    /// Waits until `element` is displayed and enabled.
    pub async fn wait_clickable<'a, E: UiElement + ?Sized>(&self, element: &'a E) -> Result<&'a E, WaitError> {
        self.condition(element, WaitKind::Clickable).wait().await.map_err(|e| {
            error!(element = %element.describe(), error = %e, "element not clickable");
            e
        })
    }

    pub async fn safe_click<E: UiElement + ?Sized>(&self, element: &E) -> Result<(), WaitError> {
        let result: Result<(), ActionFailure> = async {
            self.wait_clickable(element).await?.click().await?;
            Ok(())
        }
        .await;
        self.finish(Action::Click, element, result)?;
        info!(element = %element.describe(), "clicked element");
        Ok(())
    }

    /// Waits for `element`, clears it, then types `text`.
    pub async fn safe_type<E: UiElement + ?Sized>(&self, element: &E, text: &str) -> Result<(), WaitError> {
        let result: Result<(), ActionFailure> = async {
            let element = self.wait_visible(element).await?;
            element.clear().await?;
            element.send_keys(text).await?;
            Ok(())
        }
        .await;
        self.finish(Action::Type, element, result)?;
        info!(element = %element.describe(), chars = text.chars().count(), "entered text");
        Ok(())
    }

    pub async fn safe_get_text<E: UiElement + ?Sized>(&self, element: &E) -> Result<String, WaitError> {
        let result: Result<String, ActionFailure> = async {
            let text = self.wait_visible(element).await?.text().await?;
            Ok(text)
        }
        .await;
        let text = self.finish(Action::GetText, element, result)?;
        info!(element = %element.describe(), text = %text, "retrieved text");
        Ok(text)
    }

    /// Returns whether `element` is displayed right now.
    ///
    /// Never fails: errors, a missing element and a lookup that outlasts the
    /// timeout all read as `false`.
    pub async fn is_displayed<E: UiElement + ?Sized>(&self, element: &E) -> bool {
        match time::timeout(self.timeout, element.is_displayed()).await {
            Ok(Ok(displayed)) => displayed,
            Ok(Err(e)) => {
                debug!(element = %element.describe(), error = %e, "element not displayed");
                false
            }
            Err(_) => {
                debug!(element = %element.describe(), "display check timed out");
                false
            }
        }
    }

    /// Returns true if every element is displayed. Never fails.
    pub async fn all_displayed(&self, elements: &[&dyn UiElement]) -> bool {
        for element in elements {
            if !self.is_displayed(*element).await {
                return false;
            }
        }
        true
    }

    fn finish<T, E: UiElement + ?Sized>(
        &self,
        action: Action,
        element: &E,
        result: Result<T, ActionFailure>,
    ) -> Result<T, WaitError> {
        result.map_err(|source| {
            let element = element.describe();
            error!(element = %element, action = %action, error = %source, "action failed");
            WaitError::ActionFailed { action, element, source }
        })
    }
}

fn clamp_poll_interval(interval: Duration, timeout: Duration) -> Duration {
    interval.max(MIN_POLL_INTERVAL).min(timeout)
}
