//! Minimal W3C WebDriver client for Appium-compatible automation servers.
//!
//! This module provides [`RemoteSession`], the opaque connection handle owned
//! by the session manager, and [`probe_status`], the liveness check performed
//! before a session is opened. Only the commands droidrig needs are covered:
//! session open/close, timeouts, element lookup and element interaction,
//! back navigation and screenshots.
//!
//! All payloads follow the W3C shape `{"value": ...}`. Error responses are
//! decoded into [`DriverError`] so callers can tell a missing element from a
//! transport failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, debug_span, trace, Instrument};
use url::Url;

use crate::element::Locator;

/// W3C web element reference key.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// Pre-W3C (JSONWP) element reference key, still returned by some servers.
const LEGACY_ELEMENT_KEY: &str = "ELEMENT";

/// Default timeout for the status probe.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur while talking to the automation server.
#[derive(Error, Debug)]
pub enum DriverError {
    /// The HTTP request could not be sent or its body could not be read.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The automation server answered with a non-success status.
    #[error("Server returned {status}: {error}: {message}")]
    Remote {
        status: u16,
        /// W3C error code, e.g. `session not created`.
        error: String,
        message: String,
    },

    /// No element matched the locator.
    #[error("No such element: {0}")]
    NoSuchElement(String),

    /// The element reference is no longer attached to the UI tree.
    #[error("Stale element reference: {0}")]
    StaleElement(String),

    /// The response body did not have the expected shape.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The session was closed; it cannot be reused.
    #[error("Session {0} has been terminated")]
    SessionTerminated(String),

    /// An endpoint URL could not be built.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
}

impl DriverError {
    /// Returns true if the error means "the element is not there right now".
    pub fn is_element_absent(&self) -> bool {
        matches!(self, Self::NoSuchElement(_) | Self::StaleElement(_))
    }
}

/// Joins `path` onto the server base URL, keeping any base path such as `/wd/hub`.
fn endpoint_url(base: &Url, path: &str) -> Result<Url, DriverError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    Ok(base.join(path.trim_start_matches('/'))?)
}

/// Checks that the automation server is up.
///
/// Sends `GET {endpoint}/status` and succeeds only on HTTP 200 within
/// `timeout` (applied to both connect and read).
pub async fn probe_status(client: &Client, endpoint: &Url, timeout: Duration) -> Result<(), DriverError> {
    let url = endpoint_url(endpoint, "status")?;
    let response = client
        .get(url.clone())
        .timeout(timeout)
        .send()
        .await?;
    let status = response.status();
    debug!(url = %url, status = status.as_u16(), "status probe");
    if status == StatusCode::OK {
        Ok(())
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(remote_error(status, &body))
    }
}

/// Decodes a W3C error body into a [`DriverError`].
fn remote_error(status: StatusCode, body: &str) -> DriverError {
    let value: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let detail = value.get("value").unwrap_or(&value);
    let error = detail
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    let message = detail
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string());

    match error.as_str() {
        "no such element" => DriverError::NoSuchElement(message),
        "stale element reference" => DriverError::StaleElement(message),
        _ => DriverError::Remote {
            status: status.as_u16(),
            error,
            message,
        },
    }
}

/// Extracts an element id from a `find element` result.
fn element_id(value: &Value) -> Option<String> {
    value
        .get(ELEMENT_KEY)
        .or_else(|| value.get(LEGACY_ELEMENT_KEY))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// One open session on the automation server.
///
/// Created by [`RemoteSession::open`], closed by [`RemoteSession::quit`].
/// Once quit, every command fails with [`DriverError::SessionTerminated`].
#[derive(Debug)]
pub struct RemoteSession {
    client: Client,
    endpoint: Url,
    id: String,
    capabilities: Value,
    terminated: AtomicBool,
}

impl RemoteSession {
    /// Opens a new session with the given capability set.
    ///
    /// Capabilities are sent as `alwaysMatch`.
    pub async fn open(client: Client, endpoint: &Url, capabilities: &Map<String, Value>) -> Result<Self, DriverError> {
        let body = json!({
            "capabilities": {
                "alwaysMatch": capabilities,
                "firstMatch": [{}],
            }
        });
        let url = endpoint_url(endpoint, "session")?;
        let value = send(&client, Method::POST, url, Some(body)).await?;

        let id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::InvalidResponse("missing sessionId".to_string()))?
            .to_string();
        let capabilities = value.get("capabilities").cloned().unwrap_or(Value::Null);

        debug!(session_id = %id, "session opened");
        Ok(Self {
            client,
            endpoint: endpoint.clone(),
            id,
            capabilities,
            terminated: AtomicBool::new(false),
        })
    }

    /// The server-assigned session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Capabilities the server reported when the session was created.
    pub fn capabilities(&self) -> &Value {
        &self.capabilities
    }

    /// Returns true once [`quit`](Self::quit) has been called.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Sets the session-wide implicit element lookup timeout.
    pub async fn set_implicit_wait(&self, wait: Duration) -> Result<(), DriverError> {
        let ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
        self.command(Method::POST, "timeouts", Some(json!({ "implicit": ms })))
            .await
            .map(|_| ())
    }

    /// Finds the first element matching `locator` and returns its id.
    pub async fn find_element(&self, locator: &Locator) -> Result<String, DriverError> {
        let body = json!({ "using": locator.strategy(), "value": locator.value() });
        let value = self.command(Method::POST, "element", Some(body)).await?;
        element_id(&value).ok_or_else(|| {
            DriverError::InvalidResponse(format!("no element reference in response for {}", locator))
        })
    }

    pub async fn element_displayed(&self, element_id: &str) -> Result<bool, DriverError> {
        self.element_flag(element_id, "displayed").await
    }

    pub async fn element_enabled(&self, element_id: &str) -> Result<bool, DriverError> {
        self.element_flag(element_id, "enabled").await
    }

    pub async fn element_text(&self, element_id: &str) -> Result<String, DriverError> {
        let path = format!("element/{}/text", element_id);
        let value = self.command(Method::GET, &path, None).await?;
        match value {
            Value::String(text) => Ok(text),
            Value::Null => Ok(String::new()),
            other => Err(DriverError::InvalidResponse(format!("expected text, got {}", other))),
        }
    }

    pub async fn element_click(&self, element_id: &str) -> Result<(), DriverError> {
        let path = format!("element/{}/click", element_id);
        self.command(Method::POST, &path, Some(json!({}))).await.map(|_| ())
    }

    pub async fn element_clear(&self, element_id: &str) -> Result<(), DriverError> {
        let path = format!("element/{}/clear", element_id);
        self.command(Method::POST, &path, Some(json!({}))).await.map(|_| ())
    }

    /// Types `text` into the element.
    pub async fn element_send_keys(&self, element_id: &str, text: &str) -> Result<(), DriverError> {
        let path = format!("element/{}/value", element_id);
        let chars: Vec<String> = text.chars().map(String::from).collect();
        let body = json!({ "text": text, "value": chars });
        self.command(Method::POST, &path, Some(body)).await.map(|_| ())
    }

    /// Presses the system back button.
    pub async fn back(&self) -> Result<(), DriverError> {
        self.command(Method::POST, "back", Some(json!({}))).await.map(|_| ())
    }

    /// Captures the current screen as PNG bytes.
    pub async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        let value = self.command(Method::GET, "screenshot", None).await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| DriverError::InvalidResponse("screenshot is not a string".to_string()))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| DriverError::InvalidResponse(format!("screenshot is not base64: {}", e)))
    }

    /// Deletes the session on the server.
    ///
    /// The session is marked terminated before the request is sent, so it is
    /// never reused even if the request fails.
    pub async fn quit(&self) -> Result<(), DriverError> {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let url = endpoint_url(&self.endpoint, &format!("session/{}", self.id))?;
        send(&self.client, Method::DELETE, url, None).await?;
        debug!(session_id = %self.id, "session deleted");
        Ok(())
    }

    async fn element_flag(&self, element_id: &str, name: &str) -> Result<bool, DriverError> {
        let path = format!("element/{}/{}", element_id, name);
        let value = self.command(Method::GET, &path, None).await?;
        value
            .as_bool()
            .ok_or_else(|| DriverError::InvalidResponse(format!("expected boolean for {}, got {}", name, value)))
    }

    /// Sends a session-scoped command, returning the `value` member.
    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, DriverError> {
        if self.is_terminated() {
            return Err(DriverError::SessionTerminated(self.id.clone()));
        }
        let url = endpoint_url(&self.endpoint, &format!("session/{}/{}", self.id, path))?;
        send(&self.client, method, url, body).await
    }
}

async fn send(client: &Client, method: Method, url: Url, body: Option<Value>) -> Result<Value, DriverError> {
    let span = debug_span!("webdriver", method = %method, path = url.path());
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let (status, text) = async {
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        trace!(status = status.as_u16(), len = text.len(), "webdriver response");
        Ok::<_, DriverError>((status, text))
    }
    .instrument(span)
    .await?;

    if !status.is_success() {
        return Err(remote_error(status, &text));
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    let mut value: Value = serde_json::from_str(&text)
        .map_err(|e| DriverError::InvalidResponse(format!("{}: {}", e, text)))?;
    Ok(value.get_mut("value").map(Value::take).unwrap_or(Value::Null))
}
