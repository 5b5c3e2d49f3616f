//! Shared test helpers for droidrig-core integration tests.
//!
//! This module provides a scripted mock automation server on a raw TCP
//! listener, a scripted device bridge, and fake UI elements whose state
//! changes over (tokio) time.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

use droidrig_core::config::{keys, CapabilityConfig};
use droidrig_core::device::{CommandOutput, DeviceBridge};
use droidrig_core::element::UiElement;
use droidrig_core::webdriver::DriverError;

// ---------------------------------------------------------------------------
// Mock automation server
// ---------------------------------------------------------------------------

/// One HTTP request as seen by the mock server.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: Value,
}

impl RecordedRequest {
    /// Path segments, e.g. `["session", "s-1", "element"]`.
    pub fn segments(&self) -> Vec<&str> {
        self.path.trim_matches('/').split('/').collect()
    }
}

/// The mock's reply to one request.
pub struct MockReply {
    pub status: u16,
    pub body: Value,
    pub delay: Option<Duration>,
}

impl MockReply {
    pub fn ok(value: Value) -> Self {
        Self {
            status: 200,
            body: json!({ "value": value }),
            delay: None,
        }
    }

    /// A W3C error reply.
    pub fn error(status: u16, error: &str, message: &str) -> Self {
        Self {
            status,
            body: json!({ "value": { "error": error, "message": message, "stacktrace": "" } }),
            delay: None,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

type Router = dyn Fn(&RecordedRequest) -> MockReply + Send + Sync;

/// A scripted automation server on a random local port.
///
/// Every connection carries exactly one request and is closed after the reply.
pub struct MockServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    _handle: tokio::task::JoinHandle<()>,
}

impl MockServer {
    pub async fn start<F>(router: F) -> Self
    where
        F: Fn(&RecordedRequest) -> MockReply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let router: Arc<Router> = Arc::new(router);

        let recorded = Arc::clone(&requests);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let router = Arc::clone(&router);
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    serve_one(stream, router, recorded).await;
                });
            }
        });

        Self {
            addr,
            requests,
            _handle: handle,
        }
    }

    /// An Appium-like server that accepts every command.
    pub async fn appium() -> Self {
        Self::start(appium_router(|_| None)).await
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests with `method` whose path ends with `suffix`.
    pub fn count(&self, method: &str, suffix: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && r.path.ends_with(suffix))
            .count()
    }
}

async fn serve_one(mut stream: TcpStream, router: Arc<Router>, recorded: Arc<Mutex<Vec<RecordedRequest>>>) {
    let Some(request) = read_request(&mut stream).await else {
        return;
    };
    recorded.lock().unwrap().push(request.clone());

    let reply = router(&request);
    if let Some(delay) = reply.delay {
        tokio::time::sleep(delay).await;
    }

    let body = reply.body.to_string();
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        reply.status,
        reason(reply.status),
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.flush().await;
}

async fn read_request(stream: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.lines();
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let body_bytes = &buf[header_end..buf.len().min(header_end + content_length)];
    let body = serde_json::from_slice(body_bytes).unwrap_or(Value::Null);
    Some(RecordedRequest { method, path, body })
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Builds an Appium-like router. `overrides` is consulted first; returning
/// `None` falls through to the default behavior.
///
/// Defaults: status ready, sessions `s-1`, `s-2`, ... created on demand,
/// every element found as `el-1` and displayed, enabled, with text `"ok"`.
pub fn appium_router<O>(overrides: O) -> impl Fn(&RecordedRequest) -> MockReply + Send + Sync + 'static
where
    O: Fn(&RecordedRequest) -> Option<MockReply> + Send + Sync + 'static,
{
    let sessions = AtomicUsize::new(0);
    move |request| {
        if let Some(reply) = overrides(request) {
            return reply;
        }
        let segments = request.segments();
        match (request.method.as_str(), segments.as_slice()) {
            ("GET", ["status"]) => MockReply::ok(json!({ "ready": true, "message": "ready" })),
            ("POST", ["session"]) => {
                let n = sessions.fetch_add(1, Ordering::SeqCst) + 1;
                let caps = request.body["capabilities"]["alwaysMatch"].clone();
                MockReply::ok(json!({ "sessionId": format!("s-{}", n), "capabilities": caps }))
            }
            ("DELETE", ["session", _]) => MockReply::ok(Value::Null),
            ("POST", ["session", _, "timeouts"]) => MockReply::ok(Value::Null),
            ("POST", ["session", _, "element"]) => {
                MockReply::ok(json!({ "element-6066-11e4-a52e-4f735466cecf": "el-1" }))
            }
            ("GET", ["session", _, "element", _, "displayed"]) => MockReply::ok(json!(true)),
            ("GET", ["session", _, "element", _, "enabled"]) => MockReply::ok(json!(true)),
            ("GET", ["session", _, "element", _, "text"]) => MockReply::ok(json!("ok")),
            ("POST", ["session", _, "element", _, _]) => MockReply::ok(Value::Null),
            ("POST", ["session", _, "back"]) => MockReply::ok(Value::Null),
            // 1x1 transparent PNG
            ("GET", ["session", _, "screenshot"]) => MockReply::ok(json!(
                "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII="
            )),
            _ => MockReply::error(404, "unknown command", &format!("{} {}", request.method, request.path)),
        }
    }
}

/// A configuration pointing at `server_url` with no app binary.
pub fn config_for(server_url: &str) -> CapabilityConfig {
    config_with(server_url, &[])
}

pub fn config_with(server_url: &str, extra: &[(&str, &str)]) -> CapabilityConfig {
    let mut settings: HashMap<String, String> = HashMap::new();
    settings.insert(keys::SERVER_URL.to_string(), server_url.to_string());
    settings.insert(keys::APP_PATH.to_string(), String::new());
    for (key, value) in extra {
        settings.insert(key.to_string(), value.to_string());
    }
    CapabilityConfig::from_settings(&settings)
}

// ---------------------------------------------------------------------------
// Scripted device bridge
// ---------------------------------------------------------------------------

pub fn output(exit_code: i32, stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: Some(exit_code),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

type Script = dyn Fn(&[&str]) -> std::io::Result<CommandOutput> + Send + Sync;

/// A [`DeviceBridge`] that records every invocation and answers from a script.
pub struct FakeBridge {
    calls: Mutex<Vec<Vec<String>>>,
    script: Box<Script>,
}

impl FakeBridge {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&[&str]) -> std::io::Result<CommandOutput> + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            script: Box::new(script),
        }
    }

    /// A connected emulator where every command succeeds and `installed`
    /// controls whether the app package is listed.
    pub fn healthy(package: &'static str, installed: bool) -> Self {
        Self::new(move |args| {
            Ok(match args {
                ["devices"] => output(0, "List of devices attached\nemulator-5554\tdevice\n"),
                ["shell", "pm", "list", "packages", ..] if installed => {
                    output(0, &format!("package:{}\n", package))
                }
                ["shell", "pm", "list", "packages", ..] => output(0, ""),
                ["install", ..] => output(0, "Performing Streamed Install\nSuccess\n"),
                _ => output(0, ""),
            })
        })
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls whose arguments start with `prefix`.
    pub fn count(&self, prefix: &[&str]) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.len() >= prefix.len() && call.iter().zip(prefix).all(|(a, b)| a == b))
            .count()
    }
}

impl DeviceBridge for FakeBridge {
    fn run(&self, args: &[&str]) -> std::io::Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(args.iter().map(|a| a.to_string()).collect());
        (self.script)(args)
    }
}

// ---------------------------------------------------------------------------
// Fake elements
// ---------------------------------------------------------------------------

/// An element that appears and becomes enabled at fixed offsets from its
/// creation, measured on the tokio clock.
#[derive(Debug)]
pub struct TimedElement {
    name: String,
    created: Instant,
    visible_after: Option<Duration>,
    enabled_after: Option<Duration>,
    pub clicks: AtomicUsize,
    pub typed: Mutex<Vec<String>>,
    pub clears: AtomicUsize,
    pub fail_click: bool,
}

impl TimedElement {
    pub fn new(name: &str, visible_after: Option<Duration>, enabled_after: Option<Duration>) -> Self {
        Self {
            name: name.to_string(),
            created: Instant::now(),
            visible_after,
            enabled_after,
            clicks: AtomicUsize::new(0),
            typed: Mutex::new(Vec::new()),
            clears: AtomicUsize::new(0),
            fail_click: false,
        }
    }

    /// Visible and enabled from the start.
    pub fn ready(name: &str) -> Self {
        Self::new(name, Some(Duration::ZERO), Some(Duration::ZERO))
    }

    /// Never visible.
    pub fn hidden(name: &str) -> Self {
        Self::new(name, None, None)
    }

    fn reached(&self, after: Option<Duration>) -> bool {
        after.is_some_and(|after| self.created.elapsed() >= after)
    }
}

#[async_trait]
impl UiElement for TimedElement {
    fn describe(&self) -> String {
        self.name.clone()
    }

    async fn is_displayed(&self) -> Result<bool, DriverError> {
        Ok(self.reached(self.visible_after))
    }

    async fn is_enabled(&self) -> Result<bool, DriverError> {
        Ok(self.reached(self.enabled_after))
    }

    async fn text(&self) -> Result<String, DriverError> {
        Ok(format!("{} text", self.name))
    }

    async fn click(&self) -> Result<(), DriverError> {
        if self.fail_click {
            return Err(DriverError::StaleElement(self.name.clone()));
        }
        self.clicks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) -> Result<(), DriverError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_keys(&self, text: &str) -> Result<(), DriverError> {
        self.typed.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// The kind of fault a [`FaultyElement`] injects.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    NoSuchElement,
    Stale,
    Remote,
    /// The query never completes.
    Hang,
}

/// An element whose every query fails with the configured fault.
#[derive(Debug)]
pub struct FaultyElement {
    pub fault: Fault,
}

impl FaultyElement {
    async fn fail<T>(&self) -> Result<T, DriverError> {
        match self.fault {
            Fault::NoSuchElement => Err(DriverError::NoSuchElement("gone".into())),
            Fault::Stale => Err(DriverError::StaleElement("detached".into())),
            Fault::Remote => Err(DriverError::Remote {
                status: 500,
                error: "unknown error".into(),
                message: "instrumentation crashed".into(),
            }),
            Fault::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl UiElement for FaultyElement {
    fn describe(&self) -> String {
        format!("faulty({:?})", self.fault)
    }

    async fn is_displayed(&self) -> Result<bool, DriverError> {
        self.fail().await
    }

    async fn is_enabled(&self) -> Result<bool, DriverError> {
        self.fail().await
    }

    async fn text(&self) -> Result<String, DriverError> {
        self.fail().await
    }

    async fn click(&self) -> Result<(), DriverError> {
        self.fail().await
    }

    async fn clear(&self) -> Result<(), DriverError> {
        self.fail().await
    }

    async fn send_keys(&self, _text: &str) -> Result<(), DriverError> {
        self.fail().await
    }
}
