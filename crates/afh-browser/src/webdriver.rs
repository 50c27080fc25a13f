// SPDX-License-Identifier: MIT OR Apache-2.0
//! W3C WebDriver backend.
//!
//! Each [`BrowsingContext`] is one WebDriver session, so contexts never share
//! storage. Window handles map to [`Surface`]s. The protocol only has one
//! focused window per session, so every surface command first switches focus
//! while holding the session's focus lock.

use crate::{Browser, BrowserError, BrowsingContext, Surface, SurfaceHandle, scripts};
use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Method;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Key under which W3C drivers return element references.
const ELEMENT_KEY: &str = "element-6066-11e4-a6c3-4a6c6f636b6c";

/// Connection and polling settings for [`WebDriverBrowser`].
#[derive(Debug, Clone)]
pub struct WebDriverOptions {
    /// Base URL of the WebDriver endpoint (e.g. `http://localhost:4444`).
    pub endpoint: String,
    /// `browserName` capability.
    pub browser_name: String,
    /// Request a headless browser.
    pub headless: bool,
    /// Interval between polls in wait loops and window watchers.
    pub poll_interval: Duration,
    /// How long the URL must stay unchanged before navigation counts as idle.
    pub navigation_quiet: Duration,
    /// Deadline for a single WebDriver HTTP command.
    pub request_timeout: Duration,
}

impl WebDriverOptions {
    /// Options for `endpoint` with a headless Chrome and default polling.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            browser_name: "chrome".into(),
            headless: true,
            poll_interval: Duration::from_millis(100),
            navigation_quiet: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Build the `alwaysMatch` capabilities for a new session.
pub fn capabilities(options: &WebDriverOptions) -> Value {
    let mut caps = json!({ "browserName": options.browser_name });
    if options.headless {
        match options.browser_name.as_str() {
            "chrome" | "chromium" => {
                caps["goog:chromeOptions"] = json!({ "args": ["--headless=new", "--window-size=1280,900"] });
            }
            "MicrosoftEdge" | "msedge" => {
                caps["ms:edgeOptions"] = json!({ "args": ["--headless=new", "--window-size=1280,900"] });
            }
            "firefox" => {
                caps["moz:firefoxOptions"] = json!({ "args": ["-headless"] });
            }
            _ => {}
        }
    }
    caps
}

// ---------------------------------------------------------------------------
// Wire
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Wire {
    http: reqwest::Client,
    endpoint: String,
    request_timeout: Duration,
}

impl Wire {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, BrowserError> {
        let url = format!("{}/{}", self.endpoint.trim_end_matches('/'), path);
        debug!(target: "afh.webdriver", %method, %url, "command");
        let what = format!("{method} {path}");
        let mut req = self.http.request(method, &url).timeout(self.request_timeout);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                BrowserError::Timeout {
                    what,
                    timeout: self.request_timeout,
                }
            } else {
                BrowserError::Transport(e)
            }
        })?;
        let status = resp.status();
        let payload: Value = resp.json().await?;
        let value = payload.get("value").cloned().unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(value);
        }
        let error = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Err(BrowserError::WebDriver { error, message })
    }
}

fn is_wire_error(err: &BrowserError, code: &str) -> bool {
    matches!(err, BrowserError::WebDriver { error, .. } if error == code)
}

// ---------------------------------------------------------------------------
// Browser
// ---------------------------------------------------------------------------

/// A browser reached through a W3C WebDriver endpoint.
pub struct WebDriverBrowser {
    wire: Wire,
    options: Arc<WebDriverOptions>,
    sessions: Mutex<Vec<Arc<Session>>>,
}

impl WebDriverBrowser {
    /// Create a browser handle. No session is opened until [`Browser::new_context`].
    pub fn new(options: WebDriverOptions) -> Self {
        Self {
            wire: Wire {
                http: reqwest::Client::new(),
                endpoint: options.endpoint.clone(),
                request_timeout: options.request_timeout,
            },
            options: Arc::new(options),
            sessions: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Browser for WebDriverBrowser {
    fn name(&self) -> &str {
        "webdriver"
    }

    async fn new_context(&self) -> Result<Box<dyn BrowsingContext>, BrowserError> {
        let body = json!({ "capabilities": { "alwaysMatch": capabilities(&self.options) } });
        let value = self.wire.send(Method::POST, "session", Some(body)).await?;
        let id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::Protocol(format!("session response without id: {value}")))?
            .to_string();
        let window = self
            .wire
            .send(Method::GET, &format!("session/{id}/window"), None)
            .await?;
        let initial_window = window
            .as_str()
            .ok_or_else(|| BrowserError::Protocol(format!("window handle is not a string: {window}")))?
            .to_string();
        debug!(target: "afh.webdriver", session = %id, "session opened");

        let session = Arc::new(Session {
            wire: self.wire.clone(),
            options: Arc::clone(&self.options),
            focus: Mutex::new(Some(initial_window.clone())),
            initial_window,
            initial_taken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            id,
        });
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|s| !s.closed.load(Ordering::SeqCst));
        sessions.push(Arc::clone(&session));
        Ok(Box::new(WebDriverContext { session }))
    }

    /// Delete every session still open. All deletions are attempted; the
    /// first failure is returned.
    async fn close(&self) -> Result<(), BrowserError> {
        let sessions: Vec<_> = self.sessions.lock().await.drain(..).collect();
        let mut first_error = None;
        for session in sessions {
            if let Err(e) = session.delete().await {
                warn!(target: "afh.webdriver", session = %session.id, error = %e, "session delete failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

// ---------------------------------------------------------------------------
// Session / context
// ---------------------------------------------------------------------------

struct Session {
    wire: Wire,
    options: Arc<WebDriverOptions>,
    id: String,
    focus: Mutex<Option<String>>,
    initial_window: String,
    initial_taken: AtomicBool,
    closed: AtomicBool,
}

impl Session {
    fn path(&self, suffix: &str) -> String {
        if suffix.is_empty() {
            format!("session/{}", self.id)
        } else {
            format!("session/{}/{}", self.id, suffix)
        }
    }

    /// Run a command against `window`, switching focus first if needed.
    async fn command(
        &self,
        window: &str,
        method: Method,
        suffix: &str,
        body: Option<Value>,
    ) -> Result<Value, BrowserError> {
        let mut focus = self.focus.lock().await;
        self.focus_on(&mut focus, window).await?;
        self.wire.send(method, &self.path(suffix), body).await
    }

    async fn focus_on(&self, focus: &mut Option<String>, window: &str) -> Result<(), BrowserError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrowserError::SurfaceClosed {
                surface: window.to_string(),
            });
        }
        if focus.as_deref() == Some(window) {
            return Ok(());
        }
        match self
            .wire
            .send(Method::POST, &self.path("window"), Some(json!({ "handle": window })))
            .await
        {
            Ok(_) => {
                *focus = Some(window.to_string());
                Ok(())
            }
            Err(e) if is_wire_error(&e, "no such window") => Err(BrowserError::SurfaceClosed {
                surface: window.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn window_handles(&self) -> Result<Vec<String>, BrowserError> {
        let value = self
            .wire
            .send(Method::GET, &self.path("window/handles"), None)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| BrowserError::Protocol(format!("window handles: {e}")))
    }

    async fn delete(&self) -> Result<(), BrowserError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.wire.send(Method::DELETE, &self.path(""), None).await?;
        debug!(target: "afh.webdriver", session = %self.id, "session deleted");
        Ok(())
    }

    fn surface(self: &Arc<Self>, handle: String) -> SurfaceHandle {
        Arc::new(WebDriverSurface {
            session: Arc::clone(self),
            handle,
        })
    }
}

/// One WebDriver session.
pub struct WebDriverContext {
    session: Arc<Session>,
}

#[async_trait]
impl BrowsingContext for WebDriverContext {
    async fn new_page(&self) -> Result<SurfaceHandle, BrowserError> {
        if !self.session.initial_taken.swap(true, Ordering::SeqCst) {
            return Ok(self.session.surface(self.session.initial_window.clone()));
        }
        let value = self
            .session
            .wire
            .send(
                Method::POST,
                &self.session.path("window/new"),
                Some(json!({ "type": "tab" })),
            )
            .await?;
        let handle = value
            .get("handle")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::Protocol(format!("new window response: {value}")))?
            .to_string();
        Ok(self.session.surface(handle))
    }

    async fn open_surfaces(&self) -> Result<Vec<SurfaceHandle>, BrowserError> {
        if self.session.closed.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        Ok(self
            .session
            .window_handles()
            .await?
            .into_iter()
            .map(|h| self.session.surface(h))
            .collect())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.session.delete().await
    }
}

// ---------------------------------------------------------------------------
// Surface
// ---------------------------------------------------------------------------

/// A window handle inside a WebDriver session.
pub struct WebDriverSurface {
    session: Arc<Session>,
    handle: String,
}

impl WebDriverSurface {
    async fn command(
        &self,
        method: Method,
        suffix: &str,
        body: Option<Value>,
    ) -> Result<Value, BrowserError> {
        self.session
            .command(&self.handle, method, suffix, body)
            .await
    }

    async fn find_element(&self, selector: &str) -> Result<String, BrowserError> {
        let body = json!({ "using": "css selector", "value": selector });
        let value = match self.command(Method::POST, "element", Some(body)).await {
            Ok(v) => v,
            Err(e) if is_wire_error(&e, "no such element") => {
                return Err(BrowserError::ElementNotFound {
                    selector: selector.to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        value
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BrowserError::Protocol(format!("element reference missing: {value}")))
    }
}

#[async_trait]
impl Surface for WebDriverSurface {
    fn id(&self) -> &str {
        &self.handle
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.command(Method::POST, "url", Some(json!({ "url": url })))
            .await?;
        Ok(())
    }

    async fn reload(&self) -> Result<(), BrowserError> {
        self.command(Method::POST, "refresh", Some(json!({}))).await?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let element = self.find_element(selector).await?;
        self.command(
            Method::POST,
            &format!("element/{element}/click"),
            Some(json!({})),
        )
        .await?;
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), BrowserError> {
        let element = self.find_element(selector).await?;
        self.command(
            Method::POST,
            &format!("element/{element}/value"),
            Some(json!({ "text": text })),
        )
        .await?;
        Ok(())
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.find_element(selector).await {
                Ok(_) => return Ok(()),
                Err(BrowserError::ElementNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout {
                    what: format!("selector {selector}"),
                    timeout,
                });
            }
            tokio::time::sleep(self.session.options.poll_interval).await;
        }
    }

    async fn wait_for_navigation_idle(&self, timeout: Duration) -> Result<(), BrowserError> {
        let deadline = Instant::now() + timeout;
        let quiet = self.session.options.navigation_quiet;
        let mut last: Option<(String, Instant)> = None;
        loop {
            match self.evaluate(scripts::DOCUMENT_STATE, Vec::new()).await {
                Ok(value) => {
                    let state = value.get(0).and_then(Value::as_str).unwrap_or_default();
                    let href = value.get(1).and_then(Value::as_str).unwrap_or_default();
                    let now = Instant::now();
                    if state != "complete" {
                        last = None;
                    } else {
                        match &last {
                            Some((url, since)) if url == href => {
                                if now.duration_since(*since) >= quiet {
                                    return Ok(());
                                }
                            }
                            _ => last = Some((href.to_string(), now)),
                        }
                    }
                }
                // Script errors are expected while a document is being torn down.
                Err(BrowserError::WebDriver { .. }) => last = None,
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout {
                    what: "navigation idle".into(),
                    timeout,
                });
            }
            tokio::time::sleep(self.session.options.poll_interval).await;
        }
    }

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
        let value = self.command(Method::GET, "screenshot", None).await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| BrowserError::Protocol("screenshot is not a string".into()))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| BrowserError::Protocol(format!("screenshot base64: {e}")))
    }

    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value, BrowserError> {
        self.command(
            Method::POST,
            "execute/sync",
            Some(json!({ "script": script, "args": args })),
        )
        .await
    }

    async fn on_popup_opened(&self) -> Result<oneshot::Receiver<SurfaceHandle>, BrowserError> {
        let known: HashSet<String> = self.session.window_handles().await?.into_iter().collect();
        let (tx, rx) = oneshot::channel();
        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(session.options.poll_interval).await;
                if tx.is_closed() || session.closed.load(Ordering::SeqCst) {
                    return;
                }
                let Ok(handles) = session.window_handles().await else {
                    return;
                };
                if let Some(new) = handles.into_iter().find(|h| !known.contains(h)) {
                    debug!(target: "afh.webdriver", window = %new, "popup window detected");
                    let _ = tx.send(session.surface(new));
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn on_closed(&self) -> Result<oneshot::Receiver<()>, BrowserError> {
        let (tx, rx) = oneshot::channel();
        if self.is_closed().await {
            let _ = tx.send(());
            return Ok(rx);
        }
        let session = Arc::clone(&self.session);
        let handle = self.handle.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(session.options.poll_interval).await;
                if tx.is_closed() {
                    return;
                }
                let gone = session.closed.load(Ordering::SeqCst)
                    || match session.window_handles().await {
                        Ok(handles) => !handles.contains(&handle),
                        Err(_) => return,
                    };
                if gone {
                    let _ = tx.send(());
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn is_closed(&self) -> bool {
        if self.session.closed.load(Ordering::SeqCst) {
            return true;
        }
        match self.session.window_handles().await {
            Ok(handles) => !handles.contains(&self.handle),
            Err(_) => true,
        }
    }

    async fn close(&self) -> Result<(), BrowserError> {
        if self.is_closed().await {
            return Ok(());
        }
        let mut focus = self.session.focus.lock().await;
        self.session.focus_on(&mut focus, &self.handle).await?;
        let result = self
            .session
            .wire
            .send(Method::DELETE, &self.session.path("window"), None)
            .await;
        *focus = None;
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headless_chrome_capabilities() {
        let caps = capabilities(&WebDriverOptions::new("http://localhost:4444"));
        assert_eq!(caps["browserName"], "chrome");
        assert_eq!(caps["goog:chromeOptions"]["args"][0], "--headless=new");
    }

    #[test]
    fn headed_firefox_has_no_extra_args() {
        let mut opts = WebDriverOptions::new("http://localhost:4444");
        opts.browser_name = "firefox".into();
        opts.headless = false;
        let caps = capabilities(&opts);
        assert!(caps.get("moz:firefoxOptions").is_none());
    }

    #[test]
    fn wire_error_matching() {
        let err = BrowserError::WebDriver {
            error: "no such window".into(),
            message: String::new(),
        };
        assert!(is_wire_error(&err, "no such window"));
        assert!(!is_wire_error(&err, "no such element"));
    }
}
