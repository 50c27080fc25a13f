// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Browser automation seam for the auth flow harness.
//!
//! The harness never talks to a concrete automation library directly. It
//! drives a [`Browser`], which hands out isolated [`BrowsingContext`]s, which
//! in turn own [`Surface`]s (the main page and any popups). Two backends
//! implement these traits: [`webdriver::WebDriverBrowser`] for real browsers
//! and the scripted in-memory sample app in `afh-browser-mock`.

pub mod webdriver;

use afh_error::{ErrorCode, HarnessError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Shared handle to an open surface.
pub type SurfaceHandle = Arc<dyn Surface>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures reported by an automation backend.
#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    /// No element matched the selector.
    #[error("element not found: {selector}")]
    ElementNotFound {
        /// CSS selector that was looked up.
        selector: String,
    },
    /// A wait condition did not become true in time.
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout {
        /// Description of the awaited condition.
        what: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },
    /// The surface was closed before or during the operation.
    #[error("surface {surface} is closed")]
    SurfaceClosed {
        /// Backend identifier of the surface.
        surface: String,
    },
    /// A script evaluated inside the page failed or returned an unusable value.
    #[error("script evaluation failed: {0}")]
    Script(String),
    /// The WebDriver endpoint returned an error payload.
    #[error("webdriver error `{error}`: {message}")]
    WebDriver {
        /// W3C error code string (e.g. `no such window`).
        error: String,
        /// Message supplied by the driver.
        message: String,
    },
    /// HTTP transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// Response did not match the expected protocol shape.
    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl BrowserError {
    /// Stable harness code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ElementNotFound { .. } => ErrorCode::ElementNotFound,
            Self::Timeout { .. } => ErrorCode::WaitTimeout,
            Self::SurfaceClosed { .. } => ErrorCode::SurfaceClosed,
            Self::Script(_) | Self::WebDriver { .. } | Self::Transport(_) | Self::Protocol(_) => {
                ErrorCode::BrowserFailure
            }
        }
    }
}

impl From<BrowserError> for HarnessError {
    fn from(err: BrowserError) -> Self {
        HarnessError::new(err.code(), err.to_string()).with_source(err)
    }
}

// ---------------------------------------------------------------------------
// In-page scripts
// ---------------------------------------------------------------------------

/// Scripts the harness evaluates inside the page.
///
/// Backends that cannot run JavaScript (the mock) recognise these constants
/// verbatim.
pub mod scripts {
    /// Returns every `localStorage` entry as a string-to-string object.
    pub const LOCAL_STORAGE_SNAPSHOT: &str = "var out = {}; \
        for (var i = 0; i < window.localStorage.length; i++) { \
            var k = window.localStorage.key(i); out[k] = window.localStorage.getItem(k); \
        } \
        return out;";

    /// Removes the `localStorage` entry named by the first argument.
    pub const LOCAL_STORAGE_REMOVE: &str = "window.localStorage.removeItem(arguments[0]); return null;";

    /// Returns `[document.readyState, location.href]`.
    pub const DOCUMENT_STATE: &str = "return [document.readyState, window.location.href];";
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A launched browser able to open isolated contexts.
#[async_trait]
pub trait Browser: Send + Sync {
    /// Short backend name used in logs and reports.
    fn name(&self) -> &str;

    /// Open a fresh context with its own storage and no surfaces.
    async fn new_context(&self) -> Result<Box<dyn BrowsingContext>, BrowserError>;

    /// Shut the browser down. Open contexts become unusable.
    async fn close(&self) -> Result<(), BrowserError>;
}

/// An isolated browsing session (cookies, storage and the surfaces opened in it).
#[async_trait]
pub trait BrowsingContext: Send + Sync {
    /// Open a new top-level page.
    async fn new_page(&self) -> Result<SurfaceHandle, BrowserError>;

    /// Every surface that is still open, pages and popups alike.
    async fn open_surfaces(&self) -> Result<Vec<SurfaceHandle>, BrowserError>;

    /// Close the context and everything opened in it.
    async fn close(&self) -> Result<(), BrowserError>;
}

/// A page or popup window that can be driven.
#[async_trait]
pub trait Surface: Send + Sync {
    /// Backend identifier, unique within the browser.
    fn id(&self) -> &str;

    /// Navigate to `url` and return once the navigation is committed.
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    /// Reload the current document.
    async fn reload(&self) -> Result<(), BrowserError>;

    /// Click the first element matching `selector`.
    async fn click(&self, selector: &str) -> Result<(), BrowserError>;

    /// Type `text` into the first element matching `selector`.
    async fn type_text(&self, selector: &str, text: &str) -> Result<(), BrowserError>;

    /// Resolve once an element matching `selector` is present.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration)
    -> Result<(), BrowserError>;

    /// Resolve once navigation has settled (document loaded, URL stable).
    async fn wait_for_navigation_idle(&self, timeout: Duration) -> Result<(), BrowserError>;

    /// Capture the visible viewport as PNG bytes.
    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError>;

    /// Evaluate `script` in the page with positional `args`.
    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value, BrowserError>;

    /// Register a watcher that resolves with the next popup this surface opens.
    ///
    /// Must be called before the action that opens the popup.
    async fn on_popup_opened(&self) -> Result<oneshot::Receiver<SurfaceHandle>, BrowserError>;

    /// Register a watcher that resolves when this surface closes.
    ///
    /// Resolves immediately if the surface is already closed.
    async fn on_closed(&self) -> Result<oneshot::Receiver<()>, BrowserError>;

    /// Whether the surface has been closed.
    async fn is_closed(&self) -> bool;

    /// Close the surface. Closing an already-closed surface is a no-op.
    async fn close(&self) -> Result<(), BrowserError>;

    /// Snapshot every `localStorage` entry visible to this surface.
    async fn local_storage(&self) -> Result<BTreeMap<String, String>, BrowserError> {
        let value = self
            .evaluate(scripts::LOCAL_STORAGE_SNAPSHOT, Vec::new())
            .await?;
        decode_storage(value)
    }

    /// Remove one `localStorage` entry.
    async fn remove_local_storage_key(&self, key: &str) -> Result<(), BrowserError> {
        self.evaluate(
            scripts::LOCAL_STORAGE_REMOVE,
            vec![Value::String(key.to_string())],
        )
        .await?;
        Ok(())
    }
}

/// Decode the result of [`scripts::LOCAL_STORAGE_SNAPSHOT`].
pub fn decode_storage(value: Value) -> Result<BTreeMap<String, String>, BrowserError> {
    let Value::Object(map) = value else {
        return Err(BrowserError::Script(format!(
            "storage snapshot is not an object: {value}"
        )));
    };
    map.into_iter()
        .map(|(k, v)| match v {
            Value::String(s) => Ok((k, s)),
            other => Err(BrowserError::Script(format!(
                "storage entry {k} is not a string: {other}"
            ))),
        })
        .collect()
}

/// Close every open surface in `context` except `keep`.
///
/// Returns the number of surfaces that were closed.
pub async fn close_stray_surfaces(
    context: &dyn BrowsingContext,
    keep: &SurfaceHandle,
) -> Result<usize, BrowserError> {
    let mut closed = 0;
    for surface in context.open_surfaces().await? {
        if surface.id() == keep.id() || surface.is_closed().await {
            continue;
        }
        tracing::warn!(target: "afh.runner", surface = surface.id(), "closing stray surface");
        surface.close().await?;
        closed += 1;
    }
    Ok(closed)
}
