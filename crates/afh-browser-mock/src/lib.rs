// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Scripted in-memory stand-in for the MSAL sample application.
//!
//! [`MockBrowser`] implements the `afh-browser` traits without a real
//! browser. Each context models one origin: a shared `localStorage`, a home
//! page with the sample app's buttons, and an identity-provider form that
//! appears either in place (redirect) or in a popup surface. Signing in
//! writes the id-token and client-info entries; every token acquisition
//! writes an access-token entry whose key is the serialized
//! `{authority, clientId, scopes}` object.
//!
//! [`MockFaults`] injects the failures the harness has to survive or report.

use afh_browser::{
    Browser, BrowserError, BrowsingContext, Surface, SurfaceHandle, scripts,
};
use afh_config::{AppSelectors, HarnessConfig};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

const POLL: Duration = Duration::from_millis(5);
const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

// ---------------------------------------------------------------------------
// App description
// ---------------------------------------------------------------------------

/// Failure knobs for the scripted app.
#[derive(Debug, Clone, Default)]
pub struct MockFaults {
    /// Clicking the popup trigger never opens a popup.
    pub popup_never_opens: bool,
    /// The sign-in popup stays open after a successful submit.
    pub popup_never_closes: bool,
    /// Every token acquisition writes two matching access-token entries.
    pub duplicate_access_tokens: bool,
    /// Successful sign-in does not write the id-token/client-info entries.
    pub skip_storage_writes: bool,
    /// The screenshot primitive always fails.
    pub fail_screenshots: bool,
    /// Selectors that are never rendered.
    pub missing_elements: BTreeSet<String>,
    /// Per-selector number of initial clicks that are silently swallowed.
    ///
    /// Counted across the whole browser, so a retry in a fresh context sees
    /// the remaining budget.
    pub flaky_clicks: BTreeMap<String, u32>,
}

/// The sample application the mock serves.
#[derive(Debug, Clone)]
pub struct MockApp {
    /// URL of the home page.
    pub base_url: String,
    /// Client id written into cache keys.
    pub client_id: String,
    /// Authority written into access-token keys (lowercased).
    pub authority: String,
    /// Scopes written into access-token keys.
    pub scopes: Vec<String>,
    /// Selectors the app renders.
    pub selectors: AppSelectors,
    /// Accepted credentials. `None` accepts any non-empty pair.
    pub credentials: Option<(String, String)>,
    /// Delay between a successful popup submit and the popup closing.
    pub popup_close_delay: Duration,
    /// Injected failures.
    pub faults: MockFaults,
}

impl MockApp {
    /// App matching the `[app]` and `[selectors]` sections of `config`.
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            base_url: config.app.base_url.clone(),
            client_id: config.app.client_id.clone(),
            authority: config.app.authority.clone(),
            scopes: config.app.scopes.clone(),
            selectors: config.selectors.clone(),
            credentials: None,
            popup_close_delay: Duration::from_millis(20),
            faults: MockFaults::default(),
        }
    }

    /// Only accept this username/password pair.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Replace the injected failures.
    pub fn with_faults(mut self, faults: MockFaults) -> Self {
        self.faults = faults;
        self
    }

    /// Key of the id-token entry.
    pub fn id_token_key(&self) -> String {
        format!("msal.{}.idtoken", self.client_id)
    }

    /// Key of the client-info entry.
    pub fn client_info_key(&self) -> String {
        format!("msal.{}.client.info", self.client_id)
    }

    fn access_token_key(&self, scopes: &str) -> String {
        json!({
            "authority": self.authority.to_lowercase(),
            "clientId": self.client_id,
            "scopes": scopes,
            "homeAccountIdentifier": "bW9jay1ob21lLWFjY291bnQ",
        })
        .to_string()
    }

    fn accepts(&self, username: Option<&String>, password: Option<&String>) -> bool {
        match (&self.credentials, username, password) {
            (Some((u, p)), Some(user), Some(pass)) => u == user && p == pass,
            (None, Some(user), Some(pass)) => !user.is_empty() && !pass.is_empty(),
            _ => false,
        }
    }
}

impl Default for MockApp {
    fn default() -> Self {
        Self::from_config(&HarnessConfig::default())
    }
}

// ---------------------------------------------------------------------------
// State model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    OpenMenu,
    LoginRedirect,
    LoginPopup,
    Submit,
    AcquireRedirect,
    AcquirePopup,
    AcquireSilent,
    Inert,
}

fn action_for(selectors: &AppSelectors, selector: &str) -> Action {
    // Logged-in markers share selectors with the acquire buttons, so the
    // acquire actions win over plain markers.
    if selector == selectors.submit {
        Action::Submit
    } else if selector == selectors.login_redirect {
        Action::LoginRedirect
    } else if selector == selectors.login_popup {
        Action::LoginPopup
    } else if selector == selectors.sign_in {
        Action::OpenMenu
    } else if selector == selectors.acquire_redirect {
        Action::AcquireRedirect
    } else if selector == selectors.acquire_popup {
        Action::AcquirePopup
    } else if selector == selectors.acquire_silent {
        Action::AcquireSilent
    } else {
        Action::Inert
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Page {
    Blank,
    Home { menu_open: bool, token_shown: bool },
    SignIn { popup: bool },
}

struct SurfaceState {
    url: String,
    page: Page,
    fields: BTreeMap<String, String>,
    closed: bool,
    popup_waiters: Vec<oneshot::Sender<SurfaceHandle>>,
    close_waiters: Vec<oneshot::Sender<()>>,
}

impl SurfaceState {
    fn new(url: String, page: Page) -> Self {
        Self {
            url,
            page,
            fields: BTreeMap::new(),
            closed: false,
            popup_waiters: Vec::new(),
            close_waiters: Vec::new(),
        }
    }

    fn rendered<'a>(&self, s: &'a AppSelectors, logged_in: bool) -> Vec<&'a str> {
        match self.page {
            Page::Blank => Vec::new(),
            Page::SignIn { .. } => vec![
                s.login_area.as_str(),
                s.username.as_str(),
                s.password.as_str(),
                s.submit.as_str(),
            ],
            Page::Home {
                menu_open,
                token_shown,
            } => {
                let mut out = vec![s.sign_in.as_str()];
                if logged_in {
                    out.extend([
                        s.redirect_logged_in.as_str(),
                        s.popup_logged_in.as_str(),
                        s.acquire_redirect.as_str(),
                        s.acquire_popup.as_str(),
                        s.acquire_silent.as_str(),
                    ]);
                    if token_shown {
                        out.push(s.token_result.as_str());
                    }
                } else if menu_open {
                    out.extend([s.login_redirect.as_str(), s.login_popup.as_str()]);
                }
                out
            }
        }
    }
}

#[derive(Default)]
struct ContextState {
    storage: BTreeMap<String, String>,
    surfaces: BTreeMap<String, SurfaceState>,
    logged_in: bool,
    closed: bool,
    tokens_issued: u64,
}

impl ContextState {
    fn surface(&mut self, id: &str) -> Result<&mut SurfaceState, BrowserError> {
        match self.surfaces.get_mut(id) {
            Some(s) if !s.closed && !self.closed => Ok(s),
            _ => Err(BrowserError::SurfaceClosed {
                surface: id.to_string(),
            }),
        }
    }

    fn close_surface(&mut self, id: &str) {
        if let Some(s) = self.surfaces.get_mut(id) {
            if s.closed {
                return;
            }
            s.closed = true;
            s.popup_waiters.clear();
            for tx in s.close_waiters.drain(..) {
                let _ = tx.send(());
            }
            debug!(target: "afh.mock", surface = id, "surface closed");
        }
    }

    fn has_element(&self, id: &str, app: &MockApp, selector: &str) -> bool {
        if app.faults.missing_elements.contains(selector) {
            return false;
        }
        self.surfaces
            .get(id)
            .filter(|s| !s.closed)
            .is_some_and(|s| s.rendered(&app.selectors, self.logged_in).contains(&selector))
    }
}

/// Counters observed by tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    /// Contexts opened so far.
    pub contexts_opened: u64,
    /// Popup surfaces opened so far.
    pub popups_opened: u64,
    /// Screenshots taken so far.
    pub screenshots: u64,
}

struct Shared {
    app: MockApp,
    flaky: Mutex<BTreeMap<String, u32>>,
    stats: Mutex<MockStats>,
    next_surface: AtomicU64,
}

impl Shared {
    fn stats(&self) -> MutexGuard<'_, MockStats> {
        self.stats.lock().expect("mock stats lock poisoned")
    }

    fn swallow_click(&self, selector: &str) -> bool {
        let mut flaky = self.flaky.lock().expect("mock flaky lock poisoned");
        match flaky.get_mut(selector) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    fn surface_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_surface.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

// ---------------------------------------------------------------------------
// Browser / context
// ---------------------------------------------------------------------------

/// In-memory browser serving a [`MockApp`].
pub struct MockBrowser {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl MockBrowser {
    /// Browser serving `app`.
    pub fn new(app: MockApp) -> Self {
        let flaky = app.faults.flaky_clicks.clone();
        Self {
            shared: Arc::new(Shared {
                app,
                flaky: Mutex::new(flaky),
                stats: Mutex::new(MockStats::default()),
                next_surface: AtomicU64::new(0),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// The served app.
    pub fn app(&self) -> &MockApp {
        &self.shared.app
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> MockStats {
        *self.shared.stats()
    }
}

impl Default for MockBrowser {
    fn default() -> Self {
        Self::new(MockApp::default())
    }
}

#[async_trait]
impl Browser for MockBrowser {
    fn name(&self) -> &str {
        "mock"
    }

    async fn new_context(&self) -> Result<Box<dyn BrowsingContext>, BrowserError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrowserError::Protocol("browser is closed".into()));
        }
        self.shared.stats().contexts_opened += 1;
        Ok(Box::new(MockContext {
            shared: Arc::clone(&self.shared),
            state: Arc::new(Mutex::new(ContextState::default())),
        }))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One isolated origin with its own storage.
pub struct MockContext {
    shared: Arc<Shared>,
    state: Arc<Mutex<ContextState>>,
}

impl MockContext {
    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().expect("mock context lock poisoned")
    }

    fn handle(&self, id: String) -> SurfaceHandle {
        Arc::new(MockSurface {
            id,
            shared: Arc::clone(&self.shared),
            state: Arc::clone(&self.state),
        })
    }
}

#[async_trait]
impl BrowsingContext for MockContext {
    async fn new_page(&self) -> Result<SurfaceHandle, BrowserError> {
        let id = self.shared.surface_id("page");
        {
            let mut st = self.lock();
            if st.closed {
                return Err(BrowserError::Protocol("context is closed".into()));
            }
            st.surfaces.insert(
                id.clone(),
                SurfaceState::new("about:blank".into(), Page::Blank),
            );
        }
        Ok(self.handle(id))
    }

    async fn open_surfaces(&self) -> Result<Vec<SurfaceHandle>, BrowserError> {
        let ids: Vec<String> = {
            let st = self.lock();
            st.surfaces
                .iter()
                .filter(|(_, s)| !s.closed && !st.closed)
                .map(|(id, _)| id.clone())
                .collect()
        };
        Ok(ids.into_iter().map(|id| self.handle(id)).collect())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let mut st = self.lock();
        let ids: Vec<String> = st.surfaces.keys().cloned().collect();
        for id in ids {
            st.close_surface(&id);
        }
        st.closed = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Surface
// ---------------------------------------------------------------------------

/// A page or popup of a [`MockContext`].
pub struct MockSurface {
    id: String,
    shared: Arc<Shared>,
    state: Arc<Mutex<ContextState>>,
}

impl MockSurface {
    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().expect("mock context lock poisoned")
    }

    fn app(&self) -> &MockApp {
        &self.shared.app
    }

    fn sibling(&self, id: String) -> SurfaceHandle {
        Arc::new(MockSurface {
            id,
            shared: Arc::clone(&self.shared),
            state: Arc::clone(&self.state),
        })
    }

    fn write_access_tokens(&self, st: &mut ContextState) {
        let app = self.app();
        st.tokens_issued += 1;
        let value = json!({
            "accessToken": format!("mock-access-token-{}", st.tokens_issued),
            "idToken": "mock-id-token",
            "expiresIn": "3599",
        })
        .to_string();
        let scopes = app.scopes.join(" ");
        st.storage.insert(app.access_token_key(&scopes), value.clone());
        if app.faults.duplicate_access_tokens {
            let widened = format!("{scopes} profile");
            st.storage.insert(app.access_token_key(&widened), value);
        }
    }

    fn open_popup(&self, st: &mut ContextState) {
        if self.app().faults.popup_never_opens {
            debug!(target: "afh.mock", opener = %self.id, "popup suppressed");
            return;
        }
        let popup_id = self.shared.surface_id("popup");
        let popup = SurfaceState::new(
            format!("{}oauth2/authorize", self.app().authority.to_lowercase()),
            Page::SignIn { popup: true },
        );
        st.surfaces.insert(popup_id.clone(), popup);
        self.shared.stats().popups_opened += 1;
        debug!(target: "afh.mock", opener = %self.id, popup = %popup_id, "popup opened");

        let waiters = st
            .surfaces
            .get_mut(&self.id)
            .map(|s| std::mem::take(&mut s.popup_waiters))
            .unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(self.sibling(popup_id.clone()));
        }
    }

    fn submit(&self, st: &mut ContextState) -> Result<(), BrowserError> {
        let app = self.app().clone();
        let surface = st.surface(&self.id)?;
        let popup = matches!(surface.page, Page::SignIn { popup: true });
        if !app.accepts(
            surface.fields.get(&app.selectors.username),
            surface.fields.get(&app.selectors.password),
        ) {
            debug!(target: "afh.mock", surface = %self.id, "credentials rejected");
            return Ok(());
        }
        surface.fields.clear();
        if !popup {
            surface.page = Page::Home {
                menu_open: false,
                token_shown: false,
            };
            surface.url = app.base_url.clone();
        }

        st.logged_in = true;
        if !app.faults.skip_storage_writes {
            st.storage
                .insert(app.id_token_key(), "bW9jay1pZC10b2tlbg".into());
            st.storage
                .insert(app.client_info_key(), "eyJ1aWQiOiJtb2NrIn0".into());
        }
        debug!(target: "afh.mock", surface = %self.id, popup, "signed in");

        if popup && !app.faults.popup_never_closes {
            if app.popup_close_delay.is_zero() {
                st.close_surface(&self.id);
            } else {
                let state = Arc::clone(&self.state);
                let id = self.id.clone();
                let delay = app.popup_close_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    state
                        .lock()
                        .expect("mock context lock poisoned")
                        .close_surface(&id);
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Surface for MockSurface {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let base = self.app().base_url.clone();
        let mut st = self.lock();
        let surface = st.surface(&self.id)?;
        surface.url = url.to_string();
        surface.page = if url.trim_end_matches('/') == base.trim_end_matches('/') {
            Page::Home {
                menu_open: false,
                token_shown: false,
            }
        } else {
            Page::Blank
        };
        Ok(())
    }

    async fn reload(&self) -> Result<(), BrowserError> {
        let mut st = self.lock();
        let surface = st.surface(&self.id)?;
        if let Page::Home { .. } = surface.page {
            surface.page = Page::Home {
                menu_open: false,
                token_shown: false,
            };
        }
        surface.fields.clear();
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        let mut st = self.lock();
        st.surface(&self.id)?;
        if !st.has_element(&self.id, self.app(), selector) {
            return Err(BrowserError::ElementNotFound {
                selector: selector.to_string(),
            });
        }
        if self.shared.swallow_click(selector) {
            debug!(target: "afh.mock", selector, "click swallowed");
            return Ok(());
        }

        let action = action_for(&self.app().selectors, selector);
        debug!(target: "afh.mock", surface = %self.id, selector, ?action, "click");
        match action {
            Action::OpenMenu => {
                let surface = st.surface(&self.id)?;
                if let Page::Home { menu_open, .. } = &mut surface.page {
                    *menu_open = true;
                }
            }
            Action::LoginRedirect => {
                let authorize = format!("{}oauth2/authorize", self.app().authority.to_lowercase());
                let surface = st.surface(&self.id)?;
                surface.page = Page::SignIn { popup: false };
                surface.url = authorize;
            }
            Action::LoginPopup => self.open_popup(&mut st),
            Action::Submit => self.submit(&mut st)?,
            Action::AcquireRedirect | Action::AcquirePopup | Action::AcquireSilent => {
                if st.logged_in {
                    self.write_access_tokens(&mut st);
                    let surface = st.surface(&self.id)?;
                    if let Page::Home { token_shown, .. } = &mut surface.page {
                        *token_shown = true;
                    }
                }
            }
            Action::Inert => {}
        }
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), BrowserError> {
        let mut st = self.lock();
        if !st.has_element(&self.id, self.app(), selector) {
            st.surface(&self.id)?;
            return Err(BrowserError::ElementNotFound {
                selector: selector.to_string(),
            });
        }
        st.surface(&self.id)?
            .fields
            .entry(selector.to_string())
            .or_default()
            .push_str(text);
        Ok(())
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut st = self.lock();
                st.surface(&self.id)?;
                if st.has_element(&self.id, self.app(), selector) {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout {
                    what: format!("selector {selector}"),
                    timeout,
                });
            }
            tokio::time::sleep(POLL).await;
        }
    }

    async fn wait_for_navigation_idle(&self, _timeout: Duration) -> Result<(), BrowserError> {
        self.lock().surface(&self.id)?;
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
        if self.app().faults.fail_screenshots {
            return Err(BrowserError::Protocol("screenshot capture failed".into()));
        }
        let summary = {
            let mut st = self.lock();
            let surface = st.surface(&self.id)?;
            format!("{} {:?}", surface.url, surface.page)
        };
        self.shared.stats().screenshots += 1;
        let mut png = PNG_SIGNATURE.to_vec();
        png.extend_from_slice(summary.as_bytes());
        Ok(png)
    }

    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value, BrowserError> {
        let mut st = self.lock();
        let url = st.surface(&self.id)?.url.clone();
        match script {
            scripts::LOCAL_STORAGE_SNAPSHOT => Ok(Value::Object(
                st.storage
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            )),
            scripts::LOCAL_STORAGE_REMOVE => {
                let key = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| BrowserError::Script("removeItem needs a key".into()))?;
                st.storage.remove(key);
                Ok(Value::Null)
            }
            scripts::DOCUMENT_STATE => Ok(json!(["complete", url])),
            other => Err(BrowserError::Script(format!(
                "mock cannot evaluate script: {other}"
            ))),
        }
    }

    async fn on_popup_opened(&self) -> Result<oneshot::Receiver<SurfaceHandle>, BrowserError> {
        let (tx, rx) = oneshot::channel();
        self.lock().surface(&self.id)?.popup_waiters.push(tx);
        Ok(rx)
    }

    async fn on_closed(&self) -> Result<oneshot::Receiver<()>, BrowserError> {
        let (tx, rx) = oneshot::channel();
        let mut st = self.lock();
        let closed = st.closed;
        match st.surfaces.get_mut(&self.id) {
            Some(s) if !s.closed && !closed => s.close_waiters.push(tx),
            _ => {
                let _ = tx.send(());
            }
        }
        Ok(rx)
    }

    async fn is_closed(&self) -> bool {
        let st = self.lock();
        st.closed || st.surfaces.get(&self.id).is_none_or(|s| s.closed)
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.lock().close_surface(&self.id);
        Ok(())
    }
}
