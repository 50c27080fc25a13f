// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the auth flow harness.
//!
//! This crate provides [`HarnessConfig`] (the sample application identity,
//! the DOM contract it exposes, the lab service, the browser driver, timeouts
//! and run policy) together with helpers for loading from TOML files,
//! applying `AFH_*` environment overrides, merging command-line overlays, and
//! producing advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use afh_error::{ErrorCode, HarnessError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file exists but could not be read (permissions, encoding, ...).
    #[error("cannot read config file {path}: {source}")]
    ReadError {
        /// Path that was requested.
        path: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

impl From<ConfigError> for HarnessError {
    fn from(err: ConfigError) -> Self {
        HarnessError::new(ErrorCode::ConfigInvalid, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent a run but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// The default wait deadline is longer than the whole test-case budget.
    WaitExceedsTestTimeout {
        /// Configured wait deadline.
        wait_ms: u64,
        /// Configured test-case budget.
        test_ms: u64,
    },
    /// More than one automatic retry hides real flakiness.
    LargeRetryCount {
        /// Configured retry count.
        retries: u32,
    },
    /// Scope matching for access-token entries has been switched on.
    ScopeEnforcementEnabled,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::WaitExceedsTestTimeout { wait_ms, test_ms } => write!(
                f,
                "wait_timeout_ms ({wait_ms}) exceeds test_timeout_ms ({test_ms}); waits will be cut short"
            ),
            ConfigWarning::LargeRetryCount { retries } => {
                write!(f, "retries = {retries}; scenarios normally get a single retry")
            }
            ConfigWarning::ScopeEnforcementEnabled => write!(
                f,
                "enforce_scopes is on; access-token matching now differs from the sample app's contract"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level configuration for a harness run.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Identity of the application under test.
    #[serde(default)]
    pub app: AppConfig,

    /// DOM identifiers the application exposes.
    #[serde(default)]
    pub selectors: AppSelectors,

    /// Where test credentials come from.
    #[serde(default)]
    pub lab: LabConfig,

    /// Browser automation driver.
    #[serde(default)]
    pub browser: BrowserConfig,

    /// Deadlines, in milliseconds.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Retry, artifact and reporting policy.
    #[serde(default)]
    pub run: RunConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            log_level: Some("info".into()),
            app: AppConfig::default(),
            selectors: AppSelectors::default(),
            lab: LabConfig::default(),
            browser: BrowserConfig::default(),
            timeouts: TimeoutConfig::default(),
            run: RunConfig::default(),
        }
    }
}

/// The sample application and the identity it signs in with.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    /// Home page of the sample application.
    pub base_url: String,
    /// Client (application) id registered with the authority.
    pub client_id: String,
    /// Authority the access tokens must be bound to.
    pub authority: String,
    /// Scopes the sample app requests.
    pub scopes: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:30662/".into(),
            client_id: "57448aa1-9515-4176-a106-5cb9be8550e1".into(),
            authority: "https://fs.msidlab8.com/adfs/".into(),
            scopes: vec!["openid".into()],
        }
    }
}

/// CSS selectors for every element the harness interacts with.
///
/// Kept separate from flow logic so a UI change in the sample app only
/// touches configuration.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct AppSelectors {
    /// Opens the sign-in menu.
    pub sign_in: String,
    /// Starts redirect sign-in.
    pub login_redirect: String,
    /// Starts popup sign-in.
    pub login_popup: String,
    /// Container of the identity provider's credential form.
    pub login_area: String,
    /// Username field of the credential form.
    pub username: String,
    /// Password field of the credential form.
    pub password: String,
    /// Submit button of the credential form.
    pub submit: String,
    /// Marker shown after a redirect sign-in completed.
    pub redirect_logged_in: String,
    /// Marker shown after a popup sign-in completed.
    pub popup_logged_in: String,
    /// Trigger for redirect token acquisition.
    pub acquire_redirect: String,
    /// Trigger for popup token acquisition.
    pub acquire_popup: String,
    /// Trigger for silent token acquisition.
    pub acquire_silent: String,
    /// Element rendered once a token acquisition finished.
    pub token_result: String,
}

impl Default for AppSelectors {
    fn default() -> Self {
        Self {
            sign_in: "#SignIn".into(),
            login_redirect: "#loginRedirect".into(),
            login_popup: "#loginPopup".into(),
            login_area: "#loginArea".into(),
            username: "#userNameInput".into(),
            password: "#passwordInput".into(),
            submit: "#submitButton".into(),
            redirect_logged_in: "#getAccessTokenRedirect".into(),
            popup_logged_in: "#getAccessTokenPopup".into(),
            acquire_redirect: "#getAccessTokenRedirect".into(),
            acquire_popup: "#getAccessTokenPopup".into(),
            acquire_silent: "#getAccessTokenSilent".into(),
            token_result: "#access-token-info".into(),
        }
    }
}

impl AppSelectors {
    /// `(field name, selector)` pairs, in declaration order.
    pub fn entries(&self) -> [(&'static str, &str); 13] {
        [
            ("sign_in", &self.sign_in),
            ("login_redirect", &self.login_redirect),
            ("login_popup", &self.login_popup),
            ("login_area", &self.login_area),
            ("username", &self.username),
            ("password", &self.password),
            ("submit", &self.submit),
            ("redirect_logged_in", &self.redirect_logged_in),
            ("popup_logged_in", &self.popup_logged_in),
            ("acquire_redirect", &self.acquire_redirect),
            ("acquire_popup", &self.acquire_popup),
            ("acquire_silent", &self.acquire_silent),
            ("token_result", &self.token_result),
        ]
    }
}

/// Where the test identity is read from.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// Resolve user and secret through the lab HTTP service.
    #[default]
    Lab,
    /// Read `AFH_USERNAME` / `AFH_PASSWORD` from the environment.
    Env,
}

/// Lab (test identity) service settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct LabConfig {
    /// Credential source.
    pub source: CredentialSource,
    /// Base URL of the lab API.
    pub endpoint: String,
    /// Lab environment name.
    pub env_name: String,
    /// Lab user type.
    pub user_type: String,
    /// Federation provider of the test user.
    pub federation_provider: String,
    /// Bearer token presented to the lab API.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            source: CredentialSource::Lab,
            endpoint: "https://msidlab.com/api".into(),
            env_name: "onprem".into(),
            user_type: "onprem".into(),
            federation_provider: "adfsv2019".into(),
            access_token: None,
        }
    }
}

/// Which automation backend drives the browser.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// A W3C WebDriver endpoint (chromedriver, geckodriver, selenium).
    #[default]
    Webdriver,
    /// The in-memory scripted sample app.
    Mock,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverKind::Webdriver => f.write_str("webdriver"),
            DriverKind::Mock => f.write_str("mock"),
        }
    }
}

impl std::str::FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webdriver" => Ok(DriverKind::Webdriver),
            "mock" => Ok(DriverKind::Mock),
            other => Err(format!("unknown driver '{other}' (expected webdriver | mock)")),
        }
    }
}

/// Browser driver settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct BrowserConfig {
    /// Automation backend.
    pub driver: DriverKind,
    /// WebDriver endpoint.
    pub webdriver_url: String,
    /// `browserName` capability.
    pub browser_name: String,
    /// Run without a visible window.
    pub headless: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::Webdriver,
            webdriver_url: "http://localhost:4444".into(),
            browser_name: "chrome".into(),
            headless: true,
        }
    }
}

/// Deadlines in milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Budget for one attempt of one test case.
    pub test_timeout_ms: u64,
    /// Deadline for any wait-condition that does not set its own.
    pub wait_timeout_ms: u64,
    /// Poll period of polling waits.
    pub poll_interval_ms: u64,
    /// How long URL and ready state must stay unchanged to count as idle.
    pub navigation_quiet_ms: u64,
    /// Deadline for one request to the WebDriver endpoint.
    pub request_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            test_timeout_ms: 8_000,
            wait_timeout_ms: 5_000,
            poll_interval_ms: 100,
            navigation_quiet_ms: 500,
            request_timeout_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    /// [`Self::test_timeout_ms`] as a [`Duration`].
    pub fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }

    /// [`Self::wait_timeout_ms`] as a [`Duration`].
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// [`Self::poll_interval_ms`] as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// [`Self::navigation_quiet_ms`] as a [`Duration`].
    pub fn navigation_quiet(&self) -> Duration {
        Duration::from_millis(self.navigation_quiet_ms)
    }

    /// [`Self::request_timeout_ms`] as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Retry, artifact and reporting policy.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    /// Automatic retries per scenario after the first failed attempt.
    pub retries: u32,
    /// Base directory for screenshots; one subdirectory per scenario.
    pub screenshot_dir: PathBuf,
    /// Keep screenshots of scenarios that passed.
    pub keep_passed_screenshots: bool,
    /// Where to write the JSON run report.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
    /// Require access-token entries to cover the configured scopes.
    pub enforce_scopes: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            retries: 1,
            screenshot_dir: PathBuf::from("screenshots"),
            keep_passed_screenshots: true,
            report_path: None,
            enforce_scopes: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Upper bound on a single test-case budget (10 minutes).
const MAX_TEST_TIMEOUT_MS: u64 = 600_000;

/// Retry counts above this produce a warning.
const RETRY_WARNING_THRESHOLD: u32 = 1;

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`HarnessConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`HarnessConfig::default()`].
///
/// Environment variable overrides are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<HarnessConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|e| {
                let path = p.display().to_string();
                match e.kind() {
                    std::io::ErrorKind::NotFound => ConfigError::FileNotFound { path },
                    _ => ConfigError::ReadError { path, source: e },
                }
            })?;
            parse_toml(&content)?
        }
        None => HarnessConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`HarnessConfig`].
pub fn parse_toml(content: &str) -> Result<HarnessConfig, ConfigError> {
    toml::from_str::<HarnessConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides from the process environment.
///
/// Recognised variables:
/// - `AFH_BASE_URL`, `AFH_CLIENT_ID`, `AFH_AUTHORITY`
/// - `AFH_BROWSER_DRIVER`, `AFH_WEBDRIVER_URL`
/// - `AFH_LAB_ENDPOINT`, `AFH_LAB_TOKEN`
/// - `AFH_SCREENSHOT_DIR`, `AFH_LOG_LEVEL`
pub fn apply_env_overrides(config: &mut HarnessConfig) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// Apply overrides from an arbitrary lookup (the process environment in
/// production, a map in tests).
///
/// An unparseable `AFH_BROWSER_DRIVER` is ignored.
pub fn apply_overrides_from(config: &mut HarnessConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("AFH_BASE_URL") {
        config.app.base_url = val;
    }
    if let Some(val) = lookup("AFH_CLIENT_ID") {
        config.app.client_id = val;
    }
    if let Some(val) = lookup("AFH_AUTHORITY") {
        config.app.authority = val;
    }
    if let Some(driver) = lookup("AFH_BROWSER_DRIVER").and_then(|v| v.parse().ok()) {
        config.browser.driver = driver;
    }
    if let Some(val) = lookup("AFH_WEBDRIVER_URL") {
        config.browser.webdriver_url = val;
    }
    if let Some(val) = lookup("AFH_LAB_ENDPOINT") {
        config.lab.endpoint = val;
    }
    if let Some(val) = lookup("AFH_LAB_TOKEN") {
        config.lab.access_token = Some(val);
    }
    if let Some(val) = lookup("AFH_SCREENSHOT_DIR") {
        config.run.screenshot_dir = PathBuf::from(val);
    }
    if let Some(val) = lookup("AFH_LOG_LEVEL") {
        config.log_level = Some(val);
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (empty identifiers and selectors, zero or oversized
/// deadlines, unusable endpoints) are returned as a
/// [`ConfigError::ValidationError`]; soft issues come back as warnings.
pub fn validate_config(config: &HarnessConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if let Some(ref level) = config.log_level
        && !VALID_LOG_LEVELS.contains(&level.as_str())
    {
        errors.push(format!("invalid log_level '{level}'"));
    }

    // -- app ----------------------------------------------------------------
    if !is_http_url(&config.app.base_url) {
        errors.push(format!(
            "app.base_url '{}' must be an http(s) URL",
            config.app.base_url
        ));
    }
    if config.app.client_id.trim().is_empty() {
        errors.push("app.client_id must not be empty".into());
    }
    if config.app.authority.trim().is_empty() {
        errors.push("app.authority must not be empty".into());
    }
    if config.app.scopes.is_empty() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "app.scopes".into(),
            hint: "scope enforcement has nothing to compare against".into(),
        });
    }

    // -- selectors ----------------------------------------------------------
    for (name, selector) in config.selectors.entries() {
        if selector.trim().is_empty() {
            errors.push(format!("selectors.{name} must not be empty"));
        }
    }

    // -- lab ----------------------------------------------------------------
    if config.lab.source == CredentialSource::Lab {
        if !is_http_url(&config.lab.endpoint) {
            errors.push(format!(
                "lab.endpoint '{}' must be an http(s) URL",
                config.lab.endpoint
            ));
        }
        if config.lab.access_token.is_none() {
            warnings.push(ConfigWarning::MissingOptionalField {
                field: "lab.access_token".into(),
                hint: "lab requests will be sent unauthenticated".into(),
            });
        }
    }

    // -- browser ------------------------------------------------------------
    if config.browser.driver == DriverKind::Webdriver && !is_http_url(&config.browser.webdriver_url)
    {
        errors.push(format!(
            "browser.webdriver_url '{}' must be an http(s) URL",
            config.browser.webdriver_url
        ));
    }

    // -- timeouts -----------------------------------------------------------
    let t = &config.timeouts;
    if t.test_timeout_ms == 0 || t.test_timeout_ms > MAX_TEST_TIMEOUT_MS {
        errors.push(format!(
            "timeouts.test_timeout_ms {} out of range (1..{MAX_TEST_TIMEOUT_MS})",
            t.test_timeout_ms
        ));
    }
    if t.wait_timeout_ms == 0 {
        errors.push("timeouts.wait_timeout_ms must be positive".into());
    } else if t.wait_timeout_ms > t.test_timeout_ms {
        warnings.push(ConfigWarning::WaitExceedsTestTimeout {
            wait_ms: t.wait_timeout_ms,
            test_ms: t.test_timeout_ms,
        });
    }
    if t.poll_interval_ms == 0 {
        errors.push("timeouts.poll_interval_ms must be positive".into());
    }
    if t.request_timeout_ms == 0 {
        errors.push("timeouts.request_timeout_ms must be positive".into());
    }

    // -- run ----------------------------------------------------------------
    if config.run.screenshot_dir.as_os_str().is_empty() {
        errors.push("run.screenshot_dir must not be empty".into());
    }
    if config.run.retries > RETRY_WARNING_THRESHOLD {
        warnings.push(ConfigWarning::LargeRetryCount {
            retries: config.run.retries,
        });
    }
    if config.run.enforce_scopes {
        warnings.push(ConfigWarning::ScopeEnforcementEnabled);
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

fn is_http_url(s: &str) -> bool {
    let s = s.trim();
    (s.starts_with("http://") && s.len() > "http://".len())
        || (s.starts_with("https://") && s.len() > "https://".len())
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Command-line overrides layered on top of a loaded configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverlay {
    /// Replaces `browser.driver`.
    pub driver: Option<DriverKind>,
    /// Replaces `app.base_url`.
    pub base_url: Option<String>,
    /// Replaces `run.screenshot_dir`.
    pub screenshot_dir: Option<PathBuf>,
    /// Replaces `run.report_path`.
    pub report_path: Option<PathBuf>,
    /// Replaces `log_level`.
    pub log_level: Option<String>,
}

/// Merge an overlay into a configuration. Values in `overlay` take
/// precedence over `base`; unset overlay fields leave `base` untouched.
pub fn merge_configs(base: HarnessConfig, overlay: ConfigOverlay) -> HarnessConfig {
    let mut merged = base;
    if let Some(driver) = overlay.driver {
        merged.browser.driver = driver;
    }
    if let Some(url) = overlay.base_url {
        merged.app.base_url = url;
    }
    if let Some(dir) = overlay.screenshot_dir {
        merged.run.screenshot_dir = dir;
    }
    if overlay.report_path.is_some() {
        merged.run.report_path = overlay.report_path;
    }
    if overlay.log_level.is_some() {
        merged.log_level = overlay.log_level;
    }
    merged
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
