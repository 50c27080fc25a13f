// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error taxonomy with stable error codes for the auth flow harness.
//!
//! Every failure a scenario can report carries an [`ErrorCode`] (a stable,
//! machine-readable tag), a human-readable message, an optional cause and
//! arbitrary key-value context. Component crates keep their own `thiserror`
//! enums and convert into [`HarnessError`] at the scenario boundary so the
//! runner can decide between "fail this scenario" and "abort the run".

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Credential provisioning from the lab service.
    Provision,
    /// Harness configuration.
    Config,
    /// Screenshot capture.
    Capture,
    /// Popup appearance / closure handshake.
    PopupSync,
    /// UI contract mismatch (an expected element is missing).
    Element,
    /// The documented pass/fail signal of a scenario.
    Assertion,
    /// A wait-condition or test-case deadline elapsed.
    Timeout,
    /// Browser automation transport or session failures.
    Browser,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provision => "provision",
            Self::Config => "config",
            Self::Capture => "capture",
            Self::PopupSync => "popup_sync",
            Self::Element => "element",
            Self::Assertion => "assertion",
            Self::Timeout => "timeout",
            Self::Browser => "browser",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Provision --
    /// The lab user lookup failed or returned an unusable record.
    ProvisionUserLookupFailed,
    /// The lab secret lookup failed or returned no value.
    ProvisionSecretLookupFailed,

    // -- Config --
    /// Configuration file or value is invalid.
    ConfigInvalid,

    // -- Capture --
    /// The screenshot primitive or the artifact write failed.
    CaptureFailed,

    // -- PopupSync --
    /// No popup surface appeared after the trigger action.
    PopupNeverOpened,
    /// The popup surface never closed after credential entry.
    PopupNeverClosed,
    /// Handshake stages were driven out of order.
    PopupOutOfOrder,

    // -- Element --
    /// An element the sample app must expose was not found.
    ElementNotFound,

    // -- Assertion --
    /// A fixed-key storage entry (id token / client info) is missing.
    StorageEntryMissing,
    /// The access-token match count differs from the expected count.
    AccessTokenCountMismatch,

    // -- Timeout --
    /// A wait-condition did not become true before its deadline.
    WaitTimeout,
    /// The whole test case exceeded its time budget.
    ScenarioTimeout,

    // -- Browser --
    /// The automation layer reported a failure.
    BrowserFailure,
    /// The surface being driven was already closed.
    SurfaceClosed,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ProvisionUserLookupFailed | Self::ProvisionSecretLookupFailed => {
                ErrorCategory::Provision
            }

            Self::ConfigInvalid => ErrorCategory::Config,

            Self::CaptureFailed => ErrorCategory::Capture,

            Self::PopupNeverOpened | Self::PopupNeverClosed | Self::PopupOutOfOrder => {
                ErrorCategory::PopupSync
            }

            Self::ElementNotFound => ErrorCategory::Element,

            Self::StorageEntryMissing | Self::AccessTokenCountMismatch => ErrorCategory::Assertion,

            Self::WaitTimeout | Self::ScenarioTimeout => ErrorCategory::Timeout,

            Self::BrowserFailure | Self::SurfaceClosed => ErrorCategory::Browser,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"POPUP_NEVER_CLOSED"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProvisionUserLookupFailed => "PROVISION_USER_LOOKUP_FAILED",
            Self::ProvisionSecretLookupFailed => "PROVISION_SECRET_LOOKUP_FAILED",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::CaptureFailed => "CAPTURE_FAILED",
            Self::PopupNeverOpened => "POPUP_NEVER_OPENED",
            Self::PopupNeverClosed => "POPUP_NEVER_CLOSED",
            Self::PopupOutOfOrder => "POPUP_OUT_OF_ORDER",
            Self::ElementNotFound => "ELEMENT_NOT_FOUND",
            Self::StorageEntryMissing => "STORAGE_ENTRY_MISSING",
            Self::AccessTokenCountMismatch => "ACCESS_TOKEN_COUNT_MISMATCH",
            Self::WaitTimeout => "WAIT_TIMEOUT",
            Self::ScenarioTimeout => "SCENARIO_TIMEOUT",
            Self::BrowserFailure => "BROWSER_FAILURE",
            Self::SurfaceClosed => "SURFACE_CLOSED",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether this error aborts the whole run instead of a single scenario.
    ///
    /// Without credentials or a usable configuration no scenario can run.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Provision | ErrorCategory::Config
        )
    }

    /// Whether a scenario failing with this code gets its automatic retry.
    pub fn is_retryable(&self) -> bool {
        !self.is_run_fatal()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// HarnessError
// ---------------------------------------------------------------------------

/// Unified harness error.
///
/// # Builder usage
///
/// ```
/// use afh_error::{ErrorCode, HarnessError};
///
/// let err = HarnessError::new(ErrorCode::PopupNeverClosed, "popup still open")
///     .with_context("scenario", "popupBaseCase")
///     .with_context("timeout_ms", 8_000);
/// assert!(err.code.is_retryable());
/// ```
pub struct HarnessError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl HarnessError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// Values that fail to serialise are skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl fmt::Debug for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("HarnessError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`HarnessError`], as written into run reports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Category of the code, duplicated for report readers.
    pub category: ErrorCategory,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&HarnessError> for HarnessErrorDto {
    fn from(err: &HarnessError) -> Self {
        Self {
            code: err.code,
            category: err.category(),
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::ProvisionUserLookupFailed,
        ErrorCode::ProvisionSecretLookupFailed,
        ErrorCode::ConfigInvalid,
        ErrorCode::CaptureFailed,
        ErrorCode::PopupNeverOpened,
        ErrorCode::PopupNeverClosed,
        ErrorCode::PopupOutOfOrder,
        ErrorCode::ElementNotFound,
        ErrorCode::StorageEntryMissing,
        ErrorCode::AccessTokenCountMismatch,
        ErrorCode::WaitTimeout,
        ErrorCode::ScenarioTimeout,
        ErrorCode::BrowserFailure,
        ErrorCode::SurfaceClosed,
        ErrorCode::Internal,
    ];

    // -- Construction & Display -----------------------------------------

    #[test]
    fn basic_construction() {
        let err = HarnessError::new(ErrorCode::Internal, "boom");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_without_context() {
        let err = HarnessError::new(ErrorCode::ElementNotFound, "#SignIn missing");
        assert_eq!(err.to_string(), "[ELEMENT_NOT_FOUND] #SignIn missing");
    }

    #[test]
    fn display_with_context_is_deterministic() {
        let err = HarnessError::new(ErrorCode::WaitTimeout, "timed out")
            .with_context("selector", "#loginArea")
            .with_context("after_ms", 8000);
        assert_eq!(
            err.to_string(),
            r##"[WAIT_TIMEOUT] timed out {"after_ms":8000,"selector":"#loginArea"}"##
        );
    }

    #[test]
    fn debug_includes_source() {
        let src = io::Error::new(io::ErrorKind::BrokenPipe, "page closed");
        let err = HarnessError::new(ErrorCode::CaptureFailed, "capture failed").with_source(src);
        let dbg = format!("{err:?}");
        assert!(dbg.contains("CaptureFailed"));
        assert!(dbg.contains("page closed"));
    }

    #[test]
    fn std_error_source_is_exposed() {
        let src = io::Error::other("inner");
        let err = HarnessError::new(ErrorCode::BrowserFailure, "outer").with_source(src);
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "inner");
    }

    // -- Codes ------------------------------------------------------------

    #[test]
    fn codes_have_unique_strings() {
        let strings: HashSet<_> = ALL_CODES.iter().map(|c| c.as_str()).collect();
        assert_eq!(strings.len(), ALL_CODES.len());
    }

    #[test]
    fn serde_name_matches_as_str() {
        for code in ALL_CODES {
            let json = serde_json::to_string(code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn only_provision_and_config_are_run_fatal() {
        for code in ALL_CODES {
            let expected = matches!(
                code,
                ErrorCode::ProvisionUserLookupFailed
                    | ErrorCode::ProvisionSecretLookupFailed
                    | ErrorCode::ConfigInvalid
            );
            assert_eq!(code.is_run_fatal(), expected, "{code}");
            assert_eq!(code.is_retryable(), !expected, "{code}");
        }
    }

    #[test]
    fn popup_codes_share_a_category() {
        for code in [
            ErrorCode::PopupNeverOpened,
            ErrorCode::PopupNeverClosed,
            ErrorCode::PopupOutOfOrder,
        ] {
            assert_eq!(code.category(), ErrorCategory::PopupSync);
        }
    }

    // -- DTO --------------------------------------------------------------

    #[test]
    fn dto_captures_source_message_and_category() {
        let err = HarnessError::new(ErrorCode::AccessTokenCountMismatch, "expected 1, found 2")
            .with_context("found", 2)
            .with_source(io::Error::other("dup"));
        let dto = HarnessErrorDto::from(&err);
        assert_eq!(dto.category, ErrorCategory::Assertion);
        assert_eq!(dto.source_message.as_deref(), Some("dup"));
        assert_eq!(dto.context["found"], serde_json::json!(2));

        let json = serde_json::to_value(&dto).unwrap();
        assert_eq!(json["code"], "ACCESS_TOKEN_COUNT_MISMATCH");
        assert_eq!(json["category"], "assertion");
    }
}
