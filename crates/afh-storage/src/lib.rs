// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Assertions over the MSAL cache entries a sign-in leaves in `localStorage`.
//!
//! Three entry families are recognised:
//!
//! - `msal.<clientId>.idtoken`
//! - `msal.<clientId>.client.info`
//! - access-token entries, whose **key** is a JSON object carrying
//!   `authority`, `clientId` and a space-delimited `scopes` string.
//!
//! Access-token entries are matched on the parsed key, never the stored
//! value. Authority and client id compare case-insensitively. Scopes are
//! only compared when [`AccessTokenMatcher::required_scopes`] is set.

use afh_browser::{BrowserError, Surface};
use afh_error::{ErrorCode, HarnessError};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A storage read failed or a cache assertion did not hold.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Reading or modifying storage through the browser failed.
    #[error(transparent)]
    Browser(#[from] BrowserError),
    /// Fixed-key entries are absent.
    #[error("missing storage entries: {}", .missing.join(", "))]
    MissingEntries {
        /// Keys that were expected but absent.
        missing: Vec<String>,
    },
    /// The number of matching access-token entries is wrong.
    #[error("expected {expected} matching access token(s), found {found}")]
    AccessTokenCount {
        /// Expected number of matches.
        expected: usize,
        /// Actual number of matches.
        found: usize,
    },
}

impl StorageError {
    /// Stable harness code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Browser(e) => e.code(),
            Self::MissingEntries { .. } => ErrorCode::StorageEntryMissing,
            Self::AccessTokenCount { .. } => ErrorCode::AccessTokenCountMismatch,
        }
    }
}

impl From<StorageError> for HarnessError {
    fn from(err: StorageError) -> Self {
        let mut harness = HarnessError::new(err.code(), err.to_string());
        match &err {
            StorageError::MissingEntries { missing } => {
                harness = harness.with_context("missing", missing);
            }
            StorageError::AccessTokenCount { expected, found } => {
                harness = harness
                    .with_context("expected", expected)
                    .with_context("found", found);
            }
            StorageError::Browser(_) => {}
        }
        harness.with_source(err)
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time copy of every storage entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageSnapshot {
    entries: BTreeMap<String, String>,
}

impl StorageSnapshot {
    /// Snapshot over `entries`.
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }

    /// Read every entry visible to `surface` in one call.
    pub async fn read(surface: &dyn Surface) -> Result<Self, StorageError> {
        let entries = surface.local_storage().await?;
        debug!(target: "afh.storage", entries = entries.len(), "storage snapshot taken");
        Ok(Self { entries })
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop `key` from the snapshot.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }
}

impl FromIterator<(String, String)> for StorageSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Key convention
// ---------------------------------------------------------------------------

/// Fixed keys for a client id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeys {
    client_id: String,
}

impl CacheKeys {
    /// Keys for `client_id`.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }

    /// `msal.<clientId>.idtoken`
    pub fn id_token(&self) -> String {
        format!("msal.{}.idtoken", self.client_id)
    }

    /// `msal.<clientId>.client.info`
    pub fn client_info(&self) -> String {
        format!("msal.{}.client.info", self.client_id)
    }
}

/// The structured key of an access-token entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccessTokenKey {
    /// Authority the token was issued by.
    pub authority: String,
    /// Client the token was issued to.
    #[serde(rename = "clientId")]
    pub client_id: String,
    /// Space-delimited scopes.
    #[serde(default)]
    pub scopes: String,
}

impl AccessTokenKey {
    /// Individual scopes.
    pub fn scope_list(&self) -> impl Iterator<Item = &str> {
        self.scopes.split_whitespace()
    }
}

/// Parse `key` as an access-token key.
///
/// Keys without the substring `authority` are not candidates and yield
/// `None`. Candidates that fail to parse are logged and also yield `None`.
pub fn parse_access_token_key(key: &str) -> Option<AccessTokenKey> {
    if !key.contains("authority") {
        return None;
    }
    match serde_json::from_str(key) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(target: "afh.storage", key, error = %e, "skipping unparsable access token key");
            None
        }
    }
}

/// Identity an access-token entry has to be bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessTokenMatcher {
    /// Expected authority.
    pub authority: String,
    /// Expected client id.
    pub client_id: String,
    /// Scopes the entry must cover. `None` skips the scope comparison.
    pub required_scopes: Option<Vec<String>>,
}

impl AccessTokenMatcher {
    /// Match on authority and client id only.
    pub fn new(authority: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            client_id: client_id.into(),
            required_scopes: None,
        }
    }

    /// Whether `key` is bound to this identity.
    pub fn matches(&self, key: &AccessTokenKey) -> bool {
        if key.authority.to_lowercase() != self.authority.to_lowercase()
            || key.client_id.to_lowercase() != self.client_id.to_lowercase()
        {
            return false;
        }
        match &self.required_scopes {
            None => true,
            Some(required) => required.iter().all(|want| {
                key.scope_list()
                    .any(|have| have.eq_ignore_ascii_case(want))
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Cache assertions for one client identity.
#[derive(Debug, Clone)]
pub struct StorageValidator {
    keys: CacheKeys,
    matcher: AccessTokenMatcher,
}

impl StorageValidator {
    /// Validator for `client_id` tokens issued by `authority`.
    pub fn new(client_id: impl Into<String>, authority: impl Into<String>) -> Self {
        let client_id = client_id.into();
        Self {
            keys: CacheKeys::new(client_id.clone()),
            matcher: AccessTokenMatcher::new(authority, client_id),
        }
    }

    /// Also require access-token keys to cover `scopes`.
    pub fn with_required_scopes(mut self, scopes: Vec<String>) -> Self {
        self.matcher.required_scopes = Some(scopes);
        self
    }

    /// The fixed keys.
    pub fn keys(&self) -> &CacheKeys {
        &self.keys
    }

    /// The access-token matcher.
    pub fn matcher(&self) -> &AccessTokenMatcher {
        &self.matcher
    }

    /// Read a snapshot through `surface`.
    pub async fn snapshot(&self, surface: &dyn Surface) -> Result<StorageSnapshot, StorageError> {
        StorageSnapshot::read(surface).await
    }

    /// Both fixed-key entries must be present.
    pub fn assert_base_entries(&self, snapshot: &StorageSnapshot) -> Result<(), StorageError> {
        let missing: Vec<String> = [self.keys.id_token(), self.keys.client_info()]
            .into_iter()
            .filter(|key| !snapshot.contains_key(key))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StorageError::MissingEntries { missing })
        }
    }

    /// Keys in `snapshot` that are access-token entries for this identity.
    pub fn matching_keys(&self, snapshot: &StorageSnapshot) -> Vec<String> {
        snapshot
            .keys()
            .filter(|key| {
                parse_access_token_key(key).is_some_and(|parsed| self.matcher.matches(&parsed))
            })
            .map(str::to_string)
            .collect()
    }

    /// Count matching access-token entries and remove each one.
    ///
    /// Every match is removed from live storage through `surface` and from
    /// `snapshot`, so a second call without a new acquisition returns 0.
    pub async fn count_and_consume_access_tokens(
        &self,
        surface: &dyn Surface,
        snapshot: &mut StorageSnapshot,
    ) -> Result<usize, StorageError> {
        let matched = self.matching_keys(snapshot);
        for key in &matched {
            surface.remove_local_storage_key(key).await?;
            snapshot.remove(key);
            debug!(target: "afh.storage", key = %key, "consumed access token entry");
        }
        Ok(matched.len())
    }

    /// Post-login check: snapshot and assert the fixed-key entries.
    pub async fn verify_login(&self, surface: &dyn Surface) -> Result<StorageSnapshot, StorageError> {
        let snapshot = self.snapshot(surface).await?;
        self.assert_base_entries(&snapshot)?;
        Ok(snapshot)
    }

    /// Post-acquisition check: fixed-key entries plus exactly one matching
    /// access token, which is consumed.
    pub async fn verify_acquisition(&self, surface: &dyn Surface) -> Result<usize, StorageError> {
        let mut snapshot = self.verify_login(surface).await?;
        let found = self
            .count_and_consume_access_tokens(surface, &mut snapshot)
            .await?;
        if found != 1 {
            return Err(StorageError::AccessTokenCount { expected: 1, found });
        }
        Ok(found)
    }
}
