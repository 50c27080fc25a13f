// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Test-identity provisioning.
//!
//! A run needs exactly one username/password pair. It normally comes from
//! the lab service in two calls (resolve a user record, then resolve that
//! user's secret by lab name). [`CredentialProvisioner`] performs the lookup
//! at most once and hands the same [`Credential`] to every scenario.

use afh_config::{CredentialSource, LabConfig};
use afh_error::{ErrorCode, HarnessError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Environment variable holding the username for [`CredentialSource::Env`].
pub const USERNAME_VAR: &str = "AFH_USERNAME";
/// Environment variable holding the password for [`CredentialSource::Env`].
pub const PASSWORD_VAR: &str = "AFH_PASSWORD";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Credential provisioning failed. Always fatal to the run.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// The user lookup call failed.
    #[error("lab user lookup failed: {0}")]
    UserLookup(String),
    /// The lookup succeeded but returned nothing usable.
    #[error("lab returned no usable user record: {0}")]
    NoUsableRecord(String),
    /// The secret lookup call failed or returned an empty value.
    #[error("lab secret lookup for {lab_name} failed: {reason}")]
    SecretLookup {
        /// Lab name whose secret was requested.
        lab_name: String,
        /// What went wrong.
        reason: String,
    },
    /// A required environment variable is unset or empty.
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),
}

impl ProvisionError {
    /// Stable harness code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::SecretLookup { .. } => ErrorCode::ProvisionSecretLookupFailed,
            Self::UserLookup(_) | Self::NoUsableRecord(_) | Self::MissingEnv(_) => {
                ErrorCode::ProvisionUserLookupFailed
            }
        }
    }
}

impl From<ProvisionError> for HarnessError {
    fn from(err: ProvisionError) -> Self {
        HarnessError::new(err.code(), err.to_string()).with_source(err)
    }
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// Parameters of the user lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserQuery {
    /// Lab environment (e.g. `onprem`).
    #[serde(rename = "envname")]
    pub env_name: String,
    /// User type (e.g. `onprem`).
    #[serde(rename = "usertype")]
    pub user_type: String,
    /// Federation provider (e.g. `adfsv2019`).
    #[serde(rename = "federationprovider")]
    pub federation_provider: String,
}

impl From<&LabConfig> for UserQuery {
    fn from(lab: &LabConfig) -> Self {
        Self {
            env_name: lab.env_name.clone(),
            user_type: lab.user_type.clone(),
            federation_provider: lab.federation_provider.clone(),
        }
    }
}

/// A user record returned by the lab service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabUser {
    /// Name under which the user's secret is stored.
    pub lab_name: String,
    /// Sign-in name.
    #[serde(default)]
    pub upn: Option<String>,
}

/// A secret returned by the lab service.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct LabSecret {
    /// Secret value.
    pub value: String,
}

impl fmt::Debug for LabSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LabSecret").field("value", &"<redacted>").finish()
    }
}

/// The provisioned test identity.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Username typed into the sign-in form.
    pub username: String,
    /// Password typed into the sign-in form.
    pub password: String,
}

impl Credential {
    /// Create a credential.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Lab API
// ---------------------------------------------------------------------------

/// The two lab service calls.
#[async_trait]
pub trait LabApi: Send + Sync {
    /// Resolve the user records matching `query`.
    async fn resolve_user(&self, query: &UserQuery) -> Result<Vec<LabUser>, ProvisionError>;

    /// Resolve the secret stored under `lab_name`.
    async fn resolve_secret(&self, lab_name: &str) -> Result<LabSecret, ProvisionError>;
}

/// [`LabApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpLabClient {
    http: reqwest::Client,
    endpoint: String,
    access_token: Option<String>,
}

impl HttpLabClient {
    /// Client for the lab API rooted at `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            access_token: None,
        }
    }

    /// Client configured from the `[lab]` section.
    pub fn from_config(lab: &LabConfig) -> Self {
        let client = Self::new(lab.endpoint.clone());
        match &lab.access_token {
            Some(token) => client.with_access_token(token.clone()),
            None => client,
        }
    }

    /// Present `token` as a bearer token on every call.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self.http.get(format!("{}/{path}", self.endpoint));
        match &self.access_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl LabApi for HttpLabClient {
    async fn resolve_user(&self, query: &UserQuery) -> Result<Vec<LabUser>, ProvisionError> {
        let response = self
            .get("user")
            .query(query)
            .send()
            .await
            .map_err(|e| ProvisionError::UserLookup(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProvisionError::UserLookup(format!("HTTP {status}")));
        }
        response
            .json::<Vec<LabUser>>()
            .await
            .map_err(|e| ProvisionError::UserLookup(format!("invalid user response: {e}")))
    }

    async fn resolve_secret(&self, lab_name: &str) -> Result<LabSecret, ProvisionError> {
        let failed = |reason: String| ProvisionError::SecretLookup {
            lab_name: lab_name.to_string(),
            reason,
        };
        let response = self
            .get("LabSecret")
            .query(&[("secret", lab_name)])
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {status}")));
        }
        response
            .json::<LabSecret>()
            .await
            .map_err(|e| failed(format!("invalid secret response: {e}")))
    }
}

/// Resolve a credential through `api`: first user record, then its secret.
pub async fn provision(api: &dyn LabApi, query: &UserQuery) -> Result<Credential, ProvisionError> {
    debug!(target: "afh.lab", ?query, "resolving lab user");
    let user = api
        .resolve_user(query)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ProvisionError::NoUsableRecord("empty user list".into()))?;
    let username = user
        .upn
        .filter(|upn| !upn.is_empty())
        .ok_or_else(|| ProvisionError::NoUsableRecord(format!("{} has no upn", user.lab_name)))?;

    let secret = api.resolve_secret(&user.lab_name).await?;
    if secret.value.is_empty() {
        return Err(ProvisionError::SecretLookup {
            lab_name: user.lab_name,
            reason: "empty secret value".into(),
        });
    }
    info!(target: "afh.lab", username = %username, lab_name = %user.lab_name, "test identity provisioned");
    Ok(Credential::new(username, secret.value))
}

/// Read a credential from [`USERNAME_VAR`] / [`PASSWORD_VAR`] via `lookup`.
pub fn credential_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Credential, ProvisionError> {
    let read = |var: &'static str| {
        lookup(var)
            .filter(|v| !v.is_empty())
            .ok_or(ProvisionError::MissingEnv(var))
    };
    Ok(Credential::new(read(USERNAME_VAR)?, read(PASSWORD_VAR)?))
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

enum Source {
    Lab {
        api: Arc<dyn LabApi>,
        query: UserQuery,
    },
    Env(Box<dyn Fn(&str) -> Option<String> + Send + Sync>),
    Fixed(Credential),
}

/// Provisions the run's credential once and shares it read-only.
pub struct CredentialProvisioner {
    source: Source,
    cell: OnceCell<Arc<Credential>>,
}

impl CredentialProvisioner {
    /// Provision through the lab service.
    pub fn lab(api: Arc<dyn LabApi>, query: UserQuery) -> Self {
        Self::with_source(Source::Lab { api, query })
    }

    /// Read from the process environment on first use.
    pub fn env() -> Self {
        Self::env_lookup(|var| std::env::var(var).ok())
    }

    /// Read through `lookup` on first use.
    pub fn env_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self::with_source(Source::Env(Box::new(lookup)))
    }

    /// Use an already known credential.
    pub fn fixed(credential: Credential) -> Self {
        Self::with_source(Source::Fixed(credential))
    }

    /// Provisioner for the `[lab]` section.
    pub fn from_config(lab: &LabConfig) -> Self {
        match lab.source {
            CredentialSource::Lab => {
                Self::lab(Arc::new(HttpLabClient::from_config(lab)), UserQuery::from(lab))
            }
            CredentialSource::Env => Self::env(),
        }
    }

    fn with_source(source: Source) -> Self {
        Self {
            source,
            cell: OnceCell::new(),
        }
    }

    /// The run's credential, resolving it on the first call only.
    ///
    /// A failed resolution is not cached, but the runner treats it as fatal
    /// and never asks again.
    pub async fn credential(&self) -> Result<Arc<Credential>, ProvisionError> {
        self.cell
            .get_or_try_init(|| async {
                let credential = match &self.source {
                    Source::Lab { api, query } => provision(api.as_ref(), query).await?,
                    Source::Env(lookup) => credential_from_lookup(lookup)?,
                    Source::Fixed(credential) => credential.clone(),
                };
                Ok::<_, ProvisionError>(Arc::new(credential))
            })
            .await
            .cloned()
    }
}

impl fmt::Debug for CredentialProvisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            Source::Lab { .. } => "lab",
            Source::Env(_) => "env",
            Source::Fixed(_) => "fixed",
        };
        f.debug_struct("CredentialProvisioner")
            .field("source", &source)
            .field("resolved", &self.cell.initialized())
            .finish()
    }
}
