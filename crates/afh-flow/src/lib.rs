// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Flow driving for the auth flow harness.
//!
//! - [`plan`] turns a [`ScenarioKind`] into the ordered [`Step`]s that drive
//!   the sample app.
//! - [`popup`] holds the two-stage popup handshake.
//! - [`credentials`] types the provisioned identity into a sign-in form.
//! - [`driver`] executes a plan against a surface.

pub mod credentials;
pub mod driver;
pub mod plan;
pub mod popup;

pub use credentials::enter_credentials;
pub use driver::{FlowDriver, FlowError, FlowTrace, StepError};
pub use plan::{Step, plan, render_plan};
pub use popup::{HandshakeState, PopupHandshake, PopupSyncError};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The five flows the harness knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    /// Sign in through a full-page redirect.
    LoginRedirect,
    /// Sign in through a popup window.
    LoginPopup,
    /// Acquire a token through a redirect.
    AcquireRedirect,
    /// Acquire a token through a popup.
    AcquirePopup,
    /// Acquire a token silently.
    AcquireSilent,
}

impl ScenarioKind {
    /// Every kind, login flows first.
    pub const ALL: [ScenarioKind; 5] = [
        Self::LoginRedirect,
        Self::LoginPopup,
        Self::AcquireRedirect,
        Self::AcquirePopup,
        Self::AcquireSilent,
    ];

    /// Kebab-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoginRedirect => "login-redirect",
            Self::LoginPopup => "login-popup",
            Self::AcquireRedirect => "acquire-redirect",
            Self::AcquirePopup => "acquire-popup",
            Self::AcquireSilent => "acquire-silent",
        }
    }

    /// Whether this kind needs an already signed-in session.
    pub fn is_acquire(&self) -> bool {
        matches!(
            self,
            Self::AcquireRedirect | Self::AcquirePopup | Self::AcquireSilent
        )
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScenarioKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown scenario kind: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in ScenarioKind::ALL {
            assert_eq!(kind.as_str().parse::<ScenarioKind>().unwrap(), kind);
        }
        assert!("login".parse::<ScenarioKind>().is_err());
    }

    #[test]
    fn kind_serde_is_kebab_case() {
        let json = serde_json::to_string(&ScenarioKind::AcquireSilent).unwrap();
        assert_eq!(json, "\"acquire-silent\"");
    }

    #[test]
    fn only_acquire_kinds_need_a_session() {
        let acquire: Vec<_> = ScenarioKind::ALL
            .into_iter()
            .filter(ScenarioKind::is_acquire)
            .collect();
        assert_eq!(acquire.len(), 3);
        assert!(!ScenarioKind::LoginPopup.is_acquire());
    }
}
