// SPDX-License-Identifier: MIT OR Apache-2.0
//! Declarative step plans per scenario kind.

use crate::ScenarioKind;
use afh_config::AppSelectors;
use std::fmt;

/// Checkpoint labels, as they appear in screenshot file names.
pub mod labels {
    /// Home page before any interaction.
    pub const SAMPLE_PAGE_INIT: &str = "samplePageInit";
    /// Sign-in menu opened.
    pub const SIGN_IN_CLICKED: &str = "signInClicked";
    /// Credential form shown, before typing.
    pub const SIGN_IN_PAGE: &str = "SignInPage";
    /// Back on the app, signed in.
    pub const SAMPLE_PAGE_LOGGED_IN: &str = "samplePageLoggedIn";
    /// Token acquired by redirect.
    pub const ACQUIRED_REDIRECT: &str = "accessTokenAcquiredRedirect";
    /// Token acquired by popup.
    pub const ACQUIRED_POPUP: &str = "accessTokenAcquiredPopup";
    /// Token acquired silently.
    pub const ACQUIRED_SILENT: &str = "accessTokenAcquiredSilently";
}

/// One action of a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Screenshot the driven surface.
    Capture {
        /// Checkpoint label.
        label: &'static str,
    },
    /// Click an element.
    Click {
        /// Target selector.
        selector: String,
    },
    /// Wait until an element is present.
    WaitFor {
        /// Awaited selector.
        selector: String,
    },
    /// Wait until navigation settles.
    WaitForNavigationIdle,
    /// Fill and submit the credential form on the driven surface.
    EnterCredentials,
    /// Open the sign-in popup with `trigger`, sign in there and wait for it
    /// to close.
    PopupSignIn {
        /// Element that opens the popup.
        trigger: String,
        /// Element marking the popup's credential form.
        form: String,
    },
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capture { label } => write!(f, "capture {label}"),
            Self::Click { selector } => write!(f, "click {selector}"),
            Self::WaitFor { selector } => write!(f, "wait for {selector}"),
            Self::WaitForNavigationIdle => f.write_str("wait for navigation idle"),
            Self::EnterCredentials => f.write_str("enter credentials"),
            Self::PopupSignIn { trigger, form } => {
                write!(f, "popup sign-in via {trigger} (form {form})")
            }
        }
    }
}

fn click(selector: &str) -> Step {
    Step::Click {
        selector: selector.to_string(),
    }
}

fn wait_for(selector: &str) -> Step {
    Step::WaitFor {
        selector: selector.to_string(),
    }
}

/// The steps that take `kind` from the loaded home page to its final
/// checkpoint. Storage verification is not part of the plan.
pub fn plan(kind: ScenarioKind, s: &AppSelectors) -> Vec<Step> {
    use labels::*;

    match kind {
        ScenarioKind::LoginRedirect => vec![
            Step::Capture {
                label: SAMPLE_PAGE_INIT,
            },
            click(&s.sign_in),
            Step::Capture {
                label: SIGN_IN_CLICKED,
            },
            click(&s.login_redirect),
            wait_for(&s.login_area),
            Step::EnterCredentials,
            Step::WaitForNavigationIdle,
            wait_for(&s.redirect_logged_in),
            Step::Capture {
                label: SAMPLE_PAGE_LOGGED_IN,
            },
        ],
        ScenarioKind::LoginPopup => vec![
            Step::Capture {
                label: SAMPLE_PAGE_INIT,
            },
            click(&s.sign_in),
            Step::Capture {
                label: SIGN_IN_CLICKED,
            },
            Step::PopupSignIn {
                trigger: s.login_popup.clone(),
                form: s.login_area.clone(),
            },
            wait_for(&s.popup_logged_in),
            Step::Capture {
                label: SAMPLE_PAGE_LOGGED_IN,
            },
        ],
        ScenarioKind::AcquireRedirect => acquire(&s.acquire_redirect, &s.token_result, ACQUIRED_REDIRECT),
        ScenarioKind::AcquirePopup => acquire(&s.acquire_popup, &s.token_result, ACQUIRED_POPUP),
        ScenarioKind::AcquireSilent => acquire(&s.acquire_silent, &s.token_result, ACQUIRED_SILENT),
    }
}

fn acquire(trigger: &str, result: &str, label: &'static str) -> Vec<Step> {
    vec![click(trigger), wait_for(result), Step::Capture { label }]
}

/// Numbered, one step per line.
pub fn render_plan(steps: &[Step]) -> String {
    steps
        .iter()
        .enumerate()
        .map(|(i, step)| format!("{:>2}. {step}\n", i + 1))
        .collect()
}
