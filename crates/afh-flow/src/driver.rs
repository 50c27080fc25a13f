// SPDX-License-Identifier: MIT OR Apache-2.0
//! Executes a scenario plan against a surface.

use crate::ScenarioKind;
use crate::credentials::enter_credentials;
use crate::plan::{Step, plan};
use crate::popup::{PopupHandshake, PopupSyncError};
use afh_browser::{BrowserError, Surface, SurfaceHandle};
use afh_capture::{CaptureError, CaptureSequence};
use afh_config::AppSelectors;
use afh_error::{ErrorCode, HarnessError};
use afh_lab::Credential;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a single step failed.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// A browser primitive failed.
    #[error(transparent)]
    Browser(#[from] BrowserError),
    /// A checkpoint could not be captured.
    #[error(transparent)]
    Capture(#[from] CaptureError),
    /// The popup handshake failed.
    #[error(transparent)]
    Popup(#[from] PopupSyncError),
}

impl StepError {
    /// Stable code for reporting.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Browser(e) => e.code(),
            Self::Capture(e) => e.code(),
            Self::Popup(e) => e.code(),
        }
    }
}

/// A flow stopped at a step.
#[derive(Debug, thiserror::Error)]
#[error("{kind} failed at step {} ({step}): {source}", .index + 1)]
pub struct FlowError {
    /// Flow being driven.
    pub kind: ScenarioKind,
    /// Zero-based index of the failing step.
    pub index: usize,
    /// Rendered failing step.
    pub step: String,
    /// Underlying failure.
    #[source]
    pub source: StepError,
}

impl FlowError {
    /// Stable code for reporting.
    pub fn code(&self) -> ErrorCode {
        self.source.code()
    }
}

impl From<FlowError> for HarnessError {
    fn from(err: FlowError) -> Self {
        HarnessError::new(err.code(), err.to_string())
            .with_context("flow", err.kind)
            .with_context("step_index", err.index + 1)
            .with_context("step", err.step.clone())
            .with_source(err)
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// What a completed flow did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowTrace {
    /// Flow that ran.
    pub kind: ScenarioKind,
    /// Rendered steps, in execution order.
    pub steps: Vec<String>,
    /// Id of the popup surface, for popup flows.
    pub popup: Option<String>,
}

/// Drives scenario plans with a shared credential.
#[derive(Debug, Clone)]
pub struct FlowDriver {
    selectors: AppSelectors,
    credential: Arc<Credential>,
    wait_timeout: Duration,
    popup_timeout: Duration,
}

impl FlowDriver {
    /// Driver using `wait_timeout` for every wait condition, popup stages
    /// included.
    pub fn new(selectors: AppSelectors, credential: Arc<Credential>, wait_timeout: Duration) -> Self {
        Self {
            selectors,
            credential,
            wait_timeout,
            popup_timeout: wait_timeout,
        }
    }

    /// Separate deadline for each popup stage.
    pub fn with_popup_timeout(mut self, timeout: Duration) -> Self {
        self.popup_timeout = timeout;
        self
    }

    /// Selectors the plans are built from.
    pub fn selectors(&self) -> &AppSelectors {
        &self.selectors
    }

    /// Run `kind` on `surface`, which must show the loaded home page.
    /// Checkpoints go to `capture`.
    pub async fn run(
        &self,
        kind: ScenarioKind,
        surface: &SurfaceHandle,
        capture: &mut CaptureSequence,
    ) -> Result<FlowTrace, FlowError> {
        let steps = plan(kind, &self.selectors);
        let mut trace = FlowTrace {
            kind,
            steps: Vec::with_capacity(steps.len()),
            popup: None,
        };

        for (index, step) in steps.iter().enumerate() {
            debug!(target: "afh.flow", %kind, index, %step, "step");
            self.step(step, surface, capture, &mut trace)
                .await
                .map_err(|source| FlowError {
                    kind,
                    index,
                    step: step.to_string(),
                    source,
                })?;
            trace.steps.push(step.to_string());
        }

        info!(target: "afh.flow", %kind, steps = trace.steps.len(), "flow completed");
        Ok(trace)
    }

    async fn step(
        &self,
        step: &Step,
        surface: &SurfaceHandle,
        capture: &mut CaptureSequence,
        trace: &mut FlowTrace,
    ) -> Result<(), StepError> {
        match step {
            Step::Capture { label } => {
                capture.capture(surface.as_ref(), label).await?;
            }
            Step::Click { selector } => surface.click(selector).await?,
            Step::WaitFor { selector } => {
                surface
                    .wait_for_selector(selector, self.wait_timeout)
                    .await?
            }
            Step::WaitForNavigationIdle => {
                surface.wait_for_navigation_idle(self.wait_timeout).await?
            }
            Step::EnterCredentials => {
                enter_credentials(surface.as_ref(), capture, &self.credential, &self.selectors)
                    .await?
            }
            Step::PopupSignIn { trigger, form } => {
                let popup = self.popup_sign_in(surface, trigger, form, capture).await?;
                trace.popup = Some(popup);
            }
        }
        Ok(())
    }

    async fn popup_sign_in(
        &self,
        parent: &SurfaceHandle,
        trigger: &str,
        form: &str,
        capture: &mut CaptureSequence,
    ) -> Result<String, StepError> {
        let mut handshake = PopupHandshake::arm(parent.as_ref(), self.popup_timeout).await?;
        parent.click(trigger).await?;
        let popup = handshake.await_appearance().await?;

        popup.wait_for_selector(form, self.wait_timeout).await?;
        enter_credentials(popup.as_ref(), capture, &self.credential, &self.selectors).await?;
        handshake.await_closure().await?;
        Ok(popup.id().to_string())
    }
}
