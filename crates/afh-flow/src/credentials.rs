// SPDX-License-Identifier: MIT OR Apache-2.0
//! Credential entry on a surface already showing the sign-in form.

use crate::driver::StepError;
use crate::plan::labels;
use afh_browser::Surface;
use afh_capture::CaptureSequence;
use afh_config::AppSelectors;
use afh_lab::Credential;
use tracing::debug;

/// Capture the form, type the username and password, then submit.
///
/// Does not wait for the form: a missing field fails straight away with
/// the browser's element-not-found error.
pub async fn enter_credentials(
    surface: &dyn Surface,
    capture: &mut CaptureSequence,
    credential: &Credential,
    selectors: &AppSelectors,
) -> Result<(), StepError> {
    capture.capture(surface, labels::SIGN_IN_PAGE).await?;
    surface
        .type_text(&selectors.username, &credential.username)
        .await?;
    surface
        .type_text(&selectors.password, &credential.password)
        .await?;
    surface.click(&selectors.submit).await?;
    debug!(target: "afh.flow", surface = surface.id(), "credentials submitted");
    Ok(())
}
