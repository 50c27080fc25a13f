// SPDX-License-Identifier: MIT OR Apache-2.0
//! Runner behaviour against the mock browser.

use afh_browser::{Browser, BrowserError, BrowsingContext, SurfaceHandle};
use afh_browser_mock::{MockApp, MockBrowser, MockFaults};
use afh_config::HarnessConfig;
use afh_error::ErrorCode;
use afh_lab::{Credential, CredentialProvisioner};
use afh_runner::{Phase, RunError, Runner, ScenarioFilter, ScenarioOutcome};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const USER: &str = "user@lab";
const PASS: &str = "pw";

fn config(dir: &Path) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.run.screenshot_dir = dir.join("screenshots");
    config.timeouts.wait_timeout_ms = 200;
    config.timeouts.test_timeout_ms = 2_000;
    config
}

fn runner(config: HarnessConfig, faults: MockFaults) -> (Runner, Arc<MockBrowser>) {
    let app = MockApp::from_config(&config)
        .with_credentials(USER, PASS)
        .with_faults(faults);
    let browser = Arc::new(MockBrowser::new(app));
    let runner = Runner::new(
        config,
        browser.clone(),
        CredentialProvisioner::fixed(Credential::new(USER, PASS)),
    );
    (runner, browser)
}

fn outcome_code(outcome: &ScenarioOutcome) -> Option<ErrorCode> {
    match outcome {
        ScenarioOutcome::Failed { error } => Some(error.code),
        _ => None,
    }
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

// ---------- 1. Happy path ----------

#[tokio::test]
async fn every_scenario_passes_against_the_mock() {
    let tmp = tempfile::tempdir().unwrap();
    let (runner, browser) = runner(config(tmp.path()), MockFaults::default());

    let report = runner.run().await.unwrap();

    assert!(report.is_success(), "{}", report.render_summary());
    assert_eq!(report.summary().passed, 5);
    assert_eq!(report.driver, "mock");
    assert_eq!(report.setups.len(), 1);
    assert_eq!(report.setups[0].name, "acquireTokenBaseCase");
    assert_eq!(report.setups[0].phase, Phase::Setup);

    // Two login scenarios in their own contexts plus the shared acquire one.
    assert_eq!(browser.stats().contexts_opened, 3);
    assert_eq!(browser.stats().popups_opened, 2);

    let shots = tmp.path().join("screenshots");
    assert_eq!(
        files_in(&shots.join("redirectBaseCase")),
        [
            "001_samplePageInit.png",
            "002_signInClicked.png",
            "003_SignInPage.png",
            "004_samplePageLoggedIn.png",
        ]
    );
    assert_eq!(
        files_in(&shots.join("acquireTokenSilent")),
        ["001_accessTokenAcquiredSilently.png"]
    );
    assert_eq!(files_in(&shots.join("acquireTokenBaseCase")).len(), 4);
}

#[tokio::test]
async fn enforced_scopes_still_match_the_configured_scopes() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config(tmp.path());
    config.run.enforce_scopes = true;
    let (runner, _) = runner(config, MockFaults::default());

    let report = runner
        .with_filter(ScenarioFilter::only(["acquireTokenPopup"]))
        .run()
        .await
        .unwrap();
    assert!(report.is_success(), "{}", report.render_summary());
}

// ---------- 2. Retries ----------

#[tokio::test]
async fn flaky_trigger_passes_on_the_retry() {
    let tmp = tempfile::tempdir().unwrap();
    let faults = MockFaults {
        flaky_clicks: [("#loginPopup".to_string(), 1)].into(),
        ..MockFaults::default()
    };
    let (runner, _) = runner(config(tmp.path()), faults);

    let report = runner
        .with_filter(ScenarioFilter::only(["popupBaseCase"]))
        .run()
        .await
        .unwrap();

    let popup = report.scenario("popupBaseCase").unwrap();
    assert!(popup.passed());
    assert_eq!(popup.attempts.len(), 2);
    let first = popup.attempts[0].error.as_ref().unwrap();
    assert_eq!(first.code, ErrorCode::PopupNeverOpened);
    // Numbering continues across attempts.
    let dir = tmp.path().join("screenshots").join("popupBaseCase");
    assert_eq!(files_in(&dir).len(), 6);
    assert_eq!(files_in(&dir)[2], "003_samplePageInit.png");
}

#[tokio::test]
async fn zero_retries_reports_the_first_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config(tmp.path());
    config.run.retries = 0;
    let faults = MockFaults {
        flaky_clicks: [("#loginRedirect".to_string(), 1)].into(),
        ..MockFaults::default()
    };
    let (runner, _) = runner(config, faults);

    let report = runner
        .with_filter(ScenarioFilter::only(["redirectBaseCase"]))
        .run()
        .await
        .unwrap();
    let redirect = report.scenario("redirectBaseCase").unwrap();
    assert_eq!(redirect.attempts.len(), 1);
    assert_eq!(outcome_code(&redirect.outcome), Some(ErrorCode::WaitTimeout));
}

// ---------- 3. Failures ----------

#[tokio::test]
async fn popup_never_closing_fails_the_scenario_and_the_run_continues() {
    let tmp = tempfile::tempdir().unwrap();
    let faults = MockFaults {
        popup_never_closes: true,
        ..MockFaults::default()
    };
    let (runner, _) = runner(config(tmp.path()), faults);

    let report = runner.run().await.unwrap();

    assert!(report.scenario("redirectBaseCase").unwrap().passed());
    let popup = report.scenario("popupBaseCase").unwrap();
    assert_eq!(outcome_code(&popup.outcome), Some(ErrorCode::PopupNeverClosed));
    assert_eq!(popup.attempts.len(), 2);

    // The acquire setup signs in through a popup too, so its suite is skipped.
    assert!(!report.setups[0].passed());
    for name in ["acquireTokenRedirect", "acquireTokenPopup", "acquireTokenSilent"] {
        let entry = report.scenario(name).unwrap();
        assert!(
            matches!(entry.outcome, ScenarioOutcome::Skipped { .. }),
            "{name}: {:?}",
            entry.outcome
        );
        assert!(entry.attempts.is_empty());
    }
    assert_eq!(report.summary().skipped, 3);
}

#[tokio::test]
async fn duplicate_access_tokens_fail_only_acquire_scenarios() {
    let tmp = tempfile::tempdir().unwrap();
    let faults = MockFaults {
        duplicate_access_tokens: true,
        ..MockFaults::default()
    };
    let (runner, _) = runner(config(tmp.path()), faults);

    let report = runner.run().await.unwrap();
    assert!(report.setups[0].passed());
    for name in ["acquireTokenRedirect", "acquireTokenPopup", "acquireTokenSilent"] {
        let entry = report.scenario(name).unwrap();
        assert_eq!(
            outcome_code(&entry.outcome),
            Some(ErrorCode::AccessTokenCountMismatch),
            "{name}"
        );
    }
    assert_eq!(report.summary().passed, 2);
}

#[tokio::test]
async fn slow_popup_hits_the_test_timeout() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config(tmp.path());
    config.timeouts.test_timeout_ms = 5;
    let app = MockApp::from_config(&config).with_credentials(USER, PASS);
    let app = MockApp {
        popup_close_delay: Duration::from_millis(500),
        ..app
    };
    let runner = Runner::new(
        config,
        Arc::new(MockBrowser::new(app)),
        CredentialProvisioner::fixed(Credential::new(USER, PASS)),
    )
    .with_filter(ScenarioFilter::only(["popupBaseCase"]));

    let report = runner.run().await.unwrap();
    let popup = report.scenario("popupBaseCase").unwrap();
    assert_eq!(outcome_code(&popup.outcome), Some(ErrorCode::ScenarioTimeout));
}

/// Browser whose contexts never come up.
struct StuckBrowser {
    attempts: AtomicU32,
}

#[async_trait]
impl Browser for StuckBrowser {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn new_context(&self) -> Result<Box<dyn BrowsingContext>, BrowserError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    async fn close(&self) -> Result<(), BrowserError> {
        Ok(())
    }
}

/// Mock context whose teardown never completes.
struct StuckClose(Box<dyn BrowsingContext>);

#[async_trait]
impl BrowsingContext for StuckClose {
    async fn new_page(&self) -> Result<SurfaceHandle, BrowserError> {
        self.0.new_page().await
    }

    async fn open_surfaces(&self) -> Result<Vec<SurfaceHandle>, BrowserError> {
        self.0.open_surfaces().await
    }

    async fn close(&self) -> Result<(), BrowserError> {
        std::future::pending().await
    }
}

struct StuckCloseBrowser(MockBrowser);

#[async_trait]
impl Browser for StuckCloseBrowser {
    fn name(&self) -> &str {
        "mock"
    }

    async fn new_context(&self) -> Result<Box<dyn BrowsingContext>, BrowserError> {
        Ok(Box::new(StuckClose(self.0.new_context().await?)))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.0.close().await
    }
}

#[tokio::test]
async fn context_that_never_opens_times_out_the_scenario() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config(tmp.path());
    config.timeouts.test_timeout_ms = 200;
    let browser = Arc::new(StuckBrowser {
        attempts: AtomicU32::new(0),
    });
    let runner = Runner::new(
        config,
        browser.clone(),
        CredentialProvisioner::fixed(Credential::new(USER, PASS)),
    )
    .with_filter(ScenarioFilter::only(["redirectBaseCase", "acquireTokenSilent"]));

    let report = tokio::time::timeout(Duration::from_secs(5), runner.run())
        .await
        .expect("run must not outlive its scenario deadlines")
        .unwrap();

    let redirect = report.scenario("redirectBaseCase").unwrap();
    assert_eq!(outcome_code(&redirect.outcome), Some(ErrorCode::ScenarioTimeout));
    assert_eq!(redirect.attempts.len(), 2);

    assert_eq!(
        outcome_code(&report.setups[0].outcome),
        Some(ErrorCode::ScenarioTimeout)
    );
    assert!(matches!(
        report.scenario("acquireTokenSilent").unwrap().outcome,
        ScenarioOutcome::Skipped { .. }
    ));
    // Two attempts for the login scenario, two for the setup.
    assert_eq!(browser.attempts.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn hanging_context_close_does_not_stall_the_run() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config(tmp.path());
    config.timeouts.test_timeout_ms = 1_000;
    let app = MockApp::from_config(&config).with_credentials(USER, PASS);
    let runner = Runner::new(
        config,
        Arc::new(StuckCloseBrowser(MockBrowser::new(app))),
        CredentialProvisioner::fixed(Credential::new(USER, PASS)),
    )
    .with_filter(ScenarioFilter::only(["redirectBaseCase", "acquireTokenSilent"]));

    let report = tokio::time::timeout(Duration::from_secs(10), runner.run())
        .await
        .expect("teardown must be bounded")
        .unwrap();

    assert!(report.is_success(), "{}", report.render_summary());
}

// ---------- 4. Run-level errors ----------

#[tokio::test]
async fn provisioning_failure_aborts_the_run() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(tmp.path());
    let browser = Arc::new(MockBrowser::new(MockApp::from_config(&config)));
    let runner = Runner::new(
        config,
        browser.clone(),
        CredentialProvisioner::env_lookup(|_| None),
    );

    let err = runner.run().await.unwrap_err();
    assert!(matches!(err, RunError::Provision(_)));
    assert!(err.code().is_run_fatal());
    assert_eq!(browser.stats().contexts_opened, 0);
}

#[tokio::test]
async fn unknown_scenario_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let (runner, _) = runner(config(tmp.path()), MockFaults::default());
    let err = runner
        .with_filter(ScenarioFilter::only(["loginEverything"]))
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::UnknownScenarios(ref names) if names == &["loginEverything"]));
    assert_eq!(err.code(), ErrorCode::ConfigInvalid);
}

// ---------- 5. Artifacts ----------

#[tokio::test]
async fn passed_screenshots_are_pruned_when_not_kept() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config(tmp.path());
    config.run.keep_passed_screenshots = false;
    let faults = MockFaults {
        popup_never_closes: true,
        ..MockFaults::default()
    };
    let (runner, _) = runner(config, faults);

    let report = runner
        .with_filter(ScenarioFilter::only(["redirectBaseCase", "popupBaseCase"]))
        .run()
        .await
        .unwrap();

    let shots = tmp.path().join("screenshots");
    assert!(!shots.join("redirectBaseCase").exists());
    assert!(report.scenario("redirectBaseCase").unwrap().screenshots.is_empty());
    assert!(shots.join("popupBaseCase").exists());
    assert!(!report.scenario("popupBaseCase").unwrap().screenshots.is_empty());
}
