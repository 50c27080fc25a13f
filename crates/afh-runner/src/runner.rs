// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sequential execution of suites against one shared browser.

use crate::report::{Phase, RunReport, ScenarioOutcome, ScenarioReport};
use crate::retry::{AttemptRecord, RetryPolicy};
use crate::suite::{Isolation, ScenarioFilter, ScenarioSpec, SuiteSpec, default_suites};
use afh_browser::{Browser, BrowsingContext, Surface, SurfaceHandle, close_stray_surfaces};
use afh_capture::{CaptureError, CaptureSequence, ScreenshotRecorder};
use afh_config::HarnessConfig;
use afh_error::{ErrorCode, HarnessError};
use afh_flow::{FlowDriver, ScenarioKind};
use afh_lab::{CredentialProvisioner, ProvisionError};
use afh_storage::StorageValidator;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures that stop the whole run before or between scenarios.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// No credential could be provisioned.
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// The screenshot base directory could not be created.
    #[error("cannot prepare screenshot directory: {0}")]
    ScreenshotDir(#[source] CaptureError),

    /// The filter named scenarios that do not exist.
    #[error("unknown scenario(s): {}", .0.join(", "))]
    UnknownScenarios(Vec<String>),
}

impl RunError {
    /// Stable code for reporting.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Provision(e) => e.code(),
            Self::ScreenshotDir(_) => ErrorCode::CaptureFailed,
            Self::UnknownScenarios(_) => ErrorCode::ConfigInvalid,
        }
    }
}

impl From<RunError> for HarnessError {
    fn from(err: RunError) -> Self {
        HarnessError::new(err.code(), err.to_string()).with_source(err)
    }
}

// ---------------------------------------------------------------------------
// Attempt bookkeeping
// ---------------------------------------------------------------------------

struct Attempts {
    policy: RetryPolicy,
    records: Vec<AttemptRecord>,
    started: Instant,
}

impl Attempts {
    fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            records: Vec::new(),
            started: Instant::now(),
        }
    }

    fn next(&self) -> u32 {
        self.records.len() as u32 + 1
    }

    /// Records a finished attempt; `true` when another one should run.
    fn record<T>(&mut self, result: &Result<T, HarnessError>, took: Duration) -> bool {
        let attempt = self.next();
        match result {
            Ok(_) => {
                self.records.push(AttemptRecord::passed(attempt, took));
                false
            }
            Err(err) => {
                self.records.push(AttemptRecord::failed(attempt, took, err));
                self.policy.should_retry(attempt, err)
            }
        }
    }

    fn into_report<T>(
        self,
        suite: &SuiteSpec,
        spec: &ScenarioSpec,
        phase: Phase,
        result: &Result<T, HarnessError>,
        seq: &CaptureSequence,
    ) -> ScenarioReport {
        let outcome = match result {
            Ok(_) => ScenarioOutcome::Passed,
            Err(err) => ScenarioOutcome::Failed { error: err.into() },
        };
        ScenarioReport {
            name: spec.name.to_string(),
            kind: spec.kind,
            suite: suite.name.to_string(),
            phase,
            outcome,
            duration: self.started.elapsed(),
            attempts: self.records,
            screenshots: seq.records().iter().map(|r| r.path.clone()).collect(),
        }
    }
}

fn skipped(suite: &SuiteSpec, spec: &ScenarioSpec, reason: &str) -> ScenarioReport {
    ScenarioReport {
        name: spec.name.to_string(),
        kind: spec.kind,
        suite: suite.name.to_string(),
        phase: Phase::Scenario,
        outcome: ScenarioOutcome::Skipped {
            reason: reason.to_string(),
        },
        attempts: Vec::new(),
        duration: Duration::ZERO,
        screenshots: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

struct RunEnv {
    driver: FlowDriver,
    recorder: ScreenshotRecorder,
    validator: StorageValidator,
}

struct SharedSession {
    context: Box<dyn BrowsingContext>,
    page: SurfaceHandle,
}

/// Runs suites of scenarios and collects a [`RunReport`].
pub struct Runner {
    config: HarnessConfig,
    browser: Arc<dyn Browser>,
    provisioner: CredentialProvisioner,
    suites: Vec<SuiteSpec>,
    filter: ScenarioFilter,
}

impl Runner {
    /// Runner over [`default_suites`].
    pub fn new(
        config: HarnessConfig,
        browser: Arc<dyn Browser>,
        provisioner: CredentialProvisioner,
    ) -> Self {
        Self {
            config,
            browser,
            provisioner,
            suites: default_suites(),
            filter: ScenarioFilter::default(),
        }
    }

    /// Only run the scenarios `filter` selects.
    pub fn with_filter(mut self, filter: ScenarioFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Replace the suite catalog.
    pub fn with_suites(mut self, suites: Vec<SuiteSpec>) -> Self {
        self.suites = suites;
        self
    }

    /// Retry policy derived from the configuration.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.run.retries)
    }

    /// Provision the credential once, then run every selected scenario in
    /// order. Scenario failures land in the report; only run-level failures
    /// are returned as errors.
    pub async fn run(&self) -> Result<RunReport, RunError> {
        let unknown = self.filter.unknown(&self.suites);
        if !unknown.is_empty() {
            return Err(RunError::UnknownScenarios(unknown));
        }
        let suites = self.filter.apply(self.suites.clone());

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            target: "afh.runner",
            %run_id,
            driver = self.browser.name(),
            suites = suites.len(),
            "run started"
        );

        let recorder = ScreenshotRecorder::new(&self.config.run.screenshot_dir);
        recorder
            .ensure_base_dir()
            .await
            .map_err(RunError::ScreenshotDir)?;
        let credential = self.provisioner.credential().await?;

        let app = &self.config.app;
        let mut validator = StorageValidator::new(&app.client_id, &app.authority);
        if self.config.run.enforce_scopes {
            validator = validator.with_required_scopes(app.scopes.clone());
        }
        let env = RunEnv {
            driver: FlowDriver::new(
                self.config.selectors.clone(),
                credential,
                self.config.timeouts.wait_timeout(),
            ),
            recorder,
            validator,
        };

        let mut report = RunReport {
            run_id,
            started_at,
            finished_at: started_at,
            driver: self.browser.name().to_string(),
            setups: Vec::new(),
            scenarios: Vec::new(),
        };

        for suite in &suites {
            info!(target: "afh.runner", suite = suite.name, "suite started");
            match suite.isolation {
                Isolation::FreshContext => {
                    for spec in &suite.scenarios {
                        let entry = self.run_fresh(&env, suite, spec).await;
                        report.scenarios.push(entry);
                    }
                }
                Isolation::SharedContext => self.run_shared(&env, suite, &mut report).await,
            }
        }

        if !self.config.run.keep_passed_screenshots {
            prune_passed(&env.recorder, &mut report).await;
        }
        report.finished_at = Utc::now();
        let summary = report.summary();
        info!(
            target: "afh.runner",
            %run_id,
            passed = summary.passed,
            failed = summary.failed,
            skipped = summary.skipped,
            "run finished"
        );
        Ok(report)
    }

    // -- fresh-context scenarios --------------------------------------------

    async fn run_fresh(&self, env: &RunEnv, suite: &SuiteSpec, spec: &ScenarioSpec) -> ScenarioReport {
        let mut seq = env.recorder.sequence(spec.name);
        let mut attempts = Attempts::new(self.policy());
        let result = loop {
            let attempt = attempts.next();
            let span = info_span!("scenario", name = spec.name, kind = %spec.kind, attempt);
            let t = Instant::now();
            let result = self.fresh_attempt(env, spec, &mut seq).instrument(span).await;
            if !attempts.record(&result, t.elapsed()) {
                break result;
            }
        };
        log_outcome(spec, &result);
        attempts.into_report(suite, spec, Phase::Scenario, &result, &seq)
    }

    async fn fresh_attempt(
        &self,
        env: &RunEnv,
        spec: &ScenarioSpec,
        seq: &mut CaptureSequence,
    ) -> Result<(), HarnessError> {
        let deadline = self.deadline();
        let context = self
            .bounded(spec.name, deadline, async {
                Ok::<_, HarnessError>(self.browser.new_context().await?)
            })
            .await?;
        let result = self
            .bounded(spec.name, deadline, async {
                let page = context.new_page().await?;
                page.navigate(&self.config.app.base_url).await?;
                env.driver.run(spec.kind, &page, seq).await?;
                verify(env, spec.kind, page.as_ref()).await
            })
            .await;
        self.close_context(context.as_ref(), spec.name).await;
        result
    }

    // -- shared-context suites ----------------------------------------------

    async fn run_shared(&self, env: &RunEnv, suite: &SuiteSpec, report: &mut RunReport) {
        let setup_name = suite.setup.as_ref().map_or(suite.name, |s| s.name);
        let mut seq = env.recorder.sequence(setup_name);
        let mut attempts = Attempts::new(self.policy());
        let session = loop {
            let attempt = attempts.next();
            let span = info_span!("scenario", name = setup_name, kind = "setup", attempt);
            let t = Instant::now();
            let result = self
                .open_session(env, suite.setup.as_ref(), &mut seq)
                .instrument(span)
                .await;
            if !attempts.record(&result, t.elapsed()) {
                break result;
            }
        };
        if let Some(setup) = &suite.setup {
            let entry = attempts.into_report(suite, setup, Phase::Setup, &session, &seq);
            report.setups.push(entry);
        }

        let session = match session {
            Ok(session) => session,
            Err(err) => {
                warn!(
                    target: "afh.runner",
                    suite = suite.name,
                    code = %err.code,
                    "setup failed, skipping suite"
                );
                let reason = format!("setup {setup_name} failed: {}", err.message);
                for spec in &suite.scenarios {
                    report.scenarios.push(skipped(suite, spec, &reason));
                }
                return;
            }
        };

        for spec in &suite.scenarios {
            let mut seq = env.recorder.sequence(spec.name);
            let mut attempts = Attempts::new(self.policy());
            let result = loop {
                let attempt = attempts.next();
                let span = info_span!("scenario", name = spec.name, kind = %spec.kind, attempt);
                let t = Instant::now();
                let result = self
                    .bounded(spec.name, self.deadline(), async {
                        env.driver.run(spec.kind, &session.page, &mut seq).await?;
                        verify(env, spec.kind, session.page.as_ref()).await
                    })
                    .instrument(span)
                    .await;
                self.reset_shared(&session, spec).await;
                if !attempts.record(&result, t.elapsed()) {
                    break result;
                }
            };
            log_outcome(spec, &result);
            report
                .scenarios
                .push(attempts.into_report(suite, spec, Phase::Scenario, &result, &seq));
        }

        self.close_context(session.context.as_ref(), suite.name).await;
    }

    /// Fresh context and page on the home page, signed in by `setup` when
    /// given. The context is closed again when this fails.
    async fn open_session(
        &self,
        env: &RunEnv,
        setup: Option<&ScenarioSpec>,
        seq: &mut CaptureSequence,
    ) -> Result<SharedSession, HarnessError> {
        let name = setup.map_or("session", |s| s.name);
        let deadline = self.deadline();
        let context = self
            .bounded(name, deadline, async {
                Ok::<_, HarnessError>(self.browser.new_context().await?)
            })
            .await?;
        let page = self
            .bounded(name, deadline, async {
                let page = context.new_page().await?;
                page.navigate(&self.config.app.base_url).await?;
                if let Some(setup) = setup {
                    env.driver.run(setup.kind, &page, seq).await?;
                    verify(env, setup.kind, page.as_ref()).await?;
                }
                Ok::<_, HarnessError>(page)
            })
            .await;
        match page {
            Ok(page) => Ok(SharedSession { context, page }),
            Err(err) => {
                self.close_context(context.as_ref(), name).await;
                Err(err)
            }
        }
    }

    /// End of the time budget for a test case starting now.
    fn deadline(&self) -> tokio::time::Instant {
        tokio::time::Instant::now() + self.config.timeouts.test_timeout()
    }

    /// Run `fut` until `deadline`. Running out of time is a scenario
    /// failure, never a hang of the run.
    async fn bounded<T, F>(
        &self,
        name: &str,
        deadline: tokio::time::Instant,
        fut: F,
    ) -> Result<T, HarnessError>
    where
        F: Future<Output = Result<T, HarnessError>>,
    {
        let limit = self.config.timeouts.test_timeout();
        match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::new(
                ErrorCode::ScenarioTimeout,
                format!("{name} did not finish within {limit:?}"),
            )
            .with_context("timeout_ms", limit.as_millis() as u64)),
        }
    }

    /// Close `context`, giving up after one test-case budget.
    async fn close_context(&self, context: &dyn BrowsingContext, label: &str) {
        let limit = self.config.timeouts.test_timeout();
        match tokio::time::timeout(limit, context.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(target: "afh.runner", scope = label, error = %e, "context close failed"),
            Err(_) => warn!(target: "afh.runner", scope = label, timeout = ?limit, "context close timed out"),
        }
    }

    /// Close popups left behind and reload the shared page. Storage and the
    /// signed-in session survive.
    async fn reset_shared(&self, session: &SharedSession, spec: &ScenarioSpec) {
        let limit = self.config.timeouts.test_timeout();
        let reset = async {
            match close_stray_surfaces(session.context.as_ref(), &session.page).await {
                Ok(0) => {}
                Ok(n) => info!(target: "afh.runner", scenario = spec.name, closed = n, "closed stray surfaces"),
                Err(e) => warn!(target: "afh.runner", scenario = spec.name, error = %e, "stray surface cleanup failed"),
            }
            if let Err(e) = session.page.reload().await {
                warn!(target: "afh.runner", scenario = spec.name, error = %e, "reload failed");
            }
        };
        if tokio::time::timeout(limit, reset).await.is_err() {
            warn!(target: "afh.runner", scenario = spec.name, timeout = ?limit, "shared page reset timed out");
        }
    }
}

async fn verify(env: &RunEnv, kind: ScenarioKind, page: &dyn Surface) -> Result<(), HarnessError> {
    if kind.is_acquire() {
        env.validator.verify_acquisition(page).await?;
    } else {
        env.validator.verify_login(page).await?;
    }
    Ok(())
}

fn log_outcome(spec: &ScenarioSpec, result: &Result<(), HarnessError>) {
    match result {
        Ok(()) => info!(target: "afh.runner", scenario = spec.name, "scenario passed"),
        Err(err) => warn!(
            target: "afh.runner",
            scenario = spec.name,
            code = %err.code,
            error = %err.message,
            "scenario failed"
        ),
    }
}

async fn prune_passed(recorder: &ScreenshotRecorder, report: &mut RunReport) {
    for entry in report.setups.iter_mut().chain(report.scenarios.iter_mut()) {
        if !entry.passed_first_time() {
            continue;
        }
        match recorder.remove_scenario_dir(&entry.name).await {
            Ok(()) => entry.screenshots.clear(),
            Err(e) => warn!(target: "afh.runner", scenario = %entry.name, error = %e, "screenshot cleanup failed"),
        }
    }
}
