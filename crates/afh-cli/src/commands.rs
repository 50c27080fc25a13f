// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command implementations for the `afh` binary.

use afh_browser::Browser;
use afh_browser::webdriver::{WebDriverBrowser, WebDriverOptions};
use afh_browser_mock::{MockApp, MockBrowser};
use afh_config::{
    ConfigOverlay, ConfigWarning, DriverKind, HarnessConfig, load_config, merge_configs,
    validate_config,
};
use afh_lab::CredentialProvisioner;
use afh_runner::{RunReport, Runner, ScenarioFilter, default_suites, write_report};
use anyhow::{Context, Result};
use schemars::schema_for;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

/// One line per scenario: name, kind and suite.
pub fn scenario_listing() -> String {
    let mut out = String::new();
    for suite in default_suites() {
        if let Some(setup) = &suite.setup {
            let _ = writeln!(out, "{:<22} {:<17} {} (setup)", setup.name, setup.kind, suite.name);
        }
        for spec in &suite.scenarios {
            let _ = writeln!(out, "{:<22} {:<17} {}", spec.name, spec.kind, suite.name);
        }
    }
    out
}

/// JSON schema of [`HarnessConfig`].
pub fn config_schema() -> Result<String> {
    let value = serde_json::to_value(schema_for!(HarnessConfig))?;
    serde_json::to_string_pretty(&value).context("serialize schema")
}

/// Load `path` (or defaults), apply `AFH_*` overrides and the command-line
/// `overlay`, then validate.
pub fn load_effective(
    path: Option<&Path>,
    overlay: ConfigOverlay,
) -> Result<(HarnessConfig, Vec<ConfigWarning>)> {
    let base = load_config(path).context("load configuration")?;
    let config = merge_configs(base, overlay);
    let warnings = validate_config(&config).context("validate configuration")?;
    Ok((config, warnings))
}

/// Browser backend selected by `[browser].driver`.
pub fn build_browser(config: &HarnessConfig) -> Arc<dyn Browser> {
    match config.browser.driver {
        DriverKind::Webdriver => {
            let mut options = WebDriverOptions::new(&config.browser.webdriver_url);
            options.browser_name = config.browser.browser_name.clone();
            options.headless = config.browser.headless;
            options.poll_interval = config.timeouts.poll_interval();
            options.navigation_quiet = config.timeouts.navigation_quiet();
            options.request_timeout = config.timeouts.request_timeout();
            Arc::new(WebDriverBrowser::new(options))
        }
        DriverKind::Mock => Arc::new(MockBrowser::new(MockApp::from_config(config))),
    }
}

/// Run the selected scenarios, write the report when a path is given, and
/// close the browser.
pub async fn run(
    config: HarnessConfig,
    scenarios: Vec<String>,
    report_path: Option<&Path>,
) -> Result<RunReport> {
    let browser = build_browser(&config);
    let provisioner = CredentialProvisioner::from_config(&config.lab);
    let runner = Runner::new(config, Arc::clone(&browser), provisioner)
        .with_filter(ScenarioFilter::only(scenarios));

    let result = runner.run().await;
    if let Err(e) = browser.close().await {
        tracing::warn!(target: "afh.runner", error = %e, "browser close failed");
    }
    let report = result.context("harness run aborted")?;

    if let Some(path) = report_path {
        write_report(&report, path)
            .await
            .with_context(|| format!("write report '{}'", path.display()))?;
    }
    Ok(report)
}
