// SPDX-License-Identifier: MIT OR Apache-2.0
//! Whole-harness runs against the mock sample app, with credentials
//! provisioned from a fake lab service.

use afh_browser::{Browser, BrowsingContext, Surface};
use afh_browser_mock::{MockApp, MockBrowser, MockFaults};
use afh_capture::ScreenshotRecorder;
use afh_config::HarnessConfig;
use afh_error::ErrorCode;
use afh_flow::{FlowDriver, ScenarioKind};
use afh_lab::{Credential, CredentialProvisioner, HttpLabClient, UserQuery};
use afh_runner::{RunError, RunReport, Runner, ScenarioFilter, ScenarioOutcome, write_report};
use afh_storage::StorageValidator;
use serde_json::json;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const UPN: &str = "fidlab@msidlab8.com";
const SECRET: &str = "s3cr3t-lab-password";

fn config(dir: &Path) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.run.screenshot_dir = dir.join("screenshots");
    config.timeouts.wait_timeout_ms = 300;
    config.timeouts.test_timeout_ms = 3_000;
    config
}

async fn lab_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user"))
        .and(query_param("envname", "onprem"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{ "labName": "fidlab", "upn": UPN }])),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/LabSecret"))
        .and(query_param("secret", "fidlab"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": SECRET })))
        .expect(1)
        .mount(&server)
        .await;
    server
}

fn lab_provisioner(server: &MockServer) -> CredentialProvisioner {
    CredentialProvisioner::lab(
        Arc::new(HttpLabClient::new(server.uri())),
        UserQuery {
            env_name: "onprem".into(),
            user_type: "onprem".into(),
            federation_provider: "adfsv2019".into(),
        },
    )
}

fn mock_browser(config: &HarnessConfig, faults: MockFaults) -> Arc<MockBrowser> {
    Arc::new(MockBrowser::new(
        MockApp::from_config(config)
            .with_credentials(UPN, SECRET)
            .with_faults(faults),
    ))
}

fn failed_code(report: &RunReport, name: &str) -> Option<ErrorCode> {
    match &report.scenario(name)?.outcome {
        ScenarioOutcome::Failed { error } => Some(error.code),
        _ => None,
    }
}

/// Log sink shared between the subscriber and the test.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------- 1. Full run ----------

#[tokio::test]
async fn lab_identity_signs_in_and_every_scenario_passes() {
    let tmp = tempfile::tempdir().unwrap();
    let server = lab_server().await;
    let config = config(tmp.path());
    let browser = mock_browser(&config, MockFaults::default());

    let report = Runner::new(config, browser.clone(), lab_provisioner(&server))
        .run()
        .await
        .unwrap();

    assert!(report.is_success(), "{}", report.render_summary());
    assert_eq!(report.summary().passed, 5);
    assert_eq!(browser.stats().popups_opened, 2);
    for name in [
        "redirectBaseCase",
        "popupBaseCase",
        "acquireTokenRedirect",
        "acquireTokenPopup",
        "acquireTokenSilent",
    ] {
        let entry = report.scenario(name).unwrap();
        assert_eq!(entry.attempts.len(), 1, "{name}");
        assert!(
            tmp.path().join("screenshots").join(name).is_dir(),
            "{name} has no screenshot directory"
        );
    }
    // Both lab calls happen exactly once for the whole run.
    server.verify().await;
}

#[tokio::test]
async fn lab_outage_aborts_before_any_browser_work() {
    let tmp = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let config = config(tmp.path());
    let browser = mock_browser(&config, MockFaults::default());

    let err = Runner::new(config, browser.clone(), lab_provisioner(&server))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Provision(_)), "{err}");
    assert_eq!(err.code(), ErrorCode::ProvisionUserLookupFailed);
    assert_eq!(browser.stats().contexts_opened, 0);
}

// ---------- 2. Token cache contents ----------

#[tokio::test]
async fn popup_acquisition_leaves_one_token_for_the_adfs_authority() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(tmp.path());
    assert_eq!(config.app.client_id, "57448aa1-9515-4176-a106-5cb9be8550e1");
    assert_eq!(config.app.authority, "https://fs.msidlab8.com/adfs/");

    let browser = mock_browser(&config, MockFaults::default());
    let recorder = ScreenshotRecorder::new(&config.run.screenshot_dir);
    let driver = FlowDriver::new(
        config.selectors.clone(),
        Arc::new(Credential::new(UPN, SECRET)),
        config.timeouts.wait_timeout(),
    );
    let validator = StorageValidator::new(&config.app.client_id, &config.app.authority);

    let ctx = browser.new_context().await.unwrap();
    let page = ctx.new_page().await.unwrap();
    page.navigate(&config.app.base_url).await.unwrap();

    let mut setup = recorder.sequence("acquireTokenBaseCase");
    driver
        .run(ScenarioKind::LoginPopup, &page, &mut setup)
        .await
        .unwrap();
    let mut seq = recorder.sequence("acquireTokenPopup");
    driver
        .run(ScenarioKind::AcquirePopup, &page, &mut seq)
        .await
        .unwrap();

    let snapshot = validator.snapshot(page.as_ref()).await.unwrap();
    assert!(snapshot.contains_key("msal.57448aa1-9515-4176-a106-5cb9be8550e1.idtoken"));
    assert!(snapshot.contains_key("msal.57448aa1-9515-4176-a106-5cb9be8550e1.client.info"));
    assert_eq!(validator.matching_keys(&snapshot).len(), 1);

    // Counting consumes the entry, so the next acquisition starts from zero.
    assert_eq!(validator.verify_acquisition(page.as_ref()).await.unwrap(), 1);
    let after = validator.snapshot(page.as_ref()).await.unwrap();
    assert!(validator.matching_keys(&after).is_empty());
    assert!(after.contains_key("msal.57448aa1-9515-4176-a106-5cb9be8550e1.idtoken"));

    ctx.close().await.unwrap();
}

// ---------- 3. Failures keep the run going ----------

#[tokio::test]
async fn stuck_popup_fails_its_scenario_and_the_run_continues() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = config(tmp.path());
    config.run.retries = 0;
    let browser = mock_browser(
        &config,
        MockFaults {
            popup_never_closes: true,
            ..MockFaults::default()
        },
    );

    let report = Runner::new(
        config,
        browser,
        CredentialProvisioner::fixed(Credential::new(UPN, SECRET)),
    )
    .with_filter(ScenarioFilter::only(["popupBaseCase", "redirectBaseCase"]))
    .run()
    .await
    .unwrap();

    assert_eq!(
        failed_code(&report, "popupBaseCase"),
        Some(ErrorCode::PopupNeverClosed)
    );
    assert!(report.scenario("redirectBaseCase").unwrap().passed());
    assert!(!report.is_success());
}

// ---------- 4. Report and logs ----------

#[tokio::test]
async fn report_file_round_trips_through_json() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(tmp.path());
    let browser = mock_browser(&config, MockFaults::default());
    let report = Runner::new(
        config,
        browser,
        CredentialProvisioner::fixed(Credential::new(UPN, SECRET)),
    )
    .with_filter(ScenarioFilter::only(["redirectBaseCase"]))
    .run()
    .await
    .unwrap();

    let out = tmp.path().join("out").join("report.json");
    write_report(&report, &out).await.unwrap();

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(json["run_id"], report.run_id.to_string());
    assert_eq!(json["driver"], "mock");
    let scenario = &json["scenarios"][0];
    assert_eq!(scenario["name"], "redirectBaseCase");
    assert_eq!(scenario["kind"], "login-redirect");
    assert_eq!(scenario["outcome"]["status"], "passed");
    assert_eq!(scenario["screenshots"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn logs_name_the_scenarios_but_never_the_password() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(tmp.path());
    let browser = mock_browser(&config, MockFaults::default());
    let sink = Captured::default();
    let writer = sink.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let report = Runner::new(
        config,
        browser,
        CredentialProvisioner::fixed(Credential::new(UPN, SECRET)),
    )
    .run()
    .await
    .unwrap();
    assert!(report.is_success());

    let logs = sink.text();
    assert!(logs.contains("run started"));
    assert!(logs.contains("scenario passed"));
    assert!(logs.contains("acquireTokenSilent"));
    assert!(!logs.contains(SECRET), "password leaked into logs");
}
