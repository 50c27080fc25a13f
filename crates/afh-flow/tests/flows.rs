// SPDX-License-Identifier: MIT OR Apache-2.0
//! Every flow end to end against the mock sample app.

use afh_browser::{Browser, BrowsingContext, Surface, SurfaceHandle};
use afh_browser_mock::{MockApp, MockBrowser, MockFaults};
use afh_capture::ScreenshotRecorder;
use afh_config::AppSelectors;
use afh_error::ErrorCode;
use afh_flow::{FlowDriver, PopupSyncError, ScenarioKind, StepError};
use afh_lab::Credential;
use std::sync::Arc;
use std::time::Duration;

const USER: &str = "user@lab";
const PASS: &str = "pw";

fn driver() -> FlowDriver {
    FlowDriver::new(
        AppSelectors::default(),
        Arc::new(Credential::new(USER, PASS)),
        Duration::from_millis(500),
    )
}

fn browser(faults: MockFaults) -> MockBrowser {
    MockBrowser::new(
        MockApp::default()
            .with_credentials(USER, PASS)
            .with_faults(faults),
    )
}

async fn home(browser: &MockBrowser) -> (Box<dyn BrowsingContext>, SurfaceHandle) {
    let ctx = browser.new_context().await.unwrap();
    let page = ctx.new_page().await.unwrap();
    page.navigate(&browser.app().base_url).await.unwrap();
    (ctx, page)
}

fn labels(seq: &afh_capture::CaptureSequence) -> Vec<String> {
    seq.records()
        .iter()
        .map(|r| format!("{:03}_{}", r.sequence, r.label))
        .collect()
}

// ---------- 1. Login flows ----------

#[tokio::test]
async fn login_redirect_reaches_logged_in_page() {
    let tmp = tempfile::tempdir().unwrap();
    let recorder = ScreenshotRecorder::new(tmp.path());
    let browser = browser(MockFaults::default());
    let (_ctx, page) = home(&browser).await;
    let mut seq = recorder.sequence("redirectBaseCase");

    let trace = driver()
        .run(ScenarioKind::LoginRedirect, &page, &mut seq)
        .await
        .unwrap();

    assert_eq!(trace.popup, None);
    assert_eq!(
        labels(&seq),
        [
            "001_samplePageInit",
            "002_signInClicked",
            "003_SignInPage",
            "004_samplePageLoggedIn",
        ]
    );
    let storage = page.local_storage().await.unwrap();
    assert!(storage.contains_key(&browser.app().id_token_key()));
    assert!(storage.contains_key(&browser.app().client_info_key()));
}

#[tokio::test]
async fn login_popup_signs_in_through_the_popup() {
    let tmp = tempfile::tempdir().unwrap();
    let recorder = ScreenshotRecorder::new(tmp.path());
    let browser = browser(MockFaults::default());
    let (ctx, page) = home(&browser).await;
    let mut seq = recorder.sequence("popupBaseCase");

    let trace = driver()
        .run(ScenarioKind::LoginPopup, &page, &mut seq)
        .await
        .unwrap();

    assert!(trace.popup.is_some());
    assert_eq!(
        labels(&seq),
        [
            "001_samplePageInit",
            "002_signInClicked",
            "003_SignInPage",
            "004_samplePageLoggedIn",
        ]
    );
    assert_eq!(browser.stats().popups_opened, 1);
    // Only the parent survives.
    let open = ctx.open_surfaces().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id(), page.id());
}

#[tokio::test]
async fn popup_that_closes_immediately_is_not_missed() {
    let mut app = MockApp::default().with_credentials(USER, PASS);
    app.popup_close_delay = Duration::ZERO;
    let browser = MockBrowser::new(app);
    let tmp = tempfile::tempdir().unwrap();
    let (_ctx, page) = home(&browser).await;
    let mut seq = ScreenshotRecorder::new(tmp.path()).sequence("popupBaseCase");

    driver()
        .run(ScenarioKind::LoginPopup, &page, &mut seq)
        .await
        .unwrap();
}

// ---------- 2. Acquire flows ----------

#[tokio::test]
async fn acquire_flows_run_on_a_signed_in_page() {
    let tmp = tempfile::tempdir().unwrap();
    let recorder = ScreenshotRecorder::new(tmp.path());
    let browser = browser(MockFaults::default());
    let (_ctx, page) = home(&browser).await;
    let driver = driver();

    let mut setup = recorder.sequence("acquireTokenBaseCase");
    driver
        .run(ScenarioKind::LoginPopup, &page, &mut setup)
        .await
        .unwrap();

    for (kind, name, label) in [
        (ScenarioKind::AcquireRedirect, "acquireTokenRedirect", "accessTokenAcquiredRedirect"),
        (ScenarioKind::AcquirePopup, "acquireTokenPopup", "accessTokenAcquiredPopup"),
        (ScenarioKind::AcquireSilent, "acquireTokenSilent", "accessTokenAcquiredSilently"),
    ] {
        let mut seq = recorder.sequence(name);
        driver.run(kind, &page, &mut seq).await.unwrap();
        assert_eq!(labels(&seq), [format!("001_{label}")]);
        page.reload().await.unwrap();
    }
}

// ---------- 3. Popup failures ----------

#[tokio::test]
async fn popup_never_opening_is_a_sync_error() {
    let tmp = tempfile::tempdir().unwrap();
    let browser = browser(MockFaults {
        popup_never_opens: true,
        ..MockFaults::default()
    });
    let (_ctx, page) = home(&browser).await;
    let mut seq = ScreenshotRecorder::new(tmp.path()).sequence("popupBaseCase");

    let err = driver()
        .with_popup_timeout(Duration::from_millis(50))
        .run(ScenarioKind::LoginPopup, &page, &mut seq)
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::PopupNeverOpened);
    assert!(matches!(
        err.source,
        StepError::Popup(PopupSyncError::NeverOpened { .. })
    ));
    assert_eq!(seq.last_sequence(), 2);
}

#[tokio::test]
async fn popup_never_closing_leaves_the_popup_for_teardown() {
    let tmp = tempfile::tempdir().unwrap();
    let browser = browser(MockFaults {
        popup_never_closes: true,
        ..MockFaults::default()
    });
    let (ctx, page) = home(&browser).await;
    let mut seq = ScreenshotRecorder::new(tmp.path()).sequence("popupBaseCase");

    let err = driver()
        .with_popup_timeout(Duration::from_millis(50))
        .run(ScenarioKind::LoginPopup, &page, &mut seq)
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::PopupNeverClosed);
    assert_eq!(ctx.open_surfaces().await.unwrap().len(), 2);
    let closed = afh_browser::close_stray_surfaces(ctx.as_ref(), &page)
        .await
        .unwrap();
    assert_eq!(closed, 1);
}

#[tokio::test]
async fn wrong_password_keeps_the_popup_open() {
    let tmp = tempfile::tempdir().unwrap();
    let browser = MockBrowser::new(MockApp::default().with_credentials(USER, "other"));
    let (_ctx, page) = home(&browser).await;
    let mut seq = ScreenshotRecorder::new(tmp.path()).sequence("popupBaseCase");

    let err = driver()
        .with_popup_timeout(Duration::from_millis(50))
        .run(ScenarioKind::LoginPopup, &page, &mut seq)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::PopupNeverClosed);
}
