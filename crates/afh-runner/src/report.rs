// SPDX-License-Identifier: MIT OR Apache-2.0
//! Run reports.

use crate::retry::AttemptRecord;
use afh_error::HarnessErrorDto;
use afh_flow::ScenarioKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Serde helper: `Duration` as integer milliseconds.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        (val.as_millis() as u64).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(de)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Final state of a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScenarioOutcome {
    /// The last attempt passed.
    Passed,
    /// Every attempt failed; `error` is the last failure.
    Failed {
        /// Last failure.
        error: HarnessErrorDto,
    },
    /// Not run.
    Skipped {
        /// Why it was not run.
        reason: String,
    },
}

impl ScenarioOutcome {
    /// Short lowercase label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed { .. } => "failed",
            Self::Skipped { .. } => "skipped",
        }
    }
}

/// Whether a report entry is a suite setup or a scenario proper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Suite setup.
    Setup,
    /// Scenario.
    Scenario,
}

/// Report entry for one scenario or setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioReport {
    /// Scenario name.
    pub name: String,
    /// Flow driven.
    pub kind: ScenarioKind,
    /// Owning suite.
    pub suite: String,
    /// Setup or scenario.
    pub phase: Phase,
    /// Final state.
    pub outcome: ScenarioOutcome,
    /// Every attempt made, in order.
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    /// Total time across attempts.
    #[serde(with = "duration_millis", rename = "duration_ms")]
    pub duration: Duration,
    /// Screenshots written, across attempts.
    #[serde(default)]
    pub screenshots: Vec<PathBuf>,
}

impl ScenarioReport {
    /// Whether the outcome is [`ScenarioOutcome::Passed`].
    pub fn passed(&self) -> bool {
        matches!(self.outcome, ScenarioOutcome::Passed)
    }

    /// Passed without needing a retry.
    pub fn passed_first_time(&self) -> bool {
        self.passed() && self.attempts.len() == 1
    }
}

/// Counts per outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Passed scenarios.
    pub passed: usize,
    /// Failed scenarios.
    pub failed: usize,
    /// Skipped scenarios.
    pub skipped: usize,
}

/// Everything a run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique id of the run.
    pub run_id: Uuid,
    /// Run start.
    pub started_at: DateTime<Utc>,
    /// Run end.
    pub finished_at: DateTime<Utc>,
    /// Browser backend name.
    pub driver: String,
    /// Suite setups, in execution order.
    #[serde(default)]
    pub setups: Vec<ScenarioReport>,
    /// Scenarios, in execution order.
    pub scenarios: Vec<ScenarioReport>,
}

impl RunReport {
    /// Outcome counts over scenarios; setups are not counted.
    pub fn summary(&self) -> RunSummary {
        let mut s = RunSummary::default();
        for sc in &self.scenarios {
            match sc.outcome {
                ScenarioOutcome::Passed => s.passed += 1,
                ScenarioOutcome::Failed { .. } => s.failed += 1,
                ScenarioOutcome::Skipped { .. } => s.skipped += 1,
            }
        }
        s
    }

    /// True when no scenario failed or was skipped.
    pub fn is_success(&self) -> bool {
        let s = self.summary();
        s.failed == 0 && s.skipped == 0
    }

    /// Looks up a scenario by name.
    pub fn scenario(&self, name: &str) -> Option<&ScenarioReport> {
        self.scenarios.iter().find(|s| s.name == name)
    }

    /// Human-readable summary, one line per entry.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        for entry in self.setups.iter().chain(&self.scenarios) {
            let prefix = match entry.phase {
                Phase::Setup => "setup ",
                Phase::Scenario => "",
            };
            let _ = write!(
                out,
                "{:<8} {prefix}{} ({}, {} attempt{}, {} ms)",
                entry.outcome.label(),
                entry.name,
                entry.kind,
                entry.attempts.len(),
                if entry.attempts.len() == 1 { "" } else { "s" },
                entry.duration.as_millis(),
            );
            match &entry.outcome {
                ScenarioOutcome::Failed { error } => {
                    let _ = write!(out, ": {} {}", error.code, error.message);
                }
                ScenarioOutcome::Skipped { reason } => {
                    let _ = write!(out, ": {reason}");
                }
                ScenarioOutcome::Passed => {}
            }
            out.push('\n');
        }
        let s = self.summary();
        let _ = writeln!(
            out,
            "{} passed, {} failed, {} skipped",
            s.passed, s.failed, s.skipped
        );
        out
    }
}

/// Write `report` as pretty JSON, creating parent directories.
pub async fn write_report(report: &RunReport, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(report).map_err(std::io::Error::other)?;
    tokio::fs::write(path, json).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use afh_error::{ErrorCode, HarnessError};

    fn entry(name: &str, outcome: ScenarioOutcome, attempts: u32) -> ScenarioReport {
        ScenarioReport {
            name: name.into(),
            kind: ScenarioKind::LoginPopup,
            suite: "login".into(),
            phase: Phase::Scenario,
            outcome,
            attempts: (1..=attempts)
                .map(|a| AttemptRecord::passed(a, Duration::from_millis(10)))
                .collect(),
            duration: Duration::from_millis(10 * u64::from(attempts)),
            screenshots: Vec::new(),
        }
    }

    fn report(scenarios: Vec<ScenarioReport>) -> RunReport {
        let now = Utc::now();
        RunReport {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            driver: "mock".into(),
            setups: Vec::new(),
            scenarios,
        }
    }

    #[test]
    fn outcome_is_tagged_by_status() {
        let err = HarnessError::new(ErrorCode::PopupNeverClosed, "still open");
        let failed = ScenarioOutcome::Failed {
            error: (&err).into(),
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["code"], "POPUP_NEVER_CLOSED");
        assert_eq!(
            serde_json::to_value(ScenarioOutcome::Passed).unwrap(),
            serde_json::json!({"status": "passed"})
        );
    }

    #[test]
    fn summary_counts_scenarios_only() {
        let mut r = report(vec![
            entry("a", ScenarioOutcome::Passed, 1),
            entry(
                "b",
                ScenarioOutcome::Skipped {
                    reason: "setup failed".into(),
                },
                0,
            ),
        ]);
        r.setups.push(entry("s", ScenarioOutcome::Passed, 1));
        assert_eq!(
            r.summary(),
            RunSummary {
                passed: 1,
                failed: 0,
                skipped: 1
            }
        );
        assert!(!r.is_success());
    }

    #[test]
    fn render_summary_lists_each_entry() {
        let r = report(vec![entry("popupBaseCase", ScenarioOutcome::Passed, 2)]);
        let text = r.render_summary();
        assert!(text.contains("passed   popupBaseCase (login-popup, 2 attempts, 20 ms)"));
        assert!(text.ends_with("1 passed, 0 failed, 0 skipped\n"));
    }

    #[tokio::test]
    async fn write_report_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out").join("report.json");
        let r = report(vec![entry("redirectBaseCase", ScenarioOutcome::Passed, 1)]);
        write_report(&r, &path).await.unwrap();
        let back: RunReport =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(back.run_id, r.run_id);
        assert!(back.scenario("redirectBaseCase").unwrap().passed_first_time());
    }
}
