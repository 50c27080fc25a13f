// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Checkpoint screenshots.
//!
//! Screenshots land in `<base>/<scenario>/<NNN>_<label>.png`. The sequence
//! number is owned by a [`CaptureSequence`], which the runner creates once
//! per scenario, so numbering starts at 1 for every scenario and continues
//! across that scenario's retry.

use afh_browser::{BrowserError, Surface};
use afh_error::{ErrorCode, HarnessError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Screenshot capture failed.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The browser could not produce the image.
    #[error("screenshot `{label}` failed: {source}")]
    Primitive {
        /// Checkpoint label.
        label: String,
        /// Underlying automation failure.
        #[source]
        source: BrowserError,
    },
    /// The image or its directory could not be written.
    #[error("cannot write {}: {source}", .path.display())]
    Io {
        /// Path being written.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

impl CaptureError {
    /// Stable harness code for this failure.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::CaptureFailed
    }
}

impl From<CaptureError> for HarnessError {
    fn from(err: CaptureError) -> Self {
        HarnessError::new(err.code(), err.to_string()).with_source(err)
    }
}

/// One written screenshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRecord {
    /// Sequence number within the scenario, starting at 1.
    pub sequence: u32,
    /// Checkpoint label.
    pub label: String,
    /// File that was written.
    pub path: PathBuf,
}

/// File name for checkpoint `sequence` with `label`.
///
/// ```
/// assert_eq!(afh_capture::file_name(7, "samplePageInit"), "007_samplePageInit.png");
/// ```
pub fn file_name(sequence: u32, label: &str) -> String {
    format!("{sequence:03}_{}.png", sanitize(label))
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Owns the screenshot base directory.
#[derive(Debug, Clone)]
pub struct ScreenshotRecorder {
    base_dir: PathBuf,
}

impl ScreenshotRecorder {
    /// Recorder writing under `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// The base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create the base directory if it does not exist yet.
    pub async fn ensure_base_dir(&self) -> Result<(), CaptureError> {
        create_dir(&self.base_dir).await
    }

    /// Directory holding `scenario`'s screenshots.
    pub fn scenario_dir(&self, scenario: &str) -> PathBuf {
        self.base_dir.join(sanitize(scenario))
    }

    /// Start numbering for `scenario` at 1.
    pub fn sequence(&self, scenario: &str) -> CaptureSequence {
        CaptureSequence {
            scenario: scenario.to_string(),
            dir: self.scenario_dir(scenario),
            last: 0,
            records: Vec::new(),
        }
    }

    /// Delete `scenario`'s screenshot directory, if any.
    pub async fn remove_scenario_dir(&self, scenario: &str) -> Result<(), CaptureError> {
        let dir = self.scenario_dir(scenario);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CaptureError::Io { path: dir, source }),
        }
    }
}

async fn create_dir(dir: &Path) -> Result<(), CaptureError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| CaptureError::Io {
            path: dir.to_path_buf(),
            source,
        })
}

/// Screenshot numbering for one scenario.
#[derive(Debug)]
pub struct CaptureSequence {
    scenario: String,
    dir: PathBuf,
    last: u32,
    records: Vec<CaptureRecord>,
}

impl CaptureSequence {
    /// Capture `surface` as the next checkpoint.
    ///
    /// The number is only consumed once the file is written, so the files of
    /// a scenario are numbered without gaps.
    pub async fn capture(
        &mut self,
        surface: &dyn Surface,
        label: &str,
    ) -> Result<PathBuf, CaptureError> {
        create_dir(&self.dir).await?;
        let png = surface
            .screenshot()
            .await
            .map_err(|source| CaptureError::Primitive {
                label: label.to_string(),
                source,
            })?;

        let sequence = self.last + 1;
        let path = self.dir.join(file_name(sequence, label));
        tokio::fs::write(&path, &png)
            .await
            .map_err(|source| CaptureError::Io {
                path: path.clone(),
                source,
            })?;
        self.last = sequence;
        debug!(
            target: "afh.capture",
            scenario = %self.scenario,
            sequence,
            label,
            bytes = png.len(),
            "checkpoint captured"
        );
        self.records.push(CaptureRecord {
            sequence,
            label: label.to_string(),
            path: path.clone(),
        });
        Ok(path)
    }

    /// Scenario this sequence belongs to.
    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    /// Directory screenshots are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of the most recent checkpoint, 0 before the first.
    pub fn last_sequence(&self) -> u32 {
        self.last
    }

    /// Every checkpoint written so far, in order.
    pub fn records(&self) -> &[CaptureRecord] {
        &self.records
    }

    /// Consume the sequence, returning its records.
    pub fn into_records(self) -> Vec<CaptureRecord> {
        self.records
    }
}
