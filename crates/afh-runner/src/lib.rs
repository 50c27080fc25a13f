// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Scenario runner for the auth flow harness.
//!
//! The [`Runner`] provisions the credential once, then runs each suite in
//! order against one shared [`afh_browser::Browser`]:
//!
//! - **login** suite: every attempt of every scenario gets a fresh browsing
//!   context, so no storage leaks between sign-ins.
//! - **acquire-token** suite: a popup sign-in setup runs once in a context
//!   the three acquisition scenarios then share; the page is reloaded after
//!   each attempt. A failed setup skips the suite.
//!
//! Each attempt is bounded by the per-test-case timeout and a failed
//! scenario is re-run from the home page according to the [`RetryPolicy`].
//! Results are collected in a [`RunReport`].

pub mod report;
pub mod retry;
pub mod runner;
pub mod suite;

pub use report::{Phase, RunReport, RunSummary, ScenarioOutcome, ScenarioReport, write_report};
pub use retry::{AttemptRecord, RetryPolicy};
pub use runner::{RunError, Runner};
pub use suite::{
    ACQUIRE_SUITE, Isolation, LOGIN_SUITE, ScenarioFilter, ScenarioSpec, SuiteSpec,
    default_suites, scenario_names,
};
