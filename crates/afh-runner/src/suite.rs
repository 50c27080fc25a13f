// SPDX-License-Identifier: MIT OR Apache-2.0
//! The scenario catalog and scenario selection.

use afh_flow::ScenarioKind;
use serde::Serialize;
use std::collections::BTreeSet;

/// A named run of one flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioSpec {
    /// Scenario name; also the screenshot directory.
    pub name: &'static str,
    /// Flow driven by the scenario.
    pub kind: ScenarioKind,
}

/// How scenarios of a suite get their browsing context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Isolation {
    /// Every attempt opens a fresh context and page.
    FreshContext,
    /// The setup signs in once; every scenario reuses that page and
    /// reloads it afterwards.
    SharedContext,
}

/// A group of scenarios with a common setup and isolation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuiteSpec {
    /// Suite name.
    pub name: &'static str,
    /// Context policy.
    pub isolation: Isolation,
    /// Flow run once before the scenarios.
    pub setup: Option<ScenarioSpec>,
    /// Scenarios, in execution order.
    pub scenarios: Vec<ScenarioSpec>,
}

/// Name of the sign-in suite.
pub const LOGIN_SUITE: &str = "login";
/// Name of the token-acquisition suite.
pub const ACQUIRE_SUITE: &str = "acquire-token";

/// The sign-in suite followed by the token-acquisition suite.
pub fn default_suites() -> Vec<SuiteSpec> {
    vec![
        SuiteSpec {
            name: LOGIN_SUITE,
            isolation: Isolation::FreshContext,
            setup: None,
            scenarios: vec![
                ScenarioSpec {
                    name: "redirectBaseCase",
                    kind: ScenarioKind::LoginRedirect,
                },
                ScenarioSpec {
                    name: "popupBaseCase",
                    kind: ScenarioKind::LoginPopup,
                },
            ],
        },
        SuiteSpec {
            name: ACQUIRE_SUITE,
            isolation: Isolation::SharedContext,
            setup: Some(ScenarioSpec {
                name: "acquireTokenBaseCase",
                kind: ScenarioKind::LoginPopup,
            }),
            scenarios: vec![
                ScenarioSpec {
                    name: "acquireTokenRedirect",
                    kind: ScenarioKind::AcquireRedirect,
                },
                ScenarioSpec {
                    name: "acquireTokenPopup",
                    kind: ScenarioKind::AcquirePopup,
                },
                ScenarioSpec {
                    name: "acquireTokenSilent",
                    kind: ScenarioKind::AcquireSilent,
                },
            ],
        },
    ]
}

/// Scenario names across `suites`, in execution order.
pub fn scenario_names(suites: &[SuiteSpec]) -> Vec<&'static str> {
    suites
        .iter()
        .flat_map(|s| s.scenarios.iter().map(|sc| sc.name))
        .collect()
}

/// Selects scenarios by name. Empty selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioFilter {
    names: BTreeSet<String>,
}

impl ScenarioFilter {
    /// Filter keeping only `names`.
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the filter selects everything.
    pub fn is_all(&self) -> bool {
        self.names.is_empty()
    }

    /// Whether `name` is selected.
    pub fn selects(&self, name: &str) -> bool {
        self.is_all() || self.names.contains(name)
    }

    /// Requested names that match no scenario in `suites`.
    pub fn unknown(&self, suites: &[SuiteSpec]) -> Vec<String> {
        let known = scenario_names(suites);
        self.names
            .iter()
            .filter(|n| !known.contains(&n.as_str()))
            .cloned()
            .collect()
    }

    /// `suites` narrowed to the selected scenarios; suites left empty are
    /// dropped, setups are kept.
    pub fn apply(&self, suites: Vec<SuiteSpec>) -> Vec<SuiteSpec> {
        suites
            .into_iter()
            .filter_map(|mut suite| {
                suite.scenarios.retain(|s| self.selects(s.name));
                (!suite.scenarios.is_empty()).then_some(suite)
            })
            .collect()
    }
}
