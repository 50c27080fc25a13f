// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tracing subscriber setup.

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Filter directive for the harness targets: `--debug` wins, then the
/// configured level, then `info`.
pub fn directive(debug: bool, level: Option<&str>) -> String {
    let level = if debug { "debug" } else { level.unwrap_or("info") };
    format!("afh={level}")
}

/// Install the global subscriber on stderr. `RUST_LOG` replaces the
/// computed directive when set.
pub fn init(debug: bool, level: Option<&str>, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directive(debug, level)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(e) = result {
        eprintln!("warning: logging already initialised: {e}");
    }
}
