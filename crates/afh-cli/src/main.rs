// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use afh_cli::commands;
use afh_cli::logging::{self, LogFormat};
use afh_config::{ConfigOverlay, DriverKind};
use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "afh", version, about = "Auth flow harness CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,

    /// Log line format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List scenarios with their kind and suite.
    Scenarios,

    /// Provision credentials and run the scenarios.
    Run {
        /// TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Only run this scenario. Can be repeated.
        #[arg(long = "scenario")]
        scenarios: Vec<String>,

        /// Browser backend, overriding the configuration.
        #[arg(long, value_enum)]
        driver: Option<DriverArg>,

        /// Print the report as JSON instead of a summary.
        #[arg(long)]
        json: bool,

        /// Also write the JSON report to this path.
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Configuration helpers.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Validate a configuration and print its warnings.
    Check {
        /// TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the JSON schema of the configuration.
    Schema,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DriverArg {
    Webdriver,
    Mock,
}

impl From<DriverArg> for DriverKind {
    fn from(v: DriverArg) -> Self {
        match v {
            DriverArg::Webdriver => DriverKind::Webdriver,
            DriverArg::Mock => DriverKind::Mock,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Scenarios => {
            logging::init(cli.debug, None, cli.log_format);
            print!("{}", commands::scenario_listing());
            Ok(())
        }
        Commands::Config { action } => {
            logging::init(cli.debug, None, cli.log_format);
            match action {
                ConfigAction::Check { config } => cmd_config_check(config),
                ConfigAction::Schema => {
                    println!("{}", commands::config_schema()?);
                    Ok(())
                }
            }
        }
        Commands::Run {
            config,
            scenarios,
            driver,
            json,
            report,
        } => cmd_run(cli.debug, cli.log_format, config, scenarios, driver, json, report).await,
    }
}

fn cmd_config_check(config: Option<PathBuf>) -> Result<()> {
    let (_, warnings) = commands::load_effective(config.as_deref(), ConfigOverlay::default())?;
    for w in &warnings {
        println!("warning: {w}");
    }
    println!("config ok ({} warning(s))", warnings.len());
    Ok(())
}

async fn cmd_run(
    debug: bool,
    log_format: LogFormat,
    config: Option<PathBuf>,
    scenarios: Vec<String>,
    driver: Option<DriverArg>,
    json: bool,
    report_path: Option<PathBuf>,
) -> Result<()> {
    let overlay = ConfigOverlay {
        driver: driver.map(Into::into),
        report_path,
        ..ConfigOverlay::default()
    };
    let (config, warnings) = commands::load_effective(config.as_deref(), overlay)?;
    logging::init(debug, config.log_level.as_deref(), log_format);
    for w in &warnings {
        tracing::warn!(target: "afh.runner", "{w}");
    }

    let report_path = config.run.report_path.clone();
    let report = commands::run(config, scenarios, report_path.as_deref()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_summary());
    }

    let summary = report.summary();
    if summary.failed > 0 || summary.skipped > 0 {
        anyhow::bail!(
            "{} scenario(s) failed, {} skipped",
            summary.failed,
            summary.skipped
        );
    }
    Ok(())
}
