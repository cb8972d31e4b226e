//! # velo-cli
//!
//! Command-line interface for the velo monthly pipeline.
//!
//! ## Commands
//!
//! - `velo run` - Load, transform and gate one month
//! - `velo check` - Check whether both sources have published a month
//! - `velo status` - Show the latest recorded run for a month
//!
//! ## Configuration
//!
//! Pipeline settings come from `VELO_*` environment variables (see
//! [`velo_flow::config::PipelineConfig`]). Without `--year`/`--month` the
//! previous calendar month is processed.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]
#![allow(clippy::print_stderr)]

pub mod commands;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use velo_core::{LogFormat, PartitionKey};
use velo_flow::config::PipelineConfig;

/// velo - monthly Citi Bike load and transformation pipeline.
#[derive(Debug, Parser)]
#[command(name = "velo")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Log format (pretty or json).
    #[arg(long, global = true, env = "VELO_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Get the effective configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a `VELO_*` variable holds an invalid value.
    pub fn config(&self) -> Result<Config> {
        Ok(Config {
            pipeline: PipelineConfig::from_env().context("Invalid VELO_* configuration")?,
            format: self.format.clone(),
        })
    }
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the pipeline for one month.
    Run(commands::run::RunArgs),
    /// Check source availability without side effects.
    Check(commands::check::CheckArgs),
    /// Show the latest recorded run for a month.
    Status(commands::status::StatusArgs),
}

/// Output format.
#[derive(Debug, Clone, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output.
    Json,
    /// Table output.
    Table,
}

/// CLI configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pipeline settings.
    pub pipeline: PipelineConfig,
    /// Output format.
    pub format: OutputFormat,
}

/// Month selection shared by all subcommands.
#[derive(Debug, Clone, Default, Args)]
pub struct PartitionArgs {
    /// Year to process (requires --month).
    #[arg(long, requires = "month")]
    pub year: Option<i32>,

    /// Month to process, 1-12 (requires --year).
    #[arg(long, requires = "year", value_parser = clap::value_parser!(u32).range(1..=12))]
    pub month: Option<u32>,
}

impl PartitionArgs {
    /// Resolves the month, defaulting to the one before `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if only one of year and month is given or the pair
    /// is not a valid month.
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<PartitionKey> {
        match (self.year, self.month) {
            (Some(year), Some(month)) => PartitionKey::new(year, month)
                .with_context(|| format!("Invalid month {year}-{month}")),
            (None, None) => PartitionKey::previous_month_at(now).context("No month precedes today"),
            _ => anyhow::bail!("--year and --month must be given together"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "velo",
            "--format",
            "json",
            "--log-format",
            "json",
            "run",
            "--year",
            "2025",
            "--month",
            "1",
            "--skip-transform",
        ]);

        assert!(matches!(cli.format, OutputFormat::Json));
        assert_eq!(cli.log_format, LogFormat::Json);
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert!(args.skip_transform);
        assert_eq!(
            args.partition.resolve(Utc::now()).unwrap(),
            PartitionKey::new(2025, 1).unwrap()
        );
    }

    #[test]
    fn test_partition_defaults_to_previous_month() {
        let now = Utc.with_ymd_and_hms(2025, 3, 2, 4, 0, 0).unwrap();
        let key = PartitionArgs::default().resolve(now).unwrap();
        assert_eq!(key, PartitionKey::new(2025, 2).unwrap());
    }

    #[test]
    fn test_year_and_month_go_together() {
        assert!(Cli::try_parse_from(["velo", "check", "--year", "2025"]).is_err());
        assert!(Cli::try_parse_from(["velo", "check", "--year", "2025", "--month", "13"]).is_err());
        let lone = PartitionArgs {
            year: None,
            month: Some(4),
        };
        assert!(lone.resolve(Utc::now()).is_err());
    }
}
