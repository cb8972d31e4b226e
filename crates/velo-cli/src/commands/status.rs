//! Status command - show recorded runs for a month.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use velo_flow::ledger::{FileRunLedger, RunLedger};
use velo_flow::run::PipelineRun;

use crate::{Config, OutputFormat, PartitionArgs};

/// Arguments for the status command.
#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Month to show.
    #[command(flatten)]
    pub partition: PartitionArgs,

    /// List every recorded run instead of the latest.
    #[arg(long, short = 'a')]
    pub all: bool,
}

/// Execute the status command.
///
/// # Errors
///
/// Returns an error if the run ledger cannot be read.
pub async fn execute(args: StatusArgs, config: &Config) -> Result<()> {
    let partition = args.partition.resolve(Utc::now())?;
    let ledger = FileRunLedger::new(config.pipeline.ledger_dir.clone());

    if args.all {
        let runs = ledger
            .list(partition)
            .await
            .with_context(|| format!("Failed to read runs from {}", ledger.dir().display()))?;
        return list_runs(&runs, &config.format);
    }

    let latest = ledger
        .latest(partition)
        .await
        .with_context(|| format!("Failed to read runs from {}", ledger.dir().display()))?;
    match latest {
        Some(run) => super::print_run(&run, &config.format),
        None if matches!(config.format, OutputFormat::Json) => {
            println!("null");
            Ok(())
        }
        None => {
            println!("No runs recorded for {partition}");
            Ok(())
        }
    }
}

fn list_runs(runs: &[PipelineRun], format: &OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(runs)?),
        OutputFormat::Text => {
            if runs.is_empty() {
                println!("No runs found");
                return Ok(());
            }
            for run in runs {
                let failure = run
                    .failure()
                    .map_or(String::new(), |f| format!(" at {} ({})", f.step, f.kind));
                println!(
                    "  {} {} {}{failure}",
                    run.id(),
                    run.started_at().format("%Y-%m-%d %H:%M:%S"),
                    run.step()
                );
            }
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct RunRow {
                #[tabled(rename = "Run ID")]
                run_id: String,
                #[tabled(rename = "Trigger")]
                trigger: String,
                #[tabled(rename = "Step")]
                step: String,
                #[tabled(rename = "Started")]
                started: String,
                #[tabled(rename = "Failure")]
                failure: String,
            }

            let rows: Vec<_> = runs
                .iter()
                .map(|r| RunRow {
                    run_id: r.id().to_string(),
                    trigger: r.trigger().to_string(),
                    step: r.step().to_string(),
                    started: r.started_at().format("%Y-%m-%d %H:%M:%S").to_string(),
                    failure: r.failure().map_or(String::new(), |f| f.kind.clone()),
                })
                .collect();

            if rows.is_empty() {
                println!("No runs found");
            } else {
                println!("{}", Table::new(rows));
            }
        }
    }
    Ok(())
}
