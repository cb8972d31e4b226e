//! Check command - probe source availability for a month.

use anyhow::Result;
use chrono::Utc;
use clap::Args;
use owo_colors::OwoColorize;
use velo_flow::orchestrator::PipelineSources;
use velo_flow::source::Availability;

use crate::{Config, OutputFormat, PartitionArgs};

/// Arguments for the check command.
#[derive(Debug, Args)]
pub struct CheckArgs {
    /// Month to check.
    #[command(flatten)]
    pub partition: PartitionArgs,
}

/// Execute the check command.
///
/// # Errors
///
/// Returns an error if a probe fails or any source has not published the
/// month.
pub async fn execute(args: CheckArgs, config: &Config) -> Result<()> {
    let partition = args.partition.resolve(Utc::now())?;
    let sources = PipelineSources::http(&config.pipeline)?;
    let report = sources.check(partition).await?;

    match config.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "partition": partition.to_string(),
                    "sources": report,
                }))?
            );
        }
        OutputFormat::Text | OutputFormat::Table => {
            println!("Availability for {partition}:");
            for entry in &report {
                match &entry.availability {
                    Availability::Ready => {
                        println!("  {:<12} {}", entry.source, "READY".green());
                    }
                    Availability::NotReady { reason } => {
                        println!("  {:<12} {} ({reason})", entry.source, "NOT_READY".yellow());
                    }
                }
            }
        }
    }

    if report.iter().all(|e| e.availability.is_ready()) {
        Ok(())
    } else {
        anyhow::bail!("Sources are not ready for {partition}")
    }
}
