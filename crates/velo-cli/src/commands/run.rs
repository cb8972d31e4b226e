//! Run command - load, transform and gate one month.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use tokio_util::sync::CancellationToken;
use velo_core::FilePartitionLock;
use velo_flow::config::PipelineConfig;
use velo_flow::ledger::FileRunLedger;
use velo_flow::model::Manifest;
use velo_flow::orchestrator::{Orchestrator, PipelineSources, RunOptions};
use velo_flow::run::RunTrigger;
use velo_flow::warehouse::{InMemoryWarehouse, Warehouse};

use crate::{Config, PartitionArgs};

/// Arguments for the run command.
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Month to process.
    #[command(flatten)]
    pub partition: PartitionArgs,

    /// Stop after loading raw tables.
    #[arg(long)]
    pub skip_transform: bool,

    /// Model manifest to compile.
    #[arg(long, env = "VELO_MANIFEST", default_value = "manifests/citibike.json")]
    pub manifest: PathBuf,

    /// What started this run (manual or scheduled).
    #[arg(long, default_value = "manual")]
    pub trigger: RunTrigger,

    /// Load into an in-memory warehouse instead of BigQuery.
    #[arg(long)]
    pub dry_run: bool,
}

/// Execute the run command.
///
/// # Errors
///
/// Returns an error if setup fails, the partition is locked, or the run
/// ends `FAILED` (including a month that is not published yet).
pub async fn execute(args: RunArgs, config: &Config) -> Result<()> {
    let partition = args.partition.resolve(Utc::now())?;
    let pipeline = config.pipeline.clone();

    let manifest = Manifest::from_path(&args.manifest)
        .await
        .with_context(|| format!("Failed to load manifest {}", args.manifest.display()))?;
    let sources = PipelineSources::http(&pipeline)?;

    let mut options = RunOptions {
        trigger: args.trigger,
        skip_transform: args.skip_transform,
    };
    let warehouse: Arc<dyn Warehouse> = if args.dry_run {
        // Models have no evaluators in a bare in-memory warehouse.
        options.skip_transform = true;
        Arc::new(InMemoryWarehouse::new().with_chunk_rows(pipeline.insert_chunk_rows))
    } else {
        connect_warehouse(&pipeline).await?
    };

    let orchestrator = Orchestrator::new(pipeline.clone(), sources, warehouse, manifest)?
        .with_lock(Arc::new(FilePartitionLock::new(pipeline.lock_dir.clone())))
        .with_ledger(Arc::new(FileRunLedger::new(pipeline.ledger_dir.clone())));

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        })
    };
    let result = orchestrator.run(partition, options, &cancel).await;
    interrupt.abort();
    let run = result.with_context(|| format!("Run for {partition} did not start"))?;

    super::print_run(&run, &config.format)?;

    if run.succeeded() {
        return Ok(());
    }
    let reason = run
        .failure()
        .map_or_else(|| "unknown failure".to_string(), |f| f.message.clone());
    if run.is_benign_failure() {
        anyhow::bail!("{partition} is not ready yet: {reason}")
    }
    anyhow::bail!("Run {} for {partition} failed: {reason}", run.id())
}

#[cfg(feature = "gcp")]
async fn connect_warehouse(pipeline: &PipelineConfig) -> Result<Arc<dyn Warehouse>> {
    use velo_flow::warehouse::bigquery::{BigQueryConfig, BigQueryWarehouse};

    let mut bq = BigQueryConfig::new(pipeline.dataset.project.clone());
    bq.insert_chunk_rows = pipeline.insert_chunk_rows;
    let warehouse = BigQueryWarehouse::new(bq)
        .await
        .context("Failed to connect to BigQuery")?;
    Ok(Arc::new(warehouse))
}

#[cfg(not(feature = "gcp"))]
#[allow(clippy::unused_async)]
async fn connect_warehouse(_pipeline: &PipelineConfig) -> Result<Arc<dyn Warehouse>> {
    anyhow::bail!("velo was built without BigQuery support; rebuild with --features gcp or pass --dry-run")
}
