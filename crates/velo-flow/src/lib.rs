//! # velo-flow
//!
//! Monthly incremental load and transformation pipeline for Citi Bike trips
//! and hourly weather.
//!
//! This crate implements the pipeline domain, providing:
//!
//! - **Source adapters**: Typed, lazily streamed records from the trip archive
//!   and the weather archive, with side-effect-free availability probes
//! - **Partition reloads**: Idempotent delete-then-insert of one month into a
//!   raw warehouse table
//! - **Model DAG**: Layered views, ephemeral models and tables, compiled from a
//!   manifest and executed in dependency order with bounded parallelism
//! - **Quality gate**: Uniqueness, not-null and accepted-values assertions that
//!   are all evaluated before the gate decides
//! - **Orchestration**: A per-run state machine with partition locking, step
//!   timeouts, cancellation and an append-only run ledger
//!
//! ## Guarantees
//!
//! - **Idempotent**: Re-running a month leaves exactly one copy of its records
//! - **Fail-fast graphs**: A cyclic model graph is rejected before any
//!   statement reaches the warehouse
//! - **Auditable**: Every terminal run is recorded with its step history and
//!   failure detail
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tokio_util::sync::CancellationToken;
//! use velo_core::PartitionKey;
//! use velo_flow::prelude::*;
//!
//! # async fn example() -> velo_flow::error::Result<()> {
//! let config = PipelineConfig::from_env()?;
//! let sources = PipelineSources::http(&config)?;
//! let warehouse = Arc::new(InMemoryWarehouse::new().with_chunk_rows(config.insert_chunk_rows));
//! let manifest = Manifest::from_path("manifests/citibike.json".as_ref()).await?;
//!
//! let orchestrator = Orchestrator::new(config, sources, warehouse, manifest)?;
//! let run = orchestrator
//!     .run(PartitionKey::new(2025, 1)?, RunOptions::default(), &CancellationToken::new())
//!     .await?;
//! println!("{} {}", run.id(), run.step());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

// Internal modules - not exposed in public API.
pub(crate) mod dag;

pub mod compile;
pub mod config;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod quality;
pub mod record;
pub mod reload;
pub mod row;
pub mod run;
pub mod source;
pub mod warehouse;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::compile::{CompileContext, CompiledGraph, compile};
    pub use crate::config::PipelineConfig;
    pub use crate::error::{Disposition, Error, Result};
    pub use crate::executor::{DagExecutor, DagRunReport, NodeStatus};
    pub use crate::ledger::{FileRunLedger, InMemoryRunLedger, RunLedger};
    pub use crate::metrics::PipelineMetrics;
    pub use crate::model::{Layer, Manifest, Materialization, ModelNode};
    pub use crate::orchestrator::{Orchestrator, PipelineSources, RunOptions};
    pub use crate::quality::{GateReport, QualityAssertion, QualityGate};
    pub use crate::record::{TripRecord, WeatherObservation};
    pub use crate::reload::{PartitionReloadManager, ReloadOutcome};
    pub use crate::run::{PipelineRun, PipelineStep, RunTrigger};
    pub use crate::source::{Availability, RecordSource};
    pub use crate::warehouse::{Dataset, InMemoryWarehouse, TableRef, Warehouse};
}
