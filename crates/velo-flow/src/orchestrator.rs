//! Monthly pipeline orchestration.
//!
//! The orchestrator drives one [`PipelineRun`] per invocation:
//!
//! 1. take the partition's advisory lock (a held lock aborts before the run starts)
//! 2. compile the models and probe both sources; a missing month ends the run
//!    with a benign failure
//! 3. fetch and reload trips, then weather
//! 4. run the model DAG and the quality gate, unless transformations are skipped
//! 5. append the terminal run to the ledger and release the lock
//!
//! The lock is renewed in the background for the whole run and confirmed
//! before every step that writes to the warehouse. If another run takes it
//! over, this run stops with [`Error::LockLost`].
//!
//! Steps advance only on success. There is no retry between steps; a failed
//! run is retried by invoking the whole run again, which is safe because
//! every reload replaces its partition.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use velo_core::{LockAttempt, LockInfo, PartitionKey, PartitionLock, pipeline_span};

use crate::compile::{CompileContext, compile};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::executor::DagExecutor;
use crate::ledger::{InMemoryRunLedger, RunLedger};
use crate::metrics::{PipelineMetrics, time_step};
use crate::model::Manifest;
use crate::quality::QualityGate;
use crate::reload::PartitionReloadManager;
use crate::run::{PipelineRun, PipelineStep, RunTrigger};
use crate::source::{
    Availability, CitiBikeTripSource, DynTripSource, DynWeatherSource, OpenMeteoWeatherSource,
};
use crate::warehouse::{TableRef, Warehouse};

/// Source name raw trips are registered under for `{{ source('trips') }}`.
pub const TRIPS_SOURCE: &str = "trips";
/// Source name raw weather is registered under for `{{ source('weather') }}`.
pub const WEATHER_SOURCE: &str = "weather";

const LOCK_OPERATION: &str = "pipeline_run";
const MIN_LOCK_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// Trip and weather sources used by a run.
#[derive(Clone)]
pub struct PipelineSources {
    /// Trip archive.
    pub trips: DynTripSource,
    /// Hourly weather.
    pub weather: DynWeatherSource,
}

impl std::fmt::Debug for PipelineSources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineSources")
            .field("trips", &self.trips.name())
            .field("weather", &self.weather.name())
            .finish()
    }
}

impl PipelineSources {
    /// Probes trips, then weather, for `partition`. Side-effect free.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Source`] if a probe fails.
    pub async fn check(&self, partition: PartitionKey) -> Result<Vec<SourceAvailability>> {
        let trips = self.trips.check_availability(partition).await?;
        let weather = self.weather.check_availability(partition).await?;
        Ok(vec![
            SourceAvailability {
                source: self.trips.name().to_string(),
                availability: trips,
            },
            SourceAvailability {
                source: self.weather.name().to_string(),
                availability: weather,
            },
        ])
    }

    /// Builds the public HTTP sources described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if an HTTP client cannot be built.
    pub fn http(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            trips: Arc::new(CitiBikeTripSource::new(
                config.tripdata_base_url.clone(),
                config.http_timeout,
            )?),
            weather: Arc::new(OpenMeteoWeatherSource::new(
                config.weather.clone(),
                config.http_timeout,
            )?),
        })
    }
}

/// Availability of one source for a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAvailability {
    /// Source name.
    pub source: String,
    /// Probe result.
    #[serde(flatten)]
    pub availability: Availability,
}

/// Per-invocation options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// What started the run.
    pub trigger: RunTrigger,
    /// End the run after the weather reload.
    pub skip_transform: bool,
}

/// Runs the monthly load and transformation pipeline.
pub struct Orchestrator {
    config: PipelineConfig,
    sources: PipelineSources,
    manifest: Arc<Manifest>,
    lock: Arc<dyn PartitionLock>,
    ledger: Arc<dyn RunLedger>,
    reload: PartitionReloadManager,
    executor: DagExecutor,
    gate: QualityGate,
    trips_table: TableRef,
    weather_table: TableRef,
    metrics: PipelineMetrics,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("dataset", &self.config.dataset)
            .field("sources", &self.sources)
            .field("models", &self.manifest.models.len())
            .field("assertions", &self.manifest.assertions.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator with a process-local lock and ledger.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the manifest is invalid, and
    /// [`Error::CyclicGraph`] if its models do not form a DAG.
    pub fn new(
        config: PipelineConfig,
        sources: PipelineSources,
        warehouse: Arc<dyn Warehouse>,
        manifest: Manifest,
    ) -> Result<Self> {
        manifest.validate()?;
        // Templates resolve the same way for every month.
        let sample = PartitionKey::new(2000, 1)?;
        compile(&manifest.models, &compile_context(&config, sample))?;
        Ok(Self {
            reload: PartitionReloadManager::new(Arc::clone(&warehouse)),
            executor: DagExecutor::new(Arc::clone(&warehouse))
                .with_max_concurrency(config.max_concurrency),
            gate: QualityGate::new(warehouse, config.dataset.clone(), config.max_concurrency),
            trips_table: config.trips_table_ref(),
            weather_table: config.weather_table_ref(),
            lock: Arc::new(velo_core::InMemoryPartitionLock::new()),
            ledger: Arc::new(InMemoryRunLedger::new()),
            manifest: Arc::new(manifest),
            metrics: PipelineMetrics::new(),
            sources,
            config,
        })
    }

    /// Uses `lock` for partition exclusion.
    #[must_use]
    pub fn with_lock(mut self, lock: Arc<dyn PartitionLock>) -> Self {
        self.lock = lock;
        self
    }

    /// Records terminal runs in `ledger`.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn RunLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    /// Returns the run ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn RunLedger> {
        &self.ledger
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Probes both sources for `partition` without side effects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Source`] if a probe fails.
    pub async fn check(&self, partition: PartitionKey) -> Result<Vec<SourceAvailability>> {
        self.sources.check(partition).await
    }

    /// Runs the pipeline for `partition`.
    ///
    /// Step failures do not surface as errors: they end the returned run in
    /// [`PipelineStep::Failed`] with the failure recorded on it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PartitionLocked`] without starting a run if another
    /// run holds the partition, and [`Error::Ledger`] if the terminal run
    /// cannot be recorded.
    pub async fn run(
        &self,
        partition: PartitionKey,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> Result<PipelineRun> {
        let mut run = PipelineRun::new(partition, options.trigger);
        let span = pipeline_span("run", &partition.to_string(), &run.id().to_string());
        async {
            let holder = run.id().to_string();
            let lock = match self
                .lock
                .try_acquire(partition, &holder, LOCK_OPERATION, self.config.lock_ttl)
                .await?
            {
                LockAttempt::Acquired(info) => info,
                LockAttempt::Held(info) => {
                    tracing::warn!(holder = %info.holder_id, "partition locked, run not started");
                    return Err(Error::PartitionLocked {
                        partition,
                        holder: info.holder_id,
                    });
                }
            };

            tracing::info!(trigger = %options.trigger, skip_transform = options.skip_transform, "run started");
            let outcome = tokio::select! {
                biased;
                result = self.drive(&mut run, options, &lock, cancel) => result,
                lost = self.hold_lock(lock.clone()) => Err(lost),
            };
            if let Err(e) = outcome {
                if run.is_terminal() {
                    tracing::error!(error = %e, "error after run completed");
                } else {
                    run.fail(&e)?;
                    if e.disposition() == crate::error::Disposition::Benign {
                        tracing::info!(reason = %e, "partition not ready");
                    } else {
                        tracing::error!(
                            error = %e,
                            kind = e.kind(),
                            disposition = %e.disposition(),
                            "run failed"
                        );
                    }
                }
            }

            let last_step = run
                .failure()
                .map_or(run.step(), |failure| failure.step);
            let status = if run.succeeded() { "succeeded" } else { "failed" };
            self.metrics.record_run(status, last_step.as_str());
            tracing::info!(
                status,
                step = %last_step,
                duration_ms = run.duration().map_or(0, |d| d.num_milliseconds()),
                "run finished"
            );

            let recorded = self.ledger.append(&run).await;
            if let Err(e) = self.lock.release(&lock).await {
                tracing::warn!(error = %e, "failed to release partition lock");
            }
            recorded?;
            Ok(run)
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        run: &mut PipelineRun,
        options: RunOptions,
        lock: &LockInfo,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let partition = run.partition();
        let graph = compile(&self.manifest.models, &compile_context(&self.config, partition))?;

        self.step(run.step(), cancel, self.require_available(partition))
            .await?;

        advance(run, PipelineStep::FetchingTrips)?;
        let trips = self
            .step(run.step(), cancel, self.sources.trips.fetch(partition))
            .await?;

        advance(run, PipelineStep::LoadingTrips)?;
        self.confirm_lock(lock).await?;
        let outcome = self
            .step(
                run.step(),
                cancel,
                self.reload.reload(&self.trips_table, partition, trips, cancel),
            )
            .await?;
        run.summary_mut().trips = Some(outcome);

        advance(run, PipelineStep::FetchingWeather)?;
        let weather = self
            .step(run.step(), cancel, self.sources.weather.fetch(partition))
            .await?;

        advance(run, PipelineStep::LoadingWeather)?;
        self.confirm_lock(lock).await?;
        let outcome = self
            .step(
                run.step(),
                cancel,
                self.reload
                    .reload(&self.weather_table, partition, weather, cancel),
            )
            .await?;
        run.summary_mut().weather = Some(outcome);

        if options.skip_transform {
            tracing::info!("transformations skipped");
            return advance(run, PipelineStep::Succeeded);
        }

        advance(run, PipelineStep::Transforming)?;
        self.confirm_lock(lock).await?;
        let report = self
            .step(
                run.step(),
                cancel,
                self.executor.run_compiled(&graph, cancel),
            )
            .await?;
        run.summary_mut().transformations = Some(report.clone());
        report.into_result()?;

        advance(run, PipelineStep::QualityGating)?;
        let gate = self
            .step(
                run.step(),
                cancel,
                self.gate.evaluate(&self.manifest.assertions, cancel),
            )
            .await?;
        run.summary_mut().quality = Some(gate.clone());
        gate.into_result()?;

        advance(run, PipelineStep::Succeeded)
    }

    /// Fails unless this run still owns `lock`, extending it on success.
    async fn confirm_lock(&self, lock: &LockInfo) -> Result<()> {
        match self.lock.renew(lock, self.config.lock_ttl).await? {
            Some(_) => Ok(()),
            None => Err(lock_lost(lock)),
        }
    }

    /// Renews `lock` at a third of its TTL. Resolves only once it is lost.
    async fn hold_lock(&self, mut lock: LockInfo) -> Error {
        let interval = (self.config.lock_ttl / 3).max(MIN_LOCK_RENEW_INTERVAL);
        loop {
            tokio::time::sleep(interval).await;
            match self.lock.renew(&lock, self.config.lock_ttl).await {
                Ok(Some(renewed)) => lock = renewed,
                Ok(None) => return lock_lost(&lock),
                Err(e) => tracing::warn!(error = %e, "failed to renew partition lock"),
            }
        }
    }

    async fn require_available(&self, partition: PartitionKey) -> Result<()> {
        for probe in self.check(partition).await? {
            if let Availability::NotReady { reason } = probe.availability {
                return Err(Error::SourceUnavailable {
                    source_name: probe.source,
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Runs `work` under the step timeout and the run's cancellation token.
    async fn step<T, F>(&self, step: PipelineStep, cancel: &CancellationToken, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _timer = time_step(&self.metrics, step.as_str());
        let timeout: Duration = self.config.step_timeout;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled { step: step.to_string() }),
            result = tokio::time::timeout(timeout, work) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::TimedOut { step: step.to_string(), timeout }),
            },
        }
    }
}

fn compile_context(config: &PipelineConfig, partition: PartitionKey) -> CompileContext {
    CompileContext::new(config.dataset.clone(), partition)
        .with_source(TRIPS_SOURCE, config.trips_table_ref().relation)
        .with_source(WEATHER_SOURCE, config.weather_table_ref().relation)
}

fn lock_lost(lock: &LockInfo) -> Error {
    tracing::error!(holder = %lock.holder_id, "partition lock taken over by another run");
    Error::LockLost {
        partition: lock.partition,
        holder: lock.holder_id.clone(),
    }
}

fn advance(run: &mut PipelineRun, target: PipelineStep) -> Result<()> {
    run.transition_to(target)?;
    tracing::info!(step = %target, "step entered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Layer, Materialization, ModelNode};
    use crate::record::{TripRecord, WeatherObservation};
    use crate::source::{StaticTripSource, StaticWeatherSource};
    use crate::warehouse::InMemoryWarehouse;

    fn jan() -> PartitionKey {
        PartitionKey::new(2025, 1).unwrap()
    }

    fn orchestrator(
        trips: Vec<TripRecord>,
        weather: Vec<WeatherObservation>,
        warehouse: Arc<InMemoryWarehouse>,
    ) -> Orchestrator {
        let sources = PipelineSources {
            trips: Arc::new(StaticTripSource::new("citibike").with_partition(jan(), trips)),
            weather: Arc::new(StaticWeatherSource::new("open-meteo").with_partition(jan(), weather)),
        };
        Orchestrator::new(
            PipelineConfig::default(),
            sources,
            warehouse,
            Manifest::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn missing_month_fails_benignly_without_writes() {
        let warehouse = Arc::new(InMemoryWarehouse::new());
        let orch = orchestrator(Vec::new(), Vec::new(), Arc::clone(&warehouse));
        let june = PartitionKey::new(2025, 6).unwrap();

        let run = orch
            .run(june, RunOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.step(), PipelineStep::Failed);
        assert!(run.is_benign_failure());
        let failure = run.failure().unwrap();
        assert_eq!(failure.step, PipelineStep::CheckingAvailability);
        assert_eq!(failure.kind, "SOURCE_UNAVAILABLE");
        assert_eq!(run.history().len(), 2);
        assert!(warehouse.operations().unwrap().iter().all(|op| !op.is_write()));
        assert_eq!(orch.ledger().latest(june).await.unwrap(), Some(run));
    }

    #[tokio::test]
    async fn skip_transform_succeeds_after_weather() {
        let warehouse = Arc::new(InMemoryWarehouse::new());
        let orch = orchestrator(Vec::new(), Vec::new(), Arc::clone(&warehouse));
        let options = RunOptions {
            skip_transform: true,
            ..RunOptions::default()
        };

        let run = orch
            .run(jan(), options, &CancellationToken::new())
            .await
            .unwrap();

        assert!(run.succeeded(), "{:?}", run.failure());
        assert!(run.summary().transformations.is_none());
        assert_eq!(
            run.history().last().map(|e| e.step),
            Some(PipelineStep::Succeeded)
        );
    }

    #[tokio::test]
    async fn held_lock_prevents_run() {
        let warehouse = Arc::new(InMemoryWarehouse::new());
        let lock = Arc::new(velo_core::InMemoryPartitionLock::new());
        lock.try_acquire(jan(), "other-run", LOCK_OPERATION, Duration::from_secs(60))
            .await
            .unwrap();
        let orch = orchestrator(Vec::new(), Vec::new(), warehouse).with_lock(lock);

        let err = orch
            .run(jan(), RunOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PartitionLocked { holder, .. } if holder == "other-run"));
        assert!(orch.ledger().latest(jan()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelled_run_is_recorded_as_failed() {
        let warehouse = Arc::new(InMemoryWarehouse::new());
        let orch = orchestrator(Vec::new(), Vec::new(), warehouse);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = orch.run(jan(), RunOptions::default(), &cancel).await.unwrap();

        assert_eq!(run.step(), PipelineStep::Failed);
        assert_eq!(run.failure().unwrap().kind, "CANCELLED");
    }

    #[tokio::test]
    async fn lock_is_released_after_run() {
        let warehouse = Arc::new(InMemoryWarehouse::new());
        let lock = Arc::new(velo_core::InMemoryPartitionLock::new());
        let orch = orchestrator(Vec::new(), Vec::new(), warehouse)
            .with_lock(Arc::clone(&lock) as Arc<dyn PartitionLock>);

        orch.run(jan(), RunOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(lock.inspect(jan()).await.unwrap().is_none());
    }

    #[test]
    fn cyclic_models_are_rejected_before_any_run() {
        let model = |name: &str, upstream: &str| {
            ModelNode::new(name, Layer::Marts, Materialization::Table, "SELECT 1")
                .depends_on(&[upstream])
        };
        let manifest = Manifest {
            models: vec![model("a", "b"), model("b", "a")],
            assertions: Vec::new(),
        };
        let sources = PipelineSources {
            trips: Arc::new(StaticTripSource::new("citibike")),
            weather: Arc::new(StaticWeatherSource::new("open-meteo")),
        };

        let err = Orchestrator::new(
            PipelineConfig::default(),
            sources,
            Arc::new(InMemoryWarehouse::new()),
            manifest,
        )
        .unwrap_err();

        assert!(matches!(err, Error::CyclicGraph { .. }), "{err}");
    }

    #[test]
    fn dangling_dependency_is_rejected_before_any_run() {
        let manifest = Manifest {
            models: vec![
                ModelNode::new("fct", Layer::Marts, Materialization::Table, "SELECT 1")
                    .depends_on(&["stg_missing"]),
            ],
            assertions: Vec::new(),
        };
        let sources = PipelineSources {
            trips: Arc::new(StaticTripSource::new("citibike")),
            weather: Arc::new(StaticWeatherSource::new("open-meteo")),
        };

        let err = Orchestrator::new(
            PipelineConfig::default(),
            sources,
            Arc::new(InMemoryWarehouse::new()),
            manifest,
        )
        .unwrap_err();

        assert_eq!(err.kind(), "CONFIGURATION_ERROR");
    }
}
