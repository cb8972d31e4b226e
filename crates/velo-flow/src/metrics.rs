//! Pipeline metrics.
//!
//! Metrics go through the `metrics` crate facade; without an installed
//! recorder every call is a no-op.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `velo_runs_total` | Counter | `status`, `step` | Terminal runs by outcome and last step |
//! | `velo_step_duration_seconds` | Histogram | `step` | Time spent per pipeline step |
//! | `velo_rows_deleted_total` | Counter | `table` | Rows removed by partition reloads |
//! | `velo_rows_inserted_total` | Counter | `table` | Rows inserted by partition reloads |
//! | `velo_rows_skipped_total` | Counter | `table` | Records outside their partition |
//! | `velo_model_duration_seconds` | Histogram | `materialization`, `status` | Model execution time |
//! | `velo_assertions_total` | Counter | `result` | Quality assertions by result |

use std::time::{Duration, Instant};

use metrics::{counter, histogram};

/// Metric names.
pub mod names {
    /// Counter: terminal runs.
    pub const RUNS_TOTAL: &str = "velo_runs_total";
    /// Histogram: step duration in seconds.
    pub const STEP_DURATION_SECONDS: &str = "velo_step_duration_seconds";
    /// Counter: rows deleted by reloads.
    pub const ROWS_DELETED_TOTAL: &str = "velo_rows_deleted_total";
    /// Counter: rows inserted by reloads.
    pub const ROWS_INSERTED_TOTAL: &str = "velo_rows_inserted_total";
    /// Counter: records skipped by reloads.
    pub const ROWS_SKIPPED_TOTAL: &str = "velo_rows_skipped_total";
    /// Histogram: model execution duration in seconds.
    pub const MODEL_DURATION_SECONDS: &str = "velo_model_duration_seconds";
    /// Counter: evaluated assertions.
    pub const ASSERTIONS_TOTAL: &str = "velo_assertions_total";
}

/// Label keys.
pub mod labels {
    /// Terminal status (succeeded, failed).
    pub const STATUS: &str = "status";
    /// Pipeline step.
    pub const STEP: &str = "step";
    /// Raw table relation.
    pub const TABLE: &str = "table";
    /// Model materialization (view, ephemeral, table).
    pub const MATERIALIZATION: &str = "materialization";
    /// Assertion result (passed, failed).
    pub const RESULT: &str = "result";
}

/// Records pipeline metrics. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics;

impl PipelineMetrics {
    /// Creates a recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Counts a terminal run.
    pub fn record_run(&self, status: &str, step: &str) {
        counter!(
            names::RUNS_TOTAL,
            labels::STATUS => status.to_string(),
            labels::STEP => step.to_string(),
        )
        .increment(1);
    }

    /// Records time spent in a step.
    pub fn observe_step_duration(&self, step: &str, duration: Duration) {
        histogram!(
            names::STEP_DURATION_SECONDS,
            labels::STEP => step.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Counts the rows touched by one partition reload.
    pub fn record_reload(&self, table: &str, deleted: u64, inserted: u64, skipped: u64) {
        counter!(names::ROWS_DELETED_TOTAL, labels::TABLE => table.to_string()).increment(deleted);
        counter!(names::ROWS_INSERTED_TOTAL, labels::TABLE => table.to_string())
            .increment(inserted);
        counter!(names::ROWS_SKIPPED_TOTAL, labels::TABLE => table.to_string()).increment(skipped);
    }

    /// Records a model execution.
    pub fn observe_model_duration(&self, materialization: &str, status: &str, duration: Duration) {
        histogram!(
            names::MODEL_DURATION_SECONDS,
            labels::MATERIALIZATION => materialization.to_string(),
            labels::STATUS => status.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Counts an evaluated assertion.
    pub fn record_assertion(&self, passed: bool) {
        counter!(
            names::ASSERTIONS_TOTAL,
            labels::RESULT => if passed { "passed" } else { "failed" },
        )
        .increment(1);
    }
}

/// Calls `on_drop` with the elapsed time when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Starts timing.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the time elapsed so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Times a pipeline step into `velo_step_duration_seconds`.
#[must_use]
pub fn time_step(metrics: &PipelineMetrics, step: &'static str) -> TimingGuard<impl FnOnce(Duration)> {
    let metrics = metrics.clone();
    TimingGuard::new(move |duration| metrics.observe_step_duration(step, duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        let metrics = PipelineMetrics::new();
        metrics.record_run("succeeded", "SUCCEEDED");
        metrics.record_reload("p.d.trips", 10, 12, 1);
        metrics.observe_model_duration("table", "materialized", Duration::from_millis(3));
        metrics.record_assertion(false);
    }

    #[test]
    fn timing_guard_reports_on_drop() {
        let mut recorded = None;
        {
            let _guard = TimingGuard::new(|d| recorded = Some(d));
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(recorded.is_some_and(|d| d >= Duration::from_millis(5)));
    }
}
