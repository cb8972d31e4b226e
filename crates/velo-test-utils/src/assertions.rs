//! Custom assertion helpers for pipeline tests.

use velo_flow::run::{PipelineRun, PipelineStep};
use velo_flow::warehouse::WarehouseOp;

/// Asserts that a run completed successfully.
///
/// # Panics
///
/// Panics if the run did not succeed.
pub fn assert_run_succeeded(run: &PipelineRun) {
    assert_eq!(
        run.step(),
        PipelineStep::Succeeded,
        "Expected run to succeed, but it failed with {:?}",
        run.failure()
    );
    assert!(run.completed_at().is_some(), "Succeeded run has no completion time");
}

/// Asserts that a run failed while in `step` with an error of `kind`.
///
/// # Panics
///
/// Panics if the run did not fail, or failed elsewhere or differently.
pub fn assert_run_failed_at(run: &PipelineRun, step: PipelineStep, kind: &str) {
    assert_eq!(run.step(), PipelineStep::Failed, "Expected run to fail");
    let failure = run.failure().expect("failed run carries failure detail");
    assert_eq!(failure.step, step, "Failure originated in {}", failure.step);
    assert_eq!(failure.kind, kind, "Unexpected failure: {}", failure.message);
}

/// Asserts that a run visited exactly `steps`, in order.
///
/// # Panics
///
/// Panics if the recorded history differs.
pub fn assert_step_history(run: &PipelineRun, steps: &[PipelineStep]) {
    let history: Vec<PipelineStep> = run.history().iter().map(|e| e.step).collect();
    assert_eq!(history, steps, "Unexpected step history");
}

/// Asserts that no operation modified the warehouse.
///
/// # Panics
///
/// Panics on the first write found.
pub fn assert_no_writes(ops: &[WarehouseOp]) {
    if let Some(op) = ops.iter().find(|op| op.is_write()) {
        panic!("Expected no warehouse writes, found {op:?}");
    }
}

/// Asserts that no operation touched `relation`.
///
/// # Panics
///
/// Panics if any operation names the relation.
pub fn assert_untouched(ops: &[WarehouseOp], relation: &str) {
    let touched: Vec<_> = ops.iter().filter(|op| op.relation() == relation).collect();
    assert!(touched.is_empty(), "Expected {relation} untouched, found {touched:?}");
}
