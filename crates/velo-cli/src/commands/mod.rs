//! CLI command implementations.

pub mod check;
pub mod run;
pub mod status;

use owo_colors::OwoColorize;
use velo_flow::executor::NodeStatus;
use velo_flow::run::PipelineRun;

use crate::OutputFormat;

/// Prints `run` in the requested format.
pub(crate) fn print_run(run: &PipelineRun, format: &OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(run)?),
        OutputFormat::Text => print_run_text(run),
        OutputFormat::Table => {
            print_run_text(run);
            print_run_tables(run);
        }
    }
    Ok(())
}

fn print_run_text(run: &PipelineRun) {
    println!("Run:       {}", run.id());
    println!("Partition: {}", run.partition());
    println!("Trigger:   {}", run.trigger());
    println!("Step:      {}", format_step_colored(run));
    println!("Started:   {}", run.started_at().format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(duration) = run.duration() {
        #[allow(clippy::cast_precision_loss)]
        let secs = duration.num_milliseconds() as f64 / 1000.0;
        println!("Duration:  {secs:.1}s");
    }

    let path: Vec<&str> = run.history().iter().map(|e| e.step.as_str()).collect();
    println!("History:   {}", path.join(" -> "));

    let summary = run.summary();
    for (label, outcome) in [("Trips", &summary.trips), ("Weather", &summary.weather)] {
        if let Some(o) = outcome {
            println!(
                "{label:<10} {} deleted, {} inserted, {} skipped",
                o.rows_deleted, o.rows_inserted, o.rows_skipped
            );
        }
    }
    if let Some(report) = &summary.transformations {
        let failed = report
            .results
            .iter()
            .filter(|r| matches!(r.status, NodeStatus::Failed { .. }))
            .count();
        println!("Models:    {} run, {failed} failed", report.results.len());
    }
    if let Some(gate) = &summary.quality {
        let line = format!("{} of {} assertions passed", gate.total() - gate.failed(), gate.total());
        if gate.passed() {
            println!("Quality:   {}", line.green());
        } else {
            println!("Quality:   {}", line.red());
        }
    }

    if let Some(failure) = run.failure() {
        println!();
        println!("Failed at {} ({})", failure.step, failure.kind);
        println!("  {}", failure.message.red());
    }
}

fn print_run_tables(run: &PipelineRun) {
    use tabled::{Table, Tabled};

    #[derive(Tabled)]
    struct ModelRow {
        #[tabled(rename = "Model")]
        node: String,
        #[tabled(rename = "Materialization")]
        materialization: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "Duration (ms)")]
        duration_ms: u64,
    }

    #[derive(Tabled)]
    struct AssertionRow {
        #[tabled(rename = "Failed assertion")]
        assertion: String,
        #[tabled(rename = "Violations")]
        violations: u64,
    }

    if let Some(report) = &run.summary().transformations {
        let rows: Vec<_> = report
            .results
            .iter()
            .map(|r| ModelRow {
                node: r.node.clone(),
                materialization: r.materialization.to_string(),
                status: r.status.as_str().to_string(),
                duration_ms: r.duration_ms,
            })
            .collect();
        println!();
        println!("{}", Table::new(rows));
    }

    if let Some(gate) = &run.summary().quality {
        let rows: Vec<_> = gate
            .results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| AssertionRow {
                assertion: r
                    .error
                    .as_ref()
                    .map_or_else(|| r.assertion.to_string(), |e| format!("{} ({e})", r.assertion)),
                violations: r.violating_row_count,
            })
            .collect();
        if !rows.is_empty() {
            println!();
            println!("{}", Table::new(rows));
        }
    }
}

fn format_step_colored(run: &PipelineRun) -> String {
    let step = run.step().as_str();
    if run.succeeded() {
        step.green().to_string()
    } else if run.is_benign_failure() {
        step.yellow().to_string()
    } else if run.step().is_terminal() {
        step.red().to_string()
    } else {
        step.blue().to_string()
    }
}
