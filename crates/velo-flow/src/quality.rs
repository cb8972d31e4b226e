//! Declarative data-quality assertions and the gate that evaluates them.
//!
//! The gate runs every assertion, even after failures, and never modifies
//! data. An assertion whose query errors counts as failed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::metrics::PipelineMetrics;
use crate::row::{Row, Value, quote_string};
use crate::warehouse::{AssertionOutcome, Dataset, Warehouse, quote_relation};

/// What an assertion checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssertionKind {
    /// No two rows share the same values in `columns`.
    Unique {
        /// Key columns.
        columns: Vec<String>,
    },
    /// `column` is never NULL.
    NotNull {
        /// Checked column.
        column: String,
    },
    /// Non-null values of `column` are drawn from `values`.
    AcceptedValues {
        /// Checked column.
        column: String,
        /// Permitted values, compared as text.
        values: Vec<String>,
    },
}

/// A read-only check against one model's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityAssertion {
    /// Target model.
    pub table: String,
    /// Check.
    #[serde(flatten)]
    pub kind: AssertionKind,
}

impl QualityAssertion {
    /// Asserts uniqueness of `columns` in `table`.
    #[must_use]
    pub fn unique(table: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            table: table.into(),
            kind: AssertionKind::Unique {
                columns: columns.iter().map(ToString::to_string).collect(),
            },
        }
    }

    /// Asserts `column` of `table` is never NULL.
    #[must_use]
    pub fn not_null(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            kind: AssertionKind::NotNull {
                column: column.into(),
            },
        }
    }

    /// Asserts `column` of `table` only holds `values`.
    #[must_use]
    pub fn accepted_values(
        table: impl Into<String>,
        column: impl Into<String>,
        values: &[&str],
    ) -> Self {
        Self {
            table: table.into(),
            kind: AssertionKind::AcceptedValues {
                column: column.into(),
                values: values.iter().map(ToString::to_string).collect(),
            },
        }
    }

    /// Renders a query returning the violating row count as `violations`.
    #[must_use]
    pub fn to_sql(&self, relation: &str) -> String {
        let target = quote_relation(relation);
        match &self.kind {
            AssertionKind::Unique { columns } => {
                let key = columns.join(", ");
                format!(
                    "SELECT COALESCE(SUM(n), 0) AS violations FROM (\n  SELECT {key}, COUNT(*) AS n FROM {target}\n  GROUP BY {key}\n  HAVING COUNT(*) > 1\n)"
                )
            }
            AssertionKind::NotNull { column } => {
                format!("SELECT COUNT(*) AS violations FROM {target} WHERE {column} IS NULL")
            }
            AssertionKind::AcceptedValues { column, values } => {
                let allowed = values
                    .iter()
                    .map(|v| quote_string(v))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "SELECT COUNT(*) AS violations FROM {target} WHERE {column} IS NOT NULL AND CAST({column} AS STRING) NOT IN ({allowed})"
                )
            }
        }
    }

    /// Counts violating rows among `rows`.
    pub(crate) fn evaluate_rows(&self, rows: &[Row]) -> u64 {
        match &self.kind {
            AssertionKind::Unique { columns } => {
                let mut groups: HashMap<Vec<String>, u64> = HashMap::new();
                for row in rows {
                    let key = columns
                        .iter()
                        .map(|c| group_key(row.value(c)))
                        .collect::<Vec<_>>();
                    *groups.entry(key).or_default() += 1;
                }
                groups.values().filter(|n| **n > 1).sum()
            }
            AssertionKind::NotNull { column } => {
                rows.iter().filter(|r| r.value(column).is_null()).count() as u64
            }
            AssertionKind::AcceptedValues { column, values } => rows
                .iter()
                .filter(|r| {
                    let v = r.value(column);
                    !v.is_null() && !values.iter().any(|allowed| *allowed == v.to_string())
                })
                .count() as u64,
        }
    }
}

fn group_key(value: &Value) -> String {
    match value {
        Value::Null => "\0null".to_string(),
        other => other.to_string(),
    }
}

impl fmt::Display for QualityAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            AssertionKind::Unique { columns } => {
                write!(f, "unique({}.{})", self.table, columns.join("+"))
            }
            AssertionKind::NotNull { column } => write!(f, "not_null({}.{column})", self.table),
            AssertionKind::AcceptedValues { column, .. } => {
                write!(f, "accepted_values({}.{column})", self.table)
            }
        }
    }
}

/// Outcome of one assertion in a gate run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionResult {
    /// The assertion.
    pub assertion: QualityAssertion,
    /// True when no row violates it.
    pub passed: bool,
    /// Violating rows; zero when evaluation errored.
    pub violating_row_count: u64,
    /// Evaluation error, if the query itself failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Results of a gate run, in assertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    /// Per-assertion results.
    pub results: Vec<AssertionResult>,
}

impl GateReport {
    /// Returns the number of evaluated assertions.
    #[must_use]
    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// Returns the number of failed assertions.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.passed).count()
    }

    /// Returns true if every assertion passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failed() == 0
    }

    /// Converts a failing report into [`Error::QualityGateFailure`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::QualityGateFailure`] if any assertion failed.
    pub fn into_result(self) -> Result<Self> {
        if self.passed() {
            Ok(self)
        } else {
            Err(Error::QualityGateFailure {
                failed: self.failed(),
                total: self.total(),
            })
        }
    }
}

/// Evaluates assertions against warehouse relations.
#[derive(Clone)]
pub struct QualityGate {
    warehouse: Arc<dyn Warehouse>,
    dataset: Dataset,
    concurrency: usize,
    metrics: PipelineMetrics,
}

impl fmt::Debug for QualityGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QualityGate")
            .field("dataset", &self.dataset)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl QualityGate {
    /// Creates a gate evaluating up to `concurrency` assertions at a time.
    #[must_use]
    pub fn new(warehouse: Arc<dyn Warehouse>, dataset: Dataset, concurrency: usize) -> Self {
        Self {
            warehouse,
            dataset,
            concurrency: concurrency.max(1),
            metrics: PipelineMetrics::new(),
        }
    }

    /// Evaluates every assertion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires. Assertion failures and
    /// query errors are reported in the [`GateReport`], not as errors.
    #[tracing::instrument(skip_all, fields(assertions = assertions.len()))]
    pub async fn evaluate(
        &self,
        assertions: &[QualityAssertion],
        cancel: &CancellationToken,
    ) -> Result<GateReport> {
        let evaluations = stream::iter(assertions.iter().cloned())
            .map(|assertion| self.evaluate_one(assertion))
            .buffered(self.concurrency)
            .collect::<Vec<_>>();

        let results = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(Error::Cancelled { step: "quality gate".to_string() });
            }
            results = evaluations => results,
        };

        let report = GateReport { results };
        tracing::info!(
            total = report.total(),
            failed = report.failed(),
            "quality gate evaluated"
        );
        Ok(report)
    }

    async fn evaluate_one(&self, assertion: QualityAssertion) -> AssertionResult {
        let relation = self.dataset.relation(&assertion.table);
        let result = match self.warehouse.run_assertion(&relation, &assertion).await {
            Ok(AssertionOutcome {
                passed,
                violating_row_count,
            }) => {
                if !passed {
                    tracing::warn!(%assertion, violating_row_count, "assertion failed");
                }
                AssertionResult {
                    assertion,
                    passed,
                    violating_row_count,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(%assertion, error = %e, "assertion evaluation errored");
                AssertionResult {
                    assertion,
                    passed: false,
                    violating_row_count: 0,
                    error: Some(e.to_string()),
                }
            }
        };
        self.metrics.record_assertion(result.passed);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<Row> {
        vec![
            Row::new().with("id", "a").with("kind", "member"),
            Row::new().with("id", "a").with("kind", "casual"),
            Row::new().with("id", "b").with("kind", Value::Null),
            Row::new().with("id", "c").with("kind", "tourist"),
        ]
    }

    #[test]
    fn uniqueness_counts_all_rows_in_duplicate_groups() {
        let a = QualityAssertion::unique("t", &["id"]);
        assert_eq!(a.evaluate_rows(&rows()), 2);
        let composite = QualityAssertion::unique("t", &["id", "kind"]);
        assert_eq!(composite.evaluate_rows(&rows()), 0);
    }

    #[test]
    fn not_null_counts_nulls_and_missing_columns() {
        assert_eq!(QualityAssertion::not_null("t", "kind").evaluate_rows(&rows()), 1);
        assert_eq!(QualityAssertion::not_null("t", "nope").evaluate_rows(&rows()), 4);
    }

    #[test]
    fn accepted_values_ignores_nulls() {
        let a = QualityAssertion::accepted_values("t", "kind", &["member", "casual"]);
        assert_eq!(a.evaluate_rows(&rows()), 1);
    }

    #[test]
    fn renders_sql() {
        let unique = QualityAssertion::unique("t", &["id"]).to_sql("p.d.t");
        assert!(unique.contains("GROUP BY id"));
        assert!(unique.contains("HAVING COUNT(*) > 1"));

        let accepted =
            QualityAssertion::accepted_values("t", "kind", &["member", "casual"]).to_sql("p.d.t");
        assert!(accepted.ends_with("NOT IN ('member', 'casual')"));

        let not_null = QualityAssertion::not_null("t", "id").to_sql("p.d.t");
        assert_eq!(
            not_null,
            "SELECT COUNT(*) AS violations FROM `p.d.t` WHERE id IS NULL"
        );
    }

    #[test]
    fn deserializes_from_manifest_shape() {
        let json = r#"[
            {"table": "fct_trips", "kind": "unique", "columns": ["ride_id"]},
            {"table": "fct_trips", "kind": "not_null", "column": "ride_id"},
            {"table": "fct_trips", "kind": "accepted_values", "column": "member_casual", "values": ["member", "casual"]}
        ]"#;
        let parsed: Vec<QualityAssertion> = serde_json::from_str(json).unwrap();
        assert_eq!(parsed[0], QualityAssertion::unique("fct_trips", &["ride_id"]));
        assert_eq!(parsed[1].to_string(), "not_null(fct_trips.ride_id)");
        assert!(matches!(parsed[2].kind, AssertionKind::AcceptedValues { .. }));
    }

    #[test]
    fn report_fails_when_any_assertion_fails() {
        let ok = AssertionResult {
            assertion: QualityAssertion::not_null("t", "id"),
            passed: true,
            violating_row_count: 0,
            error: None,
        };
        let bad = AssertionResult {
            passed: false,
            violating_row_count: 2,
            ..ok.clone()
        };
        let report = GateReport {
            results: vec![ok, bad],
        };
        assert!(matches!(
            report.into_result(),
            Err(Error::QualityGateFailure { failed: 1, total: 2 })
        ));
    }
}
