//! Warehouse gateway.
//!
//! The [`Warehouse`] trait is the only path to the tabular store: partition
//! deletes, chunked inserts, transformation statements, and assertion
//! queries. Implementations hold connection handles and nothing else; the
//! warehouse itself is the source of truth for which tables and views exist.
//!
//! ## Chunked inserts
//!
//! Implementations provide [`Warehouse::insert_chunk`]. Callers use the
//! provided [`Warehouse::bulk_insert`], which splits a row stream into chunks
//! of [`Warehouse::insert_chunk_rows`] rows. A failing chunk ends the insert
//! with [`Error::Load`] carrying the rows committed before it. Recovery is a
//! full partition reload, never a resume from that offset.

#[cfg(feature = "gcp")]
pub mod bigquery;
pub mod memory;
pub mod statement;

pub use memory::{InMemoryWarehouse, ModelEvaluator, TableSet, WarehouseOp};
pub use statement::Statement;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use velo_core::PartitionKey;

use crate::error::{Error, Result};
use crate::quality::QualityAssertion;
use crate::record::{TripRecord, WeatherObservation};
use crate::row::{ColumnType, Row, WarehouseRecord};

/// Default number of rows per insert request.
pub const DEFAULT_INSERT_CHUNK_ROWS: usize = 10_000;

/// A stream of rows headed for a table.
pub type RowStream<'a> = BoxStream<'a, Result<Row>>;

/// A BigQuery project and dataset that relations are resolved in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dataset {
    /// Project identifier.
    pub project: String,
    /// Dataset name.
    pub dataset: String,
}

impl Dataset {
    /// Creates a dataset reference.
    #[must_use]
    pub fn new(project: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
        }
    }

    /// Returns the fully-qualified relation name for `name`.
    #[must_use]
    pub fn relation(&self, name: &str) -> String {
        format!("{}.{}.{name}", self.project, self.dataset)
    }
}

/// Quotes a relation name for use in SQL.
#[must_use]
pub fn quote_relation(relation: &str) -> String {
    format!("`{relation}`")
}

/// A raw table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    /// Fully-qualified relation name.
    pub relation: String,
    /// Columns whose first non-null value decides a row's partition date.
    pub partition_columns: Vec<String>,
    /// Column the table is physically partitioned on (by day).
    pub storage_partition: Option<String>,
    /// Clustering columns.
    pub cluster_by: Vec<String>,
    /// Column layout.
    pub schema: Vec<(String, ColumnType)>,
}

impl TableRef {
    /// Creates a table definition with no partitioning.
    #[must_use]
    pub fn new(relation: impl Into<String>) -> Self {
        Self {
            relation: relation.into(),
            partition_columns: Vec::new(),
            storage_partition: None,
            cluster_by: Vec::new(),
            schema: Vec::new(),
        }
    }

    /// Sets the columns deciding partition membership.
    #[must_use]
    pub fn partitioned_by(mut self, columns: &[&str]) -> Self {
        self.partition_columns = columns.iter().map(ToString::to_string).collect();
        self
    }

    /// Sets the physical partition column.
    #[must_use]
    pub fn with_storage_partition(mut self, column: &str) -> Self {
        self.storage_partition = Some(column.to_string());
        self
    }

    /// Sets clustering columns.
    #[must_use]
    pub fn clustered_by(mut self, columns: &[&str]) -> Self {
        self.cluster_by = columns.iter().map(ToString::to_string).collect();
        self
    }

    /// Sets the column layout from a record type.
    #[must_use]
    pub fn with_schema_of<R: WarehouseRecord>(mut self) -> Self {
        self.schema = R::schema()
            .iter()
            .map(|(name, ty)| ((*name).to_string(), *ty))
            .collect();
        self
    }

    /// The raw trips table: deletes by end date (start date for open trips),
    /// stored by start day and clustered for station and rider lookups.
    #[must_use]
    pub fn trips(dataset: &Dataset, table: &str) -> Self {
        Self::new(dataset.relation(table))
            .partitioned_by(&["ended_at", "started_at"])
            .with_storage_partition("started_at")
            .clustered_by(&["start_station_id", "member_casual"])
            .with_schema_of::<TripRecord>()
    }

    /// The raw hourly weather table.
    #[must_use]
    pub fn weather(dataset: &Dataset, table: &str) -> Self {
        Self::new(dataset.relation(table))
            .partitioned_by(&["datetime"])
            .with_schema_of::<WeatherObservation>()
    }

    /// Returns the partition date of a stored row.
    #[must_use]
    pub fn partition_date(&self, row: &Row) -> Option<NaiveDate> {
        self.partition_columns
            .iter()
            .find_map(|column| row.get(column).and_then(crate::row::Value::as_date))
    }

    /// Renders the SQL expression yielding a row's partition date.
    #[must_use]
    pub fn partition_date_sql(&self) -> String {
        match self.partition_columns.as_slice() {
            [] => "NULL".to_string(),
            [single] => format!("DATE({single})"),
            columns => format!("DATE(COALESCE({}))", columns.join(", ")),
        }
    }
}

/// Result of a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteOutcome {
    /// Rows written or affected, when the backend reports a count.
    pub rows_affected: Option<u64>,
    /// Result rows for queries.
    pub rows: Vec<Row>,
}

/// Result of evaluating one assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionOutcome {
    /// True when no row violates the assertion.
    pub passed: bool,
    /// Number of violating rows.
    pub violating_row_count: u64,
}

impl AssertionOutcome {
    /// Creates an outcome from a violation count.
    #[must_use]
    pub const fn from_violations(violating_row_count: u64) -> Self {
        Self {
            passed: violating_row_count == 0,
            violating_row_count,
        }
    }
}

/// Gateway to the tabular store.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Rows per insert request.
    fn insert_chunk_rows(&self) -> usize {
        DEFAULT_INSERT_CHUNK_ROWS
    }

    /// Deletes every row of `table` whose partition date falls in `partition`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Warehouse`] if the delete fails.
    async fn delete_partition(&self, table: &TableRef, partition: PartitionKey) -> Result<u64>;

    /// Inserts one chunk of rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk was not committed.
    async fn insert_chunk(&self, table: &TableRef, rows: Vec<Row>) -> Result<u64>;

    /// Executes a statement.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Warehouse`] if the statement fails.
    async fn execute(&self, statement: &Statement) -> Result<ExecuteOutcome>;

    /// Evaluates an assertion read-only against `relation`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Warehouse`] if the assertion query fails.
    async fn run_assertion(
        &self,
        relation: &str,
        assertion: &QualityAssertion,
    ) -> Result<AssertionOutcome>;

    /// Inserts a stream of rows in chunks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Load`] if a chunk fails, the stream's own error if
    /// the stream yields one, and [`Error::Cancelled`] if `cancel` fires
    /// between chunks.
    async fn bulk_insert(
        &self,
        table: &TableRef,
        mut rows: RowStream<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let chunk_rows = self.insert_chunk_rows().max(1);
        let mut committed = 0_u64;
        let mut chunk = Vec::with_capacity(chunk_rows);

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(Error::Cancelled {
                        step: format!("insert into {}", table.relation),
                    });
                }
                next = rows.next() => next,
            };
            let done = match next {
                Some(Ok(row)) => {
                    chunk.push(row);
                    false
                }
                Some(Err(e)) => return Err(e),
                None => true,
            };
            if chunk.len() >= chunk_rows || (done && !chunk.is_empty()) {
                let batch = std::mem::replace(&mut chunk, Vec::with_capacity(chunk_rows));
                let size = batch.len();
                match self.insert_chunk(table, batch).await {
                    Ok(inserted) => {
                        committed += inserted;
                        tracing::debug!(table = %table.relation, size, committed, "chunk committed");
                    }
                    Err(e) => {
                        return Err(Error::Load {
                            table: table.relation.clone(),
                            rows_committed: committed,
                            message: e.to_string(),
                        });
                    }
                }
            }
            if done {
                return Ok(committed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Value;

    fn ts(y: i32, m: u32, d: u32) -> Value {
        Value::from(
            NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
        )
    }

    #[test]
    fn trips_table_prefers_end_date() {
        let table = TableRef::trips(&Dataset::new("p", "d"), "trips");
        assert_eq!(table.relation, "p.d.trips");
        assert_eq!(
            table.partition_date_sql(),
            "DATE(COALESCE(ended_at, started_at))"
        );

        let crossing = Row::new()
            .with("started_at", ts(2025, 1, 31))
            .with("ended_at", ts(2025, 2, 1));
        assert_eq!(
            table.partition_date(&crossing),
            NaiveDate::from_ymd_opt(2025, 2, 1)
        );

        let open = Row::new()
            .with("started_at", ts(2025, 1, 31))
            .with("ended_at", Value::Null);
        assert_eq!(
            table.partition_date(&open),
            NaiveDate::from_ymd_opt(2025, 1, 31)
        );
    }

    #[test]
    fn weather_table_has_single_partition_column() {
        let table = TableRef::weather(&Dataset::new("p", "d"), "weather");
        assert_eq!(table.partition_date_sql(), "DATE(datetime)");
        assert_eq!(table.schema.len(), 5);
    }

    #[test]
    fn assertion_outcome_passes_only_without_violations() {
        assert!(AssertionOutcome::from_violations(0).passed);
        assert!(!AssertionOutcome::from_violations(3).passed);
    }
}
