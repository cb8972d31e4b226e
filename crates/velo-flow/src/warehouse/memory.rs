//! In-memory warehouse for tests and dry runs.
//!
//! Tables are vectors of rows; views live in a separate registry and are
//! computed on read. SQL is not interpreted: the rows a model produces come
//! from a [`ModelEvaluator`] registered under the model's name. Every write
//! and assertion is appended to an operation log.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use velo_core::PartitionKey;

use super::{
    AssertionOutcome, DEFAULT_INSERT_CHUNK_ROWS, ExecuteOutcome, Statement, TableRef, Warehouse,
};
use crate::error::{Error, Result};
use crate::quality::QualityAssertion;
use crate::row::Row;

/// Nesting limit when views read other views.
const MAX_VIEW_DEPTH: usize = 32;

/// Computes the rows of a model from the current warehouse contents.
///
/// The partition is set when a partitioned mart is merged; the warehouse
/// keeps only output rows inside that month.
pub type ModelEvaluator =
    Arc<dyn Fn(&TableSet<'_>, Option<PartitionKey>) -> Result<Vec<Row>> + Send + Sync>;

/// A recorded warehouse operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseOp {
    /// A raw table was declared.
    EnsureTable {
        /// Relation.
        relation: String,
    },
    /// A month was deleted from a raw table.
    DeletePartition {
        /// Relation.
        relation: String,
        /// Month.
        partition: PartitionKey,
        /// Rows removed.
        rows: u64,
    },
    /// A chunk of rows was inserted.
    InsertChunk {
        /// Relation.
        relation: String,
        /// Rows inserted.
        rows: u64,
    },
    /// A view was registered.
    CreateView {
        /// Relation.
        relation: String,
    },
    /// A table was replaced.
    CreateTable {
        /// Relation.
        relation: String,
        /// Rows written.
        rows: u64,
    },
    /// One month of a partitioned table was replaced.
    MergePartition {
        /// Relation.
        relation: String,
        /// Month.
        partition: PartitionKey,
        /// Rows written.
        rows: u64,
    },
    /// An assertion was evaluated.
    Assertion {
        /// Relation.
        relation: String,
    },
}

impl WarehouseOp {
    /// Returns true for operations that modify stored data or definitions.
    #[must_use]
    pub const fn is_write(&self) -> bool {
        !matches!(self, Self::Assertion { .. })
    }

    /// Returns the relation the operation touched.
    #[must_use]
    pub fn relation(&self) -> &str {
        match self {
            Self::EnsureTable { relation }
            | Self::DeletePartition { relation, .. }
            | Self::InsertChunk { relation, .. }
            | Self::CreateView { relation }
            | Self::CreateTable { relation, .. }
            | Self::MergePartition { relation, .. }
            | Self::Assertion { relation } => relation,
        }
    }
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Vec<Row>>,
    views: BTreeMap<String, String>,
    evaluators: HashMap<String, ModelEvaluator>,
    ops: Vec<WarehouseOp>,
}

/// Read access to tables and views, handed to model evaluators.
pub struct TableSet<'a> {
    state: &'a State,
    depth: usize,
}

impl<'a> TableSet<'a> {
    /// Returns the rows of a table or view.
    ///
    /// `name` is a fully-qualified relation or its final segment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Warehouse`] if the relation does not exist or a view
    /// cannot be computed.
    pub fn rows(&self, name: &str) -> Result<Cow<'a, [Row]>> {
        let relation = self
            .resolve(name)
            .ok_or_else(|| Error::warehouse(format!("relation not found: {name}")))?;
        if let Some(rows) = self.state.tables.get(relation) {
            return Ok(Cow::Borrowed(rows.as_slice()));
        }
        let model = self
            .state
            .views
            .get(relation)
            .ok_or_else(|| Error::warehouse(format!("relation not found: {name}")))?;
        if self.depth >= MAX_VIEW_DEPTH {
            return Err(Error::warehouse(format!(
                "view nesting too deep at {relation}"
            )));
        }
        let evaluator = self
            .state
            .evaluators
            .get(model)
            .ok_or_else(|| Error::warehouse(format!("no evaluator for view model {model}")))?;
        let nested = TableSet {
            state: self.state,
            depth: self.depth + 1,
        };
        evaluator(&nested, None).map(Cow::Owned)
    }

    /// Returns true if a table or view named `name` exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    fn resolve(&self, name: &str) -> Option<&'a str> {
        let state = self.state;
        let exact = state
            .tables
            .get_key_value(name)
            .map(|(k, _)| k.as_str())
            .or_else(|| state.views.get_key_value(name).map(|(k, _)| k.as_str()));
        exact.or_else(|| {
            let suffix = format!(".{name}");
            state
                .tables
                .keys()
                .chain(state.views.keys())
                .find(|k| k.ends_with(&suffix))
                .map(String::as_str)
        })
    }
}

/// Process-local [`Warehouse`].
pub struct InMemoryWarehouse {
    state: RwLock<State>,
    chunk_rows: usize,
}

impl fmt::Debug for InMemoryWarehouse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryWarehouse")
            .field("chunk_rows", &self.chunk_rows)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::warehouse("lock poisoned")
}

impl InMemoryWarehouse {
    /// Creates an empty warehouse.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            chunk_rows: DEFAULT_INSERT_CHUNK_ROWS,
        }
    }

    /// Sets the insert chunk size.
    #[must_use]
    pub fn with_chunk_rows(mut self, chunk_rows: usize) -> Self {
        self.chunk_rows = chunk_rows;
        self
    }

    /// Registers the evaluator computing `model`'s rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn register_evaluator(&self, model: impl Into<String>, evaluator: ModelEvaluator) -> Result<()> {
        self.state
            .write()
            .map_err(poison_err)?
            .evaluators
            .insert(model.into(), evaluator);
        Ok(())
    }

    /// Seeds a table with rows, creating it if needed. Not logged.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn insert_rows(&self, relation: impl Into<String>, rows: Vec<Row>) -> Result<()> {
        self.state
            .write()
            .map_err(poison_err)?
            .tables
            .entry(relation.into())
            .or_default()
            .extend(rows);
        Ok(())
    }

    /// Returns a copy of a table's rows, or of a view's computed rows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Warehouse`] if the relation does not exist.
    pub fn rows(&self, relation: &str) -> Result<Vec<Row>> {
        let state = self.state.read().map_err(poison_err)?;
        let set = TableSet {
            state: &state,
            depth: 0,
        };
        set.rows(relation).map(Cow::into_owned)
    }

    /// Returns the number of rows stored in a table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Warehouse`] if the table does not exist.
    pub fn row_count(&self, relation: &str) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        state
            .tables
            .get(relation)
            .map(Vec::len)
            .ok_or_else(|| Error::warehouse(format!("table not found: {relation}")))
    }

    /// Returns the names of stored tables, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn materialized_tables(&self) -> Result<Vec<String>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut names: Vec<String> = state.tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Returns the names of registered views, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn views(&self) -> Result<Vec<String>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.views.keys().cloned().collect())
    }

    /// Returns the operation log.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn operations(&self) -> Result<Vec<WarehouseOp>> {
        Ok(self.state.read().map_err(poison_err)?.ops.clone())
    }

    /// Clears the operation log.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn clear_operations(&self) -> Result<()> {
        self.state.write().map_err(poison_err)?.ops.clear();
        Ok(())
    }

    fn evaluate(state: &State, model: &str, partition: Option<PartitionKey>) -> Result<Vec<Row>> {
        let evaluator = state
            .evaluators
            .get(model)
            .ok_or_else(|| Error::warehouse(format!("no evaluator for model {model}")))?;
        let set = TableSet { state, depth: 0 };
        evaluator(&set, partition)
    }
}

fn in_partition(row: &Row, column: &str, partition: PartitionKey) -> bool {
    row.value(column)
        .as_date()
        .is_some_and(|date| partition.contains(date))
}

#[async_trait]
impl Warehouse for InMemoryWarehouse {
    fn insert_chunk_rows(&self) -> usize {
        self.chunk_rows
    }

    async fn delete_partition(&self, table: &TableRef, partition: PartitionKey) -> Result<u64> {
        let mut state = self.state.write().map_err(poison_err)?;
        let rows = state
            .tables
            .get_mut(&table.relation)
            .ok_or_else(|| Error::warehouse(format!("table not found: {}", table.relation)))?;
        let before = rows.len();
        rows.retain(|row| {
            !table
                .partition_date(row)
                .is_some_and(|date| partition.contains(date))
        });
        let deleted = (before - rows.len()) as u64;
        state.ops.push(WarehouseOp::DeletePartition {
            relation: table.relation.clone(),
            partition,
            rows: deleted,
        });
        Ok(deleted)
    }

    async fn insert_chunk(&self, table: &TableRef, rows: Vec<Row>) -> Result<u64> {
        let mut state = self.state.write().map_err(poison_err)?;
        let inserted = rows.len() as u64;
        state
            .tables
            .get_mut(&table.relation)
            .ok_or_else(|| Error::warehouse(format!("table not found: {}", table.relation)))?
            .extend(rows);
        state.ops.push(WarehouseOp::InsertChunk {
            relation: table.relation.clone(),
            rows: inserted,
        });
        Ok(inserted)
    }

    async fn execute(&self, statement: &Statement) -> Result<ExecuteOutcome> {
        let mut state = self.state.write().map_err(poison_err)?;
        match statement {
            Statement::EnsureTable { table } => {
                state.tables.entry(table.relation.clone()).or_default();
                state.ops.push(WarehouseOp::EnsureTable {
                    relation: table.relation.clone(),
                });
                Ok(ExecuteOutcome::default())
            }
            Statement::CreateView { model, relation, .. } => {
                if state.tables.contains_key(relation) {
                    return Err(Error::warehouse(format!(
                        "{relation} already exists as a table"
                    )));
                }
                state.views.insert(relation.clone(), model.clone());
                state.ops.push(WarehouseOp::CreateView {
                    relation: relation.clone(),
                });
                Ok(ExecuteOutcome::default())
            }
            Statement::CreateTableAs {
                model, relation, ..
            } => {
                let rows = Self::evaluate(&state, model, None)?;
                let written = rows.len() as u64;
                state.views.remove(relation);
                state.tables.insert(relation.clone(), rows);
                state.ops.push(WarehouseOp::CreateTable {
                    relation: relation.clone(),
                    rows: written,
                });
                Ok(ExecuteOutcome {
                    rows_affected: Some(written),
                    rows: Vec::new(),
                })
            }
            Statement::MergePartition {
                model,
                relation,
                partition_column,
                partition,
                ..
            } => {
                let mut rows = Self::evaluate(&state, model, Some(*partition))?;
                rows.retain(|row| in_partition(row, partition_column, *partition));
                let written = rows.len() as u64;
                let table = state.tables.entry(relation.clone()).or_default();
                table.retain(|row| !in_partition(row, partition_column, *partition));
                table.extend(rows);
                state.ops.push(WarehouseOp::MergePartition {
                    relation: relation.clone(),
                    partition: *partition,
                    rows: written,
                });
                Ok(ExecuteOutcome {
                    rows_affected: Some(written),
                    rows: Vec::new(),
                })
            }
            Statement::Query { .. } => Err(Error::warehouse(
                "ad-hoc queries are not supported by the in-memory warehouse",
            )),
        }
    }

    async fn run_assertion(
        &self,
        relation: &str,
        assertion: &QualityAssertion,
    ) -> Result<AssertionOutcome> {
        let violations = {
            let state = self.state.read().map_err(poison_err)?;
            let set = TableSet {
                state: &state,
                depth: 0,
            };
            let rows = set.rows(relation)?;
            assertion.evaluate_rows(&rows)
        };
        self.state
            .write()
            .map_err(poison_err)?
            .ops
            .push(WarehouseOp::Assertion {
                relation: relation.to_string(),
            });
        Ok(AssertionOutcome::from_violations(violations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Value;
    use crate::warehouse::Dataset;
    use chrono::NaiveDate;
    use futures::stream;
    use tokio_util::sync::CancellationToken;

    fn jan() -> PartitionKey {
        PartitionKey::new(2025, 1).unwrap()
    }

    fn weather_row(month: u32, day: u32) -> Row {
        let hour = NaiveDate::from_ymd_opt(2025, month, day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        Row::new().with("datetime", hour)
    }

    fn weather() -> TableRef {
        TableRef::weather(&Dataset::new("p", "d"), "weather")
    }

    #[tokio::test]
    async fn delete_partition_only_touches_month() {
        let wh = InMemoryWarehouse::new();
        wh.insert_rows(
            "p.d.weather",
            vec![weather_row(1, 1), weather_row(1, 31), weather_row(2, 1)],
        )
        .unwrap();
        let deleted = wh.delete_partition(&weather(), jan()).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(wh.row_count("p.d.weather").unwrap(), 1);
    }

    #[tokio::test]
    async fn bulk_insert_chunks_rows() {
        let wh = InMemoryWarehouse::new().with_chunk_rows(2);
        wh.execute(&Statement::EnsureTable { table: weather() })
            .await
            .unwrap();
        let rows = stream::iter((1..=5).map(|d| Ok(weather_row(1, d))));
        let inserted = wh
            .bulk_insert(&weather(), Box::pin(rows), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(inserted, 5);
        let chunks = wh
            .operations()
            .unwrap()
            .into_iter()
            .filter(|op| matches!(op, WarehouseOp::InsertChunk { .. }))
            .count();
        assert_eq!(chunks, 3);
    }

    #[tokio::test]
    async fn bulk_insert_reports_committed_rows_on_failure() {
        let wh = InMemoryWarehouse::new().with_chunk_rows(2);
        let rows = stream::iter((1..=3).map(|d| Ok(weather_row(1, d))));
        let err = wh
            .bulk_insert(&weather(), Box::pin(rows), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Load { rows_committed: 0, .. }));
    }

    #[tokio::test]
    async fn bulk_insert_stops_on_cancel() {
        let wh = InMemoryWarehouse::new();
        wh.execute(&Statement::EnsureTable { table: weather() })
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let rows = stream::iter(vec![Ok(weather_row(1, 1))]);
        let err = wh
            .bulk_insert(&weather(), Box::pin(rows), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }

    #[tokio::test]
    async fn views_are_computed_on_read_and_never_stored() {
        let wh = InMemoryWarehouse::new();
        wh.insert_rows("p.d.raw", vec![Row::new().with("x", 1_i64), Row::new().with("x", 2_i64)])
            .unwrap();
        wh.register_evaluator(
            "doubled",
            Arc::new(|tables: &TableSet<'_>, _| {
                Ok(tables
                    .rows("raw")?
                    .iter()
                    .map(|r| Row::new().with("x", r.value("x").as_int().unwrap_or(0) * 2))
                    .collect())
            }),
        )
        .unwrap();
        wh.execute(&Statement::CreateView {
            model: "doubled".into(),
            relation: "p.d.doubled".into(),
            sql: String::new(),
        })
        .await
        .unwrap();

        assert_eq!(wh.views().unwrap(), vec!["p.d.doubled".to_string()]);
        assert_eq!(wh.materialized_tables().unwrap(), vec!["p.d.raw".to_string()]);
        let rows = wh.rows("p.d.doubled").unwrap();
        assert_eq!(rows[1].value("x"), &Value::Int(4));

        let outcome = wh
            .run_assertion("p.d.doubled", &QualityAssertion::unique("doubled", &["x"]))
            .await
            .unwrap();
        assert!(outcome.passed);
    }

    #[tokio::test]
    async fn merge_partition_replaces_only_its_month() {
        let wh = InMemoryWarehouse::new();
        wh.insert_rows(
            "p.d.daily",
            vec![
                Row::new().with("day", NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()),
                Row::new().with("day", NaiveDate::from_ymd_opt(2025, 1, 5).unwrap()),
            ],
        )
        .unwrap();
        wh.register_evaluator(
            "daily",
            Arc::new(|_: &TableSet<'_>, _| {
                Ok(vec![
                    Row::new().with("day", NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()),
                    Row::new().with("day", NaiveDate::from_ymd_opt(2025, 1, 2).unwrap()),
                    Row::new().with("day", NaiveDate::from_ymd_opt(2025, 2, 1).unwrap()),
                ])
            }),
        )
        .unwrap();
        let stmt = Statement::MergePartition {
            model: "daily".into(),
            relation: "p.d.daily".into(),
            sql: String::new(),
            partition_column: "day".into(),
            partition: jan(),
            cluster_by: vec![],
        };
        for _ in 0..2 {
            let outcome = wh.execute(&stmt).await.unwrap();
            assert_eq!(outcome.rows_affected, Some(2));
        }
        assert_eq!(wh.row_count("p.d.daily").unwrap(), 3);
    }

    #[tokio::test]
    async fn missing_evaluator_is_a_warehouse_error() {
        let wh = InMemoryWarehouse::new();
        let err = wh
            .execute(&Statement::CreateTableAs {
                model: "nope".into(),
                relation: "p.d.nope".into(),
                sql: String::new(),
                cluster_by: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Warehouse { .. }));
        assert!(wh.materialized_tables().unwrap().is_empty());
    }
}
