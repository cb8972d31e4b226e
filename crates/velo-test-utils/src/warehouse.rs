//! Fault-injecting warehouse for crash and failure scenarios.
//!
//! [`FaultyWarehouse`] wraps an [`InMemoryWarehouse`] and fails selected
//! calls, so tests can stop a reload between its delete and its last insert
//! or fail a single model in the DAG.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use velo_core::PartitionKey;
use velo_flow::error::{Error, Result};
use velo_flow::quality::QualityAssertion;
use velo_flow::row::Row;
use velo_flow::warehouse::{
    AssertionOutcome, ExecuteOutcome, InMemoryWarehouse, Statement, TableRef, Warehouse,
};

/// Failures to inject.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Insert chunks that succeed before every further insert fails.
    pub fail_inserts_after: Option<u64>,
    /// Fail every partition delete.
    pub fail_deletes: bool,
    /// Models whose statements fail.
    pub failing_models: HashSet<String>,
    /// Relations (or their final segment) whose assertions error.
    pub failing_assertions: HashSet<String>,
    /// Delay applied before every statement.
    pub statement_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct FaultState {
    config: FaultConfig,
    inserts_seen: u64,
}

/// A [`Warehouse`] that fails on command.
#[derive(Debug)]
pub struct FaultyWarehouse {
    inner: Arc<InMemoryWarehouse>,
    state: Mutex<FaultState>,
}

impl FaultyWarehouse {
    /// Wraps `inner` with no faults configured.
    #[must_use]
    pub fn new(inner: Arc<InMemoryWarehouse>) -> Self {
        Self {
            inner,
            state: Mutex::new(FaultState::default()),
        }
    }

    /// Returns the wrapped warehouse.
    #[must_use]
    pub fn inner(&self) -> &Arc<InMemoryWarehouse> {
        &self.inner
    }

    /// Replaces the fault configuration and resets counters.
    pub fn configure(&self, config: FaultConfig) {
        *self.state.lock().expect("fault state") = FaultState {
            config,
            inserts_seen: 0,
        };
    }

    /// Lets `chunks` inserts succeed, then fails every insert.
    pub fn fail_inserts_after(&self, chunks: u64) {
        self.configure(FaultConfig {
            fail_inserts_after: Some(chunks),
            ..FaultConfig::default()
        });
    }

    /// Fails every statement of `model`.
    pub fn fail_model(&self, model: &str) {
        self.state
            .lock()
            .expect("fault state")
            .config
            .failing_models
            .insert(model.to_string());
    }

    /// Removes all faults.
    pub fn heal(&self) {
        self.configure(FaultConfig::default());
    }

    fn config(&self) -> FaultConfig {
        self.state.lock().expect("fault state").config.clone()
    }
}

fn statement_model(statement: &Statement) -> Option<&str> {
    match statement {
        Statement::CreateView { model, .. }
        | Statement::CreateTableAs { model, .. }
        | Statement::MergePartition { model, .. } => Some(model),
        Statement::EnsureTable { .. } | Statement::Query { .. } => None,
    }
}

#[async_trait]
impl Warehouse for FaultyWarehouse {
    fn insert_chunk_rows(&self) -> usize {
        self.inner.insert_chunk_rows()
    }

    async fn delete_partition(&self, table: &TableRef, partition: PartitionKey) -> Result<u64> {
        if self.config().fail_deletes {
            return Err(Error::warehouse(format!(
                "injected delete failure on {}",
                table.relation
            )));
        }
        self.inner.delete_partition(table, partition).await
    }

    async fn insert_chunk(&self, table: &TableRef, rows: Vec<Row>) -> Result<u64> {
        {
            let mut state = self.state.lock().expect("fault state");
            if let Some(limit) = state.config.fail_inserts_after {
                if state.inserts_seen >= limit {
                    return Err(Error::warehouse(format!(
                        "injected insert failure on {}",
                        table.relation
                    )));
                }
            }
            state.inserts_seen += 1;
        }
        self.inner.insert_chunk(table, rows).await
    }

    async fn execute(&self, statement: &Statement) -> Result<ExecuteOutcome> {
        let config = self.config();
        if let Some(delay) = config.statement_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(model) = statement_model(statement) {
            if config.failing_models.contains(model) {
                return Err(Error::warehouse(format!("injected failure in model {model}")));
            }
        }
        self.inner.execute(statement).await
    }

    async fn run_assertion(
        &self,
        relation: &str,
        assertion: &QualityAssertion,
    ) -> Result<AssertionOutcome> {
        let failing = self
            .config()
            .failing_assertions
            .iter()
            .any(|r| relation == r || relation.ends_with(&format!(".{r}")));
        if failing {
            return Err(Error::warehouse(format!(
                "injected assertion failure on {relation}"
            )));
        }
        self.inner.run_assertion(relation, assertion).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use velo_flow::record::TripRecord;
    use velo_flow::warehouse::Dataset;

    #[tokio::test]
    async fn inserts_fail_after_limit_until_healed() {
        let inner = Arc::new(InMemoryWarehouse::new());
        let table = TableRef::new("p.d.t").with_schema_of::<TripRecord>();
        inner
            .execute(&Statement::EnsureTable {
                table: table.clone(),
            })
            .await
            .unwrap();
        let faulty = FaultyWarehouse::new(Arc::clone(&inner));
        faulty.fail_inserts_after(1);

        faulty.insert_chunk(&table, vec![Row::new()]).await.unwrap();
        assert!(faulty.insert_chunk(&table, vec![Row::new()]).await.is_err());
        faulty.heal();
        faulty.insert_chunk(&table, vec![Row::new()]).await.unwrap();
        assert_eq!(inner.row_count("p.d.t").unwrap(), 2);
    }

    #[tokio::test]
    async fn failing_assertion_matches_final_segment() {
        let faulty = FaultyWarehouse::new(Arc::new(InMemoryWarehouse::new()));
        faulty.configure(FaultConfig {
            failing_assertions: HashSet::from(["fct".to_string()]),
            ..FaultConfig::default()
        });
        let relation = Dataset::new("p", "d").relation("fct");
        let err = faulty
            .run_assertion(&relation, &QualityAssertion::not_null("fct", "id"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("injected"));
    }
}
