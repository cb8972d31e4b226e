//! Transformation DAG execution.
//!
//! Nodes run as soon as every upstream node has resolved, up to
//! `max_concurrency` statements at a time. Ephemeral nodes resolve
//! immediately because compilation already inlined them. The first failing
//! node stops scheduling: statements already running finish, nothing new
//! starts, and remaining nodes are reported as aborted. Tables written
//! earlier in the run stay in place.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use velo_core::observability::model_span;

use crate::compile::{CompileContext, CompiledGraph, CompiledNode, compile};
use crate::error::{Error, Result};
use crate::metrics::PipelineMetrics;
use crate::model::{Materialization, ModelNode};
use crate::warehouse::{ExecuteOutcome, Statement, Warehouse};

/// Default number of statements run at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// How a node resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeStatus {
    /// View definition registered.
    Registered,
    /// Ephemeral body inlined into consumers.
    Inlined,
    /// Table written.
    Materialized {
        /// Rows written, if the warehouse reported them.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u64>,
    },
    /// Statement failed.
    Failed {
        /// Failure detail.
        message: String,
    },
    /// Not attempted because another node failed.
    Aborted,
}

impl NodeStatus {
    /// Returns the lowercase status name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Inlined => "inlined",
            Self::Materialized { .. } => "materialized",
            Self::Failed { .. } => "failed",
            Self::Aborted => "aborted",
        }
    }
}

/// Result of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResult {
    /// Model name.
    pub node: String,
    /// Materialization.
    pub materialization: Materialization,
    /// Outcome.
    #[serde(flatten)]
    pub status: NodeStatus,
    /// Wall time spent executing.
    pub duration_ms: u64,
}

/// Per-node results of one DAG run, in compiled order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagRunReport {
    /// Node results.
    pub results: Vec<NodeResult>,
}

impl DagRunReport {
    /// Returns the result for `node`.
    #[must_use]
    pub fn get(&self, node: &str) -> Option<&NodeResult> {
        self.results.iter().find(|r| r.node == node)
    }

    /// Returns the first failed node.
    #[must_use]
    pub fn first_failure(&self) -> Option<&NodeResult> {
        self.results
            .iter()
            .find(|r| matches!(r.status, NodeStatus::Failed { .. }))
    }

    /// Returns true if no node failed or was aborted.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.results
            .iter()
            .all(|r| !matches!(r.status, NodeStatus::Failed { .. } | NodeStatus::Aborted))
    }

    /// Converts a failed run into [`Error::Transformation`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transformation`] naming the first failed node.
    pub fn into_result(self) -> Result<Self> {
        match self.first_failure() {
            Some(NodeResult {
                node,
                status: NodeStatus::Failed { message },
                ..
            }) => Err(Error::Transformation {
                node: node.clone(),
                message: message.clone(),
            }),
            _ => Ok(self),
        }
    }
}

/// Runs compiled model graphs against a warehouse.
#[derive(Clone)]
pub struct DagExecutor {
    warehouse: Arc<dyn Warehouse>,
    max_concurrency: usize,
    metrics: PipelineMetrics,
}

impl std::fmt::Debug for DagExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagExecutor")
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}

impl DagExecutor {
    /// Creates an executor with the default concurrency.
    #[must_use]
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            warehouse,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            metrics: PipelineMetrics::new(),
        }
    }

    /// Sets the number of statements run at once.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Compiles and runs `models`.
    ///
    /// # Errors
    ///
    /// Returns compilation errors (including [`Error::CyclicGraph`]) before
    /// any statement is issued, and [`Error::Cancelled`] if `cancel` fires.
    /// Node failures are reported in the [`DagRunReport`].
    pub async fn run(
        &self,
        models: &[ModelNode],
        ctx: &CompileContext,
        cancel: &CancellationToken,
    ) -> Result<DagRunReport> {
        let graph = compile(models, ctx)?;
        self.run_compiled(&graph, cancel).await
    }

    /// Runs an already compiled graph.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if `cancel` fires. Statements still in
    /// flight are dropped.
    #[tracing::instrument(skip_all, fields(nodes = graph.len(), max_concurrency = self.max_concurrency))]
    pub async fn run_compiled(
        &self,
        graph: &CompiledGraph,
        cancel: &CancellationToken,
    ) -> Result<DagRunReport> {
        let n = graph.nodes.len();
        let position = |name: &str| graph.nodes.iter().position(|node| node.name == name);

        let mut remaining = vec![0_usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (idx, node) in graph.nodes.iter().enumerate() {
            for upstream in &node.upstream {
                let up = position(upstream).ok_or_else(|| Error::DagNodeNotFound {
                    node: upstream.clone(),
                })?;
                remaining[idx] += 1;
                dependents[up].push(idx);
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
        let mut results: Vec<Option<NodeResult>> = vec![None; n];
        let mut in_flight = FuturesUnordered::new();
        let mut halted = false;

        loop {
            while !halted && in_flight.len() < self.max_concurrency {
                let Some(idx) = ready.pop_first() else { break };
                let node = &graph.nodes[idx];
                match &node.statement {
                    None => {
                        results[idx] = Some(NodeResult {
                            node: node.name.clone(),
                            materialization: node.materialization,
                            status: NodeStatus::Inlined,
                            duration_ms: 0,
                        });
                        release(idx, &dependents, &mut remaining, &mut ready);
                    }
                    Some(statement) => in_flight.push(self.execute_node(idx, node, statement)),
                }
            }
            if in_flight.is_empty() {
                break;
            }

            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(Error::Cancelled { step: "transformation".to_string() });
                }
                next = in_flight.next() => next,
            };
            let Some((idx, outcome, elapsed)) = next else {
                break;
            };

            let node = &graph.nodes[idx];
            let status = match outcome {
                Ok(outcome) => {
                    release(idx, &dependents, &mut remaining, &mut ready);
                    match node.materialization {
                        Materialization::Table => NodeStatus::Materialized {
                            rows: outcome.rows_affected,
                        },
                        _ => NodeStatus::Registered,
                    }
                }
                Err(e) => {
                    tracing::error!(node = %node.name, error = %e, "model failed; halting");
                    halted = true;
                    NodeStatus::Failed {
                        message: e.to_string(),
                    }
                }
            };
            self.metrics
                .observe_model_duration(node.materialization.as_str(), status.as_str(), elapsed);
            tracing::info!(
                node = %node.name,
                materialization = %node.materialization,
                status = status.as_str(),
                elapsed_ms = elapsed.as_millis(),
                "model resolved"
            );
            results[idx] = Some(NodeResult {
                node: node.name.clone(),
                materialization: node.materialization,
                status,
                duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            });
        }

        let results = graph
            .nodes
            .iter()
            .zip(results)
            .map(|(node, result)| {
                result.unwrap_or_else(|| NodeResult {
                    node: node.name.clone(),
                    materialization: node.materialization,
                    status: NodeStatus::Aborted,
                    duration_ms: 0,
                })
            })
            .collect();
        Ok(DagRunReport { results })
    }

    async fn execute_node(
        &self,
        idx: usize,
        node: &CompiledNode,
        statement: &Statement,
    ) -> (usize, Result<ExecuteOutcome>, Duration) {
        let start = Instant::now();
        let outcome = self
            .warehouse
            .execute(statement)
            .instrument(model_span(&node.name, node.materialization.as_str()))
            .await;
        (idx, outcome, start.elapsed())
    }
}

fn release(
    idx: usize,
    dependents: &[Vec<usize>],
    remaining: &mut [usize],
    ready: &mut BTreeSet<usize>,
) {
    for &dependent in &dependents[idx] {
        remaining[dependent] -= 1;
        if remaining[dependent] == 0 {
            ready.insert(dependent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Layer;
    use crate::row::Row;
    use crate::warehouse::{Dataset, InMemoryWarehouse, TableSet};
    use velo_core::PartitionKey;

    fn ctx() -> CompileContext {
        CompileContext::new(Dataset::new("p", "d"), PartitionKey::new(2025, 1).unwrap())
    }

    fn constant(rows: usize) -> crate::warehouse::ModelEvaluator {
        Arc::new(move |_: &TableSet<'_>, _| {
            Ok((0..rows).map(|i| Row::new().with("i", i as i64)).collect())
        })
    }

    fn models() -> Vec<ModelNode> {
        vec![
            ModelNode::new("stg", Layer::Staging, Materialization::View, "SELECT 1"),
            ModelNode::new("int", Layer::Intermediate, Materialization::Ephemeral, "SELECT * FROM {{ ref('stg') }}")
                .depends_on(&["stg"]),
            ModelNode::new("a", Layer::Marts, Materialization::Table, "SELECT * FROM {{ ref('int') }}")
                .depends_on(&["int"]),
            ModelNode::new("b", Layer::Marts, Materialization::Table, "SELECT * FROM {{ ref('a') }}")
                .depends_on(&["a"]),
        ]
    }

    #[tokio::test]
    async fn runs_every_materialization() {
        let wh = Arc::new(InMemoryWarehouse::new());
        wh.register_evaluator("stg", constant(1)).unwrap();
        wh.register_evaluator("a", constant(3)).unwrap();
        wh.register_evaluator("b", constant(2)).unwrap();
        let executor = DagExecutor::new(wh.clone());

        let report = executor
            .run(&models(), &ctx(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.succeeded());
        assert_eq!(report.get("stg").unwrap().status, NodeStatus::Registered);
        assert_eq!(report.get("int").unwrap().status, NodeStatus::Inlined);
        assert_eq!(
            report.get("a").unwrap().status,
            NodeStatus::Materialized { rows: Some(3) }
        );
        assert_eq!(wh.views().unwrap(), vec!["p.d.stg".to_string()]);
        assert_eq!(
            wh.materialized_tables().unwrap(),
            vec!["p.d.a".to_string(), "p.d.b".to_string()]
        );
    }

    #[tokio::test]
    async fn failure_aborts_downstream_and_keeps_upstream() {
        let wh = Arc::new(InMemoryWarehouse::new());
        wh.register_evaluator("stg", constant(1)).unwrap();
        wh.register_evaluator("a", Arc::new(|_: &TableSet<'_>, _| Err(Error::warehouse("boom"))))
            .unwrap();
        let mut models = models();
        models.push(ModelNode::new("c", Layer::Marts, Materialization::Table, "SELECT 1"));
        wh.register_evaluator("c", constant(1)).unwrap();
        let executor = DagExecutor::new(wh.clone()).with_max_concurrency(1);

        let report = executor
            .run(&models, &ctx(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(report.get("a").unwrap().status, NodeStatus::Failed { .. }));
        assert_eq!(report.get("b").unwrap().status, NodeStatus::Aborted);
        assert_eq!(wh.views().unwrap().len(), 1);

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, Error::Transformation { ref node, .. } if node == "a"));
    }

    #[tokio::test]
    async fn cancellation_is_an_error() {
        let wh = Arc::new(InMemoryWarehouse::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = DagExecutor::new(wh)
            .run(&models(), &ctx(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }
}
