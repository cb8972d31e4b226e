//! Compiles model definitions into an ordered, executable graph.
//!
//! Compilation runs before any statement reaches the warehouse. It checks
//! names and dependencies, orders models topologically (layer, then
//! declaration order, breaks ties), resolves template references, and picks
//! the statement each model executes as.
//!
//! Ephemeral models are substituted into every consumer as a parenthesised
//! subquery. Because models compile in topological order, a consumer of a
//! consumer receives the ephemeral body transitively.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use velo_core::PartitionKey;

use crate::dag::Dag;
use crate::error::{Error, Result};
use crate::model::{Layer, Materialization, ModelNode};
use crate::row::Value;
use crate::warehouse::{Dataset, Statement, quote_relation};

/// Inputs to template resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileContext {
    /// Dataset models are materialized in.
    pub dataset: Dataset,
    /// Raw tables by source name, as fully-qualified relations.
    pub sources: BTreeMap<String, String>,
    /// Month being processed.
    pub partition: PartitionKey,
}

impl CompileContext {
    /// Creates a context with no sources.
    #[must_use]
    pub fn new(dataset: Dataset, partition: PartitionKey) -> Self {
        Self {
            dataset,
            sources: BTreeMap::new(),
            partition,
        }
    }

    /// Registers a raw table under `name`.
    #[must_use]
    pub fn with_source(mut self, name: impl Into<String>, relation: impl Into<String>) -> Self {
        self.sources.insert(name.into(), relation.into());
        self
    }
}

/// A model ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledNode {
    /// Model name.
    pub name: String,
    /// Layer.
    pub layer: Layer,
    /// Materialization.
    pub materialization: Materialization,
    /// Fully-qualified relation.
    pub relation: String,
    /// SQL with every reference resolved.
    pub sql: String,
    /// Statement to execute; `None` for ephemeral models.
    pub statement: Option<Statement>,
    /// Direct upstream models.
    pub upstream: Vec<String>,
}

/// Models in execution order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledGraph {
    /// Nodes, topologically ordered.
    pub nodes: Vec<CompiledNode>,
}

impl CompiledGraph {
    /// Returns a node by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CompiledNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if there are no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Compiles `models` for one run.
///
/// # Errors
///
/// Returns [`Error::Configuration`] for duplicate names, unknown
/// dependencies, references that are not declared dependencies, unknown
/// sources, malformed templates, a dependency on a later layer, or a
/// partitioned model that is not a table. Returns [`Error::CyclicGraph`] if
/// the dependencies contain a cycle.
pub fn compile(models: &[ModelNode], ctx: &CompileContext) -> Result<CompiledGraph> {
    let mut by_name: HashMap<&str, &ModelNode> = HashMap::with_capacity(models.len());
    for model in models {
        if by_name.insert(model.name.as_str(), model).is_some() {
            return Err(Error::configuration(format!(
                "model '{}' is declared more than once",
                model.name
            )));
        }
        if model.partition_by.is_some() && model.materialization != Materialization::Table {
            return Err(Error::configuration(format!(
                "model '{}' is partitioned but materialized as {}",
                model.name, model.materialization
            )));
        }
    }
    for model in models {
        for dep in &model.depends_on {
            if !by_name.contains_key(dep.as_str()) {
                return Err(Error::configuration(format!(
                    "model '{}' depends on unknown model '{dep}'",
                    model.name
                )));
            }
        }
    }

    let mut declaration: Vec<(usize, &ModelNode)> = models.iter().enumerate().collect();
    declaration.sort_by_key(|(i, m)| (m.layer, *i));
    let mut dag: Dag<String> = Dag::new();
    for (_, model) in &declaration {
        dag.add_node(model.name.clone());
    }
    for model in models {
        let to = node_index(&dag, &model.name)?;
        for dep in &model.depends_on {
            dag.add_edge(node_index(&dag, dep)?, to)?;
        }
    }
    let order = dag.toposort()?;

    for model in models {
        for dep in &model.depends_on {
            let upstream = by_name[dep.as_str()];
            if upstream.layer > model.layer {
                return Err(Error::configuration(format!(
                    "{} model '{}' cannot depend on {} model '{dep}'",
                    model.layer, model.name, upstream.layer
                )));
            }
        }
    }

    let mut compiled: HashMap<String, CompiledNode> = HashMap::with_capacity(models.len());
    let mut nodes = Vec::with_capacity(models.len());
    for name in order {
        let model = by_name[name.as_str()];
        let sql = render(model, ctx, &compiled)?;
        let relation = ctx.dataset.relation(&model.name);
        let statement = statement_for(model, &relation, &sql, ctx.partition);
        let node = CompiledNode {
            name: model.name.clone(),
            layer: model.layer,
            materialization: model.materialization,
            relation,
            sql,
            statement,
            upstream: model.depends_on.clone(),
        };
        compiled.insert(name, node.clone());
        nodes.push(node);
    }
    Ok(CompiledGraph { nodes })
}

fn node_index(dag: &Dag<String>, name: &str) -> Result<petgraph::graph::NodeIndex> {
    dag.get_index(&name.to_string())
        .ok_or_else(|| Error::DagNodeNotFound {
            node: name.to_string(),
        })
}

fn statement_for(
    model: &ModelNode,
    relation: &str,
    sql: &str,
    partition: PartitionKey,
) -> Option<Statement> {
    match model.materialization {
        Materialization::Ephemeral => None,
        Materialization::View => Some(Statement::CreateView {
            model: model.name.clone(),
            relation: relation.to_string(),
            sql: sql.to_string(),
        }),
        Materialization::Table => Some(match &model.partition_by {
            Some(column) => Statement::MergePartition {
                model: model.name.clone(),
                relation: relation.to_string(),
                sql: sql.to_string(),
                partition_column: column.clone(),
                partition,
                cluster_by: model.cluster_by.clone(),
            },
            None => Statement::CreateTableAs {
                model: model.name.clone(),
                relation: relation.to_string(),
                sql: sql.to_string(),
                cluster_by: model.cluster_by.clone(),
            },
        }),
    }
}

/// Resolves every `{{ ... }}` expression in a model's SQL.
fn render(
    model: &ModelNode,
    ctx: &CompileContext,
    compiled: &HashMap<String, CompiledNode>,
) -> Result<String> {
    let declared: HashSet<&str> = model.depends_on.iter().map(String::as_str).collect();
    let invalid = |message: String| Error::configuration(format!("model '{}': {message}", model.name));

    let mut out = String::with_capacity(model.sql.len());
    let mut rest = model.sql.as_str();
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| invalid("unterminated '{{'".to_string()))?;
        let expr = after[..close].trim();
        rest = &after[close + 2..];

        if let Some(name) = call_arg(expr, "ref") {
            if !declared.contains(name) {
                return Err(invalid(format!(
                    "references '{name}' without declaring it in depends_on"
                )));
            }
            let upstream = compiled
                .get(name)
                .ok_or_else(|| invalid(format!("reference '{name}' is not compiled")))?;
            if upstream.materialization == Materialization::Ephemeral {
                out.push('(');
                out.push_str(&upstream.sql);
                out.push(')');
            } else {
                out.push_str(&quote_relation(&upstream.relation));
            }
        } else if let Some(name) = call_arg(expr, "source") {
            let relation = ctx
                .sources
                .get(name)
                .ok_or_else(|| invalid(format!("unknown source '{name}'")))?;
            out.push_str(&quote_relation(relation));
        } else if expr == "partition_start" {
            out.push_str(&Value::from(ctx.partition.first_day()).sql_literal());
        } else if expr == "partition_end" {
            out.push_str(&Value::from(ctx.partition.last_day()).sql_literal());
        } else {
            return Err(invalid(format!("unknown template expression '{expr}'")));
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Parses `func('arg')` or `func("arg")`.
fn call_arg<'a>(expr: &'a str, func: &str) -> Option<&'a str> {
    let inner = expr
        .strip_prefix(func)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')?
        .trim();
    inner
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CompileContext {
        CompileContext::new(Dataset::new("p", "d"), PartitionKey::new(2025, 1).unwrap())
            .with_source("trips", "p.d.trips")
    }

    fn view(name: &str, sql: &str) -> ModelNode {
        ModelNode::new(name, Layer::Staging, Materialization::View, sql)
    }

    #[test]
    fn resolves_sources_refs_and_partition_bounds() {
        let models = vec![
            view("stg_trips", "SELECT * FROM {{ source('trips') }}"),
            ModelNode::new(
                "fct",
                Layer::Marts,
                Materialization::Table,
                "SELECT * FROM {{ ref('stg_trips') }} WHERE d BETWEEN {{ partition_start }} AND {{partition_end}}",
            )
            .depends_on(&["stg_trips"])
            .partitioned_by("d"),
        ];
        let graph = compile(&models, &ctx()).unwrap();
        assert_eq!(graph.nodes[0].sql, "SELECT * FROM `p.d.trips`");
        assert_eq!(
            graph.nodes[1].sql,
            "SELECT * FROM `p.d.stg_trips` WHERE d BETWEEN DATE '2025-01-01' AND DATE '2025-01-31'"
        );
        assert!(matches!(
            graph.nodes[1].statement,
            Some(Statement::MergePartition { .. })
        ));
    }

    #[test]
    fn ephemeral_models_are_inlined_transitively() {
        let models = vec![
            ModelNode::new("mart", Layer::Marts, Materialization::Table, "SELECT * FROM {{ ref('int_b') }} x")
                .depends_on(&["int_b"]),
            ModelNode::new("int_b", Layer::Intermediate, Materialization::Ephemeral, "SELECT * FROM {{ ref('int_a') }} a")
                .depends_on(&["int_a"]),
            ModelNode::new("int_a", Layer::Intermediate, Materialization::Ephemeral, "SELECT 1 AS one"),
        ];
        let graph = compile(&models, &ctx()).unwrap();
        let names: Vec<_> = graph.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["int_a", "int_b", "mart"]);
        assert_eq!(
            graph.get("mart").unwrap().sql,
            "SELECT * FROM (SELECT * FROM (SELECT 1 AS one) a) x"
        );
        assert!(graph.get("int_a").unwrap().statement.is_none());
    }

    #[test]
    fn ties_break_by_layer_then_declaration() {
        let models = vec![
            ModelNode::new("m2", Layer::Marts, Materialization::Table, "SELECT 2"),
            view("s2", "SELECT 2"),
            ModelNode::new("m1", Layer::Marts, Materialization::Table, "SELECT 1"),
            view("s1", "SELECT 1"),
        ];
        let graph = compile(&models, &ctx()).unwrap();
        let names: Vec<_> = graph.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["s2", "s1", "m2", "m1"]);
    }

    #[test]
    fn cycle_is_reported() {
        let models = vec![
            view("a", "SELECT 1").depends_on(&["b"]),
            view("b", "SELECT 1").depends_on(&["a"]),
        ];
        let err = compile(&models, &ctx()).unwrap_err();
        assert!(matches!(err, Error::CyclicGraph { ref cycle } if cycle.len() == 3));
    }

    #[test]
    fn configuration_errors() {
        let cases = vec![
            vec![view("a", "SELECT 1"), view("a", "SELECT 2")],
            vec![view("a", "SELECT 1").depends_on(&["missing"])],
            vec![view("a", "SELECT * FROM {{ ref('b') }}"), view("b", "SELECT 1")],
            vec![view("a", "SELECT * FROM {{ source('nope') }}")],
            vec![view("a", "SELECT {{ oops }}")],
            vec![view("a", "SELECT {{ partition_start")],
            vec![
                ModelNode::new("m", Layer::Marts, Materialization::Table, "SELECT 1"),
                view("s", "SELECT 1").depends_on(&["m"]),
            ],
            vec![view("v", "SELECT 1").partitioned_by("d")],
        ];
        for models in cases {
            let err = compile(&models, &ctx()).unwrap_err();
            assert!(
                matches!(err, Error::Configuration { .. }),
                "expected configuration error, got {err:?}"
            );
        }
    }

    #[test]
    fn call_arg_accepts_both_quote_styles() {
        assert_eq!(call_arg("ref('x')", "ref"), Some("x"));
        assert_eq!(call_arg("ref( \"y\" )", "ref"), Some("y"));
        assert_eq!(call_arg("ref(z)", "ref"), None);
        assert_eq!(call_arg("source('x')", "ref"), None);
    }
}
