//! Transformation model definitions and the manifest that declares them.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::quality::QualityAssertion;

/// Model layer. Models may only depend on models of the same or an earlier layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Cleaned views over raw tables.
    Staging,
    /// Reusable intermediate logic.
    Intermediate,
    /// Reporting tables.
    Marts,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Staging => "staging",
            Self::Intermediate => "intermediate",
            Self::Marts => "marts",
        })
    }
}

/// How a model's result is realised in the warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Materialization {
    /// A queryable definition; nothing is computed at run time.
    View,
    /// Inlined into every consumer; never persisted.
    Ephemeral,
    /// Computed and persisted.
    Table,
}

impl Materialization {
    /// Returns the lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Ephemeral => "ephemeral",
            Self::Table => "table",
        }
    }
}

impl fmt::Display for Materialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transformation step.
///
/// `sql` may reference other models as `{{ ref('name') }}`, raw tables as
/// `{{ source('name') }}`, and the run's month as `{{ partition_start }}` and
/// `{{ partition_end }}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelNode {
    /// Unique model name; also the relation's table name.
    pub name: String,
    /// Layer.
    pub layer: Layer,
    /// Materialization policy.
    pub materialization: Materialization,
    /// Upstream models, in declaration order.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// SQL body.
    pub sql: String,
    /// DATE column a partitioned table mart is merged on, month by month.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_by: Option<String>,
    /// Clustering columns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_by: Vec<String>,
}

impl ModelNode {
    /// Creates a model with no dependencies.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        layer: Layer,
        materialization: Materialization,
        sql: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            layer,
            materialization,
            depends_on: Vec::new(),
            sql: sql.into(),
            partition_by: None,
            cluster_by: Vec::new(),
        }
    }

    /// Adds upstream dependencies.
    #[must_use]
    pub fn depends_on(mut self, upstream: &[&str]) -> Self {
        self.depends_on
            .extend(upstream.iter().map(ToString::to_string));
        self
    }

    /// Marks a table model as merged per month on `column`.
    #[must_use]
    pub fn partitioned_by(mut self, column: impl Into<String>) -> Self {
        self.partition_by = Some(column.into());
        self
    }

    /// Sets clustering columns.
    #[must_use]
    pub fn clustered_by(mut self, columns: &[&str]) -> Self {
        self.cluster_by = columns.iter().map(ToString::to_string).collect();
        self
    }
}

/// Models plus the assertions the quality gate evaluates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Models.
    pub models: Vec<ModelNode>,
    /// Quality assertions.
    #[serde(default)]
    pub assertions: Vec<QualityAssertion>,
}

impl Manifest {
    /// Parses and validates a manifest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the document is malformed or an
    /// assertion targets an unknown or ephemeral model.
    pub fn from_json(json: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(json)
            .map_err(|e| Error::configuration(format!("invalid model manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Reads a manifest file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the file cannot be read or is invalid.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::configuration(format!("cannot read manifest {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Checks that every assertion targets a persisted or viewable model.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the first offending assertion.
    pub fn validate(&self) -> Result<()> {
        let queryable: HashSet<&str> = self
            .models
            .iter()
            .filter(|m| m.materialization != Materialization::Ephemeral)
            .map(|m| m.name.as_str())
            .collect();
        for assertion in &self.assertions {
            if !queryable.contains(assertion.table.as_str()) {
                return Err(Error::configuration(format!(
                    "assertion {assertion} targets '{}', which is not a view or table model",
                    assertion.table
                )));
            }
        }
        Ok(())
    }
}
