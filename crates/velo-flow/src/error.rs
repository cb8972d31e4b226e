//! Error types for the pipeline domain.
//!
//! Every failure a run can end in is a variant here. [`Error::disposition`]
//! separates the expected "not yet published" outcome from failures worth
//! re-invoking and from defects that need a human.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use velo_core::PartitionKey;

/// The result type used throughout velo-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// How a failure should be treated by whoever invoked the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Disposition {
    /// Expected outcome; do not alert.
    Benign,
    /// Transient; re-invoking the whole run may succeed.
    Retryable,
    /// Configuration or data defect; re-invoking will not help.
    Fatal,
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Benign => write!(f, "BENIGN"),
            Self::Retryable => write!(f, "RETRYABLE"),
            Self::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Errors that can occur in pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The month has not been published by the source yet.
    #[error("source {source_name} not ready: {reason}")]
    SourceUnavailable {
        /// Source that reported the month missing.
        source_name: String,
        /// Human-readable reason.
        reason: String,
    },

    /// Transient network, auth or server failure talking to a source.
    #[error("source {source_name} error: {message}")]
    Source {
        /// Source that failed.
        source_name: String,
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The source returned a payload that does not match the expected shape.
    #[error("source {source_name} returned malformed data: {message}")]
    SourceFormat {
        /// Source that produced the payload.
        source_name: String,
        /// What was wrong with it.
        message: String,
    },

    /// A bulk insert failed part-way.
    #[error("load into {table} failed after {rows_committed} rows: {message}")]
    Load {
        /// Target table.
        table: String,
        /// Rows committed before the failing chunk.
        rows_committed: u64,
        /// Description of the failure.
        message: String,
    },

    /// A warehouse operation other than insert failed.
    #[error("warehouse error: {message}")]
    Warehouse {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The model graph contains a cycle.
    #[error("cycle detected in model graph: {}", cycle.join(" -> "))]
    CyclicGraph {
        /// Models participating in the cycle.
        cycle: Vec<String>,
    },

    /// A model failed to execute.
    #[error("transformation of {node} failed: {message}")]
    Transformation {
        /// The failing model.
        node: String,
        /// Description of the failure.
        message: String,
    },

    /// One or more quality assertions failed.
    #[error("quality gate failed: {failed} of {total} assertions failed")]
    QualityGateFailure {
        /// Number of failed assertions.
        failed: usize,
        /// Number of evaluated assertions.
        total: usize,
    },

    /// Invalid configuration or manifest.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// The run was cancelled by its caller.
    #[error("cancelled during {step}")]
    Cancelled {
        /// The step that was interrupted.
        step: String,
    },

    /// A step exceeded its time budget.
    #[error("step {step} timed out after {}s", timeout.as_secs())]
    TimedOut {
        /// The step that timed out.
        step: String,
        /// The budget it exceeded.
        timeout: Duration,
    },

    /// Another run holds the partition's lock.
    #[error("partition {partition} is locked by {holder}")]
    PartitionLocked {
        /// The contended partition.
        partition: PartitionKey,
        /// Current lock holder.
        holder: String,
    },

    /// The run's partition lock expired and another holder took it.
    #[error("lost lock on partition {partition} held as {holder}")]
    LockLost {
        /// The partition whose lock was lost.
        partition: PartitionKey,
        /// The holder ID this run acquired under.
        holder: String,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A DAG node was not found (internal graph operation error).
    #[error("DAG node not found: {node}")]
    DagNodeNotFound {
        /// The node identifier (index or value).
        node: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// The run ledger could not be read or written.
    #[error("ledger error: {message}")]
    Ledger {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An error from velo-core.
    #[error("core error: {0}")]
    Core(#[from] velo_core::Error),
}

impl Error {
    /// Creates a transient source error.
    #[must_use]
    pub fn source_error(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Source {
            source_name: source_name.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Creates a transient source error with a cause.
    #[must_use]
    pub fn source_error_with_cause(
        source_name: impl Into<String>,
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Source {
            source_name: source_name.into(),
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// Creates a source format error.
    #[must_use]
    pub fn source_format(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SourceFormat {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Creates a warehouse error.
    #[must_use]
    pub fn warehouse(message: impl Into<String>) -> Self {
        Self::Warehouse {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a warehouse error with a cause.
    #[must_use]
    pub fn warehouse_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Warehouse {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a ledger error with a cause.
    #[must_use]
    pub fn ledger_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Ledger {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Classifies the error for alerting and retry decisions.
    #[must_use]
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::SourceUnavailable { .. } => Disposition::Benign,
            Self::Source { .. }
            | Self::Load { .. }
            | Self::Warehouse { .. }
            | Self::Transformation { .. }
            | Self::Cancelled { .. }
            | Self::TimedOut { .. }
            | Self::PartitionLocked { .. }
            | Self::LockLost { .. }
            | Self::Ledger { .. } => Disposition::Retryable,
            Self::SourceFormat { .. }
            | Self::CyclicGraph { .. }
            | Self::QualityGateFailure { .. }
            | Self::Configuration { .. }
            | Self::InvalidStateTransition { .. }
            | Self::DagNodeNotFound { .. }
            | Self::Serialization { .. } => Disposition::Fatal,
            Self::Core(inner) => match inner {
                velo_core::Error::Storage { .. } => Disposition::Retryable,
                _ => Disposition::Fatal,
            },
        }
    }

    /// Returns a stable, machine-readable name for the error kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "SOURCE_UNAVAILABLE",
            Self::Source { .. } => "SOURCE_ERROR",
            Self::SourceFormat { .. } => "SOURCE_FORMAT_ERROR",
            Self::Load { .. } => "LOAD_ERROR",
            Self::Warehouse { .. } => "WAREHOUSE_ERROR",
            Self::CyclicGraph { .. } => "CYCLIC_GRAPH_ERROR",
            Self::Transformation { .. } => "TRANSFORMATION_ERROR",
            Self::QualityGateFailure { .. } => "QUALITY_GATE_FAILURE",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::Cancelled { .. } => "CANCELLED",
            Self::TimedOut { .. } => "TIMED_OUT",
            Self::PartitionLocked { .. } => "PARTITION_LOCKED",
            Self::LockLost { .. } => "LOCK_LOST",
            Self::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            Self::DagNodeNotFound { .. } => "DAG_NODE_NOT_FOUND",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::Ledger { .. } => "LEDGER_ERROR",
            Self::Core(_) => "CORE_ERROR",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn cycle_error_display_lists_path() {
        let err = Error::CyclicGraph {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cycle detected in model graph: a -> b -> a");
        assert_eq!(err.disposition(), Disposition::Fatal);
    }

    #[test]
    fn source_unavailable_is_benign() {
        let err = Error::SourceUnavailable {
            source_name: "citibike".into(),
            reason: "archive for 2025-06 not published".into(),
        };
        assert_eq!(err.disposition(), Disposition::Benign);
        assert_eq!(err.kind(), "SOURCE_UNAVAILABLE");
    }

    #[test]
    fn transient_errors_are_retryable() {
        let load = Error::Load {
            table: "trips".into(),
            rows_committed: 20_000,
            message: "quota exceeded".into(),
        };
        assert_eq!(load.disposition(), Disposition::Retryable);
        assert!(load.to_string().contains("after 20000 rows"));

        let transform = Error::Transformation {
            node: "fct_trips".into(),
            message: "boom".into(),
        };
        assert_eq!(transform.disposition(), Disposition::Retryable);
    }

    #[test]
    fn format_errors_are_fatal() {
        let err = Error::source_format("open-meteo", "hourly arrays differ in length");
        assert_eq!(err.disposition(), Disposition::Fatal);
    }

    #[test]
    fn state_transition_error_display() {
        let err = Error::InvalidStateTransition {
            from: "SUCCEEDED".into(),
            to: "LOADING_TRIPS".into(),
            reason: "run is terminal".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("SUCCEEDED"));
        assert!(msg.contains("LOADING_TRIPS"));
    }

    #[test]
    fn source_error_with_cause() {
        let cause = std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timeout");
        let err = Error::source_error_with_cause("citibike", "HEAD request failed", cause);
        assert!(err.to_string().contains("citibike"));
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn core_storage_errors_are_retryable() {
        let err: Error = velo_core::Error::storage("lock dir unreadable").into();
        assert_eq!(err.disposition(), Disposition::Retryable);
    }
}
