//! Pipeline run records.
//!
//! A [`PipelineRun`] is created when orchestration starts, advanced step by
//! step by the orchestrator, and frozen once it reaches a terminal step. The
//! frozen record is the audit trail appended to the run ledger.
//!
//! ```text
//! CHECKING_AVAILABILITY -> FETCHING_TRIPS -> LOADING_TRIPS -> FETCHING_WEATHER
//!     -> LOADING_WEATHER -> TRANSFORMING -> QUALITY_GATING -> SUCCEEDED
//!
//! any non-terminal step -> FAILED
//! LOADING_WEATHER -> SUCCEEDED            (transformations skipped)
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use velo_core::{PartitionKey, RunId};

use crate::error::{Disposition, Error, Result};
use crate::executor::DagRunReport;
use crate::quality::GateReport;
use crate::reload::ReloadOutcome;

/// Pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStep {
    /// Probing both sources.
    CheckingAvailability,
    /// Requesting the trip archive.
    FetchingTrips,
    /// Reloading the trips partition.
    LoadingTrips,
    /// Requesting hourly weather.
    FetchingWeather,
    /// Reloading the weather partition.
    LoadingWeather,
    /// Running the model DAG.
    Transforming,
    /// Evaluating quality assertions.
    QualityGating,
    /// Completed successfully.
    Succeeded,
    /// Stopped on an error.
    Failed,
}

impl PipelineStep {
    /// Returns true for [`PipelineStep::Succeeded`] and [`PipelineStep::Failed`].
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns the step that follows on success.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self {
            Self::CheckingAvailability => Some(Self::FetchingTrips),
            Self::FetchingTrips => Some(Self::LoadingTrips),
            Self::LoadingTrips => Some(Self::FetchingWeather),
            Self::FetchingWeather => Some(Self::LoadingWeather),
            Self::LoadingWeather => Some(Self::Transforming),
            Self::Transforming => Some(Self::QualityGating),
            Self::QualityGating => Some(Self::Succeeded),
            Self::Succeeded | Self::Failed => None,
        }
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        target == Self::Failed
            || self.next() == Some(target)
            || (*self == Self::LoadingWeather && target == Self::Succeeded)
    }

    /// Returns the SCREAMING_SNAKE_CASE name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CheckingAvailability => "CHECKING_AVAILABILITY",
            Self::FetchingTrips => "FETCHING_TRIPS",
            Self::LoadingTrips => "LOADING_TRIPS",
            Self::FetchingWeather => "FETCHING_WEATHER",
            Self::LoadingWeather => "LOADING_WEATHER",
            Self::Transforming => "TRANSFORMING",
            Self::QualityGating => "QUALITY_GATING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    /// Started by an operator.
    #[default]
    Manual,
    /// Started by the monthly schedule.
    Scheduled,
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Scheduled => write!(f, "scheduled"),
        }
    }
}

impl FromStr for RunTrigger {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            other => Err(Error::configuration(format!("unknown run trigger '{other}'"))),
        }
    }
}

/// Entry into a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEntry {
    /// Step entered.
    pub step: PipelineStep,
    /// When it was entered.
    pub entered_at: DateTime<Utc>,
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
    /// Step the error originated in.
    pub step: PipelineStep,
    /// Machine-readable error kind.
    pub kind: String,
    /// Human-readable detail.
    pub message: String,
    /// Alerting and retry class.
    pub disposition: Disposition,
}

/// Loads, transformations and assertions performed by a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Trips reload counts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trips: Option<ReloadOutcome>,
    /// Weather reload counts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather: Option<ReloadOutcome>,
    /// Per-model results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformations: Option<DagRunReport>,
    /// Per-assertion results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<GateReport>,
}

/// One orchestration of one month.
///
/// Step and failure state change only through [`PipelineRun::transition_to`]
/// and [`PipelineRun::fail`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    id: RunId,
    partition: PartitionKey,
    trigger: RunTrigger,
    step: PipelineStep,
    history: Vec<StepEntry>,
    started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<RunFailure>,
    #[serde(default)]
    summary: RunSummary,
}

impl PipelineRun {
    /// Starts a run in [`PipelineStep::CheckingAvailability`].
    #[must_use]
    pub fn new(partition: PartitionKey, trigger: RunTrigger) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::generate(),
            partition,
            trigger,
            step: PipelineStep::CheckingAvailability,
            history: vec![StepEntry {
                step: PipelineStep::CheckingAvailability,
                entered_at: now,
            }],
            started_at: now,
            completed_at: None,
            failure: None,
            summary: RunSummary::default(),
        }
    }

    /// Returns the run identifier.
    #[must_use]
    pub const fn id(&self) -> RunId {
        self.id
    }

    /// Returns the month processed.
    #[must_use]
    pub const fn partition(&self) -> PartitionKey {
        self.partition
    }

    /// Returns what started the run.
    #[must_use]
    pub const fn trigger(&self) -> RunTrigger {
        self.trigger
    }

    /// Returns the current step.
    #[must_use]
    pub const fn step(&self) -> PipelineStep {
        self.step
    }

    /// Returns the steps entered, in order.
    #[must_use]
    pub fn history(&self) -> &[StepEntry] {
        &self.history
    }

    /// Returns the start time.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Returns the completion time, once terminal.
    #[must_use]
    pub const fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Returns the failure detail of a failed run.
    #[must_use]
    pub const fn failure(&self) -> Option<&RunFailure> {
        self.failure.as_ref()
    }

    /// Returns the work performed so far.
    #[must_use]
    pub const fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Returns the work summary for recording step results.
    pub fn summary_mut(&mut self) -> &mut RunSummary {
        &mut self.summary
    }

    /// Returns true once the run has succeeded or failed.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.step.is_terminal()
    }

    /// Returns true if the run succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.step == PipelineStep::Succeeded
    }

    /// Returns true if the run failed for an expected, non-alerting reason.
    #[must_use]
    pub fn is_benign_failure(&self) -> bool {
        self.failure
            .as_ref()
            .is_some_and(|f| f.disposition == Disposition::Benign)
    }

    /// Returns the wall time from start to completion.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }

    /// Advances to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the transition is not
    /// allowed, including any transition out of a terminal step.
    #[tracing::instrument(skip(self), fields(run_id = %self.id, from = %self.step, to = %target))]
    pub fn transition_to(&mut self, target: PipelineStep) -> Result<()> {
        if !self.step.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.step.to_string(),
                to: target.to_string(),
                reason: if self.step.is_terminal() {
                    "run is already terminal".into()
                } else {
                    "steps advance in order".into()
                },
            });
        }
        let now = Utc::now();
        self.step = target;
        self.history.push(StepEntry {
            step: target,
            entered_at: now,
        });
        if target.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Records `error` against the current step and moves to [`PipelineStep::Failed`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the run is already terminal.
    pub fn fail(&mut self, error: &Error) -> Result<()> {
        let step = self.step;
        self.transition_to(PipelineStep::Failed)?;
        self.failure = Some(RunFailure {
            step,
            kind: error.kind().to_string(),
            message: error.to_string(),
            disposition: error.disposition(),
        });
        Ok(())
    }
}
