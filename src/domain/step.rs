//! Step instances and their status transitions.
//!
//! A step instance belongs to exactly one run and is created together with
//! it. Transitions are checked: a step never jumps from `idle` straight to a
//! terminal status.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::ParseEnumError;

/// Output payload produced by a step
pub type StepOutput = Map<String, Value>;

/// Status of a single step instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Created, never run
    Idle,

    /// Parked at an approval gate
    Queued,

    /// Currently executing
    Running,

    /// Completed successfully
    Success,

    /// Failed (with error)
    Failed,

    /// Interrupted or deliberately not run
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Idle => "idle",
            StepStatus::Queued => "queued",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(StepStatus::Idle),
            "queued" => Ok(StepStatus::Queued),
            "running" => Ok(StepStatus::Running),
            "success" => Ok(StepStatus::Success),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            other => Err(ParseEnumError::new("step status", other)),
        }
    }
}

/// Rejected status change on a step instance
#[derive(Debug, Clone, Error)]
#[error("invalid transition for step '{step}': {from} → {to}")]
pub struct InvalidTransition {
    pub step: String,
    pub from: StepStatus,
    pub to: StepStatus,
}

/// A persisted step instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Run this step belongs to
    pub run_id: String,

    /// Catalog name of the step
    pub step_name: String,

    pub status: StepStatus,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Output map of the last execution
    pub outputs: StepOutput,

    /// Error text of the last failed execution
    pub error: Option<String>,
}

impl StepRecord {
    /// Create an idle step for a run
    pub fn new(run_id: impl Into<String>, step_name: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            step_name: step_name.into(),
            status: StepStatus::Idle,
            started_at: None,
            completed_at: None,
            outputs: StepOutput::new(),
            error: None,
        }
    }

    fn transition(&mut self, to: StepStatus, allowed: &[StepStatus]) -> Result<(), InvalidTransition> {
        if !allowed.contains(&self.status) {
            return Err(InvalidTransition {
                step: self.step_name.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Begin (or replay) execution
    pub fn mark_running(&mut self) -> Result<(), InvalidTransition> {
        self.transition(
            StepStatus::Running,
            &[
                StepStatus::Idle,
                StepStatus::Success,
                StepStatus::Failed,
                StepStatus::Skipped,
            ],
        )?;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        self.error = None;
        Ok(())
    }

    /// Park at an approval gate, keeping the handler output
    pub fn mark_queued(&mut self, outputs: StepOutput) -> Result<(), InvalidTransition> {
        self.transition(StepStatus::Queued, &[StepStatus::Running])?;
        self.outputs = outputs;
        Ok(())
    }

    /// Complete successfully; queued steps complete on approval
    pub fn mark_success(&mut self, outputs: StepOutput) -> Result<(), InvalidTransition> {
        self.transition(
            StepStatus::Success,
            &[StepStatus::Running, StepStatus::Queued],
        )?;
        self.completed_at = Some(Utc::now());
        self.outputs = outputs;
        Ok(())
    }

    /// Fail with an error; queued steps fail on rejection
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(
            StepStatus::Failed,
            &[StepStatus::Running, StepStatus::Queued],
        )?;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
        Ok(())
    }

    /// Interrupt an in-flight or parked step
    pub fn mark_skipped(&mut self) -> Result<(), InvalidTransition> {
        self.transition(
            StepStatus::Skipped,
            &[StepStatus::Running, StepStatus::Queued],
        )?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_starts_idle() {
        let step = StepRecord::new("run_1", "ci_tests");
        assert_eq!(step.status, StepStatus::Idle);
        assert!(step.started_at.is_none());
        assert!(step.outputs.is_empty());
    }

    #[test]
    fn test_idle_cannot_complete_directly() {
        let mut step = StepRecord::new("run_1", "ci_tests");

        assert!(step.mark_success(StepOutput::new()).is_err());
        assert!(step.mark_failed("boom").is_err());
        assert_eq!(step.status, StepStatus::Idle);
    }

    #[test]
    fn test_running_then_success() {
        let mut step = StepRecord::new("run_1", "ci_tests");
        step.mark_running().unwrap();
        assert!(step.started_at.is_some());

        let mut outputs = StepOutput::new();
        outputs.insert("tests_passed".to_string(), json!(26));
        step.mark_success(outputs).unwrap();

        assert_eq!(step.status, StepStatus::Success);
        assert!(step.completed_at.is_some());
        assert_eq!(step.outputs.get("tests_passed"), Some(&json!(26)));
    }

    #[test]
    fn test_gate_transitions() {
        let mut step = StepRecord::new("run_1", "manual_approval");
        step.mark_running().unwrap();
        step.mark_queued(StepOutput::new()).unwrap();

        // A parked step cannot be replayed, only resolved
        assert!(step.mark_running().is_err());

        step.mark_failed("Rejected: not good enough").unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.error.as_deref(), Some("Rejected: not good enough"));
    }

    #[test]
    fn test_replay_clears_previous_error() {
        let mut step = StepRecord::new("run_1", "data_validation");
        step.mark_running().unwrap();
        step.mark_failed("schema").unwrap();

        step.mark_running().unwrap();
        assert!(step.error.is_none());
        assert!(step.completed_at.is_none());
    }
}
