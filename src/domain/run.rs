//! Run state and stage progression.
//!
//! A Run represents one end-to-end execution attempt of a stage sequence
//! for a given commit.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::ParseEnumError;

/// Seed recorded on every run so simulated results are reproducible
pub const RUN_SEED: u64 = 42;

/// A pipeline execution run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run (`run_<12 hex>`)
    pub id: String,

    /// Commit that triggered the run
    pub commit_sha: String,

    /// Stage currently being executed (or last executed)
    pub stage: Stage,

    /// Current status of the run
    pub status: RunStatus,

    /// When the run was created
    pub created_at: DateTime<Utc>,

    /// When the run record last changed
    pub updated_at: DateTime<Utc>,

    /// Experiment-tracking run reference, once one has been logged
    pub tracking_run_id: Option<String>,

    /// Free-form metadata
    pub metadata: Map<String, Value>,
}

impl Run {
    /// Create a new pending run
    pub fn new(id: impl Into<String>, commit_sha: impl Into<String>, stage: Stage) -> Self {
        let now = Utc::now();
        let mut metadata = Map::new();
        metadata.insert("started_at".to_string(), json!(now.to_rfc3339()));
        metadata.insert("seed".to_string(), json!(RUN_SEED));

        Self {
            id: id.into(),
            commit_sha: commit_sha.into(),
            stage,
            status: RunStatus::Pending,
            created_at: now,
            updated_at: now,
            tracking_run_id: None,
            metadata,
        }
    }

    /// Check if the run can no longer make progress
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One of the fixed ordered subsequences of steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ci,
    Cd,
    Deploy,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Ci, Stage::Cd, Stage::Deploy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ci => "ci",
            Stage::Cd => "cd",
            Stage::Deploy => "deploy",
        }
    }

    /// The stage that follows this one, if any
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Ci => Some(Stage::Cd),
            Stage::Cd => Some(Stage::Deploy),
            Stage::Deploy => None,
        }
    }

    /// This stage and every stage after it, in order
    pub fn and_later(&self) -> Vec<Stage> {
        Self::ALL.iter().copied().filter(|s| s >= self).collect()
    }

    /// Status a run reaches when this stage's sequence is exhausted
    pub fn completion_status(&self) -> RunStatus {
        match self {
            Stage::Ci => RunStatus::CiComplete,
            Stage::Cd => RunStatus::CdComplete,
            Stage::Deploy => RunStatus::Completed,
        }
    }
}

impl Default for Stage {
    fn default() -> Self {
        Self::Ci
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ci" => Ok(Stage::Ci),
            "cd" => Ok(Stage::Cd),
            "deploy" => Ok(Stage::Deploy),
            other => Err(ParseEnumError::new("stage", other)),
        }
    }
}

/// Status of a pipeline run
///
/// `pending → running → {ci_complete | cd_complete | completed | failed | rejected}`.
/// `awaiting_approval` is the persisted suspended state while a gate is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    AwaitingApproval,
    CiComplete,
    CdComplete,
    Completed,
    Failed,
    Rejected,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::AwaitingApproval => "awaiting_approval",
            RunStatus::CiComplete => "ci_complete",
            RunStatus::CdComplete => "cd_complete",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Rejected => "rejected",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses never change again; retry means a new run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Rejected | RunStatus::Cancelled
        )
    }

    /// Stage-complete statuses that an external caller may advance
    pub fn is_stage_complete(&self) -> bool {
        matches!(self, RunStatus::CiComplete | RunStatus::CdComplete)
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "awaiting_approval" => Ok(RunStatus::AwaitingApproval),
            "ci_complete" => Ok(RunStatus::CiComplete),
            "cd_complete" => Ok(RunStatus::CdComplete),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "rejected" => Ok(RunStatus::Rejected),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(ParseEnumError::new("run status", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_creation() {
        let run = Run::new("run_abc", "deadbeef", Stage::Ci);

        assert_eq!(run.id, "run_abc");
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.metadata.get("seed"), Some(&json!(42)));
        assert!(run.metadata.contains_key("started_at"));
        assert!(!run.is_finished());
    }

    #[test]
    fn test_stage_progression() {
        assert_eq!(Stage::Ci.next(), Some(Stage::Cd));
        assert_eq!(Stage::Cd.next(), Some(Stage::Deploy));
        assert_eq!(Stage::Deploy.next(), None);

        assert_eq!(Stage::Ci.and_later(), vec![Stage::Ci, Stage::Cd, Stage::Deploy]);
        assert_eq!(Stage::Cd.and_later(), vec![Stage::Cd, Stage::Deploy]);
        assert_eq!(Stage::Deploy.and_later(), vec![Stage::Deploy]);

        assert_eq!(Stage::Cd.completion_status(), RunStatus::CdComplete);
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            RunStatus::Pending,
            RunStatus::AwaitingApproval,
            RunStatus::CiComplete,
            RunStatus::Rejected,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Rejected.is_terminal());
        assert!(!RunStatus::CiComplete.is_terminal());
        assert!(RunStatus::CiComplete.is_stage_complete());
        assert!(!RunStatus::AwaitingApproval.is_terminal());
    }
}
