//! Adapter interfaces for external systems.
//!
//! The only external collaborator the engine talks to is an experiment
//! tracker with a model registry. Two implementations ship: an in-memory
//! tracker for tests and offline use, and an MLflow REST client.

pub mod memory;
pub mod mlflow;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::InMemoryTracker;
pub use mlflow::MlflowTracker;

/// Errors raised by a tracker backend
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("tracking server request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracking server returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("unexpected tracking response: {0}")]
    InvalidResponse(String),

    #[error("unknown tracking run: {0}")]
    UnknownRun(String),

    #[error("unknown model version: {model} v{version}")]
    UnknownModelVersion { model: String, version: String },
}

/// Registry stage of a model version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelStage {
    None,
    Staging,
    Production,
    Archived,
}

impl ModelStage {
    /// Name as the registry spells it
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStage::None => "None",
            ModelStage::Staging => "Staging",
            ModelStage::Production => "Production",
            ModelStage::Archived => "Archived",
        }
    }
}

impl fmt::Display for ModelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final status of a tracking run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Finished,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Finished => "FINISHED",
            RunOutcome::Failed => "FAILED",
        }
    }
}

/// A registered model version as the tracker reports it
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredVersion {
    pub model_name: String,
    pub version: String,
    pub run_id: String,
    pub stage: ModelStage,
}

/// Experiment tracking and model registry
#[async_trait]
pub trait ExperimentTracker: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Open a tracking run and return its id
    async fn start_run(
        &self,
        run_name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String, TrackingError>;

    async fn log_params(
        &self,
        run_id: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(), TrackingError>;

    async fn log_metrics(
        &self,
        run_id: &str,
        metrics: &BTreeMap<String, f64>,
    ) -> Result<(), TrackingError>;

    async fn end_run(&self, run_id: &str, outcome: RunOutcome) -> Result<(), TrackingError>;

    /// Register the model logged by a run; returns the new version
    async fn register_model(&self, model_name: &str, run_id: &str)
        -> Result<String, TrackingError>;

    async fn transition_stage(
        &self,
        model_name: &str,
        version: &str,
        stage: ModelStage,
    ) -> Result<(), TrackingError>;

    /// Latest version currently in `stage`, if any
    async fn get_latest_version(
        &self,
        model_name: &str,
        stage: ModelStage,
    ) -> Result<Option<RegisteredVersion>, TrackingError>;
}
