//! Built-in step handlers.
//!
//! Every handler simulates its work: it emits progress on the run's
//! channel, sleeps for a (scaled) while and returns a structured output.
//! Handlers raise when their failure mode is switched on, except
//! `cd_full_train`, which degrades its metrics instead.

mod cd;
mod ci;
mod deploy;

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::core::executor::StepExecutor;
use crate::domain::StepOutput;

pub use cd::{CdFullTrain, EvaluateVsChampion, ManualApproval};
pub use ci::{CiQuickTrain, CiTests, CommitReceived, DataValidation, MlflowLogCi};
pub use deploy::{DeployStaging, PromoteProd, Rollback, ShadowMonitor};

/// Register a handler for every step of the built-in catalog
pub fn register_builtin(executor: &mut StepExecutor) {
    executor.register("commit_received", Arc::new(CommitReceived));
    executor.register("ci_tests", Arc::new(CiTests));
    executor.register("data_validation", Arc::new(DataValidation));
    executor.register("ci_quick_train", Arc::new(CiQuickTrain));
    executor.register("mlflow_log_ci", Arc::new(MlflowLogCi));
    executor.register("cd_full_train", Arc::new(CdFullTrain));
    executor.register("evaluate_vs_champion", Arc::new(EvaluateVsChampion));
    executor.register("manual_approval", Arc::new(ManualApproval));
    executor.register("deploy_staging", Arc::new(DeployStaging));
    executor.register("shadow_monitor", Arc::new(ShadowMonitor));
    executor.register("promote_prod", Arc::new(PromoteProd));
    executor.register("rollback", Arc::new(Rollback));
}

/// Turn a `json!` object into a step output
pub(crate) fn output(value: Value) -> StepOutput {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// First eight characters of a commit, for tracking run names
pub(crate) fn short_sha(commit_sha: &str) -> String {
    commit_sha.chars().take(8).collect()
}

/// Version label derived from the current time
pub(crate) fn version_label() -> String {
    format!("v{}", chrono::Utc::now().format("%Y%m%d%H%M%S%3f"))
}

/// A string field of another step's output
pub(crate) fn output_str(output: Option<&StepOutput>, key: &str) -> Option<String> {
    output
        .and_then(|o| o.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}
