//! In-process experiment tracker.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use super::{ExperimentTracker, ModelStage, RegisteredVersion, RunOutcome, TrackingError};

/// A tracking run recorded in memory
#[derive(Debug, Clone, Default)]
pub struct TrackedRun {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    /// `None` while the run is open
    pub status: Option<&'static str>,
}

#[derive(Debug, Default)]
struct State {
    runs: BTreeMap<String, TrackedRun>,
    versions: Vec<RegisteredVersion>,
}

/// Tracker that keeps everything in memory
#[derive(Debug, Default)]
pub struct InMemoryTracker {
    state: Mutex<State>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of a recorded run
    pub fn run(&self, run_id: &str) -> Option<TrackedRun> {
        self.state().runs.get(run_id).cloned()
    }

    pub fn run_count(&self) -> usize {
        self.state().runs.len()
    }

    /// Every registered version, oldest first
    pub fn versions(&self) -> Vec<RegisteredVersion> {
        self.state().versions.clone()
    }
}

#[async_trait]
impl ExperimentTracker for InMemoryTracker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn start_run(
        &self,
        run_name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String, TrackingError> {
        let run_id = Uuid::new_v4().simple().to_string();
        self.state().runs.insert(
            run_id.clone(),
            TrackedRun {
                name: run_name.to_string(),
                tags: tags.clone(),
                ..TrackedRun::default()
            },
        );
        Ok(run_id)
    }

    async fn log_params(
        &self,
        run_id: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(), TrackingError> {
        let mut state = self.state();
        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| TrackingError::UnknownRun(run_id.to_string()))?;
        run.params.extend(params.clone());
        Ok(())
    }

    async fn log_metrics(
        &self,
        run_id: &str,
        metrics: &BTreeMap<String, f64>,
    ) -> Result<(), TrackingError> {
        let mut state = self.state();
        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| TrackingError::UnknownRun(run_id.to_string()))?;
        run.metrics.extend(metrics.clone());
        Ok(())
    }

    async fn end_run(&self, run_id: &str, outcome: RunOutcome) -> Result<(), TrackingError> {
        let mut state = self.state();
        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| TrackingError::UnknownRun(run_id.to_string()))?;
        run.status = Some(outcome.as_str());
        Ok(())
    }

    async fn register_model(
        &self,
        model_name: &str,
        run_id: &str,
    ) -> Result<String, TrackingError> {
        let mut state = self.state();
        if !state.runs.contains_key(run_id) {
            return Err(TrackingError::UnknownRun(run_id.to_string()));
        }

        let next = state
            .versions
            .iter()
            .filter(|v| v.model_name == model_name)
            .count()
            + 1;
        let version = next.to_string();
        state.versions.push(RegisteredVersion {
            model_name: model_name.to_string(),
            version: version.clone(),
            run_id: run_id.to_string(),
            stage: ModelStage::None,
        });
        Ok(version)
    }

    async fn transition_stage(
        &self,
        model_name: &str,
        version: &str,
        stage: ModelStage,
    ) -> Result<(), TrackingError> {
        let mut state = self.state();
        let entry = state
            .versions
            .iter_mut()
            .find(|v| v.model_name == model_name && v.version == version)
            .ok_or_else(|| TrackingError::UnknownModelVersion {
                model: model_name.to_string(),
                version: version.to_string(),
            })?;
        entry.stage = stage;
        Ok(())
    }

    async fn get_latest_version(
        &self,
        model_name: &str,
        stage: ModelStage,
    ) -> Result<Option<RegisteredVersion>, TrackingError> {
        Ok(self
            .state()
            .versions
            .iter()
            .rev()
            .find(|v| v.model_name == model_name && v.stage == stage)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_lifecycle() {
        let tracker = InMemoryTracker::new();
        let tags = BTreeMap::from([("commit_sha".to_string(), "abc123".to_string())]);

        let run_id = tracker.start_run("CI-abc123", &tags).await.unwrap();
        tracker
            .log_metrics(&run_id, &BTreeMap::from([("f1".to_string(), 0.85)]))
            .await
            .unwrap();
        tracker.end_run(&run_id, RunOutcome::Finished).await.unwrap();

        let run = tracker.run(&run_id).unwrap();
        assert_eq!(run.name, "CI-abc123");
        assert_eq!(run.metrics["f1"], 0.85);
        assert_eq!(run.status, Some("FINISHED"));
    }

    #[tokio::test]
    async fn test_unknown_run_is_error() {
        let tracker = InMemoryTracker::new();
        let result = tracker.log_params("nope", &BTreeMap::new()).await;
        assert!(matches!(result, Err(TrackingError::UnknownRun(_))));
    }

    #[tokio::test]
    async fn test_registry_versions_and_stages() {
        let tracker = InMemoryTracker::new();
        let run_id = tracker.start_run("train", &BTreeMap::new()).await.unwrap();

        let v1 = tracker.register_model("model", &run_id).await.unwrap();
        let v2 = tracker.register_model("model", &run_id).await.unwrap();
        assert_eq!((v1.as_str(), v2.as_str()), ("1", "2"));

        tracker
            .transition_stage("model", &v1, ModelStage::Production)
            .await
            .unwrap();

        let latest = tracker
            .get_latest_version("model", ModelStage::Production)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.version, "1");
        assert!(tracker
            .get_latest_version("model", ModelStage::Staging)
            .await
            .unwrap()
            .is_none());
    }
}
