//! Step dispatch: maps a step name to its handler and runs it.
//!
//! The executor owns the failure-mode toggles and hands each handler a
//! [`StepContext`] carrying everything it may touch. It never converts a
//! handler error into persisted state; that is the orchestrator's job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, error, instrument};

use crate::adapters::ExperimentTracker;
use crate::domain::{LogLevel, StepOutput, StepStatus};

use super::broadcaster::Broadcaster;
use super::error::PipelineError;
use super::failure::{FailureMode, FailureModeSet, FailureModes};
use super::registry::StepRegistry;
use super::store::{PipelineStore, StoreError};

/// Knobs shared by every handler
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    /// Multiplier applied to simulated step latency (0 disables sleeping)
    pub latency_scale: f64,

    /// Experiment the tracking runs are logged under
    pub experiment_name: String,

    /// Registered model name
    pub model_name: String,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            latency_scale: 1.0,
            experiment_name: "claim-settlement-prediction".to_string(),
            model_name: "claim-settlement-model".to_string(),
        }
    }
}

impl ExecutorSettings {
    /// Settings with no simulated latency
    pub fn instant() -> Self {
        Self {
            latency_scale: 0.0,
            ..Self::default()
        }
    }
}

/// What a handler gets to work with during one invocation
pub struct StepContext<'a> {
    pub run_id: &'a str,
    pub commit_sha: &'a str,
    pub store: &'a dyn PipelineStore,
    pub events: &'a Broadcaster,
    pub tracker: &'a dyn ExperimentTracker,
    /// Toggles as they were when the step started
    pub failure_modes: FailureModeSet,
    pub settings: &'a ExecutorSettings,
}

impl StepContext<'_> {
    pub async fn log(&self, level: LogLevel, text: impl Into<String>) {
        self.events.send_log(self.run_id, level, text).await;
    }

    pub async fn info(&self, text: impl Into<String>) {
        self.log(LogLevel::Info, text).await;
    }

    pub async fn warn(&self, text: impl Into<String>) {
        self.log(LogLevel::Warning, text).await;
    }

    pub async fn error(&self, text: impl Into<String>) {
        self.log(LogLevel::Error, text).await;
    }

    pub async fn metrics(&self, metrics: Map<String, Value>) {
        self.events.send_metrics(self.run_id, metrics).await;
    }

    /// Simulated work, scaled by the configured latency
    pub async fn pause(&self, millis: u64) {
        let scaled = (millis as f64 * self.settings.latency_scale).max(0.0);
        if scaled >= 1.0 {
            tokio::time::sleep(Duration::from_millis(scaled as u64)).await;
        }
    }

    pub fn failure_enabled(&self, mode: FailureMode) -> bool {
        self.failure_modes.is_enabled(mode)
    }

    /// Output of another step of this run, if it completed successfully
    pub async fn step_output(&self, step_name: &str) -> Result<Option<StepOutput>, StoreError> {
        let step = self.store.get_step(self.run_id, step_name).await?;
        Ok(step
            .filter(|s| s.status == StepStatus::Success)
            .map(|s| s.outputs))
    }
}

/// Business logic of one step
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutput>;
}

/// Dispatch table from step name to handler
pub struct StepExecutor {
    registry: Arc<StepRegistry>,
    broadcaster: Arc<Broadcaster>,
    tracker: Arc<dyn ExperimentTracker>,
    failure_modes: FailureModes,
    settings: ExecutorSettings,
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl StepExecutor {
    /// Create an executor with the built-in handlers registered
    pub fn new(
        registry: Arc<StepRegistry>,
        broadcaster: Arc<Broadcaster>,
        tracker: Arc<dyn ExperimentTracker>,
        failure_modes: FailureModes,
        settings: ExecutorSettings,
    ) -> Self {
        let mut executor = Self {
            registry,
            broadcaster,
            tracker,
            failure_modes,
            settings,
            handlers: HashMap::new(),
        };
        crate::steps::register_builtin(&mut executor);
        executor
    }

    /// Register (or replace) the handler for a step
    pub fn register(&mut self, step_name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(step_name.into(), handler);
    }

    pub fn has_handler(&self, step_name: &str) -> bool {
        self.handlers.contains_key(step_name)
    }

    pub fn set_failure_mode(&self, mode: FailureMode, enabled: bool) {
        self.failure_modes.set(mode, enabled);
    }

    pub fn failure_modes(&self) -> &FailureModes {
        &self.failure_modes
    }

    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Run one step's handler and return its output
    #[instrument(skip_all, fields(step = %step_name, run_id = %run_id))]
    pub async fn execute(
        &self,
        step_name: &str,
        run_id: &str,
        commit_sha: &str,
        store: &dyn PipelineStore,
    ) -> Result<StepOutput, PipelineError> {
        let definition = self
            .registry
            .get(step_name)
            .ok_or_else(|| PipelineError::UnknownStep(step_name.to_string()))?;
        let handler = self
            .handlers
            .get(step_name)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownStep(step_name.to_string()))?;

        self.broadcaster
            .send_log(
                run_id,
                LogLevel::Info,
                format!("Starting step: {}", definition.display_name),
            )
            .await;

        let ctx = StepContext {
            run_id,
            commit_sha,
            store,
            events: &self.broadcaster,
            tracker: self.tracker.as_ref(),
            failure_modes: self.failure_modes.snapshot(),
            settings: &self.settings,
        };

        let output = handler.run(&ctx).await.map_err(|e| {
            let message = format!("{e:#}");
            error!(error = %message, "Step handler failed");
            PipelineError::StepExecution {
                step: step_name.to_string(),
                message,
            }
        })?;

        self.broadcaster
            .send_log(
                run_id,
                LogLevel::Info,
                format!("Completed step: {}", definition.display_name),
            )
            .await;
        debug!(keys = output.len(), "Step produced output");

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryTracker;
    use crate::core::broadcaster::{ChannelSubscriber, Subscriber};
    use crate::core::registry::StepDefinition;
    use crate::core::store::SqliteStore;
    use crate::domain::{Message, Stage};

    struct Echo;

    #[async_trait]
    impl StepHandler for Echo {
        async fn run(&self, ctx: &StepContext<'_>) -> anyhow::Result<StepOutput> {
            let mut out = StepOutput::new();
            out.insert("commit".to_string(), Value::String(ctx.commit_sha.to_string()));
            Ok(out)
        }
    }

    fn executor() -> StepExecutor {
        StepExecutor::new(
            Arc::new(StepRegistry::builtin()),
            Arc::new(Broadcaster::new()),
            Arc::new(InMemoryTracker::new()),
            FailureModes::default(),
            ExecutorSettings::instant(),
        )
    }

    #[test]
    fn test_every_catalog_step_has_a_handler() {
        let executor = executor();
        for step in executor.registry().steps() {
            assert!(executor.has_handler(&step.name), "{} has no handler", step.name);
        }
    }

    #[tokio::test]
    async fn test_unknown_step() {
        let executor = executor();
        let store = SqliteStore::open_in_memory().unwrap();

        let result = executor.execute("nonexistent", "run_1", "abc", &store).await;
        assert!(matches!(result, Err(PipelineError::UnknownStep(name)) if name == "nonexistent"));
    }

    #[tokio::test]
    async fn test_catalog_entry_without_handler_is_unknown() {
        let mut definitions = StepRegistry::builtin().steps().to_vec();
        definitions.push(StepDefinition {
            name: "orphan".to_string(),
            display_name: "Orphan".to_string(),
            description: String::new(),
            stage: Stage::Deploy,
            requires_approval: false,
            dependencies: vec![],
        });
        let executor = StepExecutor::new(
            Arc::new(StepRegistry::new(definitions).unwrap()),
            Arc::new(Broadcaster::new()),
            Arc::new(InMemoryTracker::new()),
            FailureModes::default(),
            ExecutorSettings::instant(),
        );
        let store = SqliteStore::open_in_memory().unwrap();

        let result = executor.execute("orphan", "run_1", "abc", &store).await;
        assert!(matches!(result, Err(PipelineError::UnknownStep(_))));
    }

    #[tokio::test]
    async fn test_registered_handler_brackets_with_logs() {
        let mut executor = executor();
        executor.register("commit_received", Arc::new(Echo));
        let store = SqliteStore::open_in_memory().unwrap();

        let (subscriber, mut rx) = ChannelSubscriber::new();
        executor
            .broadcaster()
            .subscribe("run_1", Arc::new(subscriber) as Arc<dyn Subscriber>);

        let output = executor
            .execute("commit_received", "run_1", "abc123", &store)
            .await
            .unwrap();
        assert_eq!(output["commit"], "abc123");

        let mut logs = Vec::new();
        while let Ok(Message::Log { message, .. }) = rx.try_recv() {
            logs.push(message);
        }
        assert_eq!(
            logs,
            vec![
                "Starting step: Commit/PR Received".to_string(),
                "Completed step: Commit/PR Received".to_string(),
            ]
        );
    }
}
