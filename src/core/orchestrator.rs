//! Run orchestrator.
//!
//! Turns a stage request into an ordered execution of steps. Every state
//! change is persisted first and broadcast second. Each run's stage flow is
//! an independent tokio task; the flow parks at an approval-gated step and
//! an external `approve`/`reject` call resumes or terminates the run.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    Environment, LogLevel, Message, RollbackOutcome, Run, RunStatus, Stage, StepOutput,
    StepRecord, StepStatus,
};

use super::broadcaster::Broadcaster;
use super::error::PipelineError;
use super::executor::StepExecutor;
use super::failure::FailureMode;
use super::registry::{StageSequences, StepRegistry};
use super::store::{rollback_deployment, PipelineStore};

/// Result of starting a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartedRun {
    pub run_id: String,
    pub commit_sha: String,
    pub status: RunStatus,
    pub stage: Stage,
}

/// In-memory marker for a run parked at an approval gate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingApproval {
    pub step_name: String,
    pub raised_at: DateTime<Utc>,
    /// Comparison snapshot produced by the gated step
    pub metrics: Map<String, Value>,
}

/// Outcome of an approve or reject call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Read-only projection of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunStatusView {
    pub run: Run,
    pub steps: Vec<StepRecord>,
    pub pending_approval: Option<PendingApproval>,
    /// Persisted as awaiting approval but no marker exists in this process
    pub stuck_awaiting_approval: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run: Run,
    pub pending_approval: bool,
}

/// Generate a run id (`run_` + 12 hex characters)
pub fn generate_run_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("run_{}", &id[..12])
}

/// Generate a commit id from the current time (8 hex characters)
pub fn generate_commit_sha() -> String {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
    let digest = Sha256::digest(now.as_bytes());
    hex::encode(digest)[..8].to_string()
}

/// A run's live execution task
///
/// `done` flips to true once the stage body has returned; the sender is
/// dropped without flipping when the task is aborted or panics.
struct ActiveFlow {
    handle: JoinHandle<()>,
    done: watch::Receiver<bool>,
}

impl ActiveFlow {
    fn is_running(&self) -> bool {
        self.done.has_changed().is_ok() && !*self.done.borrow()
    }
}

struct Shared {
    store: Arc<dyn PipelineStore>,
    executor: Arc<StepExecutor>,
    sequences: StageSequences,
    active_runs: DashMap<String, ActiveFlow>,
    pending_approvals: DashMap<String, PendingApproval>,
}

/// Main pipeline orchestrator
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Shared>,
}

impl Orchestrator {
    /// Create an orchestrator walking the default stage sequences
    pub fn new(
        store: Arc<dyn PipelineStore>,
        executor: Arc<StepExecutor>,
    ) -> Result<Self, PipelineError> {
        Self::with_sequences(store, executor, StageSequences::default())
    }

    /// Create an orchestrator with custom stage sequences
    pub fn with_sequences(
        store: Arc<dyn PipelineStore>,
        executor: Arc<StepExecutor>,
        sequences: StageSequences,
    ) -> Result<Self, PipelineError> {
        sequences.validate(executor.registry())?;

        Ok(Self {
            inner: Arc::new(Shared {
                store,
                executor,
                sequences,
                active_runs: DashMap::new(),
                pending_approvals: DashMap::new(),
            }),
        })
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.inner.store
    }

    pub fn executor(&self) -> &Arc<StepExecutor> {
        &self.inner.executor
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        self.inner.executor.broadcaster()
    }

    pub fn registry(&self) -> &StepRegistry {
        self.inner.executor.registry()
    }

    pub fn sequences(&self) -> &StageSequences {
        &self.inner.sequences
    }

    pub fn set_failure_mode(&self, mode: FailureMode, enabled: bool) {
        self.inner.executor.set_failure_mode(mode, enabled);
    }

    /// Start a run for a stage; returns as soon as the run is persisted
    pub async fn start_run(
        &self,
        commit_sha: Option<String>,
        stage: Stage,
    ) -> Result<StartedRun, PipelineError> {
        self.start_run_with_id(generate_run_id(), commit_sha, stage)
            .await
    }

    /// Start a run under a caller-chosen id (lets callers subscribe first)
    #[instrument(skip(self, commit_sha, stage), fields(stage = %stage))]
    pub async fn start_run_with_id(
        &self,
        run_id: String,
        commit_sha: Option<String>,
        stage: Stage,
    ) -> Result<StartedRun, PipelineError> {
        let commit_sha = commit_sha.unwrap_or_else(generate_commit_sha);
        let run = Run::new(run_id.clone(), commit_sha.clone(), stage);
        let steps: Vec<StepRecord> = self
            .registry()
            .for_stages(&stage.and_later())
            .map(|definition| StepRecord::new(run_id.clone(), definition.name.clone()))
            .collect();

        // Nothing is launched unless the run and its steps are stored
        self.inner.store.insert_run(&run, &steps).await?;
        info!(%commit_sha, steps = steps.len(), "Run created");

        self.broadcaster()
            .send_log(
                &run_id,
                LogLevel::Info,
                format!("Pipeline started for commit {commit_sha} (stage: {stage})"),
            )
            .await;

        self.launch(&run_id, stage);

        Ok(StartedRun {
            run_id,
            commit_sha,
            status: RunStatus::Pending,
            stage,
        })
    }

    /// Execute exactly one step of a run, out of order
    #[instrument(skip(self))]
    pub async fn run_single_step(
        &self,
        run_id: &str,
        step_name: &str,
    ) -> Result<StepOutput, PipelineError> {
        let run = self.load_run(run_id).await?;
        let mut step = self.load_step(run_id, step_name).await?;

        if self.is_active(run_id) {
            return Err(PipelineError::Precondition(format!(
                "run {run_id} has an active execution flow"
            )));
        }
        if run.status.is_terminal() {
            return Err(PipelineError::Precondition(format!(
                "run {run_id} is already {}",
                run.status
            )));
        }
        if matches!(step.status, StepStatus::Running | StepStatus::Queued) {
            return Err(PipelineError::Precondition(format!(
                "step {step_name} is {}",
                step.status
            )));
        }

        self.begin_step(&mut step).await?;

        match self
            .inner
            .executor
            .execute(step_name, run_id, &run.commit_sha, self.inner.store.as_ref())
            .await
        {
            Ok(output) => {
                self.complete_step(&mut step, output.clone()).await?;
                Ok(output)
            }
            Err(e) if e.is_step_level() => {
                // A failed run has nothing left to approve
                self.inner.pending_approvals.remove(run_id);
                self.fail_step(run.stage, &mut step, &e).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Approve a parked run and continue with the next stage
    #[instrument(skip(self))]
    pub async fn approve(&self, run_id: &str) -> Result<ApprovalDecision, PipelineError> {
        self.load_run(run_id).await?;
        let (_, pending) = self
            .inner
            .pending_approvals
            .remove(run_id)
            .ok_or_else(|| PipelineError::NotFound(format!("pending approval for run {run_id}")))?;

        let Some(gate_stage) = self
            .registry()
            .get(&pending.step_name)
            .map(|definition| definition.stage)
        else {
            let step_name = pending.step_name.clone();
            self.inner
                .pending_approvals
                .insert(run_id.to_string(), pending);
            return Err(PipelineError::UnknownStep(step_name));
        };

        // The parked flow may still be announcing the gate
        self.settle_flow(run_id).await;

        let closed = async {
            let mut step = self.load_step(run_id, &pending.step_name).await?;
            let mut outputs = step.outputs.clone();
            outputs.insert("approved".to_string(), json!(true));
            outputs.insert("approved_at".to_string(), json!(Utc::now().to_rfc3339()));
            step.mark_success(outputs)?;
            self.inner.store.update_step(&step).await?;
            Ok::<_, PipelineError>(step)
        }
        .await;

        let step = match closed {
            Ok(step) => step,
            Err(e) => {
                self.inner
                    .pending_approvals
                    .insert(run_id.to_string(), pending);
                return Err(e);
            }
        };

        self.broadcaster()
            .send_status(
                run_id,
                Message::status(&step.step_name, StepStatus::Success.as_str())
                    .with_message("Approved! Continuing to deployment.")
                    .with_outputs(step.outputs.clone()),
            )
            .await;
        info!(step = %step.step_name, "Approval granted");

        match gate_stage.next() {
            Some(next) => self.launch(run_id, next),
            None => {
                self.set_run_status(run_id, RunStatus::Completed, gate_stage)
                    .await?
            }
        }

        Ok(ApprovalDecision {
            approved: true,
            reason: None,
        })
    }

    /// Reject a parked run; the run ends as rejected
    #[instrument(skip(self))]
    pub async fn reject(
        &self,
        run_id: &str,
        reason: &str,
    ) -> Result<ApprovalDecision, PipelineError> {
        let run = self.load_run(run_id).await?;
        let (_, pending) = self
            .inner
            .pending_approvals
            .remove(run_id)
            .ok_or_else(|| PipelineError::NotFound(format!("pending approval for run {run_id}")))?;

        self.settle_flow(run_id).await;

        let error_text = format!("Rejected: {reason}");
        let closed = async {
            let mut step = self.load_step(run_id, &pending.step_name).await?;
            step.mark_failed(error_text.clone())?;
            step.outputs.insert("approved".to_string(), json!(false));
            step.outputs.insert("reason".to_string(), json!(reason));
            self.inner.store.update_step(&step).await?;
            Ok::<_, PipelineError>(step)
        }
        .await;

        let step = match closed {
            Ok(step) => step,
            Err(e) => {
                self.inner
                    .pending_approvals
                    .insert(run_id.to_string(), pending);
                return Err(e);
            }
        };

        self.broadcaster()
            .send_status(
                run_id,
                Message::status(&step.step_name, StepStatus::Failed.as_str())
                    .with_message(error_text.clone())
                    .with_error(error_text),
            )
            .await;
        self.set_run_status(run_id, RunStatus::Rejected, run.stage)
            .await?;
        warn!(step = %step.step_name, reason, "Approval rejected");

        Ok(ApprovalDecision {
            approved: false,
            reason: Some(reason.to_string()),
        })
    }

    /// Roll an environment back to its previous deployment
    #[instrument(skip(self))]
    pub async fn rollback(&self, environment: Environment) -> Result<RollbackOutcome, PipelineError> {
        let outcome = rollback_deployment(self.inner.store.as_ref(), environment)
            .await?
            .ok_or_else(|| {
                PipelineError::Precondition("No previous version to rollback to".to_string())
            })?;

        self.broadcaster()
            .publish_global(&Message::rollback(
                outcome.environment,
                outcome.from_version.clone(),
                outcome.to_version.clone(),
            ))
            .await;
        info!(
            from = %outcome.from_version,
            to = %outcome.to_version,
            "Rolled back"
        );

        Ok(outcome)
    }

    /// Continue a stage-complete run with the next stage
    #[instrument(skip(self))]
    pub async fn advance_run(&self, run_id: &str) -> Result<Stage, PipelineError> {
        let run = self.load_run(run_id).await?;
        if self.is_active(run_id) {
            return Err(PipelineError::Precondition(format!(
                "run {run_id} has an active execution flow"
            )));
        }

        let next = match run.status {
            RunStatus::CiComplete => Stage::Cd,
            RunStatus::CdComplete => Stage::Deploy,
            other => {
                return Err(PipelineError::Precondition(format!(
                    "run {run_id} is {other}; only ci_complete or cd_complete runs can advance"
                )))
            }
        };

        self.launch(run_id, next);
        Ok(next)
    }

    /// Stop a run; in-flight or parked steps become skipped
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: &str) -> Result<(), PipelineError> {
        let run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(PipelineError::Precondition(format!(
                "run {run_id} is already {}",
                run.status
            )));
        }

        if let Some((_, flow)) = self.inner.active_runs.remove(run_id) {
            flow.handle.abort();
            // Cancelled (or finished) either way
            let _ = flow.handle.await;
        }
        self.inner.pending_approvals.remove(run_id);

        for mut step in self.inner.store.get_steps(run_id).await? {
            if matches!(step.status, StepStatus::Running | StepStatus::Queued) {
                step.mark_skipped()?;
                self.inner.store.update_step(&step).await?;
                self.broadcaster()
                    .send_status(
                        run_id,
                        Message::status(&step.step_name, StepStatus::Skipped.as_str())
                            .with_message("Run cancelled"),
                    )
                    .await;
            }
        }

        let run = self.load_run(run_id).await?;
        self.set_run_status(run_id, RunStatus::Cancelled, run.stage)
            .await?;
        info!("Run cancelled");
        Ok(())
    }

    /// Wait for the run's current execution flow to end, then return the run
    ///
    /// The flow stays registered while it runs, so concurrent callers still
    /// see the run as active.
    pub async fn wait_for_run(&self, run_id: &str) -> Result<Run, PipelineError> {
        let done = self
            .inner
            .active_runs
            .get(run_id)
            .map(|flow| flow.done.clone());

        if let Some(mut done) = done {
            let finished = done.wait_for(|done| *done).await.is_ok();
            if !finished {
                // Aborted or panicked; cancel_run has already taken aborted flows
                let dead = self
                    .inner
                    .active_runs
                    .remove_if(run_id, |_, flow| flow.done.same_channel(&done));
                if let Some((_, flow)) = dead {
                    if let Err(e) = flow.handle.await {
                        if e.is_panic() {
                            return Err(PipelineError::TaskFailed {
                                run_id: run_id.to_string(),
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
        }
        self.load_run(run_id).await
    }

    /// Wait until the current flow's stage body has returned
    async fn settle_flow(&self, run_id: &str) {
        let done = self
            .inner
            .active_runs
            .get(run_id)
            .map(|flow| flow.done.clone());
        if let Some(mut done) = done {
            // A closed channel means the flow is gone as well
            let _ = done.wait_for(|done| *done).await;
        }
    }

    /// Run, steps and approval state of one run
    pub async fn get_status(&self, run_id: &str) -> Result<RunStatusView, PipelineError> {
        let run = self.load_run(run_id).await?;
        let steps = self.inner.store.get_steps(run_id).await?;
        let pending_approval = self.pending_approval(run_id);
        let stuck_awaiting_approval =
            run.status == RunStatus::AwaitingApproval && pending_approval.is_none();

        Ok(RunStatusView {
            run,
            steps,
            pending_approval,
            stuck_awaiting_approval,
        })
    }

    /// Most recent runs with their approval flag
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>, PipelineError> {
        let runs = self.inner.store.list_runs(limit).await?;
        Ok(runs
            .into_iter()
            .map(|run| RunSummary {
                pending_approval: self.inner.pending_approvals.contains_key(&run.id),
                run,
            })
            .collect())
    }

    pub fn pending_approval(&self, run_id: &str) -> Option<PendingApproval> {
        self.inner
            .pending_approvals
            .get(run_id)
            .map(|entry| entry.value().clone())
    }

    /// Whether an execution flow for the run is still going
    pub fn is_active(&self, run_id: &str) -> bool {
        self.inner
            .active_runs
            .get(run_id)
            .map(|flow| flow.is_running())
            .unwrap_or(false)
    }

    fn launch(&self, run_id: &str, stage: Stage) {
        let (done_tx, done_rx) = watch::channel(false);
        let this = self.clone();
        let id = run_id.to_string();
        let handle = tokio::spawn(async move {
            this.execute_stage(&id, stage).await;
            let _ = done_tx.send(true);
        });

        self.inner.active_runs.retain(|_, flow| flow.is_running());
        self.inner.active_runs.insert(
            run_id.to_string(),
            ActiveFlow {
                handle,
                done: done_rx,
            },
        );
    }

    /// Body of a run's task; never returns an error
    async fn execute_stage(&self, run_id: &str, stage: Stage) {
        if let Err(e) = self.drive_stage(run_id, stage).await {
            error!(run_id, stage = %stage, error = %e, "Stage execution aborted");
            self.broadcaster()
                .send_log(run_id, LogLevel::Error, format!("Pipeline error: {e}"))
                .await;
            if let Err(e) = self.set_run_status(run_id, RunStatus::Failed, stage).await {
                error!(run_id, error = %e, "Failed to mark run as failed");
            }
        }
    }

    #[instrument(skip(self, stage), fields(stage = %stage))]
    async fn drive_stage(&self, run_id: &str, stage: Stage) -> Result<(), PipelineError> {
        let run = self.load_run(run_id).await?;
        self.inner
            .store
            .update_run_stage(run_id, stage, RunStatus::Running)
            .await?;
        self.broadcaster()
            .publish(run_id, &Message::run(run_id, RunStatus::Running, stage))
            .await;

        for step_name in self.inner.sequences.get(stage) {
            let Some(mut step) = self.inner.store.get_step(run_id, step_name).await? else {
                warn!(step = %step_name, "No step instance for sequenced step, skipping");
                continue;
            };

            self.begin_step(&mut step).await?;

            let result = self
                .inner
                .executor
                .execute(step_name, run_id, &run.commit_sha, self.inner.store.as_ref())
                .await;

            match result {
                Ok(output) if self.registry().requires_approval(step_name) => {
                    self.park_at_gate(run_id, stage, &mut step, output).await?;
                    return Ok(());
                }
                Ok(output) => {
                    self.complete_step(&mut step, output).await?;
                }
                Err(e) if e.is_step_level() => {
                    self.fail_step(stage, &mut step, &e).await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        self.set_run_status(run_id, stage.completion_status(), stage)
            .await?;
        if stage == Stage::Ci {
            self.broadcaster()
                .send_log(run_id, LogLevel::Info, "CI stage complete. Ready for CD.")
                .await;
        }
        info!(run_id, status = %stage.completion_status(), "Stage complete");
        Ok(())
    }

    async fn begin_step(&self, step: &mut StepRecord) -> Result<(), PipelineError> {
        step.mark_running()?;
        self.inner.store.update_step(step).await?;
        self.broadcaster()
            .send_status(
                &step.run_id,
                Message::status(&step.step_name, StepStatus::Running.as_str()),
            )
            .await;
        Ok(())
    }

    async fn complete_step(
        &self,
        step: &mut StepRecord,
        output: StepOutput,
    ) -> Result<(), PipelineError> {
        step.mark_success(output)?;
        self.inner.store.update_step(step).await?;
        self.broadcaster()
            .send_status(
                &step.run_id,
                Message::status(&step.step_name, StepStatus::Success.as_str())
                    .with_outputs(step.outputs.clone()),
            )
            .await;
        Ok(())
    }

    /// Record a step error and terminate the run
    async fn fail_step(
        &self,
        stage: Stage,
        step: &mut StepRecord,
        err: &PipelineError,
    ) -> Result<(), PipelineError> {
        let message = match err {
            PipelineError::StepExecution { message, .. } => message.clone(),
            other => other.to_string(),
        };
        error!(run_id = %step.run_id, step = %step.step_name, error = %message, "Step failed");

        step.mark_failed(message.clone())?;
        self.inner.store.update_step(step).await?;
        self.broadcaster()
            .send_status(
                &step.run_id,
                Message::status(&step.step_name, StepStatus::Failed.as_str()).with_error(message),
            )
            .await;

        self.set_run_status(&step.run_id, RunStatus::Failed, stage)
            .await
    }

    async fn park_at_gate(
        &self,
        run_id: &str,
        stage: Stage,
        step: &mut StepRecord,
        output: StepOutput,
    ) -> Result<(), PipelineError> {
        let metrics = output
            .get("metrics")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        step.mark_queued(output)?;
        self.inner.store.update_step(step).await?;
        self.inner
            .store
            .update_run_status(run_id, RunStatus::AwaitingApproval)
            .await?;

        // Marker goes in before anyone hears about the gate
        self.inner.pending_approvals.insert(
            run_id.to_string(),
            PendingApproval {
                step_name: step.step_name.clone(),
                raised_at: Utc::now(),
                metrics,
            },
        );

        self.broadcaster()
            .send_status(
                run_id,
                Message::status(&step.step_name, RunStatus::AwaitingApproval.as_str())
                    .with_message("Waiting for manual approval to proceed")
                    .with_outputs(step.outputs.clone()),
            )
            .await;
        self.broadcaster()
            .publish(
                run_id,
                &Message::run(run_id, RunStatus::AwaitingApproval, stage),
            )
            .await;
        info!(run_id, step = %step.step_name, "Awaiting approval");
        Ok(())
    }

    async fn set_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        stage: Stage,
    ) -> Result<(), PipelineError> {
        self.inner.store.update_run_status(run_id, status).await?;
        self.broadcaster()
            .publish(run_id, &Message::run(run_id, status, stage))
            .await;
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<Run, PipelineError> {
        self.inner
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("run {run_id}")))
    }

    async fn load_step(&self, run_id: &str, step_name: &str) -> Result<StepRecord, PipelineError> {
        self.inner
            .store
            .get_step(run_id, step_name)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("step {step_name} of run {run_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_run_id_shape() {
        let id = generate_run_id();
        assert!(id.starts_with("run_"));
        assert_eq!(id.len(), 16);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_run_id());
    }

    #[test]
    fn test_generated_commit_shape() {
        let sha = generate_commit_sha();
        assert_eq!(sha.len(), 8);
        assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_flow_stops_running_once_done() {
        let (done_tx, done_rx) = watch::channel(false);
        let flow = ActiveFlow {
            handle: tokio::spawn(async {}),
            done: done_rx,
        };
        assert!(flow.is_running());

        done_tx.send(true).unwrap();
        assert!(!flow.is_running());
    }

    #[tokio::test]
    async fn test_dropped_flow_is_not_running() {
        let (done_tx, done_rx) = watch::channel(false);
        let flow = ActiveFlow {
            handle: tokio::spawn(async {}),
            done: done_rx,
        };
        drop(done_tx);
        assert!(!flow.is_running());
    }
}
