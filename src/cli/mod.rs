//! Command-line interface for mlpipe.
//!
//! Provides commands for driving pipeline runs, inspecting run state,
//! toggling failure modes, and managing deployments.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::adapters::{ExperimentTracker, InMemoryTracker, MlflowTracker};
use crate::config::{self, ResolvedConfig};
use crate::core::{
    generate_run_id, Broadcaster, ChannelSubscriber, FailureMode, FailureModes, Orchestrator,
    SqliteStore, StepExecutor, StepRegistry, Subscriber, CLAIMS_STREAM,
};
use crate::domain::{Environment, Message, RunStatus, Stage};

/// mlpipe - CI/CD orchestrator for ML model promotion
#[derive(Parser, Debug)]
#[command(name = "mlpipe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a pipeline run and follow it to the end
    Run {
        /// Stage to start from (ci, cd, deploy)
        #[arg(short, long, default_value = "ci")]
        stage: Stage,

        /// Commit id (generated if not provided)
        #[arg(short, long)]
        commit: Option<String>,

        /// Enable a failure mode for this run (repeatable)
        #[arg(short, long = "fail")]
        fail: Vec<FailureMode>,

        /// Approve the approval gate without asking
        #[arg(long, conflicts_with = "reject")]
        approve: bool,

        /// Reject the approval gate with this reason
        #[arg(long)]
        reject: Option<String>,

        /// Keep going into the next stage when a stage completes
        #[arg(long)]
        through: bool,
    },

    /// Execute a single step of an existing run
    Step {
        /// Run ID
        run_id: String,

        /// Step name
        step_name: String,
    },

    /// Check the status of a run
    Status {
        /// Run ID
        run_id: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// List the step catalog
    Steps,

    /// List the available failure modes
    FailureModes,

    /// Show deployment history
    Deployments {
        /// Environment (staging, production)
        #[arg(short, long, default_value = "production")]
        environment: Environment,

        /// Maximum number of deployments to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show registered model versions
    Models {
        /// Filter by model name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Roll an environment back to its previous deployment
    Rollback {
        /// Environment (staging, production)
        #[arg(short, long, default_value = "production")]
        environment: Environment,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// What to do when a run parks at the approval gate
#[derive(Debug, Clone, PartialEq)]
enum GateDecision {
    Approve,
    Reject(String),
    Ask,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                stage,
                commit,
                fail,
                approve,
                reject,
                through,
            } => {
                let decision = match (approve, reject) {
                    (true, _) => GateDecision::Approve,
                    (false, Some(reason)) => GateDecision::Reject(reason),
                    (false, None) => GateDecision::Ask,
                };
                run_pipeline(stage, commit, &fail, decision, through).await
            }
            Commands::Step { run_id, step_name } => run_step(&run_id, &step_name).await,
            Commands::Status { run_id, json } => show_status(&run_id, json).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Steps => list_steps(),
            Commands::FailureModes => list_failure_modes(),
            Commands::Deployments { environment, limit } => {
                list_deployments(environment, limit).await
            }
            Commands::Models { name } => list_models(name.as_deref()).await,
            Commands::Rollback { environment } => rollback(environment).await,
            Commands::Config => show_config(),
        }
    }
}

/// Wire store, catalog, tracker and executor from configuration
pub fn build_orchestrator(cfg: &ResolvedConfig) -> Result<Orchestrator> {
    let store = SqliteStore::open(&cfg.database)
        .with_context(|| format!("Failed to open database: {}", cfg.database.display()))?;

    let registry = match &cfg.catalog_file {
        Some(path) => StepRegistry::from_file(path)?,
        None => StepRegistry::builtin(),
    };

    let tracker: Arc<dyn ExperimentTracker> = match &cfg.tracking_uri {
        Some(uri) => Arc::new(MlflowTracker::new(uri.clone(), cfg.experiment_name.clone())),
        None => Arc::new(InMemoryTracker::new()),
    };

    let executor = StepExecutor::new(
        Arc::new(registry),
        Arc::new(Broadcaster::new()),
        tracker,
        FailureModes::default(),
        cfg.executor_settings(),
    );

    Ok(Orchestrator::new(Arc::new(store), Arc::new(executor))?)
}

fn open_orchestrator() -> Result<Orchestrator> {
    build_orchestrator(config::config()?)
}

/// Start a run, stream its events, and settle the approval gate
async fn run_pipeline(
    stage: Stage,
    commit: Option<String>,
    failure_modes: &[FailureMode],
    decision: GateDecision,
    through: bool,
) -> Result<()> {
    let orchestrator = open_orchestrator()?;
    for mode in failure_modes {
        orchestrator.set_failure_mode(*mode, true);
    }

    // Subscribe before the run exists so no event is missed
    let run_id = generate_run_id();
    let (subscriber, rx) = ChannelSubscriber::new();
    let subscriber_id = subscriber.id();
    let subscriber: Arc<dyn Subscriber> = Arc::new(subscriber);
    let broadcaster = orchestrator.broadcaster();
    broadcaster.subscribe(&run_id, subscriber.clone());
    broadcaster.subscribe(CLAIMS_STREAM, subscriber);
    let printer = spawn_printer(rx);

    let started = orchestrator
        .start_run_with_id(run_id.clone(), commit, stage)
        .await?;
    eprintln!(
        "[Run {} started for commit {} at stage {}]",
        started.run_id, started.commit_sha, started.stage
    );

    let run = loop {
        let run = orchestrator.wait_for_run(&run_id).await?;
        match run.status {
            RunStatus::AwaitingApproval => {
                if orchestrator.pending_approval(&run_id).is_none() {
                    break run;
                }
                match settle_gate(&decision).await? {
                    GateDecision::Reject(reason) => {
                        orchestrator.reject(&run_id, &reason).await?;
                    }
                    _ => {
                        orchestrator.approve(&run_id).await?;
                    }
                }
            }
            RunStatus::CiComplete | RunStatus::CdComplete if through => {
                orchestrator.advance_run(&run_id).await?;
            }
            _ => break run,
        }
    };

    broadcaster.unsubscribe(&run_id, subscriber_id);
    broadcaster.unsubscribe(CLAIMS_STREAM, subscriber_id);
    // Printer ends once the last sender is gone
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "Event printer stopped abnormally");
    }

    match run.status {
        RunStatus::Failed | RunStatus::Rejected => {
            eprintln!("\n[Run {} {}]", run.id, run.status);
            std::process::exit(1);
        }
        status => {
            eprintln!("\n[Run {} {}]", run.id, status);
        }
    }

    Ok(())
}

/// Resolve an `Ask` decision by prompting on the terminal
async fn settle_gate(decision: &GateDecision) -> Result<GateDecision> {
    if *decision != GateDecision::Ask {
        return Ok(decision.clone());
    }

    let answer = tokio::task::spawn_blocking(|| -> io::Result<String> {
        eprint!("Approve deployment? [y/N] ");
        io::stderr().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line)
    })
    .await
    .context("Prompt task failed")?
    .context("Failed to read approval answer")?;

    Ok(match answer.trim().to_lowercase().as_str() {
        "y" | "yes" => GateDecision::Approve,
        _ => GateDecision::Reject("Rejected from the command line".to_string()),
    })
}

fn spawn_printer(mut rx: UnboundedReceiver<Message>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            println!("{}", render_message(&message));
        }
    })
}

/// One line per message
fn render_message(message: &Message) -> String {
    match message {
        Message::Log {
            timestamp,
            level,
            message,
        } => format!(
            "{} {:<5} {}",
            timestamp.format("%H:%M:%S%.3f"),
            level.as_str().to_uppercase(),
            message
        ),
        Message::Status {
            step_name,
            status,
            message,
            error,
            ..
        } => {
            let mut line = format!("  -> {step_name}: {status}");
            if let Some(text) = message {
                line.push_str(&format!(" ({text})"));
            }
            if let Some(text) = error {
                line.push_str(&format!(" [error: {text}]"));
            }
            line
        }
        Message::Run {
            run_id,
            status,
            stage,
            ..
        } => format!("== {run_id}: {status} ({stage}) =="),
        Message::Metrics { metrics, .. } => {
            let pairs: Vec<String> = metrics.iter().map(|(k, v)| format!("{k}={v}")).collect();
            format!("  metrics: {}", pairs.join(" "))
        }
        Message::Artifact {
            artifact_name,
            artifact_type,
            ..
        } => format!("  artifact: {artifact_name} ({artifact_type})"),
        Message::Claim { data, .. } => format!("  claim: {data}"),
        Message::Drift { data, .. } => format!("  drift: {data}"),
        Message::Rollback {
            environment,
            from_version,
            to_version,
            ..
        } => format!("** {environment} rolled back from {from_version} to {to_version} **"),
    }
}

/// Execute one step of an existing run
async fn run_step(run_id: &str, step_name: &str) -> Result<()> {
    let orchestrator = open_orchestrator()?;

    let (subscriber, rx) = ChannelSubscriber::new();
    let subscriber_id = subscriber.id();
    orchestrator
        .broadcaster()
        .subscribe(run_id, Arc::new(subscriber));
    let printer = spawn_printer(rx);

    let result = orchestrator.run_single_step(run_id, step_name).await;

    orchestrator.broadcaster().unsubscribe(run_id, subscriber_id);
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "Event printer stopped abnormally");
    }

    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

/// Show the status of a run
async fn show_status(run_id: &str, json: bool) -> Result<()> {
    let orchestrator = open_orchestrator()?;
    let view = orchestrator.get_status(run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let run = &view.run;
    println!("Run ID: {}", run.id);
    println!("Commit: {}", run.commit_sha);
    println!("Stage: {}", run.stage);
    println!("Status: {}", run.status);
    println!("Created: {}", run.created_at);
    println!("Updated: {}", run.updated_at);
    if let Some(tracking) = &run.tracking_run_id {
        println!("Tracking run: {}", tracking);
    }
    if view.stuck_awaiting_approval {
        println!("Approval: lost (no live approval marker for this run)");
    }
    println!("\nSteps:");
    for step in &view.steps {
        match &step.error {
            Some(error) => println!("  {:<22} {:<10} {}", step.step_name, step.status, error),
            None => println!("  {:<22} {}", step.step_name, step.status),
        }
    }

    Ok(())
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let orchestrator = open_orchestrator()?;
    let runs = orchestrator.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<18} {:<10} {:<8} {:<18} {}", "RUN ID", "COMMIT", "STAGE", "STATUS", "CREATED");
    println!("{}", "-".repeat(80));

    for summary in runs {
        let run = summary.run;
        println!(
            "{:<18} {:<10} {:<8} {:<18} {}",
            run.id,
            run.commit_sha,
            run.stage,
            run.status,
            run.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// List the step catalog
fn list_steps() -> Result<()> {
    let cfg = config::config()?;
    let registry = match &cfg.catalog_file {
        Some(path) => StepRegistry::from_file(path)?,
        None => StepRegistry::builtin(),
    };

    println!("{:<22} {:<8} {:<9} {}", "STEP", "STAGE", "APPROVAL", "DESCRIPTION");
    println!("{}", "-".repeat(80));
    for step in registry.steps() {
        println!(
            "{:<22} {:<8} {:<9} {}",
            step.name,
            step.stage,
            if step.requires_approval { "yes" } else { "" },
            step.description
        );
    }

    Ok(())
}

fn list_failure_modes() -> Result<()> {
    for mode in FailureMode::ALL {
        println!("{:<20} {} (affects {})", mode, mode.title(), mode.affected_step());
        println!("{:<20} {}", "", mode.description());
    }
    Ok(())
}

/// Show deployment history for an environment
async fn list_deployments(environment: Environment, limit: usize) -> Result<()> {
    let orchestrator = open_orchestrator()?;
    let deployments = orchestrator
        .store()
        .recent_deployments(environment, limit)
        .await?;

    if deployments.is_empty() {
        println!("No deployments to {}", environment);
        return Ok(());
    }

    println!("{:<6} {:<22} {:<12} {:<10} {}", "ID", "VERSION", "STATUS", "BY", "DEPLOYED");
    println!("{}", "-".repeat(80));
    for deployment in deployments {
        println!(
            "{:<6} {:<22} {:<12} {:<10} {}",
            deployment.id,
            deployment.model_version,
            deployment.status,
            deployment.deployed_by,
            deployment.deployed_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

async fn list_models(name: Option<&str>) -> Result<()> {
    let orchestrator = open_orchestrator()?;
    let models = orchestrator.store().list_models(name).await?;

    if models.is_empty() {
        println!("No model versions registered");
        return Ok(());
    }

    for model in models {
        let champion = if model.is_champion { " (champion)" } else { "" };
        println!(
            "{} {} [{}]{}",
            model.model_name, model.version, model.stage, champion
        );
    }

    Ok(())
}

async fn rollback(environment: Environment) -> Result<()> {
    let orchestrator = open_orchestrator()?;
    let outcome = orchestrator.rollback(environment).await?;

    println!(
        "Rolled back {} from {} to {}",
        outcome.environment, outcome.from_version, outcome.to_version
    );
    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("mlpipe configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Database: {}", cfg.database.display());
    println!(
        "  Catalog:  {}",
        cfg.catalog_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(built-in)".to_string())
    );
    println!();
    println!("Tracking:");
    println!(
        "  Server:     {}",
        cfg.tracking_uri.as_deref().unwrap_or("(in-memory)")
    );
    println!("  Experiment: {}", cfg.experiment_name);
    println!("  Model:      {}", cfg.model_name);
    println!();
    println!("Simulation latency scale: {}", cfg.latency_scale);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "mlpipe",
            "run",
            "--stage",
            "cd",
            "--fail",
            "metric_regression",
            "--fail",
            "mlflow_connection",
            "--approve",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                stage,
                fail,
                approve,
                reject,
                through,
                ..
            } => {
                assert_eq!(stage, Stage::Cd);
                assert_eq!(
                    fail,
                    vec![FailureMode::MetricRegression, FailureMode::MlflowConnection]
                );
                assert!(approve);
                assert!(reject.is_none());
                assert!(!through);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_approve_conflicts_with_reject() {
        let result = Cli::try_parse_from(["mlpipe", "run", "--approve", "--reject", "no"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_stage_rejected() {
        let result = Cli::try_parse_from(["mlpipe", "run", "--stage", "qa"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_rollback_defaults_to_production() {
        let cli = Cli::try_parse_from(["mlpipe", "rollback"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Rollback {
                environment: Environment::Production
            }
        ));
    }

    #[test]
    fn test_render_status_line() {
        let message = Message::status("data_validation", "failed")
            .with_error("Schema validation failed");
        assert_eq!(
            render_message(&message),
            "  -> data_validation: failed [error: Schema validation failed]"
        );
    }

    #[test]
    fn test_render_drift_line() {
        let message = Message::drift(json!({"batch": 1}));
        assert_eq!(render_message(&message), "  drift: {\"batch\":1}");
    }

    #[tokio::test]
    async fn test_settle_gate_passes_fixed_decisions() {
        assert_eq!(
            settle_gate(&GateDecision::Approve).await.unwrap(),
            GateDecision::Approve
        );
        let reject = GateDecision::Reject("metrics".to_string());
        assert_eq!(settle_gate(&reject).await.unwrap(), reject);
    }
}
