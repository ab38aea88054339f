//! Deploy stage handlers and the rollback step.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::adapters::ModelStage;
use crate::core::executor::{StepContext, StepHandler};
use crate::core::store::rollback_deployment;
use crate::domain::{Deployment, Environment, Message, ModelVersion, StepOutput};

use super::{output, output_str, version_label};

const SHADOW_BATCHES: u32 = 5;

pub struct DeployStaging;

#[async_trait]
impl StepHandler for DeployStaging {
    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutput> {
        ctx.info("Deploying to staging environment...").await;
        ctx.pause(500).await;

        let training = ctx.step_output("cd_full_train").await?;
        let model_version =
            output_str(training.as_ref(), "model_version").unwrap_or_else(version_label);
        let trained_run = output_str(training.as_ref(), "tracking_run_id");
        let tracking_run_id = trained_run.clone().unwrap_or_else(|| ctx.run_id.to_string());

        let deployment = Deployment::new(
            Environment::Staging,
            model_version.clone(),
            tracking_run_id.clone(),
            "system",
        );
        ctx.store
            .promote_deployment(&deployment)
            .await
            .context("Failed to record staging deployment")?;

        // Only a real tracking run has a model to register
        let registry_version = match trained_run {
            Some(run) => {
                let model = &ctx.settings.model_name;
                let version = ctx
                    .tracker
                    .register_model(model, &run)
                    .await
                    .context("Failed to register model")?;
                ctx.tracker
                    .transition_stage(model, &version, ModelStage::Staging)
                    .await
                    .context("Failed to move model to Staging")?;
                Some(version)
            }
            None => {
                ctx.warn("No training run recorded; skipping model registration")
                    .await;
                None
            }
        };

        let metrics = training
            .as_ref()
            .and_then(|t| t.get("metrics"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        ctx.store
            .insert_model_version(&ModelVersion {
                model_name: ctx.settings.model_name.clone(),
                version: model_version.clone(),
                stage: "staging".to_string(),
                tracking_run_id,
                commit_sha: Some(ctx.commit_sha.to_string()),
                is_champion: false,
                metrics,
                created_at: Utc::now(),
                promoted_at: None,
            })
            .await
            .context("Failed to record model version")?;

        ctx.events
            .send_artifact(ctx.run_id, format!("model-{model_version}"), "model", None)
            .await;
        ctx.info(format!("Deployed to staging: {model_version}")).await;

        Ok(output(json!({
            "environment": "staging",
            "model_version": model_version,
            "registry_version": registry_version,
            "deployed_at": deployment.deployed_at.to_rfc3339(),
        })))
    }
}

pub struct ShadowMonitor;

#[async_trait]
impl StepHandler for ShadowMonitor {
    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutput> {
        ctx.info("Starting shadow scoring...").await;

        for batch in 1..=SHADOW_BATCHES {
            ctx.pause(400).await;

            let psi = 0.05 + f64::from(batch) * 0.01;
            let accuracy = 0.91 - f64::from(batch) * 0.005;
            ctx.info(format!(
                "  Batch {batch}: PSI={psi:.3}, Accuracy={accuracy:.3}"
            ))
            .await;

            ctx.events
                .send_drift(json!({
                    "batch": batch,
                    "psi": psi,
                    "accuracy": accuracy,
                    "timestamp": Utc::now().to_rfc3339(),
                }))
                .await;
        }

        let drift_detected = false;
        ctx.info("Shadow scoring complete. Drift: NOT DETECTED").await;

        Ok(output(json!({
            "drift_detected": drift_detected,
            "drift_metrics": {
                "mean_psi": 0.08,
                "max_psi": 0.10,
                "mean_accuracy": 0.89,
                "samples_scored": 500,
            },
            "recommendation": "proceed",
        })))
    }
}

pub struct PromoteProd;

#[async_trait]
impl StepHandler for PromoteProd {
    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutput> {
        ctx.info("Promoting to production...").await;
        ctx.pause(500).await;

        let staging = ctx.step_output("deploy_staging").await?;
        let training = ctx.step_output("cd_full_train").await?;

        let model_version =
            output_str(staging.as_ref(), "model_version").unwrap_or_else(version_label);
        let tracking_run_id = output_str(training.as_ref(), "tracking_run_id")
            .unwrap_or_else(|| ctx.run_id.to_string());

        ctx.store
            .promote_deployment(&Deployment::new(
                Environment::Production,
                model_version.clone(),
                tracking_run_id.clone(),
                "system",
            ))
            .await
            .context("Failed to record production deployment")?;

        let mut metrics = Map::new();
        if let Some(trained) = training
            .as_ref()
            .and_then(|t| t.get("metrics"))
            .and_then(Value::as_object)
        {
            for key in ["f1_score", "auc_roc"] {
                if let Some(value) = trained.get(key) {
                    metrics.insert(key.to_string(), value.clone());
                }
            }
        }

        let now = Utc::now();
        ctx.store
            .insert_model_version(&ModelVersion {
                model_name: ctx.settings.model_name.clone(),
                version: model_version.clone(),
                stage: "production".to_string(),
                tracking_run_id,
                commit_sha: Some(ctx.commit_sha.to_string()),
                is_champion: true,
                metrics,
                created_at: now,
                promoted_at: Some(now),
            })
            .await
            .context("Failed to record champion model")?;

        if let Some(version) = output_str(staging.as_ref(), "registry_version") {
            ctx.tracker
                .transition_stage(&ctx.settings.model_name, &version, ModelStage::Production)
                .await
                .context("Failed to move model to Production")?;
        }

        ctx.info(format!("Model promoted to production: {model_version}"))
            .await;

        Ok(output(json!({
            "environment": "production",
            "model_version": model_version,
            "promoted_at": now.to_rfc3339(),
            "is_champion": true,
        })))
    }
}

pub struct Rollback;

#[async_trait]
impl StepHandler for Rollback {
    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutput> {
        ctx.info("Initiating rollback...").await;
        ctx.pause(300).await;

        let Some(outcome) = rollback_deployment(ctx.store, Environment::Production)
            .await
            .context("Failed to roll back production")?
        else {
            ctx.warn("No previous version available for rollback").await;
            return Ok(output(json!({
                "success": false,
                "reason": "No previous version",
            })));
        };

        ctx.events
            .publish_global(&Message::rollback(
                outcome.environment,
                outcome.from_version.clone(),
                outcome.to_version.clone(),
            ))
            .await;
        ctx.info(format!(
            "Rolled back from {} to {}",
            outcome.from_version, outcome.to_version
        ))
        .await;

        Ok(output(json!({
            "success": true,
            "from_version": outcome.from_version,
            "to_version": outcome.to_version,
        })))
    }
}
