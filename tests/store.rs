//! Store Integration Tests
//!
//! Persistence across reopen, deployment history and the model registry.

use chrono::Utc;
use mlpipe::core::{rollback_deployment, PipelineStore, SqliteStore};
use mlpipe::domain::{
    Deployment, DeploymentStatus, Environment, ModelVersion, Run, RunStatus, Stage, StepRecord,
    StepStatus,
};
use serde_json::{json, Map};
use tempfile::TempDir;

fn model(version: &str, champion: bool) -> ModelVersion {
    let mut metrics = Map::new();
    metrics.insert("f1_score".to_string(), json!(0.89));
    ModelVersion {
        model_name: "claim-settlement-model".to_string(),
        version: version.to_string(),
        stage: if champion { "production" } else { "staging" }.to_string(),
        tracking_run_id: format!("track-{version}"),
        commit_sha: Some("abc123".to_string()),
        is_champion: champion,
        metrics,
        created_at: Utc::now(),
        promoted_at: champion.then(Utc::now),
    }
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("state").join("pipeline.db");

    {
        let store = SqliteStore::open(&path).unwrap();
        let run = Run::new("run_reopen000001", "abc123", Stage::Ci);
        let steps = vec![
            StepRecord::new("run_reopen000001", "commit_received"),
            StepRecord::new("run_reopen000001", "ci_tests"),
        ];
        store.insert_run(&run, &steps).await.unwrap();

        let mut step = steps[0].clone();
        step.mark_running().unwrap();
        let mut outputs = Map::new();
        outputs.insert("branch".to_string(), json!("main"));
        step.mark_success(outputs).unwrap();
        store.update_step(&step).await.unwrap();
        store
            .update_run_status("run_reopen000001", RunStatus::Failed)
            .await
            .unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    let run = store.get_run("run_reopen000001").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.commit_sha, "abc123");

    let steps = store.get_steps("run_reopen000001").await.unwrap();
    let names: Vec<&str> = steps.iter().map(|s| s.step_name.as_str()).collect();
    assert_eq!(names, vec!["commit_received", "ci_tests"]);
    assert_eq!(steps[0].status, StepStatus::Success);
    assert_eq!(steps[0].outputs["branch"], "main");
    assert!(steps[0].completed_at.is_some());
    assert_eq!(steps[1].status, StepStatus::Idle);
}

#[tokio::test]
async fn test_stage_update_and_tracking_run() {
    let store = SqliteStore::open_in_memory().unwrap();
    let run = Run::new("run_stage0000001", "abc123", Stage::Ci);
    store.insert_run(&run, &[]).await.unwrap();

    store
        .update_run_stage("run_stage0000001", Stage::Cd, RunStatus::Running)
        .await
        .unwrap();
    store
        .set_tracking_run("run_stage0000001", "track-1")
        .await
        .unwrap();

    let run = store.get_run("run_stage0000001").await.unwrap().unwrap();
    assert_eq!(run.stage, Stage::Cd);
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.tracking_run_id.as_deref(), Some("track-1"));
    assert!(run.updated_at >= run.created_at);
}

#[tokio::test]
async fn test_list_runs_newest_first() {
    let store = SqliteStore::open_in_memory().unwrap();
    for id in ["run_a", "run_b", "run_c"] {
        store
            .insert_run(&Run::new(id, "abc123", Stage::Ci), &[])
            .await
            .unwrap();
    }

    let runs = store.list_runs(2).await.unwrap();
    let ids: Vec<&str> = runs.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["run_c", "run_b"]);
}

#[tokio::test]
async fn test_promotion_archives_previous_active() {
    let store = SqliteStore::open_in_memory().unwrap();
    for version in ["v1", "v2"] {
        store
            .promote_deployment(&Deployment::new(Environment::Production, version, "t", "system"))
            .await
            .unwrap();
    }
    store
        .promote_deployment(&Deployment::new(Environment::Staging, "v9", "t", "system"))
        .await
        .unwrap();

    let history = store
        .recent_deployments(Environment::Production, 10)
        .await
        .unwrap();
    let summary: Vec<(&str, DeploymentStatus)> = history
        .iter()
        .map(|d| (d.model_version.as_str(), d.status))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("v2", DeploymentStatus::Active),
            ("v1", DeploymentStatus::Archived),
        ]
    );

    // Environments are independent
    let staging = store
        .active_deployment(Environment::Staging)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(staging.model_version, "v9");
}

#[tokio::test]
async fn test_rollback_marks_and_restores() {
    let store = SqliteStore::open_in_memory().unwrap();
    for version in ["v1", "v2"] {
        store
            .promote_deployment(&Deployment::new(
                Environment::Production,
                version,
                format!("track-{version}"),
                "system",
            ))
            .await
            .unwrap();
    }

    let outcome = rollback_deployment(&store, Environment::Production)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.from_version, "v2");
    assert_eq!(outcome.to_version, "v1");

    let history = store
        .recent_deployments(Environment::Production, 10)
        .await
        .unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].model_version, "v1");
    assert_eq!(history[0].status, DeploymentStatus::Active);
    assert_eq!(history[0].deployed_by, "rollback");
    assert_eq!(history[0].tracking_run_id, "track-v1");
    assert_eq!(history[1].model_version, "v2");
    assert_eq!(history[1].status, DeploymentStatus::RolledBack);

    let active: Vec<_> = history
        .iter()
        .filter(|d| d.status == DeploymentStatus::Active)
        .collect();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn test_single_champion_per_model() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.insert_model_version(&model("v1", true)).await.unwrap();
    store.insert_model_version(&model("v2", false)).await.unwrap();
    store.insert_model_version(&model("v2", true)).await.unwrap();

    let models = store
        .list_models(Some("claim-settlement-model"))
        .await
        .unwrap();
    assert_eq!(models.len(), 2);

    let champions: Vec<&str> = models
        .iter()
        .filter(|m| m.is_champion)
        .map(|m| m.version.as_str())
        .collect();
    assert_eq!(champions, vec!["v2"]);

    let upgraded = models.iter().find(|m| m.version == "v2").unwrap();
    assert_eq!(upgraded.stage, "production");
    assert!(upgraded.promoted_at.is_some());

    assert!(store.list_models(Some("other")).await.unwrap().is_empty());
}
