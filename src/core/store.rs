//! Persistent state: runs, step instances, deployments and the local
//! model registry.
//!
//! The store is the single source of truth for run and step state. The
//! SQLite implementation keeps one connection behind a mutex; every
//! multi-row change happens inside a transaction so runs and their steps
//! appear (or roll back) together.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::domain::{
    Deployment, DeploymentStatus, Environment, ModelVersion, ParseEnumError, RollbackOutcome, Run,
    RunStatus, Stage, StepRecord,
};

/// Persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An update targeted a row that does not exist
    #[error("{0} not found in store")]
    MissingRecord(String),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Storage contract used by the orchestrator and step handlers
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Insert a run and its full step set atomically
    async fn insert_run(&self, run: &Run, steps: &[StepRecord]) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError>;

    /// Most recent runs first
    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError>;

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<(), StoreError>;

    /// Move a run to another stage with a new status
    async fn update_run_stage(
        &self,
        run_id: &str,
        stage: Stage,
        status: RunStatus,
    ) -> Result<(), StoreError>;

    async fn set_tracking_run(&self, run_id: &str, tracking_run_id: &str)
        -> Result<(), StoreError>;

    /// Step instances of a run in creation (catalog) order
    async fn get_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, StoreError>;

    async fn get_step(&self, run_id: &str, step_name: &str)
        -> Result<Option<StepRecord>, StoreError>;

    /// Overwrite status, timestamps, outputs and error of a step instance
    async fn update_step(&self, step: &StepRecord) -> Result<(), StoreError>;

    /// Newest first, any status
    async fn recent_deployments(
        &self,
        environment: Environment,
        limit: usize,
    ) -> Result<Vec<Deployment>, StoreError>;

    async fn active_deployment(
        &self,
        environment: Environment,
    ) -> Result<Option<Deployment>, StoreError>;

    async fn insert_deployment(&self, deployment: &Deployment) -> Result<i64, StoreError>;

    /// Archive the active deployment of the environment and insert a new one
    async fn promote_deployment(&self, deployment: &Deployment) -> Result<i64, StoreError>;

    /// Mark `rolled_back_id` as rolled back and insert the restored deployment
    async fn apply_rollback(
        &self,
        rolled_back_id: i64,
        restored: &Deployment,
    ) -> Result<i64, StoreError>;

    /// Insert or update a registry entry; a champion entry demotes the others
    async fn insert_model_version(&self, model: &ModelVersion) -> Result<(), StoreError>;

    async fn list_models(&self, model_name: Option<&str>) -> Result<Vec<ModelVersion>, StoreError>;
}

/// Roll an environment back to its previous deployment
///
/// Returns `None` (and changes nothing) when fewer than two deployments
/// exist for the environment.
pub async fn rollback_deployment(
    store: &dyn PipelineStore,
    environment: Environment,
) -> Result<Option<RollbackOutcome>, StoreError> {
    let recent = store.recent_deployments(environment, 2).await?;
    let (current, previous) = match recent.as_slice() {
        [current, previous] => (current, previous),
        _ => return Ok(None),
    };

    let restored = Deployment::new(
        environment,
        previous.model_version.clone(),
        previous.tracking_run_id.clone(),
        "rollback",
    );
    store.apply_rollback(current.id, &restored).await?;

    Ok(Some(RollbackOutcome {
        environment,
        from_version: current.model_version.clone(),
        to_version: previous.model_version.clone(),
    }))
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id TEXT PRIMARY KEY,
    commit_sha TEXT NOT NULL,
    stage TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    tracking_run_id TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS pipeline_steps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL REFERENCES pipeline_runs(id),
    step_name TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    outputs TEXT NOT NULL DEFAULT '{}',
    error TEXT,
    UNIQUE(run_id, step_name)
);

CREATE INDEX IF NOT EXISTS idx_pipeline_steps_run ON pipeline_steps(run_id);

CREATE TABLE IF NOT EXISTS deployment_state (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    environment TEXT NOT NULL,
    model_version TEXT NOT NULL,
    tracking_run_id TEXT NOT NULL,
    deployed_at TEXT NOT NULL,
    deployed_by TEXT NOT NULL,
    status TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_deployment_env ON deployment_state(environment, deployed_at);

CREATE TABLE IF NOT EXISTS model_registry (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model_name TEXT NOT NULL,
    version TEXT NOT NULL,
    stage TEXT NOT NULL,
    tracking_run_id TEXT NOT NULL,
    commit_sha TEXT,
    is_champion INTEGER NOT NULL DEFAULT 0,
    metrics TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    promoted_at TEXT,
    UNIQUE(model_name, version)
);
"#;

const RUN_COLUMNS: &str =
    "id, commit_sha, stage, status, created_at, updated_at, tracking_run_id, metadata";
const STEP_COLUMNS: &str =
    "run_id, step_name, status, started_at, completed_at, outputs, error";
const DEPLOYMENT_COLUMNS: &str =
    "id, environment, model_version, tracking_run_id, deployed_at, deployed_by, status";
const MODEL_COLUMNS: &str = "model_name, version, stage, tracking_run_id, commit_sha, \
     is_champion, metrics, created_at, promoted_at";

/// SQLite-backed store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file, creating parent directories
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "Opened pipeline database");
        Self::init(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.lock()?;
        f(&mut conn)
    }
}

fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_time(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_optional_time(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(|value| parse_time(idx, value)).transpose()
}

fn parse_enum<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

fn parse_map(idx: usize, raw: &str) -> rusqlite::Result<Map<String, Value>> {
    serde_json::from_str(raw).map_err(|e| conversion_error(idx, e))
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        commit_sha: row.get(1)?,
        stage: parse_enum(2, &row.get::<_, String>(2)?)?,
        status: parse_enum(3, &row.get::<_, String>(3)?)?,
        created_at: parse_time(4, &row.get::<_, String>(4)?)?,
        updated_at: parse_time(5, &row.get::<_, String>(5)?)?,
        tracking_run_id: row.get(6)?,
        metadata: parse_map(7, &row.get::<_, String>(7)?)?,
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<StepRecord> {
    Ok(StepRecord {
        run_id: row.get(0)?,
        step_name: row.get(1)?,
        status: parse_enum(2, &row.get::<_, String>(2)?)?,
        started_at: parse_optional_time(3, row.get(3)?)?,
        completed_at: parse_optional_time(4, row.get(4)?)?,
        outputs: parse_map(5, &row.get::<_, String>(5)?)?,
        error: row.get(6)?,
    })
}

fn deployment_from_row(row: &Row<'_>) -> rusqlite::Result<Deployment> {
    Ok(Deployment {
        id: row.get(0)?,
        environment: parse_enum(1, &row.get::<_, String>(1)?)?,
        model_version: row.get(2)?,
        tracking_run_id: row.get(3)?,
        deployed_at: parse_time(4, &row.get::<_, String>(4)?)?,
        deployed_by: row.get(5)?,
        status: parse_enum::<DeploymentStatus>(6, &row.get::<_, String>(6)?)?,
    })
}

fn model_from_row(row: &Row<'_>) -> rusqlite::Result<ModelVersion> {
    Ok(ModelVersion {
        model_name: row.get(0)?,
        version: row.get(1)?,
        stage: row.get(2)?,
        tracking_run_id: row.get(3)?,
        commit_sha: row.get(4)?,
        is_champion: row.get(5)?,
        metrics: parse_map(6, &row.get::<_, String>(6)?)?,
        created_at: parse_time(7, &row.get::<_, String>(7)?)?,
        promoted_at: parse_optional_time(8, row.get(8)?)?,
    })
}

fn insert_deployment_row(conn: &Connection, deployment: &Deployment) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO deployment_state \
         (environment, model_version, tracking_run_id, deployed_at, deployed_by, status) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            deployment.environment.as_str(),
            deployment.model_version,
            deployment.tracking_run_id,
            timestamp(&deployment.deployed_at),
            deployment.deployed_by,
            deployment.status.as_str(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

#[async_trait]
impl PipelineStore for SqliteStore {
    async fn insert_run(&self, run: &Run, steps: &[StepRecord]) -> Result<(), StoreError> {
        let metadata = serde_json::to_string(&run.metadata)?;
        let step_outputs = steps
            .iter()
            .map(|s| serde_json::to_string(&s.outputs))
            .collect::<Result<Vec<_>, _>>()?;

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!("INSERT INTO pipeline_runs ({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    run.id,
                    run.commit_sha,
                    run.stage.as_str(),
                    run.status.as_str(),
                    timestamp(&run.created_at),
                    timestamp(&run.updated_at),
                    run.tracking_run_id,
                    metadata,
                ],
            )?;

            for (step, outputs) in steps.iter().zip(&step_outputs) {
                tx.execute(
                    &format!("INSERT INTO pipeline_steps ({STEP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                    params![
                        step.run_id,
                        step.step_name,
                        step.status.as_str(),
                        step.started_at.as_ref().map(timestamp),
                        step.completed_at.as_ref().map(timestamp),
                        outputs,
                        step.error,
                    ],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        self.with_conn(|conn| {
            let run = conn
                .query_row(
                    &format!("SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE id = ?1"),
                    params![run_id],
                    run_from_row,
                )
                .optional()?;
            Ok(run)
        })
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM pipeline_runs \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?1"
            ))?;
            let runs = stmt
                .query_map(params![limit as i64], run_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(runs)
        })
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE pipeline_runs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), timestamp(&Utc::now()), run_id],
            )?;
            if changed == 0 {
                return Err(StoreError::MissingRecord(format!("run {run_id}")));
            }
            Ok(())
        })
    }

    async fn update_run_stage(
        &self,
        run_id: &str,
        stage: Stage,
        status: RunStatus,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE pipeline_runs SET stage = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
                params![stage.as_str(), status.as_str(), timestamp(&Utc::now()), run_id],
            )?;
            if changed == 0 {
                return Err(StoreError::MissingRecord(format!("run {run_id}")));
            }
            Ok(())
        })
    }

    async fn set_tracking_run(
        &self,
        run_id: &str,
        tracking_run_id: &str,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE pipeline_runs SET tracking_run_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![tracking_run_id, timestamp(&Utc::now()), run_id],
            )?;
            if changed == 0 {
                return Err(StoreError::MissingRecord(format!("run {run_id}")));
            }
            Ok(())
        })
    }

    async fn get_steps(&self, run_id: &str) -> Result<Vec<StepRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM pipeline_steps WHERE run_id = ?1 ORDER BY id"
            ))?;
            let steps = stmt
                .query_map(params![run_id], step_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(steps)
        })
    }

    async fn get_step(
        &self,
        run_id: &str,
        step_name: &str,
    ) -> Result<Option<StepRecord>, StoreError> {
        self.with_conn(|conn| {
            let step = conn
                .query_row(
                    &format!(
                        "SELECT {STEP_COLUMNS} FROM pipeline_steps \
                         WHERE run_id = ?1 AND step_name = ?2"
                    ),
                    params![run_id, step_name],
                    step_from_row,
                )
                .optional()?;
            Ok(step)
        })
    }

    async fn update_step(&self, step: &StepRecord) -> Result<(), StoreError> {
        let outputs = serde_json::to_string(&step.outputs)?;

        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE pipeline_steps \
                 SET status = ?1, started_at = ?2, completed_at = ?3, outputs = ?4, error = ?5 \
                 WHERE run_id = ?6 AND step_name = ?7",
                params![
                    step.status.as_str(),
                    step.started_at.as_ref().map(timestamp),
                    step.completed_at.as_ref().map(timestamp),
                    outputs,
                    step.error,
                    step.run_id,
                    step.step_name,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::MissingRecord(format!(
                    "step {} of run {}",
                    step.step_name, step.run_id
                )));
            }
            Ok(())
        })
    }

    async fn recent_deployments(
        &self,
        environment: Environment,
        limit: usize,
    ) -> Result<Vec<Deployment>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DEPLOYMENT_COLUMNS} FROM deployment_state WHERE environment = ?1 \
                 ORDER BY deployed_at DESC, id DESC LIMIT ?2"
            ))?;
            let deployments = stmt
                .query_map(
                    params![environment.as_str(), limit as i64],
                    deployment_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(deployments)
        })
    }

    async fn active_deployment(
        &self,
        environment: Environment,
    ) -> Result<Option<Deployment>, StoreError> {
        self.with_conn(|conn| {
            let deployment = conn
                .query_row(
                    &format!(
                        "SELECT {DEPLOYMENT_COLUMNS} FROM deployment_state \
                         WHERE environment = ?1 AND status = 'active' \
                         ORDER BY deployed_at DESC, id DESC LIMIT 1"
                    ),
                    params![environment.as_str()],
                    deployment_from_row,
                )
                .optional()?;
            Ok(deployment)
        })
    }

    async fn insert_deployment(&self, deployment: &Deployment) -> Result<i64, StoreError> {
        self.with_conn(|conn| insert_deployment_row(conn, deployment))
    }

    async fn promote_deployment(&self, deployment: &Deployment) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE deployment_state SET status = 'archived' \
                 WHERE environment = ?1 AND status = 'active'",
                params![deployment.environment.as_str()],
            )?;
            let id = insert_deployment_row(&tx, deployment)?;
            tx.commit()?;
            Ok(id)
        })
    }

    async fn apply_rollback(
        &self,
        rolled_back_id: i64,
        restored: &Deployment,
    ) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE deployment_state SET status = 'rolled_back' WHERE id = ?1",
                params![rolled_back_id],
            )?;
            if changed == 0 {
                return Err(StoreError::MissingRecord(format!(
                    "deployment {rolled_back_id}"
                )));
            }
            // Anything else still active in the environment is superseded
            tx.execute(
                "UPDATE deployment_state SET status = 'archived' \
                 WHERE environment = ?1 AND status = 'active'",
                params![restored.environment.as_str()],
            )?;
            let id = insert_deployment_row(&tx, restored)?;
            tx.commit()?;
            Ok(id)
        })
    }

    async fn insert_model_version(&self, model: &ModelVersion) -> Result<(), StoreError> {
        let metrics = serde_json::to_string(&model.metrics)?;

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if model.is_champion {
                tx.execute(
                    "UPDATE model_registry SET is_champion = 0 WHERE model_name = ?1",
                    params![model.model_name],
                )?;
            }
            tx.execute(
                &format!(
                    "INSERT INTO model_registry ({MODEL_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                     ON CONFLICT(model_name, version) DO UPDATE SET \
                     stage = excluded.stage, is_champion = excluded.is_champion, \
                     metrics = excluded.metrics, promoted_at = excluded.promoted_at"
                ),
                params![
                    model.model_name,
                    model.version,
                    model.stage,
                    model.tracking_run_id,
                    model.commit_sha,
                    model.is_champion,
                    metrics,
                    timestamp(&model.created_at),
                    model.promoted_at.as_ref().map(timestamp),
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    async fn list_models(&self, model_name: Option<&str>) -> Result<Vec<ModelVersion>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MODEL_COLUMNS} FROM model_registry \
                 WHERE ?1 IS NULL OR model_name = ?1 \
                 ORDER BY created_at DESC, id DESC"
            ))?;
            let models = stmt
                .query_map(params![model_name], model_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(models)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StepStatus;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_run(id: &str) -> (Run, Vec<StepRecord>) {
        let run = Run::new(id, "abc123", Stage::Ci);
        let steps = ["commit_received", "ci_tests"]
            .iter()
            .map(|name| StepRecord::new(id, *name))
            .collect();
        (run, steps)
    }

    #[tokio::test]
    async fn test_run_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (run, steps) = sample_run("run_1");

        store.insert_run(&run, &steps).await.unwrap();

        let loaded = store.get_run("run_1").await.unwrap().unwrap();
        assert_eq!(loaded.commit_sha, "abc123");
        assert_eq!(loaded.status, RunStatus::Pending);
        assert_eq!(loaded.metadata.get("seed"), Some(&json!(42)));

        let loaded_steps = store.get_steps("run_1").await.unwrap();
        let names: Vec<&str> = loaded_steps.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, vec!["commit_received", "ci_tests"]);
        assert!(loaded_steps.iter().all(|s| s.status == StepStatus::Idle));
    }

    #[tokio::test]
    async fn test_duplicate_step_aborts_whole_insert() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = Run::new("run_dup", "abc123", Stage::Ci);
        let steps = vec![
            StepRecord::new("run_dup", "ci_tests"),
            StepRecord::new("run_dup", "ci_tests"),
        ];

        assert!(store.insert_run(&run, &steps).await.is_err());
        assert!(store.get_run("run_dup").await.unwrap().is_none());
        assert!(store.get_steps("run_dup").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_missing_run_is_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = store.update_run_status("run_nope", RunStatus::Failed).await;
        assert!(matches!(result, Err(StoreError::MissingRecord(_))));
    }

    #[tokio::test]
    async fn test_open_creates_parent_directories() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("pipeline.db");

        let store = SqliteStore::open(&path).unwrap();
        let (run, steps) = sample_run("run_file");
        store.insert_run(&run, &steps).await.unwrap();
        drop(store);

        let reopened = SqliteStore::open(&path).unwrap();
        assert!(reopened.get_run("run_file").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rollback_needs_two_deployments() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .promote_deployment(&Deployment::new(Environment::Production, "v1", "t1", "system"))
            .await
            .unwrap();

        let outcome = rollback_deployment(&store, Environment::Production)
            .await
            .unwrap();
        assert!(outcome.is_none());

        let recent = store
            .recent_deployments(Environment::Production, 10)
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, DeploymentStatus::Active);
    }
}
