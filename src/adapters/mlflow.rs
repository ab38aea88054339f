//! MLflow tracking server adapter (REST API 2.0).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::RequestBuilder;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::debug;

use super::{ExperimentTracker, ModelStage, RegisteredVersion, RunOutcome, TrackingError};

/// MLflow REST client bound to one experiment
pub struct MlflowTracker {
    /// Tracking server base URL, without trailing slash
    base_url: String,
    experiment_name: String,
    /// Resolved (or created) on first use
    experiment_id: OnceCell<String>,
    client: reqwest::Client,
}

impl MlflowTracker {
    pub fn new(base_url: impl Into<String>, experiment_name: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            experiment_name: experiment_name.into(),
            experiment_id: OnceCell::new(),
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/api/2.0/mlflow/{}", self.base_url, endpoint)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value, TrackingError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(TrackingError::Api {
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&body).map_err(|e| TrackingError::InvalidResponse(e.to_string()))
    }

    async fn post(&self, endpoint: &str, body: Value) -> Result<Value, TrackingError> {
        debug!(endpoint, "MLflow request");
        self.send(self.client.post(self.api_url(endpoint)).json(&body))
            .await
    }

    async fn experiment_id(&self) -> Result<&str, TrackingError> {
        let id = self
            .experiment_id
            .get_or_try_init(|| async {
                let lookup = self
                    .send(
                        self.client
                            .get(self.api_url("experiments/get-by-name"))
                            .query(&[("experiment_name", self.experiment_name.as_str())]),
                    )
                    .await;

                match lookup {
                    Ok(body) => string_at(&body, "/experiment/experiment_id"),
                    Err(TrackingError::Api { status: 404, .. }) => {
                        let created = self
                            .post("experiments/create", json!({ "name": self.experiment_name }))
                            .await?;
                        string_at(&created, "/experiment_id")
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;
        Ok(id.as_str())
    }
}

/// Read a string (or number) at a JSON pointer
fn string_at(value: &Value, pointer: &str) -> Result<String, TrackingError> {
    match value.pointer(pointer) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(TrackingError::InvalidResponse(format!(
            "missing field {pointer}"
        ))),
    }
}

fn parse_stage(raw: &str) -> ModelStage {
    match raw {
        "Staging" => ModelStage::Staging,
        "Production" => ModelStage::Production,
        "Archived" => ModelStage::Archived,
        _ => ModelStage::None,
    }
}

#[async_trait]
impl ExperimentTracker for MlflowTracker {
    fn name(&self) -> &str {
        "mlflow"
    }

    async fn start_run(
        &self,
        run_name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String, TrackingError> {
        let experiment_id = self.experiment_id().await?;
        let tags: Vec<Value> = tags
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();

        let body = self
            .post(
                "runs/create",
                json!({
                    "experiment_id": experiment_id,
                    "run_name": run_name,
                    "start_time": Utc::now().timestamp_millis(),
                    "tags": tags,
                }),
            )
            .await?;
        string_at(&body, "/run/info/run_id")
    }

    async fn log_params(
        &self,
        run_id: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(), TrackingError> {
        let params: Vec<Value> = params
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();
        self.post("runs/log-batch", json!({ "run_id": run_id, "params": params }))
            .await?;
        Ok(())
    }

    async fn log_metrics(
        &self,
        run_id: &str,
        metrics: &BTreeMap<String, f64>,
    ) -> Result<(), TrackingError> {
        let now = Utc::now().timestamp_millis();
        let metrics: Vec<Value> = metrics
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value, "timestamp": now, "step": 0 }))
            .collect();
        self.post("runs/log-batch", json!({ "run_id": run_id, "metrics": metrics }))
            .await?;
        Ok(())
    }

    async fn end_run(&self, run_id: &str, outcome: RunOutcome) -> Result<(), TrackingError> {
        self.post(
            "runs/update",
            json!({
                "run_id": run_id,
                "status": outcome.as_str(),
                "end_time": Utc::now().timestamp_millis(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn register_model(
        &self,
        model_name: &str,
        run_id: &str,
    ) -> Result<String, TrackingError> {
        match self
            .post("registered-models/create", json!({ "name": model_name }))
            .await
        {
            Ok(_) => {}
            Err(TrackingError::Api { body, .. }) if body.contains("RESOURCE_ALREADY_EXISTS") => {}
            Err(e) => return Err(e),
        }

        let body = self
            .post(
                "model-versions/create",
                json!({
                    "name": model_name,
                    "source": format!("runs:/{run_id}/model"),
                    "run_id": run_id,
                }),
            )
            .await?;
        string_at(&body, "/model_version/version")
    }

    async fn transition_stage(
        &self,
        model_name: &str,
        version: &str,
        stage: ModelStage,
    ) -> Result<(), TrackingError> {
        self.post(
            "model-versions/transition-stage",
            json!({
                "name": model_name,
                "version": version,
                "stage": stage.as_str(),
                "archive_existing_versions": false,
            }),
        )
        .await?;
        Ok(())
    }

    async fn get_latest_version(
        &self,
        model_name: &str,
        stage: ModelStage,
    ) -> Result<Option<RegisteredVersion>, TrackingError> {
        let body = match self
            .post(
                "registered-models/get-latest-versions",
                json!({ "name": model_name, "stages": [stage.as_str()] }),
            )
            .await
        {
            Ok(body) => body,
            Err(TrackingError::Api { status: 404, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let Some(first) = body
            .get("model_versions")
            .and_then(Value::as_array)
            .and_then(|versions| versions.first())
        else {
            return Ok(None);
        };

        Ok(Some(RegisteredVersion {
            model_name: model_name.to_string(),
            version: string_at(first, "/version")?,
            run_id: string_at(first, "/run_id")?,
            stage: parse_stage(first.get("current_stage").and_then(Value::as_str).unwrap_or("")),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_url_strips_trailing_slash() {
        let tracker = MlflowTracker::new("http://localhost:5000/", "exp");
        assert_eq!(
            tracker.api_url("runs/create"),
            "http://localhost:5000/api/2.0/mlflow/runs/create"
        );
    }

    #[test]
    fn test_string_at_accepts_numbers() {
        let body = json!({"model_version": {"version": 3}, "run": {"info": {"run_id": "abc"}}});
        assert_eq!(string_at(&body, "/model_version/version").unwrap(), "3");
        assert_eq!(string_at(&body, "/run/info/run_id").unwrap(), "abc");
        assert!(string_at(&body, "/missing").is_err());
    }

    #[test]
    fn test_stage_parsing() {
        assert_eq!(parse_stage("Production"), ModelStage::Production);
        assert_eq!(parse_stage("whatever"), ModelStage::None);
    }
}
