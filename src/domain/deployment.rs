//! Deployment records and model registry entries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ParseEnumError;

/// Target environment of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::Production
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staging" => Ok(Environment::Staging),
            "production" => Ok(Environment::Production),
            other => Err(ParseEnumError::new("environment", other)),
        }
    }
}

/// Lifecycle of a deployment record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Active,
    Archived,
    RolledBack,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Active => "active",
            DeploymentStatus::Archived => "archived",
            DeploymentStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(DeploymentStatus::Active),
            "archived" => Ok(DeploymentStatus::Archived),
            "rolled_back" => Ok(DeploymentStatus::RolledBack),
            other => Err(ParseEnumError::new("deployment status", other)),
        }
    }
}

/// A model version deployed to an environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    /// Store-assigned id (0 until inserted)
    pub id: i64,

    pub environment: Environment,

    pub model_version: String,

    /// Tracking run that produced the model
    pub tracking_run_id: String,

    pub deployed_at: DateTime<Utc>,

    /// `system` for pipeline deployments, `rollback` for rollbacks
    pub deployed_by: String,

    pub status: DeploymentStatus,
}

impl Deployment {
    /// Create a new active deployment record
    pub fn new(
        environment: Environment,
        model_version: impl Into<String>,
        tracking_run_id: impl Into<String>,
        deployed_by: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            environment,
            model_version: model_version.into(),
            tracking_run_id: tracking_run_id.into(),
            deployed_at: Utc::now(),
            deployed_by: deployed_by.into(),
            status: DeploymentStatus::Active,
        }
    }
}

/// Result of rolling an environment back one version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub environment: Environment,
    pub from_version: String,
    pub to_version: String,
}

/// A model version recorded in the local registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub model_name: String,
    pub version: String,
    /// none, staging, production, archived
    pub stage: String,
    pub tracking_run_id: String,
    pub commit_sha: Option<String>,
    pub is_champion: bool,
    pub metrics: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub promoted_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_deployment_is_active() {
        let deployment = Deployment::new(Environment::Production, "v1", "trk_1", "system");
        assert_eq!(deployment.id, 0);
        assert_eq!(deployment.status, DeploymentStatus::Active);
        assert_eq!(deployment.deployed_by, "system");
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!("staging".parse::<Environment>().unwrap(), Environment::Staging);
        assert_eq!(
            "production".parse::<Environment>().unwrap(),
            Environment::Production
        );
        assert!("qa".parse::<Environment>().is_err());
        assert_eq!(
            "rolled_back".parse::<DeploymentStatus>().unwrap(),
            DeploymentStatus::RolledBack
        );
    }
}
