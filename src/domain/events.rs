//! Messages fanned out to subscribers.
//!
//! Every state change the orchestrator persists is followed by one of these
//! messages on the run's channel. Messages are tagged by `type` when
//! serialized so remote clients can dispatch on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::deployment::Environment;
use super::run::{RunStatus, Stage};

/// Severity of a log message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// A single message delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Human-readable progress line
    Log {
        timestamp: DateTime<Utc>,
        level: LogLevel,
        message: String,
    },

    /// Step status change (`status` is a step status or `awaiting_approval`)
    Status {
        timestamp: DateTime<Utc>,
        step_name: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outputs: Option<Map<String, Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Run-level status change
    Run {
        timestamp: DateTime<Utc>,
        run_id: String,
        status: RunStatus,
        stage: Stage,
    },

    /// Metrics snapshot
    Metrics {
        timestamp: DateTime<Utc>,
        metrics: Map<String, Value>,
    },

    /// A new artifact is available
    Artifact {
        timestamp: DateTime<Utc>,
        artifact_name: String,
        artifact_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },

    /// Synthetic claim event (claims stream only)
    Claim {
        timestamp: DateTime<Utc>,
        data: Value,
    },

    /// Drift monitoring update (claims stream only)
    Drift {
        timestamp: DateTime<Utc>,
        data: Value,
    },

    /// An environment was rolled back (sent to every channel)
    Rollback {
        timestamp: DateTime<Utc>,
        environment: Environment,
        from_version: String,
        to_version: String,
    },
}

impl Message {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Message::Log {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }

    pub fn status(step_name: impl Into<String>, status: impl Into<String>) -> Self {
        Message::Status {
            timestamp: Utc::now(),
            step_name: step_name.into(),
            status: status.into(),
            message: None,
            outputs: None,
            error: None,
        }
    }

    pub fn run(run_id: impl Into<String>, status: RunStatus, stage: Stage) -> Self {
        Message::Run {
            timestamp: Utc::now(),
            run_id: run_id.into(),
            status,
            stage,
        }
    }

    pub fn metrics(metrics: Map<String, Value>) -> Self {
        Message::Metrics {
            timestamp: Utc::now(),
            metrics,
        }
    }

    pub fn artifact(
        artifact_name: impl Into<String>,
        artifact_type: impl Into<String>,
        url: Option<String>,
    ) -> Self {
        Message::Artifact {
            timestamp: Utc::now(),
            artifact_name: artifact_name.into(),
            artifact_type: artifact_type.into(),
            url,
        }
    }

    pub fn claim(data: Value) -> Self {
        Message::Claim {
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn drift(data: Value) -> Self {
        Message::Drift {
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn rollback(
        environment: Environment,
        from_version: impl Into<String>,
        to_version: impl Into<String>,
    ) -> Self {
        Message::Rollback {
            timestamp: Utc::now(),
            environment,
            from_version: from_version.into(),
            to_version: to_version.into(),
        }
    }

    /// Attach a human-readable note to a status message
    pub fn with_message(mut self, text: impl Into<String>) -> Self {
        if let Message::Status { message, .. } = &mut self {
            *message = Some(text.into());
        }
        self
    }

    /// Attach step outputs to a status message
    pub fn with_outputs(mut self, step_outputs: Map<String, Value>) -> Self {
        if let Message::Status { outputs, .. } = &mut self {
            *outputs = Some(step_outputs);
        }
        self
    }

    /// Attach error text to a status message
    pub fn with_error(mut self, text: impl Into<String>) -> Self {
        if let Message::Status { error, .. } = &mut self {
            *error = Some(text.into());
        }
        self
    }

    /// The `type` tag this message serializes with
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Log { .. } => "log",
            Message::Status { .. } => "status",
            Message::Run { .. } => "run",
            Message::Metrics { .. } => "metrics",
            Message::Artifact { .. } => "artifact",
            Message::Claim { .. } => "claim",
            Message::Drift { .. } => "drift",
            Message::Rollback { .. } => "rollback",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_message_serialization() {
        let message = Message::status("data_validation", "failed")
            .with_error("Schema validation failed");

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["step_name"], "data_validation");
        assert_eq!(json["error"], "Schema validation failed");
        assert!(json.get("outputs").is_none());

        let parsed: Message = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_builders_ignore_other_kinds() {
        let message = Message::log(LogLevel::Info, "hello").with_error("ignored");
        match message {
            Message::Log { message, level, .. } => {
                assert_eq!(message, "hello");
                assert_eq!(level, LogLevel::Info);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_rollback_message_tag() {
        let message = Message::rollback(Environment::Production, "v2", "v1");
        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["type"], "rollback");
        assert_eq!(json["environment"], "production");
        assert_eq!(message.kind(), "rollback");
    }

    #[test]
    fn test_drift_message_carries_data() {
        let message = Message::drift(json!({"batch": 1, "psi": 0.06}));
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "drift");
        assert_eq!(json["data"]["batch"], 1);
    }
}
