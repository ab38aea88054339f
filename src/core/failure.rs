//! Failure-mode toggles for deterministic failure simulation.
//!
//! The executor owns a [`FailureModes`] handle; handlers only ever see a
//! [`FailureModeSet`] snapshot taken when their step starts, so a toggle
//! flipped mid-step takes effect from the next step on.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::ParseEnumError;

/// A named failure scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// `data_validation` raises on a missing column
    SchemaValidation,

    /// `cd_full_train` produces degraded metrics (does not raise)
    MetricRegression,

    /// `mlflow_log_ci` cannot reach the tracking server
    MlflowConnection,

    /// `ci_tests` reports failing unit tests and raises
    TrainingError,
}

impl FailureMode {
    pub const ALL: [FailureMode; 4] = [
        FailureMode::SchemaValidation,
        FailureMode::MetricRegression,
        FailureMode::MlflowConnection,
        FailureMode::TrainingError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureMode::SchemaValidation => "schema_validation",
            FailureMode::MetricRegression => "metric_regression",
            FailureMode::MlflowConnection => "mlflow_connection",
            FailureMode::TrainingError => "training_error",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            FailureMode::SchemaValidation => "Schema Validation Failure",
            FailureMode::MetricRegression => "Metric Regression",
            FailureMode::MlflowConnection => "MLflow Connection Failure",
            FailureMode::TrainingError => "Training Error",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            FailureMode::SchemaValidation => {
                "Causes data validation step to fail due to missing required column"
            }
            FailureMode::MetricRegression => {
                "Causes model to perform worse than champion (fails evaluation)"
            }
            FailureMode::MlflowConnection => "Simulates MLflow server connection failure",
            FailureMode::TrainingError => "Causes CI tests to fail",
        }
    }

    /// Step whose behavior the mode changes
    pub fn affected_step(&self) -> &'static str {
        match self {
            FailureMode::SchemaValidation => "data_validation",
            FailureMode::MetricRegression => "evaluate_vs_champion",
            FailureMode::MlflowConnection => "mlflow_log_ci",
            FailureMode::TrainingError => "ci_tests",
        }
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for FailureMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("failure mode", s))
    }
}

/// Immutable snapshot of every toggle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureModeSet {
    pub schema_validation: bool,
    pub metric_regression: bool,
    pub mlflow_connection: bool,
    pub training_error: bool,
}

impl FailureModeSet {
    pub fn is_enabled(&self, mode: FailureMode) -> bool {
        match mode {
            FailureMode::SchemaValidation => self.schema_validation,
            FailureMode::MetricRegression => self.metric_regression,
            FailureMode::MlflowConnection => self.mlflow_connection,
            FailureMode::TrainingError => self.training_error,
        }
    }

    fn set(&mut self, mode: FailureMode, enabled: bool) {
        let flag = match mode {
            FailureMode::SchemaValidation => &mut self.schema_validation,
            FailureMode::MetricRegression => &mut self.metric_regression,
            FailureMode::MlflowConnection => &mut self.mlflow_connection,
            FailureMode::TrainingError => &mut self.training_error,
        };
        *flag = enabled;
    }

    /// Modes currently switched on
    pub fn enabled(&self) -> Vec<FailureMode> {
        FailureMode::ALL
            .into_iter()
            .filter(|mode| self.is_enabled(*mode))
            .collect()
    }
}

/// Shared, mutable failure-mode configuration
///
/// Cloning yields another handle onto the same toggles.
#[derive(Debug, Clone, Default)]
pub struct FailureModes {
    inner: Arc<RwLock<FailureModeSet>>,
}

impl FailureModes {
    pub fn new(initial: FailureModeSet) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Enable or disable a single mode
    pub fn set(&self, mode: FailureMode, enabled: bool) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.set(mode, enabled);
        info!(mode = %mode, enabled, "Failure mode updated");
    }

    pub fn is_enabled(&self, mode: FailureMode) -> bool {
        self.snapshot().is_enabled(mode)
    }

    /// Copy of the current toggles
    pub fn snapshot(&self) -> FailureModeSet {
        *self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Switch every mode off
    pub fn reset(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = FailureModeSet::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modes_default_off() {
        let modes = FailureModes::default();
        for mode in FailureMode::ALL {
            assert!(!modes.is_enabled(mode));
        }
    }

    #[test]
    fn test_toggles_are_independent() {
        let modes = FailureModes::default();
        modes.set(FailureMode::SchemaValidation, true);

        assert!(modes.is_enabled(FailureMode::SchemaValidation));
        assert!(!modes.is_enabled(FailureMode::MetricRegression));

        modes.set(FailureMode::MetricRegression, true);
        modes.set(FailureMode::SchemaValidation, false);
        assert_eq!(modes.snapshot().enabled(), vec![FailureMode::MetricRegression]);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let modes = FailureModes::default();
        let before = modes.snapshot();

        modes.set(FailureMode::TrainingError, true);

        assert!(!before.training_error);
        assert!(modes.snapshot().training_error);
    }

    #[test]
    fn test_clones_share_state() {
        let modes = FailureModes::default();
        let handle = modes.clone();

        handle.set(FailureMode::MlflowConnection, true);
        assert!(modes.is_enabled(FailureMode::MlflowConnection));

        modes.reset();
        assert!(!handle.is_enabled(FailureMode::MlflowConnection));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(
            "metric_regression".parse::<FailureMode>().unwrap(),
            FailureMode::MetricRegression
        );
        assert!("disk_full".parse::<FailureMode>().is_err());
        assert_eq!(FailureMode::SchemaValidation.affected_step(), "data_validation");
    }
}
