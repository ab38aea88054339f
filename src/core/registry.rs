//! Step catalog and stage sequences.
//!
//! The catalog is an ordered list of step definitions, each tagged with the
//! stage it belongs to. It ships built in and can also be loaded from YAML.
//! Stage sequences are the fixed lists the orchestrator walks; they are
//! validated against the catalog once, at construction.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Stage;

/// Name of the approval-gated step in the built-in catalog
pub const MANUAL_APPROVAL: &str = "manual_approval";

/// A single catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step name (unique within the catalog)
    pub name: String,

    /// Human-readable name used in log lines
    pub display_name: String,

    #[serde(default)]
    pub description: String,

    /// Stage this step belongs to
    pub stage: Stage,

    /// Whether the run must wait for an external approve/reject
    #[serde(default)]
    pub requires_approval: bool,

    /// Steps that must precede this one
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl StepDefinition {
    fn builtin(
        name: &str,
        display_name: &str,
        description: &str,
        stage: Stage,
        dependencies: &[&str],
    ) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            description: description.to_string(),
            stage,
            requires_approval: false,
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn gated(mut self) -> Self {
        self.requires_approval = true;
        self
    }
}

/// Catalog validation errors
#[derive(Debug, Clone, Error)]
pub enum CatalogError {
    #[error("Step catalog cannot be empty")]
    Empty,

    #[error("Step {0} has an empty name")]
    EmptyName(usize),

    #[error("Duplicate step '{0}' in catalog")]
    Duplicate(String),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Step '{step}' depends on later step '{dependency}' (forward references not allowed)")]
    ForwardDependency { step: String, dependency: String },

    #[error("Stage '{stage}' sequence references unknown step '{step}'")]
    UnknownSequenceStep { stage: Stage, step: String },

    #[error("Step '{step}' is tagged '{actual}' but listed in the '{expected}' sequence")]
    StageMismatch {
        step: String,
        expected: Stage,
        actual: Stage,
    },
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    steps: Vec<StepDefinition>,
}

/// Ordered, read-only step catalog
#[derive(Debug, Clone)]
pub struct StepRegistry {
    steps: Vec<StepDefinition>,
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl StepRegistry {
    /// Create a registry from definitions, validating them
    pub fn new(steps: Vec<StepDefinition>) -> Result<Self, CatalogError> {
        let registry = Self { steps };
        registry.validate()?;
        Ok(registry)
    }

    /// The built-in model-promotion catalog
    pub fn builtin() -> Self {
        let steps = vec![
            StepDefinition::builtin(
                "commit_received",
                "Commit/PR Received",
                "New commit or PR triggers the pipeline",
                Stage::Ci,
                &[],
            ),
            StepDefinition::builtin(
                "ci_tests",
                "CI Tests",
                "Run unit tests and linting",
                Stage::Ci,
                &["commit_received"],
            ),
            StepDefinition::builtin(
                "data_validation",
                "Data Validation",
                "Validate data schema and quality",
                Stage::Ci,
                &["ci_tests"],
            ),
            StepDefinition::builtin(
                "ci_quick_train",
                "CI Quick Train",
                "Fast training on sample data for validation",
                Stage::Ci,
                &["data_validation"],
            ),
            StepDefinition::builtin(
                "mlflow_log_ci",
                "MLflow Log (CI)",
                "Log CI results to the experiment tracker",
                Stage::Ci,
                &["ci_quick_train"],
            ),
            StepDefinition::builtin(
                "cd_full_train",
                "CD Full Train",
                "Full model training on complete dataset",
                Stage::Cd,
                &["mlflow_log_ci"],
            ),
            StepDefinition::builtin(
                "evaluate_vs_champion",
                "Evaluate vs Champion",
                "Compare challenger model against current champion",
                Stage::Cd,
                &["cd_full_train"],
            ),
            StepDefinition::builtin(
                MANUAL_APPROVAL,
                "Manual Approval",
                "Wait for human approval to proceed to deployment",
                Stage::Cd,
                &["evaluate_vs_champion"],
            )
            .gated(),
            StepDefinition::builtin(
                "deploy_staging",
                "Deploy to Staging",
                "Deploy model to staging environment",
                Stage::Deploy,
                &[MANUAL_APPROVAL],
            ),
            StepDefinition::builtin(
                "shadow_monitor",
                "Shadow/A-B Monitor",
                "Run shadow scoring and monitor drift",
                Stage::Deploy,
                &["deploy_staging"],
            ),
            StepDefinition::builtin(
                "promote_prod",
                "Promote to Production",
                "Promote model to production",
                Stage::Deploy,
                &["shadow_monitor"],
            ),
            StepDefinition::builtin(
                "rollback",
                "Rollback",
                "Rollback to previous production model",
                Stage::Deploy,
                &[],
            ),
        ];

        Self { steps }
    }

    /// Load a catalog from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read step catalog: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a catalog from YAML content (a top-level `steps:` list)
    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: CatalogFile =
            serde_yaml::from_str(content).context("Failed to parse step catalog YAML")?;
        Ok(Self::new(file.steps)?)
    }

    /// Validate names and dependency references
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.steps.is_empty() {
            return Err(CatalogError::Empty);
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() {
                return Err(CatalogError::EmptyName(i));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(CatalogError::Duplicate(step.name.clone()));
            }
        }

        for (i, step) in self.steps.iter().enumerate() {
            for dependency in &step.dependencies {
                match self.position(dependency) {
                    Some(idx) if idx >= i => {
                        return Err(CatalogError::ForwardDependency {
                            step: step.name.clone(),
                            dependency: dependency.clone(),
                        });
                    }
                    None => {
                        return Err(CatalogError::UnknownDependency {
                            step: step.name.clone(),
                            dependency: dependency.clone(),
                        });
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }

    /// All definitions in catalog order
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// Get a definition by name
    pub fn get(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Catalog index of a step
    pub fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Definitions whose stage is one of `stages`, in catalog order
    pub fn for_stages<'a>(&'a self, stages: &'a [Stage]) -> impl Iterator<Item = &'a StepDefinition> + 'a {
        self.steps.iter().filter(move |s| stages.contains(&s.stage))
    }

    pub fn requires_approval(&self, name: &str) -> bool {
        self.get(name).map(|s| s.requires_approval).unwrap_or(false)
    }
}

/// The fixed step lists walked for each stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSequences {
    pub ci: Vec<String>,
    pub cd: Vec<String>,
    pub deploy: Vec<String>,
}

impl Default for StageSequences {
    fn default() -> Self {
        fn names(list: &[&str]) -> Vec<String> {
            list.iter().map(|s| s.to_string()).collect()
        }

        Self {
            ci: names(&[
                "commit_received",
                "ci_tests",
                "data_validation",
                "ci_quick_train",
                "mlflow_log_ci",
            ]),
            cd: names(&["cd_full_train", "evaluate_vs_champion", MANUAL_APPROVAL]),
            deploy: names(&["deploy_staging", "shadow_monitor", "promote_prod"]),
        }
    }
}

impl StageSequences {
    pub fn get(&self, stage: Stage) -> &[String] {
        match stage {
            Stage::Ci => &self.ci,
            Stage::Cd => &self.cd,
            Stage::Deploy => &self.deploy,
        }
    }

    /// Every sequenced step must exist in the catalog under the same stage
    pub fn validate(&self, registry: &StepRegistry) -> Result<(), CatalogError> {
        for stage in Stage::ALL {
            for name in self.get(stage) {
                let definition =
                    registry
                        .get(name)
                        .ok_or_else(|| CatalogError::UnknownSequenceStep {
                            stage,
                            step: name.clone(),
                        })?;

                if definition.stage != stage {
                    return Err(CatalogError::StageMismatch {
                        step: name.clone(),
                        expected: stage,
                        actual: definition.stage,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CATALOG_YAML: &str = r#"
steps:
  - name: checkout
    display_name: Checkout
    stage: ci

  - name: train
    display_name: Train
    stage: cd
    dependencies: [checkout]

  - name: signoff
    display_name: Sign-off
    stage: cd
    requires_approval: true
    dependencies: [train]
"#;

    #[test]
    fn test_builtin_catalog_is_valid() {
        let registry = StepRegistry::builtin();
        assert!(registry.validate().is_ok());
        assert_eq!(registry.steps().len(), 12);
        assert!(registry.requires_approval(MANUAL_APPROVAL));
        assert!(!registry.requires_approval("ci_tests"));
    }

    #[test]
    fn test_default_sequences_match_catalog() {
        let registry = StepRegistry::builtin();
        let sequences = StageSequences::default();

        assert!(sequences.validate(&registry).is_ok());
        assert_eq!(sequences.get(Stage::Ci).len(), 5);
        assert_eq!(sequences.get(Stage::Cd).last().unwrap(), MANUAL_APPROVAL);
        assert_eq!(sequences.get(Stage::Deploy)[0], "deploy_staging");
    }

    #[test]
    fn test_steps_for_stages() {
        let registry = StepRegistry::builtin();

        let cd_onward: Vec<&str> = registry
            .for_stages(&[Stage::Cd, Stage::Deploy])
            .map(|s| s.name.as_str())
            .collect();

        assert_eq!(cd_onward.len(), 7);
        assert_eq!(cd_onward[0], "cd_full_train");
        assert!(cd_onward.contains(&"rollback"));
        assert!(!cd_onward.contains(&"ci_tests"));
    }

    #[test]
    fn test_catalog_from_yaml() {
        let registry = StepRegistry::from_yaml(TEST_CATALOG_YAML).unwrap();

        assert_eq!(registry.steps().len(), 3);
        assert!(registry.requires_approval("signoff"));
        assert_eq!(registry.get("train").unwrap().stage, Stage::Cd);
        assert_eq!(registry.position("signoff"), Some(2));
    }

    #[test]
    fn test_forward_dependency_rejected() {
        let yaml = r#"
steps:
  - name: first
    display_name: First
    stage: ci
    dependencies: [second]
  - name: second
    display_name: Second
    stage: ci
"#;
        assert!(StepRegistry::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let step = StepDefinition::builtin("dup", "Dup", "", Stage::Ci, &[]);
        let result = StepRegistry::new(vec![step.clone(), step]);
        assert!(matches!(result, Err(CatalogError::Duplicate(name)) if name == "dup"));
    }

    #[test]
    fn test_sequence_stage_mismatch() {
        let registry = StepRegistry::builtin();
        let mut sequences = StageSequences::default();
        sequences.ci.push("promote_prod".to_string());

        let result = sequences.validate(&registry);
        assert!(matches!(result, Err(CatalogError::StageMismatch { .. })));
    }
}
