//! Configuration for mlpipe.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (MLPIPE_HOME, MLPIPE_TRACKING_URI)
//! 2. Config file (.mlpipe/config.yaml)
//! 3. Defaults (~/.mlpipe, in-memory tracking)
//!
//! Config file discovery:
//! - Searches current directory and parents for .mlpipe/config.yaml
//! - Paths in config file are relative to the .mlpipe/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::ExecutorSettings;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const DEFAULT_EXPERIMENT: &str = "claim-settlement-prediction";
const DEFAULT_MODEL: &str = "claim-settlement-model";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .mlpipe/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackingConfig {
    /// MLflow server URL; unset means the in-memory tracker
    pub uri: Option<String>,
    pub experiment_name: Option<String>,
    pub model_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimulationConfig {
    pub latency_scale: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogConfig {
    /// Step catalog YAML (relative to .mlpipe/)
    pub file: Option<String>,
}

/// Environment overrides, read once per load
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<String>,
    tracking_uri: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            home: std::env::var("MLPIPE_HOME").ok(),
            tracking_uri: std::env::var("MLPIPE_TRACKING_URI").ok(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    /// Engine state directory
    pub home: PathBuf,
    /// SQLite database file
    pub database: PathBuf,
    /// MLflow tracking server, if any
    pub tracking_uri: Option<String>,
    pub experiment_name: String,
    pub model_name: String,
    pub latency_scale: f64,
    /// Custom step catalog, if configured
    pub catalog_file: Option<PathBuf>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Handler settings derived from this configuration
    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            latency_scale: self.latency_scale,
            experiment_name: self.experiment_name.clone(),
            model_name: self.model_name.clone(),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".mlpipe").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to a base directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Combine file contents, environment and defaults
fn resolve(
    default_home: PathBuf,
    file: Option<(&Path, ConfigFile)>,
    env: EnvOverrides,
) -> Result<ResolvedConfig> {
    let (config_file, config) = match file {
        Some((path, config)) => (Some(path.to_path_buf()), config),
        None => (None, ConfigFile::default()),
    };
    // Relative paths hang off the .mlpipe/ directory
    let base_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));

    let home = match (env.home, &config.paths.home) {
        (Some(env_home), _) => PathBuf::from(env_home),
        (None, Some(home_path)) => resolve_path(base_dir, home_path),
        (None, None) => default_home,
    };

    let latency_scale = config.simulation.latency_scale.unwrap_or(1.0);
    if !latency_scale.is_finite() || latency_scale < 0.0 {
        anyhow::bail!("simulation.latency_scale must be a non-negative number, got {latency_scale}");
    }

    Ok(ResolvedConfig {
        database: home.join("pipeline.db"),
        home,
        tracking_uri: env.tracking_uri.or(config.tracking.uri),
        experiment_name: config
            .tracking
            .experiment_name
            .unwrap_or_else(|| DEFAULT_EXPERIMENT.to_string()),
        model_name: config
            .tracking
            .model_name
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        latency_scale,
        catalog_file: config.catalog.file.map(|f| resolve_path(base_dir, &f)),
        config_file,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".mlpipe");

    let file = match find_config_file() {
        Some(path) => {
            let config = load_config_file(&path)?;
            Some((path, config))
        }
        None => None,
    };

    resolve(
        default_home,
        file.as_ref().map(|(path, config)| (path.as_path(), config.clone())),
        EnvOverrides::from_env(),
    )
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{e:#}")));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the mlpipe home directory (engine state)
pub fn mlpipe_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the database path ($MLPIPE_HOME/pipeline.db)
pub fn database_path() -> Result<PathBuf> {
    Ok(config()?.database.clone())
}
