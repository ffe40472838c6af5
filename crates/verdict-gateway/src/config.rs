// config.rs — Service configuration.
//
// ServiceConfig determines where the service keeps its state (engine files
// and the decision log) and the limits for generation jobs, control-plane
// writes and validation. Every field has a default, so an empty TOML file
// is a valid in-memory configuration. `for_project()` lays state out under
// a `.verdict/` directory in the project root.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use verdict_policy::DEFAULT_MAX_CLAUSES;
use verdict_store::{StoreOptions, ThrottleConfig};

use crate::error::GatewayError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Directory for engine files (one JSON file per engine). `None` keeps
    /// engines in memory.
    pub state_dir: Option<PathBuf>,

    /// Path to the append-only decision log. `None` keeps records in memory.
    pub audit_log: Option<PathBuf>,

    pub generation: GenerationConfig,

    pub throttle: ThrottleConfig,

    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    /// Candidates kept per generation job.
    pub max_candidates: usize,
    /// Budget for the judge model call.
    pub timeout_secs: u64,
    /// How long a job stays readable after it starts.
    pub retention_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_candidates: 3,
            timeout_secs: 30,
            retention_secs: 3600,
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Normal-form clause cap; conditions that expand further are reported
    /// as unknown rather than analyzed.
    pub max_normal_form_clauses: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_normal_form_clauses: DEFAULT_MAX_CLAUSES,
        }
    }
}

impl ServiceConfig {
    /// Create a config with the standard `.verdict/` layout for a project.
    pub fn for_project(project_root: impl AsRef<Path>) -> Self {
        let dir = project_root.as_ref().join(".verdict");
        Self {
            state_dir: Some(dir.join("engines")),
            audit_log: Some(dir.join("decisions.jsonl")),
            ..Self::default()
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, GatewayError> {
        Ok(toml::from_str(text)?)
    }

    /// Read a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| GatewayError::IoError {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            state_dir: self.state_dir.clone(),
            throttle: self.throttle,
            max_normal_form_clauses: self.validation.max_normal_form_clauses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_all_defaults() {
        let config = ServiceConfig::from_toml("").unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.generation.max_candidates, 3);
        assert_eq!(config.generation.timeout(), Duration::from_secs(30));
        assert_eq!(config.throttle.burst, 20);
        assert_eq!(config.validation.max_normal_form_clauses, 64);
        assert!(config.state_dir.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = ServiceConfig::from_toml(
            r#"
            state_dir = "/var/lib/verdict"

            [generation]
            max_candidates = 5

            [throttle]
            per_second = 2.5
            "#,
        )
        .unwrap();
        assert_eq!(config.state_dir, Some(PathBuf::from("/var/lib/verdict")));
        assert_eq!(config.generation.max_candidates, 5);
        assert_eq!(config.generation.retention_secs, 3600);
        assert_eq!(config.throttle.burst, 20);
        assert_eq!(config.throttle.per_second, 2.5);
    }

    #[test]
    fn for_project_uses_verdict_dir() {
        let config = ServiceConfig::for_project("/work/app");
        assert_eq!(
            config.state_dir,
            Some(PathBuf::from("/work/app/.verdict/engines"))
        );
        assert_eq!(
            config.audit_log,
            Some(PathBuf::from("/work/app/.verdict/decisions.jsonl"))
        );
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(matches!(
            ServiceConfig::from_toml("generation = 3"),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verdict.toml");
        std::fs::write(&path, "[validation]\nmax_normal_form_clauses = 16\n").unwrap();
        let config = ServiceConfig::load(&path).unwrap();
        assert_eq!(config.store_options().max_normal_form_clauses, 16);
        assert!(ServiceConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
