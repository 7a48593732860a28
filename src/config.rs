use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Main configuration structure for Grantflow
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GrantflowConfig {
    /// Checkpoint persistence settings
    pub checkpoint: CheckpointConfig,
    /// Evaluation and criteria settings
    pub evaluation: EvaluationConfig,
    /// Orchestrator loop settings
    pub orchestrator: OrchestratorConfig,
    /// Declared section plan, in document order
    pub sections: Vec<SectionPlan>,
    /// Declared dependency graph: content id -> ids that depend on it.
    /// Empty means the built-in default proposal graph.
    pub dependencies: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Enable checkpoint persistence
    pub enable_persistence: bool,
    /// Directory for checkpoint files
    pub directory: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enable_persistence: true,
            directory: ".grantflow/checkpoints".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Directory holding per-content-type criteria files (<type>.json)
    pub criteria_directory: String,
    /// Deployment-wide passing threshold (0-1)
    pub default_passing_threshold: f64,
    /// Stricter threshold applied to key sections
    pub key_section_threshold: f64,
    /// Section ids held to the stricter threshold
    pub key_sections: Vec<String>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            criteria_directory: ".grantflow/criteria".to_string(),
            default_passing_threshold: 0.7,
            key_section_threshold: 0.85,
            key_sections: vec!["executive_summary".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per evaluator call, including the first
    pub max_attempts: u8,
    /// Base delay for exponential backoff
    pub base_delay_ms: u64,
    /// Backoff cap
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Automatic revise-and-regenerate rounds before interrupting for review
    pub max_revision_rounds: u8,
    /// Retry policy for transient evaluator failures
    pub retry: RetryConfig,
    /// Node ids that always interrupt for human review, even on a pass
    pub review_checkpoints: Vec<String>,
    /// Research sub-queries fanned out concurrently; empty means one plain call
    pub research_queries: Vec<String>,
    /// Per-branch timeout for research fan-out
    pub research_branch_timeout_secs: u64,
    /// Per-branch attempt budget for research fan-out
    pub research_branch_attempts: u8,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_revision_rounds: 2,
            retry: RetryConfig::default(),
            review_checkpoints: vec!["executive_summary".to_string()],
            research_queries: vec![],
            research_branch_timeout_secs: 120,
            research_branch_attempts: 2,
        }
    }
}

/// One declared document section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SectionPlan {
    pub id: String,
    pub title: String,
}

impl Default for GrantflowConfig {
    fn default() -> Self {
        let section = |id: &str, title: &str| SectionPlan {
            id: id.to_string(),
            title: title.to_string(),
        };
        Self {
            checkpoint: CheckpointConfig::default(),
            evaluation: EvaluationConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            sections: vec![
                section("problem_statement", "Problem Statement"),
                section("implementation_plan", "Implementation Plan"),
                section("budget_narrative", "Budget Narrative"),
                section("executive_summary", "Executive Summary"),
            ],
            dependencies: HashMap::new(),
        }
    }
}

impl GrantflowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. grantflow.toml in the working directory
    /// 3. Environment variables (prefixed with GRANTFLOW_)
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder();

        if Path::new("grantflow.toml").exists() {
            builder = builder.add_source(File::with_name("grantflow"));
        }

        builder = builder.add_source(
            Environment::with_prefix("GRANTFLOW")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let loaded: GrantflowConfig = config.try_deserialize()?;
        Ok(loaded)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_coherent() {
        let config = GrantflowConfig::default();
        assert!(
            config.evaluation.key_section_threshold > config.evaluation.default_passing_threshold
        );
        assert!(config.orchestrator.retry.max_attempts >= 1);
        assert!(!config.sections.is_empty());
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = GrantflowConfig::default();
        let toml_content = toml::to_string_pretty(&config).unwrap();
        let parsed: GrantflowConfig = toml::from_str(&toml_content).unwrap();
        assert_eq!(parsed.sections.len(), config.sections.len());
        assert_eq!(
            parsed.evaluation.default_passing_threshold,
            config.evaluation.default_passing_threshold
        );
    }
}
