//! Criteria configuration: the externally supplied, weighted rubric used to
//! score generated content, with built-in defaults as the fallback.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One scoring criterion inside a rubric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub id: String,
    pub name: String,
    pub weight: f64,
    #[serde(default)]
    pub is_critical: bool,
    #[serde(default)]
    pub passing_threshold: Option<f64>,
    #[serde(default)]
    pub scoring_guidelines: Option<String>,
}

/// A named, versioned rubric for one content type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriteriaConfig {
    pub id: String,
    pub name: String,
    pub version: String,
    pub criteria: Vec<Criterion>,
    pub passing_threshold: f64,
}

impl CriteriaConfig {
    fn builtin(id: &str, name: &str, criteria: Vec<Criterion>, passing_threshold: f64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            version: "builtin-1".to_string(),
            criteria,
            passing_threshold,
        }
    }

    /// Hard-coded default rubric used when the named configuration file is
    /// absent or unparsable.
    pub fn default_for(content_type: &str) -> Self {
        let criterion = |id: &str, name: &str, weight: f64| Criterion {
            id: id.to_string(),
            name: name.to_string(),
            weight,
            is_critical: false,
            passing_threshold: None,
            scoring_guidelines: None,
        };

        match content_type {
            "research" => Self::builtin(
                "research-default",
                "Research Quality (default)",
                vec![
                    criterion("relevance", "Relevance to the funding call", 0.4),
                    criterion("depth", "Depth of evidence", 0.3),
                    criterion("recency", "Recency of sources", 0.3),
                ],
                0.7,
            ),
            "solution" => Self::builtin(
                "solution-default",
                "Solution Quality (default)",
                vec![
                    criterion("clarity", "Clarity of the proposed approach", 0.3),
                    criterion("feasibility", "Feasibility", 0.4),
                    criterion("impact", "Expected impact", 0.3),
                ],
                0.7,
            ),
            "connections" => Self::builtin(
                "connections-default",
                "Connections Quality (default)",
                vec![
                    criterion("alignment", "Alignment with funder priorities", 0.5),
                    criterion("specificity", "Specificity of linkages", 0.5),
                ],
                0.7,
            ),
            _ => Self::builtin(
                "section-default",
                "Section Quality (default)",
                vec![
                    criterion("clarity", "Clarity", 0.3),
                    criterion("relevance", "Relevance", 0.4),
                    criterion("accuracy", "Accuracy", 0.3),
                ],
                0.7,
            ),
        }
    }
}

/// Loads rubrics by content type from a configuration directory, falling
/// back to the built-in defaults. The fallback is silent at the data layer
/// but always logged.
#[derive(Debug, Clone)]
pub struct CriteriaLoader {
    criteria_dir: PathBuf,
    default_passing_threshold: f64,
    key_section_threshold: f64,
    key_sections: Vec<String>,
}

impl CriteriaLoader {
    pub fn new(
        criteria_dir: impl Into<PathBuf>,
        default_passing_threshold: f64,
        key_section_threshold: f64,
        key_sections: Vec<String>,
    ) -> Self {
        Self {
            criteria_dir: criteria_dir.into(),
            default_passing_threshold,
            key_section_threshold,
            key_sections,
        }
    }

    /// Load the rubric for `content_type` from
    /// `<criteria_dir>/<content_type>.json`, or the built-in default set.
    pub fn load(&self, content_type: &str) -> CriteriaConfig {
        let path = self.criteria_dir.join(format!("{content_type}.json"));
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<CriteriaConfig>(&raw) {
                Ok(config) => {
                    debug!(
                        content_type = %content_type,
                        config_id = %config.id,
                        version = %config.version,
                        "Loaded criteria configuration"
                    );
                    config
                }
                Err(e) => {
                    warn!(
                        content_type = %content_type,
                        file = %path.display(),
                        error = %e,
                        "Criteria configuration unparsable, falling back to built-in defaults"
                    );
                    CriteriaConfig::default_for(content_type)
                }
            },
            Err(_) => {
                warn!(
                    content_type = %content_type,
                    file = %path.display(),
                    "Criteria configuration missing, falling back to built-in defaults"
                );
                CriteriaConfig::default_for(content_type)
            }
        }
    }

    /// Passing threshold for a given piece of content. Designated key
    /// sections use the stricter threshold; otherwise the rubric's own
    /// threshold wins, then the deployment default.
    pub fn threshold_for(&self, content_id: &str, config: &CriteriaConfig) -> f64 {
        if self.key_sections.iter().any(|s| s == content_id) {
            return self.key_section_threshold.max(config.passing_threshold);
        }
        if config.passing_threshold > 0.0 {
            config.passing_threshold
        } else {
            self.default_passing_threshold
        }
    }
}
