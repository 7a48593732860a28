//! Evaluation engine: extract -> score -> threshold -> state update.
//!
//! The engine makes exactly one evaluator call per [`EvaluationEngine::score`]
//! invocation and never retries on its own; retry of transient evaluator
//! failures is an orchestrator policy.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::collaborators::{ContentEvaluator, EvaluatorError};
use crate::state::{ContentRef, CriterionScore, EvaluationResult, ProposalState, StateError};

use super::criteria::{CriteriaConfig, CriteriaLoader};

#[derive(Debug, Error)]
pub enum EvaluationError {
    /// Content empty after extraction; surfaced immediately, no network call.
    #[error("{content_type} content is empty, nothing to evaluate")]
    EmptyContent { content_type: String },

    /// Transient collaborator failure. Retryable at the orchestrator.
    #[error(transparent)]
    Evaluator(#[from] EvaluatorError),

    /// Evaluator returned unparsable or unusable output. Fatal for this
    /// attempt; the raw response is preserved for diagnosis.
    #[error("Failed to parse evaluator response: {reason}")]
    MalformedResponse { reason: String, raw: String },
}

impl EvaluationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EvaluationError::Evaluator(_))
    }
}

/// Wire shape of an evaluator response. Per-criterion entries are either a
/// bare score or a score with feedback.
#[derive(Debug, Deserialize)]
struct RawEvaluation {
    scores: HashMap<String, RawCriterionScore>,
    #[serde(default)]
    feedback: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCriterionScore {
    Bare(f64),
    Detailed {
        score: f64,
        #[serde(default)]
        feedback: Option<String>,
    },
}

impl RawCriterionScore {
    fn score(&self) -> f64 {
        match self {
            RawCriterionScore::Bare(score) => *score,
            RawCriterionScore::Detailed { score, .. } => *score,
        }
    }

    fn feedback(&self) -> Option<&str> {
        match self {
            RawCriterionScore::Bare(_) => None,
            RawCriterionScore::Detailed { feedback, .. } => feedback.as_deref(),
        }
    }
}

pub struct EvaluationEngine {
    loader: CriteriaLoader,
    evaluator: Arc<dyn ContentEvaluator>,
}

impl EvaluationEngine {
    pub fn new(loader: CriteriaLoader, evaluator: Arc<dyn ContentEvaluator>) -> Self {
        Self { loader, evaluator }
    }

    pub fn criteria_for(&self, content_type: &str) -> CriteriaConfig {
        self.loader.load(content_type)
    }

    /// Run one evaluation: validate, call the collaborator once, parse, and
    /// decide pass/fail. Does not touch workflow state.
    ///
    /// `content_id` addresses the slot/section (for key-section thresholds);
    /// `content_type` names the rubric.
    pub async fn score(
        &self,
        content_type: &str,
        content_id: &str,
        content: &str,
    ) -> Result<EvaluationResult, EvaluationError> {
        if content.trim().is_empty() {
            return Err(EvaluationError::EmptyContent {
                content_type: content_type.to_string(),
            });
        }

        let criteria = self.loader.load(content_type);
        let raw = self.evaluator.evaluate(content, &criteria).await?;
        let parsed: RawEvaluation =
            serde_json::from_str(&raw).map_err(|e| EvaluationError::MalformedResponse {
                reason: e.to_string(),
                raw: raw.clone(),
            })?;

        let result = self.build_result(content_id, &criteria, parsed, &raw)?;

        info!(
            content_type = %content_type,
            content_id = %content_id,
            overall_score = %result.overall_score,
            passed = %result.passed,
            criteria_scored = %result.criterion_scores.len(),
            "Evaluation completed"
        );

        Ok(result)
    }

    /// Weighted average over present criterion scores. Missing criteria are
    /// excluded from both numerator and denominator (weights renormalized),
    /// never treated as zero.
    fn build_result(
        &self,
        content_id: &str,
        criteria: &CriteriaConfig,
        parsed: RawEvaluation,
        raw: &str,
    ) -> Result<EvaluationResult, EvaluationError> {
        let mut numerator = 0.0;
        let mut denominator = 0.0;
        let mut criterion_scores = HashMap::new();

        for criterion in &criteria.criteria {
            let Some(raw_score) = parsed.scores.get(&criterion.id) else {
                debug!(
                    criterion = %criterion.id,
                    "Criterion score missing, excluded from weighted average"
                );
                continue;
            };
            let score = raw_score.score();
            if !(0.0..=1.0).contains(&score) {
                return Err(EvaluationError::MalformedResponse {
                    reason: format!(
                        "criterion '{}' score {score} outside 0-1 range",
                        criterion.id
                    ),
                    raw: raw.to_string(),
                });
            }
            numerator += criterion.weight * score;
            denominator += criterion.weight;
            criterion_scores.insert(
                criterion.id.clone(),
                CriterionScore {
                    score,
                    feedback: raw_score.feedback().map(|f| f.to_string()),
                },
            );
        }

        if denominator <= 0.0 {
            return Err(EvaluationError::MalformedResponse {
                reason: "no declared criterion was scored".to_string(),
                raw: raw.to_string(),
            });
        }

        let overall_score = numerator / denominator;
        let threshold = self.loader.threshold_for(content_id, criteria);

        Ok(EvaluationResult {
            overall_score,
            passed: overall_score >= threshold,
            feedback: parsed.feedback.unwrap_or_default(),
            criterion_scores,
            evaluated_at: Utc::now(),
        })
    }

    /// Commit a successful evaluation into the state slot: result attached,
    /// status -> AwaitingReview.
    pub fn apply_result(
        &self,
        state: &ProposalState,
        content_ref: &ContentRef,
        result: EvaluationResult,
    ) -> Result<ProposalState, StateError> {
        let mut next = state.clone();
        next.attach_evaluation(content_ref, result)?;
        Ok(next)
    }

    /// Commit an evaluation failure: prefixed error-log entry plus Error
    /// status for the affected content only.
    pub fn record_failure(
        &self,
        state: &ProposalState,
        content_type: &str,
        content_ref: &ContentRef,
        error: &EvaluationError,
    ) -> ProposalState {
        let mut next = state.clone();
        next.record_content_error(
            content_ref,
            format!("{content_type} evaluation failed: {error}"),
        );
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::mocks::MockEvaluator;
    use crate::evaluation::criteria::Criterion;
    use crate::state::SectionStatus;
    use tempfile::TempDir;

    fn engine_with(evaluator: Arc<MockEvaluator>, dir: &TempDir) -> EvaluationEngine {
        let loader = CriteriaLoader::new(dir.path(), 0.7, 0.85, vec![]);
        EvaluationEngine::new(loader, evaluator)
    }

    fn write_rubric(dir: &TempDir, content_type: &str, weights: &[(&str, f64)], threshold: f64) {
        let config = CriteriaConfig {
            id: format!("{content_type}-test"),
            name: content_type.to_string(),
            version: "1".to_string(),
            criteria: weights
                .iter()
                .map(|(id, weight)| Criterion {
                    id: id.to_string(),
                    name: id.to_string(),
                    weight: *weight,
                    is_critical: false,
                    passing_threshold: None,
                    scoring_guidelines: None,
                })
                .collect(),
            passing_threshold: threshold,
        };
        std::fs::write(
            dir.path().join(format!("{content_type}.json")),
            serde_json::to_string(&config).unwrap(),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_weighted_score_example() {
        let dir = TempDir::new().unwrap();
        write_rubric(
            &dir,
            "section",
            &[("clarity", 0.3), ("relevance", 0.4), ("accuracy", 0.3)],
            0.7,
        );
        let evaluator = Arc::new(MockEvaluator::new());
        evaluator.queue_raw(
            r#"{"scores": {"clarity": 0.8, "relevance": 0.9, "accuracy": 0.7}, "feedback": "solid"}"#,
        );
        let engine = engine_with(evaluator, &dir);

        let result = engine.score("section", "budget", "content").await.unwrap();
        assert!((result.overall_score - 0.8).abs() < 1e-9);
        assert!(result.passed);
        assert_eq!(result.feedback, "solid");
    }

    #[tokio::test]
    async fn test_missing_criterion_renormalizes_weights() {
        let dir = TempDir::new().unwrap();
        write_rubric(
            &dir,
            "section",
            &[("clarity", 0.3), ("relevance", 0.4), ("accuracy", 0.3)],
            0.7,
        );
        let evaluator = Arc::new(MockEvaluator::new());
        // relevance missing: (0.8*0.3 + 0.7*0.3) / 0.6 = 0.75
        evaluator.queue_raw(r#"{"scores": {"clarity": 0.8, "accuracy": 0.7}}"#);
        let engine = engine_with(evaluator, &dir);

        let result = engine.score("section", "budget", "content").await.unwrap();
        assert!((result.overall_score - 0.75).abs() < 1e-9);
        assert_eq!(result.criterion_scores.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_content_makes_no_evaluator_call() {
        let dir = TempDir::new().unwrap();
        let evaluator = Arc::new(MockEvaluator::new());
        let engine = engine_with(Arc::clone(&evaluator), &dir);

        let result = engine.score("research", "research", "   \n ").await;
        assert!(matches!(
            result,
            Err(EvaluationError::EmptyContent { .. })
        ));
        assert_eq!(evaluator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_response_preserves_raw() {
        let dir = TempDir::new().unwrap();
        let evaluator = Arc::new(MockEvaluator::new());
        evaluator.queue_raw("I liked it a lot!");
        let engine = engine_with(Arc::clone(&evaluator), &dir);

        let err = engine
            .score("section", "budget", "content")
            .await
            .unwrap_err();
        match &err {
            EvaluationError::MalformedResponse { raw, .. } => {
                assert_eq!(raw, "I liked it a lot!");
            }
            other => panic!("expected MalformedResponse, got {other:?}"),
        }
        assert!(err.to_string().contains("Failed to parse"));
        assert_eq!(evaluator.call_count(), 1);
    }

    #[tokio::test]
    async fn test_no_scored_criteria_is_malformed() {
        let dir = TempDir::new().unwrap();
        write_rubric(&dir, "section", &[("clarity", 1.0)], 0.7);
        let evaluator = Arc::new(MockEvaluator::new());
        evaluator.queue_raw(r#"{"scores": {"unrelated": 0.9}}"#);
        let engine = engine_with(evaluator, &dir);

        let err = engine
            .score("section", "budget", "content")
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluationError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn test_out_of_range_score_is_malformed() {
        let dir = TempDir::new().unwrap();
        write_rubric(&dir, "section", &[("clarity", 1.0)], 0.7);
        let evaluator = Arc::new(MockEvaluator::new());
        evaluator.queue_raw(r#"{"scores": {"clarity": 7.5}}"#);
        let engine = engine_with(evaluator, &dir);

        let err = engine
            .score("section", "budget", "content")
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluationError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn test_apply_result_transitions_to_awaiting_review() {
        let dir = TempDir::new().unwrap();
        let evaluator = Arc::new(MockEvaluator::new());
        let engine = engine_with(Arc::clone(&evaluator), &dir);

        let mut state = ProposalState::new("thread-1", "user-1");
        state
            .transition(&ContentRef::Research, SectionStatus::Generating)
            .unwrap();
        state
            .set_generated_content(&ContentRef::Research, "findings".to_string())
            .unwrap();

        let result = engine
            .score("research", "research", "findings")
            .await
            .unwrap();
        let next = engine
            .apply_result(&state, &ContentRef::Research, result)
            .unwrap();

        assert_eq!(
            next.status_of(&ContentRef::Research).unwrap(),
            SectionStatus::AwaitingReview
        );
        // Copy-on-write: original snapshot untouched.
        assert_eq!(
            state.status_of(&ContentRef::Research).unwrap(),
            SectionStatus::ReadyForEvaluation
        );
    }

    #[tokio::test]
    async fn test_record_failure_prefixes_error_log() {
        let dir = TempDir::new().unwrap();
        let evaluator = Arc::new(MockEvaluator::new());
        let engine = engine_with(Arc::clone(&evaluator), &dir);

        let mut state = ProposalState::new("thread-1", "user-1");
        state
            .transition(&ContentRef::Solution, SectionStatus::Generating)
            .unwrap();

        let error = EvaluationError::Evaluator(EvaluatorError::Service {
            reason: "503".to_string(),
        });
        let next = engine.record_failure(&state, "solution", &ContentRef::Solution, &error);

        assert_eq!(next.error_log.len(), 1);
        assert!(next.error_log[0]
            .message
            .starts_with("solution evaluation failed:"));
        assert_eq!(
            next.status_of(&ContentRef::Solution).unwrap(),
            SectionStatus::Error
        );
    }
}
