//! External collaborator seams: content generation and content evaluation.
//!
//! The orchestrator only ever talks to these traits; production wiring
//! supplies model-backed implementations, tests supply the scripted mocks
//! below.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evaluation::criteria::CriteriaConfig;

/// Transient or fatal failure from the generation collaborator.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum GeneratorError {
    #[error("generator unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("generation timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

/// Transient failure calling the external evaluator. Eligible for bounded
/// retry with backoff at the orchestrator layer, never inside the engine.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum EvaluatorError {
    #[error("evaluator service error: {reason}")]
    Service { reason: String },

    #[error("evaluator network error: {reason}")]
    Network { reason: String },

    #[error("evaluation timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

/// Content generation collaborator. `guidance` carries accumulated revision
/// feedback when re-entering generation from NeedsRevision or Stale.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(
        &self,
        content_type: &str,
        context: &str,
        guidance: Option<&str>,
    ) -> Result<String, GeneratorError>;
}

/// Content evaluation collaborator. Returns the raw response; the evaluation
/// engine owns parsing and validation.
#[async_trait]
pub trait ContentEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        content: &str,
        criteria: &CriteriaConfig,
    ) -> Result<String, EvaluatorError>;
}

/// Scripted mock collaborators for tests - no side effects.
pub mod mocks {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Mock generator that replays queued responses and records calls.
    #[derive(Debug, Default)]
    pub struct MockGenerator {
        responses: Mutex<VecDeque<Result<String, GeneratorError>>>,
        calls: Mutex<Vec<MockGeneratorCall>>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct MockGeneratorCall {
        pub content_type: String,
        pub guidance: Option<String>,
    }

    impl MockGenerator {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn queue_content(&self, content: &str) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Ok(content.to_string()));
        }

        pub fn queue_error(&self, error: GeneratorError) {
            self.responses.lock().unwrap().push_back(Err(error));
        }

        pub fn calls(&self) -> Vec<MockGeneratorCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ContentGenerator for MockGenerator {
        async fn generate(
            &self,
            content_type: &str,
            _context: &str,
            guidance: Option<&str>,
        ) -> Result<String, GeneratorError> {
            self.calls.lock().unwrap().push(MockGeneratorCall {
                content_type: content_type.to_string(),
                guidance: guidance.map(|g| g.to_string()),
            });
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(format!("generated {content_type} content")))
        }
    }

    /// Mock evaluator that replays queued raw responses and counts calls.
    #[derive(Debug, Default)]
    pub struct MockEvaluator {
        responses: Mutex<VecDeque<Result<String, EvaluatorError>>>,
        call_count: AtomicUsize,
    }

    impl MockEvaluator {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a well-formed raw response scoring every criterion at `score`.
        pub fn queue_uniform_score(&self, criteria: &[&str], score: f64) {
            let scores: Vec<String> = criteria
                .iter()
                .map(|id| format!(r#""{id}": {{"score": {score}}}"#))
                .collect();
            let raw = format!(
                r#"{{"scores": {{{}}}, "feedback": "mock evaluation"}}"#,
                scores.join(", ")
            );
            self.queue_raw(&raw);
        }

        pub fn queue_raw(&self, raw: &str) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Ok(raw.to_string()));
        }

        pub fn queue_error(&self, error: EvaluatorError) {
            self.responses.lock().unwrap().push_back(Err(error));
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ContentEvaluator for MockEvaluator {
        async fn evaluate(
            &self,
            _content: &str,
            criteria: &CriteriaConfig,
        ) -> Result<String, EvaluatorError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            self.responses.lock().unwrap().pop_front().unwrap_or_else(|| {
                // Default: pass everything at 0.9.
                let scores: Vec<String> = criteria
                    .criteria
                    .iter()
                    .map(|c| format!(r#""{}": {{"score": 0.9}}"#, c.id))
                    .collect();
                Ok(format!(
                    r#"{{"scores": {{{}}}, "feedback": "default mock verdict"}}"#,
                    scores.join(", ")
                ))
            })
        }
    }
}
