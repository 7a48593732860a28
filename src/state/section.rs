use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::proposal::EvaluationResult;

/// Lifecycle status of a single piece of proposal content.
///
/// Transitions are only legal through [`SectionStatus::can_transition`]; every
/// mutating method on [`SectionEntity`] and the pipeline slots goes through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectionStatus {
    /// Declared but generation has not started yet.
    Queued,
    /// A generation call is in flight (or was in flight when the process died).
    Generating,
    /// Fresh draft present, evaluation not yet run.
    ReadyForEvaluation,
    /// Evaluation result attached, waiting for routing or human review.
    AwaitingReview,
    /// Accepted, either by a passing evaluation or by explicit human approval.
    Approved,
    /// Rejected by evaluation or reviewer; will re-enter generation with guidance.
    NeedsRevision,
    /// Content replaced directly by a human edit.
    Edited,
    /// A section this content depends on changed; needs an explicit keep/regenerate decision.
    Stale,
    /// Failed terminally for this content until manually retried.
    Error,
}

impl SectionStatus {
    /// The declared transition table. Anything not listed here is illegal
    /// through the public API.
    pub fn can_transition(from: SectionStatus, to: SectionStatus) -> bool {
        use SectionStatus::*;

        // Error is reachable from every state; Stale from everything but Queued.
        if to == Error {
            return from != Error;
        }
        if to == Stale {
            return !matches!(from, Queued | Stale);
        }

        matches!(
            (from, to),
            (Queued, Generating)
                | (Generating, ReadyForEvaluation)
                | (ReadyForEvaluation, AwaitingReview)
                | (AwaitingReview, Approved)
                | (AwaitingReview, NeedsRevision)
                | (NeedsRevision, Generating)
                // Direct reviewer edits: allowed on anything a human can
                // see, not just approved content.
                | (Approved, Edited)
                | (AwaitingReview, Edited)
                | (NeedsRevision, Edited)
                | (Stale, Edited)
                | (Edited, ReadyForEvaluation)
                | (Edited, Approved)
                // Stale resolution: keep, regenerate, or revise-with-comment.
                | (Stale, Approved)
                | (Stale, Generating)
                | (Stale, NeedsRevision)
                // Manual retry after a terminal error.
                | (Error, Generating)
        )
    }

    pub fn is_terminal_success(self) -> bool {
        matches!(self, SectionStatus::Approved | SectionStatus::Edited)
    }
}

impl std::fmt::Display for SectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SectionStatus::Queued => "queued",
            SectionStatus::Generating => "generating",
            SectionStatus::ReadyForEvaluation => "ready_for_evaluation",
            SectionStatus::AwaitingReview => "awaiting_review",
            SectionStatus::Approved => "approved",
            SectionStatus::NeedsRevision => "needs_revision",
            SectionStatus::Edited => "edited",
            SectionStatus::Stale => "stale",
            SectionStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// Errors raised by state-model mutations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("illegal transition for '{id}': {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: SectionStatus,
        to: SectionStatus,
    },

    #[error("unknown section '{0}'")]
    UnknownSection(String),
}

/// One named section of the proposal document.
///
/// Never deleted for the life of a thread; superseded content only bumps the
/// version counter. The status field is private so callers cannot bypass the
/// transition table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionEntity {
    pub id: String,
    pub title: String,
    pub content: String,
    status: SectionStatus,
    pub updated_at: DateTime<Utc>,
    pub evaluation: Option<EvaluationResult>,
    /// Incremented on every content mutation.
    pub version: u64,
}

impl SectionEntity {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            content: String::new(),
            status: SectionStatus::Queued,
            updated_at: Utc::now(),
            evaluation: None,
            version: 0,
        }
    }

    pub fn status(&self) -> SectionStatus {
        self.status
    }

    /// Checked status transition. The only way status changes.
    pub fn transition(&mut self, to: SectionStatus) -> Result<(), StateError> {
        if !SectionStatus::can_transition(self.status, to) {
            return Err(StateError::IllegalTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        debug!(
            section_id = %self.id,
            from = %self.status,
            to = %to,
            "Section status transition"
        );
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Replace the draft with freshly generated content.
    ///
    /// Clears any previous evaluation; a new draft always needs a new verdict.
    pub fn set_generated_content(&mut self, content: String) -> Result<(), StateError> {
        self.transition(SectionStatus::ReadyForEvaluation)?;
        self.content = content;
        self.evaluation = None;
        self.version += 1;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Replace content via a direct human edit.
    pub fn apply_edit(&mut self, content: String) -> Result<(), StateError> {
        self.transition(SectionStatus::Edited)?;
        self.content = content;
        self.evaluation = None;
        self.version += 1;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Attach an evaluation result and move to awaiting review.
    pub fn attach_evaluation(&mut self, result: EvaluationResult) -> Result<(), StateError> {
        self.transition(SectionStatus::AwaitingReview)?;
        self.evaluation = Some(result);
        Ok(())
    }
}
