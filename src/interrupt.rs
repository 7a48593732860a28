//! Interrupt controller: decides when the workflow suspends for human review
//! and applies resume feedback.
//!
//! The persisted [`InterruptStatus`] plus [`InterruptMetadata`] is the whole
//! continuation; resuming is a pure function of (snapshot, feedback), never
//! an in-memory paused call stack.

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::state::{
    ContentRef, FeedbackKind, HumanFeedback, InterruptMetadata, InterruptReason, InterruptStatus,
    ProcessingStatus, ProposalState, SectionStatus, StateError,
};

/// Routing decision after an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Evaluation passed; advance to the next node.
    Continue,
    /// Evaluation failed; route back to generation with feedback as guidance.
    Revise,
    /// Suspend and wait for external feedback.
    AwaitingFeedback,
}

#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("thread is not interrupted; feedback has nothing to clear")]
    NotInterrupted,

    #[error("a resume is already being processed for this thread")]
    AlreadyProcessing,

    #[error("edit feedback carried no specific edits")]
    MissingEdits,

    #[error(transparent)]
    Transition(#[from] StateError),
}

/// Stateless controller; all context lives in the snapshot it is handed.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterruptController;

impl InterruptController {
    pub fn new() -> Self {
        Self
    }

    /// Decision order, first match wins:
    /// 1. already interrupted -> awaiting feedback;
    /// 2. evaluation passed -> continue;
    /// 3. evaluation failed -> revise;
    /// 4. no evaluation present -> awaiting feedback (defensive default).
    pub fn after_evaluation(&self, state: &ProposalState, content_ref: &ContentRef) -> Route {
        if state.interrupt.is_interrupted {
            return Route::AwaitingFeedback;
        }
        match state.evaluation_of(content_ref) {
            Ok(Some(result)) if result.passed => Route::Continue,
            Ok(Some(_)) => Route::Revise,
            Ok(None) | Err(_) => {
                warn!(
                    content_ref = %content_ref,
                    "No evaluation result for referenced content, defaulting to awaiting feedback"
                );
                Route::AwaitingFeedback
            }
        }
    }

    /// Suspend the workflow at `node_id`, capturing the triggering evaluation
    /// verbatim for audit.
    pub fn raise_interrupt(
        &self,
        state: &ProposalState,
        node_id: &str,
        content_ref: ContentRef,
        reason: InterruptReason,
    ) -> ProposalState {
        let mut next = state.clone();
        let evaluation = next.evaluation_of(&content_ref).ok().flatten().cloned();

        next.interrupt = InterruptStatus {
            is_interrupted: true,
            interruption_point: Some(node_id.to_string()),
            pending_feedback: None,
            processing: ProcessingStatus::Pending,
        };
        next.interrupt_metadata = Some(InterruptMetadata {
            reason,
            node_id: node_id.to_string(),
            timestamp: Utc::now(),
            content_ref,
            evaluation,
        });

        info!(
            thread_id = %next.thread_id,
            node_id = %node_id,
            reason = ?reason,
            "Workflow interrupted for review"
        );

        next
    }

    /// Apply resume feedback to a suspended snapshot, producing the snapshot
    /// the orchestrator continues from. Any accepted feedback clears the
    /// interrupt and its metadata.
    ///
    /// The caller is responsible for running dependency propagation for each
    /// id edited by `Edit` feedback.
    pub fn apply_feedback(
        &self,
        state: &ProposalState,
        feedback: HumanFeedback,
    ) -> Result<ProposalState, FeedbackError> {
        if !state.interrupt.is_interrupted {
            return Err(FeedbackError::NotInterrupted);
        }
        if state.interrupt.processing == ProcessingStatus::Processing {
            return Err(FeedbackError::AlreadyProcessing);
        }

        let mut next = state.clone();
        let node_id = next
            .interrupt
            .interruption_point
            .clone()
            .unwrap_or_else(|| feedback.content_ref.id().to_string());

        match feedback.kind {
            FeedbackKind::Approve => {
                next.transition(&feedback.content_ref, SectionStatus::Approved)?;
                if let Some(comments) = &feedback.comments {
                    next.push_message(&node_id, comments.clone());
                }
            }
            FeedbackKind::Revise => {
                next.transition(&feedback.content_ref, SectionStatus::NeedsRevision)?;
                next.push_message(
                    &node_id,
                    feedback
                        .comments
                        .clone()
                        .unwrap_or_else(|| "revision requested".to_string()),
                );
            }
            FeedbackKind::Edit => {
                if feedback.specific_edits.is_empty() {
                    return Err(FeedbackError::MissingEdits);
                }
                for (section_id, new_content) in &feedback.specific_edits {
                    next.apply_edit(section_id, new_content.clone())?;
                }
                if let Some(comments) = &feedback.comments {
                    next.push_message(&node_id, comments.clone());
                }
            }
        }

        next.interrupt = InterruptStatus {
            is_interrupted: false,
            interruption_point: None,
            pending_feedback: None,
            processing: ProcessingStatus::Processed,
        };
        next.interrupt_metadata = None;

        info!(
            thread_id = %next.thread_id,
            kind = ?feedback.kind,
            content_ref = %feedback.content_ref,
            "Resume feedback applied, interrupt cleared"
        );

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CriterionScore, EvaluationResult};
    use std::collections::HashMap;

    fn eval(passed: bool) -> EvaluationResult {
        EvaluationResult {
            overall_score: if passed { 0.9 } else { 0.4 },
            passed,
            feedback: "needs more specificity".to_string(),
            criterion_scores: HashMap::from([(
                "clarity".to_string(),
                CriterionScore {
                    score: 0.4,
                    feedback: None,
                },
            )]),
            evaluated_at: Utc::now(),
        }
    }

    fn state_awaiting_review(passed: bool) -> ProposalState {
        let mut state = ProposalState::new("thread-1", "user-1");
        state.declare_section("executive_summary", "Executive Summary");
        let content_ref = ContentRef::Section("executive_summary".to_string());
        state
            .transition(&content_ref, SectionStatus::Generating)
            .unwrap();
        state
            .set_generated_content(&content_ref, "draft summary".to_string())
            .unwrap();
        state.attach_evaluation(&content_ref, eval(passed)).unwrap();
        state
    }

    #[test]
    fn test_route_decision_order() {
        let controller = InterruptController::new();
        let content_ref = ContentRef::Section("executive_summary".to_string());

        // Passing evaluation -> continue.
        let state = state_awaiting_review(true);
        assert_eq!(
            controller.after_evaluation(&state, &content_ref),
            Route::Continue
        );

        // Failing evaluation -> revise.
        let state = state_awaiting_review(false);
        assert_eq!(
            controller.after_evaluation(&state, &content_ref),
            Route::Revise
        );

        // Already interrupted wins over everything.
        let interrupted = controller.raise_interrupt(
            &state,
            "executive_summary",
            content_ref.clone(),
            InterruptReason::EvaluationNeeded,
        );
        assert_eq!(
            controller.after_evaluation(&interrupted, &content_ref),
            Route::AwaitingFeedback
        );

        // Missing evaluation -> defensive awaiting feedback.
        let fresh = ProposalState::new("thread-2", "user-1");
        assert_eq!(
            controller.after_evaluation(&fresh, &ContentRef::Research),
            Route::AwaitingFeedback
        );
    }

    #[test]
    fn test_raise_interrupt_captures_evaluation_verbatim() {
        let controller = InterruptController::new();
        let state = state_awaiting_review(false);
        let content_ref = ContentRef::Section("executive_summary".to_string());

        let interrupted = controller.raise_interrupt(
            &state,
            "executive_summary",
            content_ref.clone(),
            InterruptReason::EvaluationNeeded,
        );

        assert!(interrupted.interrupt.is_interrupted);
        assert_eq!(
            interrupted.interrupt.interruption_point.as_deref(),
            Some("executive_summary")
        );
        assert_eq!(
            interrupted.interrupt.processing,
            ProcessingStatus::Pending
        );
        let metadata = interrupted.interrupt_metadata.as_ref().unwrap();
        assert_eq!(metadata.reason, InterruptReason::EvaluationNeeded);
        assert_eq!(
            metadata.evaluation,
            state.evaluation_of(&content_ref).unwrap().cloned()
        );
    }

    #[test]
    fn test_approve_clears_interrupt_and_approves() {
        let controller = InterruptController::new();
        let content_ref = ContentRef::Section("executive_summary".to_string());
        let state = controller.raise_interrupt(
            &state_awaiting_review(false),
            "executive_summary",
            content_ref.clone(),
            InterruptReason::EvaluationNeeded,
        );

        let resumed = controller
            .apply_feedback(&state, HumanFeedback::approve(content_ref.clone()))
            .unwrap();

        assert!(!resumed.interrupt.is_interrupted);
        assert_eq!(resumed.interrupt.processing, ProcessingStatus::Processed);
        assert!(resumed.interrupt_metadata.is_none());
        assert_eq!(
            resumed.status_of(&content_ref).unwrap(),
            SectionStatus::Approved
        );
    }

    #[test]
    fn test_revise_appends_comment_to_message_log() {
        let controller = InterruptController::new();
        let content_ref = ContentRef::Section("executive_summary".to_string());
        let state = controller.raise_interrupt(
            &state_awaiting_review(false),
            "executive_summary",
            content_ref.clone(),
            InterruptReason::EvaluationNeeded,
        );

        let resumed = controller
            .apply_feedback(
                &state,
                HumanFeedback::revise(content_ref.clone(), "tighten the opening paragraph"),
            )
            .unwrap();

        assert_eq!(
            resumed.status_of(&content_ref).unwrap(),
            SectionStatus::NeedsRevision
        );
        assert!(resumed
            .message_log
            .iter()
            .any(|m| m.body.contains("tighten the opening paragraph")));
        assert!(!resumed.interrupt.is_interrupted);
    }

    #[test]
    fn test_edit_replaces_content_and_sets_edited() {
        let controller = InterruptController::new();
        let content_ref = ContentRef::Section("executive_summary".to_string());
        // Approve first so the edit path exercises Approved -> Edited.
        let mut base = state_awaiting_review(true);
        base.transition(&content_ref, SectionStatus::Approved)
            .unwrap();
        let state = controller.raise_interrupt(
            &base,
            "executive_summary",
            content_ref.clone(),
            InterruptReason::ContentReview,
        );

        let edits = HashMap::from([(
            "executive_summary".to_string(),
            "rewritten by reviewer".to_string(),
        )]);
        let resumed = controller
            .apply_feedback(&state, HumanFeedback::edit(content_ref.clone(), edits))
            .unwrap();

        assert_eq!(
            resumed.status_of(&content_ref).unwrap(),
            SectionStatus::Edited
        );
        assert_eq!(
            resumed.content_of(&content_ref).unwrap(),
            Some("rewritten by reviewer")
        );
        assert!(resumed
            .section("executive_summary")
            .unwrap()
            .evaluation
            .is_none());
    }

    #[test]
    fn test_edit_feedback_on_section_under_review() {
        let controller = InterruptController::new();
        let content_ref = ContentRef::Section("executive_summary".to_string());
        // Failing evaluation, interrupted while still AwaitingReview: the
        // reviewer rewrites the section instead of approving or bouncing it.
        let state = controller.raise_interrupt(
            &state_awaiting_review(false),
            "executive_summary",
            content_ref.clone(),
            InterruptReason::EvaluationNeeded,
        );

        let edits = HashMap::from([(
            "executive_summary".to_string(),
            "reviewer replacement text".to_string(),
        )]);
        let resumed = controller
            .apply_feedback(&state, HumanFeedback::edit(content_ref.clone(), edits))
            .unwrap();

        assert_eq!(
            resumed.status_of(&content_ref).unwrap(),
            SectionStatus::Edited
        );
        assert_eq!(
            resumed.content_of(&content_ref).unwrap(),
            Some("reviewer replacement text")
        );
        assert!(!resumed.interrupt.is_interrupted);
    }

    #[test]
    fn test_feedback_without_interrupt_is_rejected() {
        let controller = InterruptController::new();
        let state = state_awaiting_review(false);
        let result = controller.apply_feedback(
            &state,
            HumanFeedback::approve(ContentRef::Section("executive_summary".to_string())),
        );
        assert!(matches!(result, Err(FeedbackError::NotInterrupted)));
    }

    #[test]
    fn test_feedback_while_processing_is_rejected() {
        let controller = InterruptController::new();
        let content_ref = ContentRef::Section("executive_summary".to_string());
        let mut state = controller.raise_interrupt(
            &state_awaiting_review(false),
            "executive_summary",
            content_ref.clone(),
            InterruptReason::EvaluationNeeded,
        );
        state.interrupt.processing = ProcessingStatus::Processing;

        let result = controller.apply_feedback(&state, HumanFeedback::approve(content_ref));
        assert!(matches!(result, Err(FeedbackError::AlreadyProcessing)));
    }

    #[test]
    fn test_edit_without_edits_is_rejected() {
        let controller = InterruptController::new();
        let content_ref = ContentRef::Section("executive_summary".to_string());
        let state = controller.raise_interrupt(
            &state_awaiting_review(false),
            "executive_summary",
            content_ref.clone(),
            InterruptReason::ContentReview,
        );

        let result = controller.apply_feedback(
            &state,
            HumanFeedback::edit(content_ref, HashMap::new()),
        );
        assert!(matches!(result, Err(FeedbackError::MissingEdits)));
    }
}
