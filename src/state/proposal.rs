use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::section::{SectionEntity, SectionStatus, StateError};

/// Ids of the three pipeline content slots. They participate in the
/// dependency graph under these names.
pub const RESEARCH_SLOT: &str = "research";
pub const SOLUTION_SLOT: &str = "solution";
pub const CONNECTIONS_SLOT: &str = "connections";

/// Addresses a piece of content: either one of the three pipeline slots or a
/// named document section. The evaluation engine, interrupt controller and
/// feedback application all use this one addressing scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentRef {
    Research,
    Solution,
    Connections,
    Section(String),
}

impl ContentRef {
    pub fn from_id(id: &str) -> Self {
        match id {
            RESEARCH_SLOT => ContentRef::Research,
            SOLUTION_SLOT => ContentRef::Solution,
            CONNECTIONS_SLOT => ContentRef::Connections,
            other => ContentRef::Section(other.to_string()),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ContentRef::Research => RESEARCH_SLOT,
            ContentRef::Solution => SOLUTION_SLOT,
            ContentRef::Connections => CONNECTIONS_SLOT,
            ContentRef::Section(id) => id,
        }
    }
}

impl std::fmt::Display for ContentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Per-criterion outcome inside an [`EvaluationResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionScore {
    pub score: f64,
    pub feedback: Option<String>,
}

/// The parsed, validated verdict of one evaluator call. Scores are 0-1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub overall_score: f64,
    pub passed: bool,
    pub feedback: String,
    pub criterion_scores: HashMap<String, CriterionScore>,
    pub evaluated_at: DateTime<Utc>,
}

/// One of the three pipeline content slots (research / solution / connections).
///
/// Same status discipline as [`SectionEntity`]; content is optional until the
/// slot's generation node has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSlot {
    pub content: Option<String>,
    status: SectionStatus,
    pub evaluation: Option<EvaluationResult>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Default for PipelineSlot {
    fn default() -> Self {
        Self {
            content: None,
            status: SectionStatus::Queued,
            evaluation: None,
            version: 0,
            updated_at: Utc::now(),
        }
    }
}

impl PipelineSlot {
    pub fn status(&self) -> SectionStatus {
        self.status
    }

    fn transition(&mut self, id: &str, to: SectionStatus) -> Result<(), StateError> {
        if !SectionStatus::can_transition(self.status, to) {
            return Err(StateError::IllegalTransition {
                id: id.to_string(),
                from: self.status,
                to,
            });
        }
        debug!(slot = %id, from = %self.status, to = %to, "Pipeline slot status transition");
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn set_generated_content(&mut self, id: &str, content: String) -> Result<(), StateError> {
        self.transition(id, SectionStatus::ReadyForEvaluation)?;
        self.content = Some(content);
        self.evaluation = None;
        self.version += 1;
        Ok(())
    }

    fn apply_edit(&mut self, id: &str, content: String) -> Result<(), StateError> {
        self.transition(id, SectionStatus::Edited)?;
        self.content = Some(content);
        self.evaluation = None;
        self.version += 1;
        Ok(())
    }

    fn attach_evaluation(&mut self, id: &str, result: EvaluationResult) -> Result<(), StateError> {
        self.transition(id, SectionStatus::AwaitingReview)?;
        self.evaluation = Some(result);
        Ok(())
    }
}

/// Timestamped entry in the append-only error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Timestamped entry in the append-only message/event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMessage {
    pub at: DateTime<Utc>,
    pub node_id: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Processed,
}

/// Why the workflow suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterruptReason {
    EvaluationNeeded,
    ContentReview,
    Error,
}

/// The persisted "resumable token": this plus [`InterruptMetadata`] is the
/// whole continuation. There is never an in-memory paused call stack, so a
/// suspended thread survives process restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptStatus {
    pub is_interrupted: bool,
    pub interruption_point: Option<String>,
    pub pending_feedback: Option<HumanFeedback>,
    pub processing: ProcessingStatus,
}

impl Default for InterruptStatus {
    fn default() -> Self {
        Self {
            is_interrupted: false,
            interruption_point: None,
            pending_feedback: None,
            processing: ProcessingStatus::Pending,
        }
    }
}

/// Audit record for a suspension, capturing the triggering evaluation verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptMetadata {
    pub reason: InterruptReason,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub content_ref: ContentRef,
    pub evaluation: Option<EvaluationResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedbackKind {
    Approve,
    Revise,
    Edit,
}

/// Human feedback submitted to clear an interrupt. The only external input
/// that can do so.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanFeedback {
    pub kind: FeedbackKind,
    pub content_ref: ContentRef,
    pub comments: Option<String>,
    /// For `Edit`: section/slot id -> replacement content.
    #[serde(default)]
    pub specific_edits: HashMap<String, String>,
}

impl HumanFeedback {
    pub fn approve(content_ref: ContentRef) -> Self {
        Self {
            kind: FeedbackKind::Approve,
            content_ref,
            comments: None,
            specific_edits: HashMap::new(),
        }
    }

    pub fn revise(content_ref: ContentRef, comments: impl Into<String>) -> Self {
        Self {
            kind: FeedbackKind::Revise,
            content_ref,
            comments: Some(comments.into()),
            specific_edits: HashMap::new(),
        }
    }

    pub fn edit(content_ref: ContentRef, edits: HashMap<String, String>) -> Self {
        Self {
            kind: FeedbackKind::Edit,
            content_ref,
            comments: None,
            specific_edits: edits,
        }
    }
}

/// Root aggregate for one workflow thread.
///
/// Steps never mutate a previous snapshot in place: they clone, mutate the
/// clone, and the new snapshot is the only one handed to the checkpoint store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalState {
    pub thread_id: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub sections: HashMap<String, SectionEntity>,

    pub research: PipelineSlot,
    pub solution: PipelineSlot,
    pub connections: PipelineSlot,

    pub error_log: Vec<ErrorEntry>,
    pub message_log: Vec<WorkflowMessage>,

    pub interrupt: InterruptStatus,
    pub interrupt_metadata: Option<InterruptMetadata>,
}

impl ProposalState {
    pub fn new(thread_id: impl Into<String>, owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            thread_id: thread_id.into(),
            owner: owner.into(),
            created_at: now,
            updated_at: now,
            sections: HashMap::new(),
            research: PipelineSlot::default(),
            solution: PipelineSlot::default(),
            connections: PipelineSlot::default(),
            error_log: Vec::new(),
            message_log: Vec::new(),
            interrupt: InterruptStatus::default(),
            interrupt_metadata: None,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Declare a section if it does not exist yet. Sections are never deleted.
    pub fn declare_section(&mut self, id: impl Into<String>, title: impl Into<String>) {
        let id = id.into();
        self.sections
            .entry(id.clone())
            .or_insert_with(|| SectionEntity::new(id, title.into()));
        self.touch();
    }

    pub fn section(&self, id: &str) -> Result<&SectionEntity, StateError> {
        self.sections
            .get(id)
            .ok_or_else(|| StateError::UnknownSection(id.to_string()))
    }

    fn slot(&self, content_ref: &ContentRef) -> Option<&PipelineSlot> {
        match content_ref {
            ContentRef::Research => Some(&self.research),
            ContentRef::Solution => Some(&self.solution),
            ContentRef::Connections => Some(&self.connections),
            ContentRef::Section(_) => None,
        }
    }

    fn slot_mut(&mut self, content_ref: &ContentRef) -> Option<&mut PipelineSlot> {
        match content_ref {
            ContentRef::Research => Some(&mut self.research),
            ContentRef::Solution => Some(&mut self.solution),
            ContentRef::Connections => Some(&mut self.connections),
            ContentRef::Section(_) => None,
        }
    }

    pub fn status_of(&self, content_ref: &ContentRef) -> Result<SectionStatus, StateError> {
        match self.slot(content_ref) {
            Some(slot) => Ok(slot.status()),
            None => Ok(self.section(content_ref.id())?.status()),
        }
    }

    pub fn evaluation_of(
        &self,
        content_ref: &ContentRef,
    ) -> Result<Option<&EvaluationResult>, StateError> {
        match self.slot(content_ref) {
            Some(slot) => Ok(slot.evaluation.as_ref()),
            None => Ok(self.section(content_ref.id())?.evaluation.as_ref()),
        }
    }

    pub fn content_of(&self, content_ref: &ContentRef) -> Result<Option<&str>, StateError> {
        match self.slot(content_ref) {
            Some(slot) => Ok(slot.content.as_deref()),
            None => {
                let section = self.section(content_ref.id())?;
                if section.version == 0 {
                    Ok(None)
                } else {
                    Ok(Some(section.content.as_str()))
                }
            }
        }
    }

    /// Checked status transition for a slot or section.
    pub fn transition(
        &mut self,
        content_ref: &ContentRef,
        to: SectionStatus,
    ) -> Result<(), StateError> {
        let id = content_ref.id().to_string();
        match self.slot_mut(content_ref) {
            Some(slot) => slot.transition(&id, to)?,
            None => {
                let section = self
                    .sections
                    .get_mut(&id)
                    .ok_or_else(|| StateError::UnknownSection(id.clone()))?;
                section.transition(to)?;
            }
        }
        self.touch();
        Ok(())
    }

    /// Commit a freshly generated draft: content replaced, evaluation cleared,
    /// version bumped, status -> ReadyForEvaluation.
    pub fn set_generated_content(
        &mut self,
        content_ref: &ContentRef,
        content: String,
    ) -> Result<(), StateError> {
        let id = content_ref.id().to_string();
        match self.slot_mut(content_ref) {
            Some(slot) => slot.set_generated_content(&id, content)?,
            None => {
                let section = self
                    .sections
                    .get_mut(&id)
                    .ok_or_else(|| StateError::UnknownSection(id.clone()))?;
                section.set_generated_content(content)?;
            }
        }
        self.touch();
        Ok(())
    }

    /// Replace content via a direct human edit (status -> Edited).
    pub fn apply_edit(&mut self, id: &str, content: String) -> Result<(), StateError> {
        let content_ref = ContentRef::from_id(id);
        match self.slot_mut(&content_ref) {
            Some(slot) => slot.apply_edit(id, content)?,
            None => {
                let section = self
                    .sections
                    .get_mut(id)
                    .ok_or_else(|| StateError::UnknownSection(id.to_string()))?;
                section.apply_edit(content)?;
            }
        }
        self.touch();
        Ok(())
    }

    /// Attach an evaluation result (status -> AwaitingReview). Only the
    /// evaluation engine calls this.
    pub fn attach_evaluation(
        &mut self,
        content_ref: &ContentRef,
        result: EvaluationResult,
    ) -> Result<(), StateError> {
        let id = content_ref.id().to_string();
        match self.slot_mut(content_ref) {
            Some(slot) => slot.attach_evaluation(&id, result)?,
            None => {
                let section = self
                    .sections
                    .get_mut(&id)
                    .ok_or_else(|| StateError::UnknownSection(id.clone()))?;
                section.attach_evaluation(result)?;
            }
        }
        self.touch();
        Ok(())
    }

    /// Dependency propagation hook: mark content stale if the transition is
    /// meaningful. Returns whether the status actually changed; Queued,
    /// already-Stale and unknown ids are no-ops.
    pub fn force_stale(&mut self, id: &str) -> bool {
        let content_ref = ContentRef::from_id(id);
        let current = match self.status_of(&content_ref) {
            Ok(status) => status,
            Err(_) => return false,
        };
        if matches!(current, SectionStatus::Queued | SectionStatus::Stale) {
            return false;
        }
        // Legal from every non-Queued state per the transition table.
        self.transition(&content_ref, SectionStatus::Stale).is_ok()
    }

    /// Record a node-local failure: error log entry plus Error status for the
    /// affected content only.
    pub fn record_content_error(&mut self, content_ref: &ContentRef, message: impl Into<String>) {
        let message = message.into();
        self.push_error(message);
        let _ = self.transition(content_ref, SectionStatus::Error);
    }

    pub fn push_error(&mut self, message: impl Into<String>) {
        self.error_log.push(ErrorEntry {
            at: Utc::now(),
            message: message.into(),
        });
        self.touch();
    }

    pub fn push_message(&mut self, node_id: impl Into<String>, body: impl Into<String>) {
        self.message_log.push(WorkflowMessage {
            at: Utc::now(),
            node_id: node_id.into(),
            body: body.into(),
        });
        self.touch();
    }

    /// All declared content ids with a non-success, non-queued status.
    pub fn unresolved_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for (id, content_ref) in [
            (RESEARCH_SLOT, ContentRef::Research),
            (SOLUTION_SLOT, ContentRef::Solution),
            (CONNECTIONS_SLOT, ContentRef::Connections),
        ] {
            if let Ok(status) = self.status_of(&content_ref) {
                if !status.is_terminal_success() {
                    ids.push(id.to_string());
                }
            }
        }
        for (id, section) in &self.sections {
            if !section.status().is_terminal_success() {
                ids.push(id.clone());
            }
        }
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(passed: bool) -> EvaluationResult {
        EvaluationResult {
            overall_score: if passed { 0.9 } else { 0.4 },
            passed,
            feedback: "test".to_string(),
            criterion_scores: HashMap::new(),
            evaluated_at: Utc::now(),
        }
    }

    #[test]
    fn test_slot_and_section_share_transition_discipline() {
        let mut state = ProposalState::new("thread-1", "user-1");
        state.declare_section("budget", "Budget");

        // Direct jump to Approved is illegal for both.
        assert!(state
            .transition(&ContentRef::Research, SectionStatus::Approved)
            .is_err());
        assert!(state
            .transition(
                &ContentRef::Section("budget".to_string()),
                SectionStatus::Approved
            )
            .is_err());
    }

    #[test]
    fn test_generated_content_clears_evaluation() {
        let mut state = ProposalState::new("thread-1", "user-1");
        state
            .transition(&ContentRef::Research, SectionStatus::Generating)
            .unwrap();
        state
            .set_generated_content(&ContentRef::Research, "findings".to_string())
            .unwrap();
        state
            .attach_evaluation(&ContentRef::Research, eval(false))
            .unwrap();
        assert!(state.evaluation_of(&ContentRef::Research).unwrap().is_some());

        state
            .transition(&ContentRef::Research, SectionStatus::NeedsRevision)
            .unwrap();
        state
            .transition(&ContentRef::Research, SectionStatus::Generating)
            .unwrap();
        state
            .set_generated_content(&ContentRef::Research, "better findings".to_string())
            .unwrap();
        assert!(state.evaluation_of(&ContentRef::Research).unwrap().is_none());
        assert_eq!(state.research.version, 2);
    }

    #[test]
    fn test_force_stale_skips_queued_and_stale() {
        let mut state = ProposalState::new("thread-1", "user-1");
        state.declare_section("summary", "Summary");

        // Queued: no-op.
        assert!(!state.force_stale("summary"));

        let content_ref = ContentRef::Section("summary".to_string());
        state
            .transition(&content_ref, SectionStatus::Generating)
            .unwrap();
        assert!(state.force_stale("summary"));
        // Already stale: idempotent no-op.
        assert!(!state.force_stale("summary"));
        // Unknown id: no-op, no panic.
        assert!(!state.force_stale("nonexistent"));
    }

    #[test]
    fn test_record_content_error_is_node_local() {
        let mut state = ProposalState::new("thread-1", "user-1");
        state.declare_section("summary", "Summary");
        state
            .transition(&ContentRef::Research, SectionStatus::Generating)
            .unwrap();

        state.record_content_error(&ContentRef::Research, "research evaluation failed: boom");

        assert_eq!(
            state.status_of(&ContentRef::Research).unwrap(),
            SectionStatus::Error
        );
        // Other content untouched.
        assert_eq!(
            state.status_of(&ContentRef::Solution).unwrap(),
            SectionStatus::Queued
        );
        assert_eq!(state.error_log.len(), 1);
        assert!(state.error_log[0].message.contains("evaluation failed"));
    }
}
