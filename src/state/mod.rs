//! Canonical in-memory representation of one workflow thread.
//!
//! [`ProposalState`] is the root aggregate: document metadata, the section
//! map, the three pipeline content slots, the append-only error and message
//! logs, and the interrupt status that makes a suspended thread resumable
//! after a process restart. All status changes go through the transition
//! table in [`section`]; nothing outside this module can set a status
//! directly.

pub mod proposal;
pub mod section;

pub use proposal::{
    ContentRef, CriterionScore, ErrorEntry, EvaluationResult, FeedbackKind, HumanFeedback,
    InterruptMetadata, InterruptReason, InterruptStatus, PipelineSlot, ProcessingStatus,
    ProposalState, WorkflowMessage, CONNECTIONS_SLOT, RESEARCH_SLOT, SOLUTION_SLOT,
};
pub use section::{SectionEntity, SectionStatus, StateError};
