// Grantflow - Funding-Proposal Workflow Engine
// This exposes the core components for testing and integration

pub mod checkpoint;
pub mod collaborators;
pub mod config;
pub mod dependency;
pub mod evaluation;
pub mod interrupt;
pub mod orchestrator;
pub mod state;
pub mod telemetry;

// Re-export key types for easy access
pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
};
pub use collaborators::{ContentEvaluator, ContentGenerator, EvaluatorError, GeneratorError};
pub use config::GrantflowConfig;
pub use dependency::{DependencyGraph, DependencyGraphError};
pub use evaluation::{CriteriaConfig, CriteriaLoader, Criterion, EvaluationEngine, EvaluationError};
pub use interrupt::{FeedbackError, InterruptController, Route};
pub use orchestrator::{Orchestrator, RunOutcome, WorkflowError, WorkflowNode};
pub use state::{
    ContentRef, EvaluationResult, FeedbackKind, HumanFeedback, InterruptReason, InterruptStatus,
    ProcessingStatus, ProposalState, SectionStatus, StateError,
};
pub use telemetry::{create_workflow_span, generate_correlation_id, init_telemetry};
