//! The driver loop: generate -> evaluate -> interrupt-check -> route, with a
//! checkpoint written after every committed transition.
//!
//! Suspension is never an in-memory paused call stack: when a node needs
//! human review the orchestrator persists the snapshot and returns
//! [`RunOutcome::Suspended`]; [`Orchestrator::resume`] rebuilds the
//! continuation from the checkpoint.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::collaborators::{ContentGenerator, GeneratorError};
use crate::config::GrantflowConfig;
use crate::dependency::{DependencyGraph, DependencyGraphError};
use crate::evaluation::{EvaluationEngine, EvaluationError};
use crate::interrupt::{FeedbackError, InterruptController, Route};
use crate::telemetry::{create_workflow_span, generate_correlation_id};
use crate::state::{
    ContentRef, FeedbackKind, HumanFeedback, InterruptReason, ProcessingStatus, ProposalState,
    SectionStatus, StateError,
};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("no checkpoint exists for thread '{0}'")]
    UnknownThread(String),

    #[error("a checkpoint already exists for thread '{0}'")]
    ThreadExists(String),

    #[error(transparent)]
    Generator(#[from] GeneratorError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Feedback(#[from] FeedbackError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Graph(#[from] DependencyGraphError),
}

/// How a drive of the workflow ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every declared node reached a terminal success status.
    Completed,
    /// Suspended awaiting human feedback at the named node.
    Suspended { node_id: String },
    /// No node is pending but some ended in Error; resumable once the
    /// underlying cause is resolved.
    Halted { errored: Vec<String> },
    /// Caller-initiated cancellation; the last checkpoint stands.
    Cancelled,
}

/// One declared step of the pipeline: the three content slots first, then the
/// document sections in plan order.
#[derive(Debug, Clone)]
pub struct WorkflowNode {
    pub id: String,
    pub content_ref: ContentRef,
    pub content_type: String,
}

enum StepResult {
    Advanced(ProposalState),
    Suspended(ProposalState, String),
    /// Cancelled mid-phase; carries the last committed snapshot.
    Cancelled(ProposalState),
}

pub struct Orchestrator {
    config: GrantflowConfig,
    graph: DependencyGraph,
    engine: EvaluationEngine,
    generator: Arc<dyn ContentGenerator>,
    controller: InterruptController,
    store: Arc<dyn CheckpointStore>,
    nodes: Vec<WorkflowNode>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Orchestrator {
    /// Build an orchestrator. The dependency graph is validated here; a
    /// cyclic or dangling declaration fails construction, never a request.
    pub fn new(
        config: GrantflowConfig,
        engine: EvaluationEngine,
        generator: Arc<dyn ContentGenerator>,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, DependencyGraphError> {
        let graph = if config.dependencies.is_empty() {
            DependencyGraph::default_proposal_graph()
        } else {
            DependencyGraph::new(config.dependencies.clone())?
        };

        let mut nodes = vec![
            WorkflowNode {
                id: "research".to_string(),
                content_ref: ContentRef::Research,
                content_type: "research".to_string(),
            },
            WorkflowNode {
                id: "solution".to_string(),
                content_ref: ContentRef::Solution,
                content_type: "solution".to_string(),
            },
            WorkflowNode {
                id: "connections".to_string(),
                content_ref: ContentRef::Connections,
                content_type: "connections".to_string(),
            },
        ];
        for plan in &config.sections {
            nodes.push(WorkflowNode {
                id: plan.id.clone(),
                content_ref: ContentRef::Section(plan.id.clone()),
                content_type: "section".to_string(),
            });
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            graph,
            engine,
            generator,
            controller: InterruptController::new(),
            store,
            nodes,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn nodes(&self) -> &[WorkflowNode] {
        &self.nodes
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Request cancellation of the in-flight drive. The current step commits
    /// nothing; the last written checkpoint remains the recoverable state.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn is_cancelled(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Start a fresh thread and drive it until completion, suspension or
    /// cancellation. Returns the thread id with the outcome. A thread id
    /// that already has a checkpoint is refused; overwriting it would erase
    /// in-flight review context.
    pub async fn run_thread(
        &self,
        thread_id: Option<String>,
        owner: &str,
    ) -> Result<(String, RunOutcome), WorkflowError> {
        let thread_id = match thread_id {
            Some(id) => {
                if self.store.get(&id).await?.is_some() {
                    return Err(WorkflowError::ThreadExists(id));
                }
                id
            }
            None => Uuid::new_v4().to_string(),
        };
        let mut state = ProposalState::new(thread_id.clone(), owner);
        for plan in &self.config.sections {
            state.declare_section(&plan.id, &plan.title);
        }
        state.push_message("orchestrator", "workflow started");
        self.save(&state).await?;

        info!(thread_id = %thread_id, owner = %owner, "Workflow thread started");
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span(
            "run_thread",
            Some(&thread_id),
            None,
            Some(correlation_id.as_str()),
        );
        let outcome = self.drive(state).instrument(span).await?;
        Ok((thread_id, outcome))
    }

    /// Resume a suspended thread with human feedback. Edits trigger
    /// dependency propagation before the sequence continues.
    pub async fn resume(
        &self,
        thread_id: &str,
        feedback: HumanFeedback,
    ) -> Result<RunOutcome, WorkflowError> {
        let checkpoint = self
            .store
            .get(thread_id)
            .await?
            .ok_or_else(|| WorkflowError::UnknownThread(thread_id.to_string()))?;
        let state = checkpoint.state;

        if state.interrupt.processing == ProcessingStatus::Processing {
            return Err(WorkflowError::Feedback(FeedbackError::AlreadyProcessing));
        }

        let is_edit = feedback.kind == FeedbackKind::Edit;
        let edited_ids: Vec<String> = feedback.specific_edits.keys().cloned().collect();
        let submitted = feedback.clone();

        let mut next = self.controller.apply_feedback(&state, feedback)?;

        if is_edit {
            for edited in &edited_ids {
                let marked = self.graph.propagate_stale(&mut next, edited);
                if !marked.is_empty() {
                    info!(
                        thread_id = %thread_id,
                        edited = %edited,
                        stale = ?marked,
                        "Edit invalidated dependent content"
                    );
                }
            }
        }

        // Guards a second resume submission until this drive settles; the
        // submitted feedback rides along in the snapshot for audit.
        next.interrupt.processing = ProcessingStatus::Processing;
        next.interrupt.pending_feedback = Some(submitted);
        self.save(&next).await?;

        info!(thread_id = %thread_id, "Workflow thread resumed");
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span(
            "resume",
            Some(thread_id),
            None,
            Some(correlation_id.as_str()),
        );
        self.drive(next).instrument(span).await
    }

    /// Re-enter the drive loop for a thread whose process died mid-drive.
    ///
    /// A crash after a resume snapshot was written leaves the checkpoint
    /// with `processing == Processing` and no interrupt, which blocks
    /// `resume` permanently. Recovery takes over that guard and continues
    /// from the last written snapshot. On a thread that is merely suspended
    /// this is a no-op reporting where it waits.
    pub async fn recover(&self, thread_id: &str) -> Result<RunOutcome, WorkflowError> {
        let checkpoint = self
            .store
            .get(thread_id)
            .await?
            .ok_or_else(|| WorkflowError::UnknownThread(thread_id.to_string()))?;
        let mut state = checkpoint.state;

        if state.interrupt.is_interrupted {
            let node_id = state
                .interrupt
                .interruption_point
                .clone()
                .unwrap_or_default();
            info!(thread_id = %thread_id, node_id = %node_id, "Thread is awaiting feedback, nothing to recover");
            return Ok(RunOutcome::Suspended { node_id });
        }

        state.interrupt.processing = ProcessingStatus::Processing;
        self.save(&state).await?;

        info!(thread_id = %thread_id, "Workflow thread recovered from checkpoint");
        let correlation_id = generate_correlation_id();
        let span = create_workflow_span(
            "recover",
            Some(thread_id),
            None,
            Some(correlation_id.as_str()),
        );
        self.drive(state).instrument(span).await
    }

    /// Main loop: advance one phase at a time until nothing is pending.
    async fn drive(&self, mut state: ProposalState) -> Result<RunOutcome, WorkflowError> {
        loop {
            if self.is_cancelled() {
                return self.finish_cancelled(state).await;
            }

            let Some(node) = self.next_pending_node(&state).cloned() else {
                return self.finish(state).await;
            };

            match self.run_phase(state, &node).await? {
                StepResult::Advanced(next) => state = next,
                StepResult::Suspended(next, node_id) => {
                    self.save(&next).await?;
                    return Ok(RunOutcome::Suspended { node_id });
                }
                StepResult::Cancelled(prior) => return self.finish_cancelled(prior).await,
            }
        }
    }

    fn next_pending_node(&self, state: &ProposalState) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|node| {
            match state.status_of(&node.content_ref) {
                // Error waits for a manual retry; other nodes keep going.
                Ok(SectionStatus::Error) => false,
                Ok(status) => !status.is_terminal_success(),
                Err(_) => false,
            }
        })
    }

    async fn finish(&self, mut state: ProposalState) -> Result<RunOutcome, WorkflowError> {
        state.interrupt.processing = ProcessingStatus::Processed;
        state.interrupt.pending_feedback = None;
        let errored: Vec<String> = self
            .nodes
            .iter()
            .filter(|node| {
                matches!(
                    state.status_of(&node.content_ref),
                    Ok(SectionStatus::Error)
                )
            })
            .map(|node| node.id.clone())
            .collect();
        self.save(&state).await?;

        if errored.is_empty() {
            info!(thread_id = %state.thread_id, "Workflow thread completed");
            Ok(RunOutcome::Completed)
        } else {
            warn!(
                thread_id = %state.thread_id,
                errored = ?errored,
                "Workflow thread halted with errored content"
            );
            Ok(RunOutcome::Halted { errored })
        }
    }

    async fn finish_cancelled(
        &self,
        mut state: ProposalState,
    ) -> Result<RunOutcome, WorkflowError> {
        state.interrupt.processing = ProcessingStatus::Processed;
        state.interrupt.pending_feedback = None;
        self.save(&state).await?;
        info!(thread_id = %state.thread_id, "Workflow thread cancelled");
        Ok(RunOutcome::Cancelled)
    }

    /// Advance `node` by exactly one phase, keyed off its current status.
    /// Every committed transition is checkpointed before returning.
    async fn run_phase(
        &self,
        state: ProposalState,
        node: &WorkflowNode,
    ) -> Result<StepResult, WorkflowError> {
        let status = state.status_of(&node.content_ref)?;
        match status {
            SectionStatus::Queued | SectionStatus::NeedsRevision | SectionStatus::Generating => {
                self.generate_phase(state, node).await
            }
            SectionStatus::ReadyForEvaluation => self.evaluate_phase(state, node).await,
            SectionStatus::AwaitingReview => self.route_phase(state, node).await,
            SectionStatus::Stale => {
                // Stale content needs an explicit keep/regenerate decision.
                let suspended = self.controller.raise_interrupt(
                    &state,
                    &node.id,
                    node.content_ref.clone(),
                    InterruptReason::ContentReview,
                );
                Ok(StepResult::Suspended(suspended, node.id.clone()))
            }
            // Approved / Edited / Error never reach here.
            other => {
                debug!(node_id = %node.id, status = %other, "Nothing to do for node");
                Ok(StepResult::Advanced(state))
            }
        }
    }

    async fn generate_phase(
        &self,
        state: ProposalState,
        node: &WorkflowNode,
    ) -> Result<StepResult, WorkflowError> {
        let mut next = state.clone();
        if next.status_of(&node.content_ref)? != SectionStatus::Generating {
            next.transition(&node.content_ref, SectionStatus::Generating)?;
        }

        let context = self.build_context(&next);
        let guidance = self.guidance_for(&next, node);

        let mut shutdown = self.shutdown_rx.clone();
        let generated = tokio::select! {
            _ = shutdown.changed() => return Ok(StepResult::Cancelled(state)),
            result = self.call_generator(node, &context, guidance.as_deref()) => result,
        };

        match generated {
            Ok(content) => {
                next.set_generated_content(&node.content_ref, content)?;
                self.save(&next).await?;
                Ok(StepResult::Advanced(next))
            }
            Err(e) => {
                // Collaborator unavailability surfaces to the caller; the
                // failure is still recorded against this content only.
                error!(node_id = %node.id, error = %e, "Generation failed");
                next.record_content_error(
                    &node.content_ref,
                    format!("{} generation failed: {e}", node.content_type),
                );
                self.save(&next).await?;
                Err(WorkflowError::Generator(e))
            }
        }
    }

    async fn call_generator(
        &self,
        node: &WorkflowNode,
        context: &str,
        guidance: Option<&str>,
    ) -> Result<String, GeneratorError> {
        if node.content_ref == ContentRef::Research
            && !self.config.orchestrator.research_queries.is_empty()
        {
            self.gather_research(context, guidance).await
        } else {
            self.generator
                .generate(&node.content_type, context, guidance)
                .await
        }
    }

    /// Fan out configured research sub-queries concurrently and join at a
    /// barrier. Each branch carries its own timeout and attempt budget so one
    /// slow branch cannot starve the others; the barrier proceeds once every
    /// branch completes or exhausts its budget.
    async fn gather_research(
        &self,
        context: &str,
        guidance: Option<&str>,
    ) -> Result<String, GeneratorError> {
        let timeout = Duration::from_secs(self.config.orchestrator.research_branch_timeout_secs);
        let attempts = self.config.orchestrator.research_branch_attempts.max(1);

        let mut join_set = JoinSet::new();
        for query in self.config.orchestrator.research_queries.clone() {
            let generator = Arc::clone(&self.generator);
            let branch_context = format!("{context}\n\nResearch focus: {query}");
            let guidance = guidance.map(|g| g.to_string());
            join_set.spawn(async move {
                for attempt in 1..=attempts {
                    let call = generator.generate("research", &branch_context, guidance.as_deref());
                    match tokio::time::timeout(timeout, call).await {
                        Ok(Ok(content)) => return (query, Some(content)),
                        Ok(Err(e)) => {
                            warn!(query = %query, attempt = %attempt, error = %e, "Research branch failed");
                        }
                        Err(_) => {
                            warn!(query = %query, attempt = %attempt, "Research branch timed out");
                        }
                    }
                }
                (query, None)
            });
        }

        let mut digests = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            if let Ok((query, Some(content))) = joined {
                digests.push(format!("## {query}\n\n{content}"));
            }
        }

        if digests.is_empty() {
            return Err(GeneratorError::Unavailable {
                reason: "every research branch exhausted its attempt budget".to_string(),
            });
        }
        digests.sort();
        Ok(digests.join("\n\n"))
    }

    async fn evaluate_phase(
        &self,
        state: ProposalState,
        node: &WorkflowNode,
    ) -> Result<StepResult, WorkflowError> {
        let content = state
            .content_of(&node.content_ref)?
            .unwrap_or_default()
            .to_string();

        match self.score_with_retry(node, &content).await {
            Ok(Some(result)) => {
                let next = self.engine.apply_result(&state, &node.content_ref, result)?;
                self.save(&next).await?;
                Ok(StepResult::Advanced(next))
            }
            Ok(None) => Ok(StepResult::Cancelled(state)),
            Err(e) => {
                // Node-local: error log + Error status for this content only,
                // then keep going with the rest of the document.
                let next =
                    self.engine
                        .record_failure(&state, &node.content_type, &node.content_ref, &e);
                self.save(&next).await?;
                Ok(StepResult::Advanced(next))
            }
        }
    }

    /// One evaluator call per attempt; only transient evaluator failures are
    /// retried, with exponential backoff. Validation and malformed-response
    /// failures are surfaced on the first attempt. `Ok(None)` means the wait
    /// was cancelled.
    async fn score_with_retry(
        &self,
        node: &WorkflowNode,
        content: &str,
    ) -> Result<Option<crate::state::EvaluationResult>, EvaluationError> {
        let retry = &self.config.orchestrator.retry;
        let max_attempts = retry.max_attempts.max(1) as u32;

        let mut attempt = 1u32;
        loop {
            match self
                .engine
                .score(&node.content_type, &node.id, content)
                .await
            {
                Ok(result) => return Ok(Some(result)),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = backoff_delay(retry.base_delay_ms, retry.max_delay_ms, attempt);
                    warn!(
                        node_id = %node.id,
                        attempt = %attempt,
                        delay_ms = %delay.as_millis(),
                        error = %e,
                        "Transient evaluator failure, backing off"
                    );
                    let mut shutdown = self.shutdown_rx.clone();
                    tokio::select! {
                        _ = shutdown.changed() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn route_phase(
        &self,
        state: ProposalState,
        node: &WorkflowNode,
    ) -> Result<StepResult, WorkflowError> {
        let is_review_checkpoint = self
            .config
            .orchestrator
            .review_checkpoints
            .iter()
            .any(|id| id == &node.id);

        match self.controller.after_evaluation(&state, &node.content_ref) {
            Route::Continue => {
                if is_review_checkpoint {
                    // Explicitly gated: a pass still needs a human sign-off.
                    let suspended = self.controller.raise_interrupt(
                        &state,
                        &node.id,
                        node.content_ref.clone(),
                        InterruptReason::ContentReview,
                    );
                    return Ok(StepResult::Suspended(suspended, node.id.clone()));
                }
                let mut next = state;
                next.transition(&node.content_ref, SectionStatus::Approved)?;
                self.save(&next).await?;
                Ok(StepResult::Advanced(next))
            }
            Route::Revise => {
                let rounds = revision_count(&state, &node.content_ref);
                if is_review_checkpoint
                    || rounds > self.config.orchestrator.max_revision_rounds as u64
                {
                    let suspended = self.controller.raise_interrupt(
                        &state,
                        &node.id,
                        node.content_ref.clone(),
                        InterruptReason::EvaluationNeeded,
                    );
                    return Ok(StepResult::Suspended(suspended, node.id.clone()));
                }

                let feedback = state
                    .evaluation_of(&node.content_ref)?
                    .map(|result| result.feedback.clone())
                    .unwrap_or_default();
                let mut next = state;
                next.transition(&node.content_ref, SectionStatus::NeedsRevision)?;
                if !feedback.is_empty() {
                    next.push_message(&node.id, feedback);
                }
                self.save(&next).await?;
                Ok(StepResult::Advanced(next))
            }
            Route::AwaitingFeedback => {
                let suspended = if state.interrupt.is_interrupted {
                    state
                } else {
                    self.controller.raise_interrupt(
                        &state,
                        &node.id,
                        node.content_ref.clone(),
                        InterruptReason::EvaluationNeeded,
                    )
                };
                Ok(StepResult::Suspended(suspended, node.id.clone()))
            }
        }
    }

    /// Generation context: everything already accepted into the document, in
    /// pipeline order.
    fn build_context(&self, state: &ProposalState) -> String {
        let mut parts = vec![format!(
            "Funding proposal thread {} (owner: {})",
            state.thread_id, state.owner
        )];
        for node in &self.nodes {
            let accepted = state
                .status_of(&node.content_ref)
                .map(|status| status.is_terminal_success())
                .unwrap_or(false);
            if accepted {
                if let Ok(Some(content)) = state.content_of(&node.content_ref) {
                    parts.push(format!("# {}\n\n{}", node.id, content));
                }
            }
        }
        parts.join("\n\n")
    }

    /// Accumulated revision guidance for a node: every message logged against
    /// it (evaluator feedback and reviewer comments), oldest first.
    fn guidance_for(&self, state: &ProposalState, node: &WorkflowNode) -> Option<String> {
        let lines: Vec<&str> = state
            .message_log
            .iter()
            .filter(|m| m.node_id == node.id)
            .map(|m| m.body.as_str())
            .collect();
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }

    async fn save(&self, state: &ProposalState) -> Result<(), WorkflowError> {
        if !self.config.checkpoint.enable_persistence {
            return Ok(());
        }
        self.store.put(&state.thread_id, state).await?;
        Ok(())
    }
}

fn revision_count(state: &ProposalState, content_ref: &ContentRef) -> u64 {
    match content_ref {
        ContentRef::Research => state.research.version,
        ContentRef::Solution => state.solution.version,
        ContentRef::Connections => state.connections.version,
        ContentRef::Section(id) => state.section(id).map(|s| s.version).unwrap_or(0),
    }
}

fn backoff_delay(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(16);
    Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
}
