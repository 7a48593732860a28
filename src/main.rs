use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use grantflow::checkpoint::{CheckpointStore, FileCheckpointStore};
use grantflow::config::GrantflowConfig;
use grantflow::dependency::DependencyGraph;
use grantflow::interrupt::InterruptController;
use grantflow::state::{ContentRef, HumanFeedback, ProposalState};
use grantflow::telemetry::init_telemetry;

#[derive(Parser)]
#[command(name = "grantflow")]
#[command(about = "Checkpointed generate-evaluate-review workflow for funding proposals")]
#[command(
    long_about = "Grantflow drives funding-proposal drafting as a resumable workflow: \
                  content is generated, scored against weighted criteria, and suspended \
                  for human review at configured checkpoints. Every transition is \
                  checkpointed, so threads survive restarts and resume from feedback."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default grantflow.toml into the working directory
    Init {
        /// Overwrite an existing grantflow.toml
        #[arg(long, help = "Overwrite existing configuration")]
        force: bool,
    },
    /// List every thread with a checkpoint on disk
    Threads,
    /// Show section statuses and any pending interrupt for a thread
    Status {
        /// Workflow thread id
        #[arg(long)]
        thread: String,
    },
    /// Submit human feedback for a suspended thread
    Feedback {
        #[command(subcommand)]
        action: FeedbackAction,
    },
    /// Validate the configured dependency graph and print its order
    ValidateGraph,
}

#[derive(Subcommand)]
enum FeedbackAction {
    /// Approve the content under review
    Approve {
        #[arg(long)]
        thread: String,
        /// Slot or section id under review
        #[arg(long)]
        target: String,
        #[arg(long, help = "Optional reviewer comment")]
        comment: Option<String>,
    },
    /// Send the content back for revision with a comment
    Revise {
        #[arg(long)]
        thread: String,
        #[arg(long)]
        target: String,
        /// Guidance handed to the next generation round
        #[arg(long)]
        comment: String,
    },
    /// Replace content directly; dependents are marked stale
    Edit {
        #[arg(long)]
        thread: String,
        #[arg(long)]
        target: String,
        /// Replacement text
        #[arg(long, conflicts_with = "content_file")]
        content: Option<String>,
        /// Read replacement text from a file
        #[arg(long)]
        content_file: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    GrantflowConfig::load_env_file()?;
    init_telemetry()?;
    let cli = Cli::parse();

    tokio::runtime::Runtime::new()?.block_on(async {
        match cli.command {
            Commands::Init { force } => init_command(force),
            Commands::Threads => threads_command().await,
            Commands::Status { thread } => status_command(&thread).await,
            Commands::Feedback { action } => feedback_command(action).await,
            Commands::ValidateGraph => validate_graph_command(),
        }
    })
}

fn load_config() -> Result<GrantflowConfig> {
    GrantflowConfig::load().context("failed to load configuration")
}

fn store(config: &GrantflowConfig) -> FileCheckpointStore {
    FileCheckpointStore::new(&config.checkpoint.directory)
}

fn graph(config: &GrantflowConfig) -> Result<DependencyGraph> {
    if config.dependencies.is_empty() {
        Ok(DependencyGraph::default_proposal_graph())
    } else {
        Ok(DependencyGraph::new(config.dependencies.clone())?)
    }
}

fn init_command(force: bool) -> Result<()> {
    let path = std::path::Path::new("grantflow.toml");
    if path.exists() && !force {
        bail!("grantflow.toml already exists; rerun with --force to overwrite");
    }
    GrantflowConfig::default().save_to_file(path)?;
    println!("Wrote default configuration to grantflow.toml");
    Ok(())
}

async fn threads_command() -> Result<()> {
    let config = load_config()?;
    let store = store(&config);
    let threads = store.list_threads().await?;
    if threads.is_empty() {
        println!("No checkpointed threads in {}", config.checkpoint.directory);
        return Ok(());
    }
    for thread_id in threads {
        println!("{thread_id}");
    }
    Ok(())
}

async fn load_state(store: &FileCheckpointStore, thread: &str) -> Result<ProposalState> {
    let checkpoint = store
        .get(thread)
        .await?
        .with_context(|| format!("no checkpoint exists for thread '{thread}'"))?;
    Ok(checkpoint.state)
}

async fn status_command(thread: &str) -> Result<()> {
    let config = load_config()?;
    let store = store(&config);
    let state = load_state(&store, thread).await?;

    println!("Thread:  {}", state.thread_id);
    println!("Owner:   {}", state.owner);
    println!("Updated: {}", state.updated_at);
    println!();

    let mut ids: Vec<String> = vec![
        "research".to_string(),
        "solution".to_string(),
        "connections".to_string(),
    ];
    let mut section_ids: Vec<&String> = state.sections.keys().collect();
    section_ids.sort();
    ids.extend(section_ids.into_iter().cloned());

    for id in &ids {
        let content_ref = ContentRef::from_id(id);
        let status = state.status_of(&content_ref)?;
        let score = state
            .evaluation_of(&content_ref)?
            .map(|e| format!("  score {:.2}", e.overall_score))
            .unwrap_or_default();
        println!("  {id:<24} {status}{score}");
    }

    if state.interrupt.is_interrupted {
        println!();
        if let Some(metadata) = &state.interrupt_metadata {
            println!(
                "Awaiting feedback at '{}' ({:?}, since {})",
                metadata.node_id, metadata.reason, metadata.timestamp
            );
            if let Some(evaluation) = &metadata.evaluation {
                println!(
                    "  triggering evaluation: score {:.2}, passed: {}",
                    evaluation.overall_score, evaluation.passed
                );
                if !evaluation.feedback.is_empty() {
                    println!("  feedback: {}", evaluation.feedback);
                }
            }
        } else {
            println!("Awaiting feedback");
        }
    }

    if !state.error_log.is_empty() {
        println!();
        println!("Errors:");
        for entry in &state.error_log {
            println!("  {} {}", entry.at, entry.message);
        }
    }

    Ok(())
}

async fn feedback_command(action: FeedbackAction) -> Result<()> {
    let config = load_config()?;
    let store = store(&config);
    let graph = graph(&config)?;
    let controller = InterruptController::new();

    let (thread, feedback) = match action {
        FeedbackAction::Approve {
            thread,
            target,
            comment,
        } => {
            let mut feedback = HumanFeedback::approve(ContentRef::from_id(&target));
            feedback.comments = comment;
            (thread, feedback)
        }
        FeedbackAction::Revise {
            thread,
            target,
            comment,
        } => (
            thread.clone(),
            HumanFeedback::revise(ContentRef::from_id(&target), comment),
        ),
        FeedbackAction::Edit {
            thread,
            target,
            content,
            content_file,
        } => {
            let text = match (content, content_file) {
                (Some(text), None) => text,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                _ => bail!("provide exactly one of --content or --content-file"),
            };
            let edits = std::collections::HashMap::from([(target.clone(), text)]);
            (thread, HumanFeedback::edit(ContentRef::from_id(&target), edits))
        }
    };

    let state = load_state(&store, &thread).await?;
    let edited_ids: Vec<String> = feedback.specific_edits.keys().cloned().collect();

    let mut next = controller.apply_feedback(&state, feedback)?;
    for edited in &edited_ids {
        let marked = graph.propagate_stale(&mut next, edited);
        for id in marked {
            println!("Marked '{id}' stale (depends on '{edited}')");
        }
    }

    store.put(&thread, &next).await?;
    println!("Feedback recorded for thread '{thread}'; resume the workflow to continue");
    Ok(())
}

fn validate_graph_command() -> Result<()> {
    let config = load_config()?;
    let graph = graph(&config)?;
    let order = graph.validate()?;
    println!("Dependency graph is acyclic. Topological order:");
    for id in order {
        println!("  {id}");
    }
    Ok(())
}
