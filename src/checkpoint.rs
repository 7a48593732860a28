//! Durable per-thread snapshots: the unit of crash recovery.
//!
//! Writes are last-write-wins per thread id and atomic (temp file + rename),
//! so a reader never observes a partial write. Reads of corrupt data fail
//! loudly; a silent default would erase in-flight human review context.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::state::ProposalState;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("checkpoint for thread '{thread_id}' is corrupt: {reason}")]
    Corrupt { thread_id: String, reason: String },
}

/// Provenance recorded alongside every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub checkpoint_id: String,
    pub hostname: String,
    pub pid: u32,
}

/// A full serialized snapshot of one thread's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub state: ProposalState,
    pub written_at: DateTime<Utc>,
    pub metadata: CheckpointMetadata,
}

fn new_checkpoint_id() -> String {
    format!("{}_{}", Utc::now().timestamp(), rand::rng().random::<u32>())
}

fn new_metadata() -> CheckpointMetadata {
    CheckpointMetadata {
        checkpoint_id: new_checkpoint_id(),
        hostname: hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string(),
        pid: std::process::id(),
    }
}

/// Persistence boundary for thread state. Implementations must serialize
/// writes per thread id while allowing concurrent writes across distinct
/// threads.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist the snapshot; returns the checkpoint id.
    async fn put(&self, thread_id: &str, state: &ProposalState) -> Result<String, CheckpointError>;

    /// Latest successfully written snapshot, or `None` for an unknown thread.
    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    async fn delete(&self, thread_id: &str) -> Result<(), CheckpointError>;
}

/// File-backed store: one `<thread_id>.checkpoint.json` per thread.
pub struct FileCheckpointStore {
    directory: PathBuf,
    // Per-thread write locks; distinct threads write concurrently.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileCheckpointStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn checkpoint_path(&self, thread_id: &str) -> PathBuf {
        self.directory.join(format!("{thread_id}.checkpoint.json"))
    }

    async fn lock_for(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Thread ids of every checkpoint currently on disk.
    pub async fn list_threads(&self) -> Result<Vec<String>, CheckpointError> {
        if !self.directory.exists() {
            return Ok(vec![]);
        }
        let mut threads = Vec::new();
        let mut entries = fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(thread_id) = name.strip_suffix(".checkpoint.json") {
                    threads.push(thread_id.to_string());
                }
            }
        }
        threads.sort();
        Ok(threads)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn put(&self, thread_id: &str, state: &ProposalState) -> Result<String, CheckpointError> {
        let lock = self.lock_for(thread_id).await;
        let _guard = lock.lock().await;

        fs::create_dir_all(&self.directory).await?;

        let checkpoint = Checkpoint {
            thread_id: thread_id.to_string(),
            state: state.clone(),
            written_at: Utc::now(),
            metadata: new_metadata(),
        };
        let serialized = serde_json::to_string_pretty(&checkpoint)?;

        // Write to a temporary file first, then rename (atomic swap).
        let path = self.checkpoint_path(thread_id);
        let temp_path = self
            .directory
            .join(format!("{thread_id}.checkpoint.json.tmp"));
        fs::write(&temp_path, serialized).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(
            thread_id = %thread_id,
            checkpoint_id = %checkpoint.metadata.checkpoint_id,
            file = %path.display(),
            "Checkpoint written"
        );

        Ok(checkpoint.metadata.checkpoint_id)
    }

    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.checkpoint_path(thread_id);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(thread_id = %thread_id, "No checkpoint on disk");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let checkpoint: Checkpoint =
            serde_json::from_str(&contents).map_err(|e| {
                warn!(
                    thread_id = %thread_id,
                    file = %path.display(),
                    error = %e,
                    "Checkpoint file is corrupt"
                );
                CheckpointError::Corrupt {
                    thread_id: thread_id.to_string(),
                    reason: e.to_string(),
                }
            })?;

        info!(
            thread_id = %thread_id,
            checkpoint_id = %checkpoint.metadata.checkpoint_id,
            written_at = %checkpoint.written_at,
            "Checkpoint loaded"
        );

        Ok(Some(checkpoint))
    }

    async fn delete(&self, thread_id: &str) -> Result<(), CheckpointError> {
        let lock = self.lock_for(thread_id).await;
        let _guard = lock.lock().await;

        match fs::remove_file(self.checkpoint_path(thread_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for tests and embedding.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(&self, thread_id: &str, state: &ProposalState) -> Result<String, CheckpointError> {
        let checkpoint = Checkpoint {
            thread_id: thread_id.to_string(),
            state: state.clone(),
            written_at: Utc::now(),
            metadata: new_metadata(),
        };
        let id = checkpoint.metadata.checkpoint_id.clone();
        self.checkpoints
            .write()
            .await
            .insert(thread_id.to_string(), checkpoint);
        Ok(id)
    }

    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.checkpoints.read().await.get(thread_id).cloned())
    }

    async fn delete(&self, thread_id: &str) -> Result<(), CheckpointError> {
        self.checkpoints.write().await.remove(thread_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_state(thread_id: &str) -> ProposalState {
        let mut state = ProposalState::new(thread_id, "user-1");
        state.declare_section("executive_summary", "Executive Summary");
        state.push_message("orchestrator", "thread started");
        state
    }

    #[tokio::test]
    async fn test_put_then_get_round_trips_exactly() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let state = test_state("thread-1");

        store.put("thread-1", &state).await.unwrap();
        let loaded = store.get("thread-1").await.unwrap().unwrap();
        assert_eq!(loaded.state, state);
    }

    #[tokio::test]
    async fn test_recovery_after_simulated_crash() {
        let dir = TempDir::new().unwrap();
        let state = test_state("thread-1");
        {
            let store = FileCheckpointStore::new(dir.path());
            store.put("thread-1", &state).await.unwrap();
            // Store dropped: simulates the process dying.
        }

        let fresh = FileCheckpointStore::new(dir.path());
        let loaded = fresh.get("thread-1").await.unwrap().unwrap();
        assert_eq!(loaded.state, state);
    }

    #[tokio::test]
    async fn test_unknown_thread_is_none_not_default() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        assert!(store.get("never-written").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_fails_loudly() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("thread-1.checkpoint.json"), "{broken")
            .await
            .unwrap();

        let result = store.get("thread-1").await;
        assert!(matches!(result, Err(CheckpointError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let mut state = test_state("thread-1");

        store.put("thread-1", &state).await.unwrap();
        state.push_error("something went wrong");
        store.put("thread-1", &state).await.unwrap();

        let loaded = store.get("thread-1").await.unwrap().unwrap();
        assert_eq!(loaded.state.error_log.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_threads_write_concurrently() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileCheckpointStore::new(dir.path()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let thread_id = format!("thread-{i}");
                let state = test_state(&thread_id);
                store.put(&thread_id, &state).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let threads = store.list_threads().await.unwrap();
        assert_eq!(threads.len(), 8);
    }

    #[tokio::test]
    async fn test_delete_then_get_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let state = test_state("thread-1");

        store.put("thread-1", &state).await.unwrap();
        store.delete("thread-1").await.unwrap();
        assert!(store.get("thread-1").await.unwrap().is_none());
        // Deleting again is fine.
        store.delete("thread-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryCheckpointStore::new();
        let state = test_state("thread-1");

        store.put("thread-1", &state).await.unwrap();
        let loaded = store.get("thread-1").await.unwrap().unwrap();
        assert_eq!(loaded.state, state);
        assert!(store.get("thread-2").await.unwrap().is_none());
    }
}
