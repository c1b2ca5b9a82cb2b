use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::task::{result_filename, TaskEnvelope, TaskResult};

/// Task queue on a shared filesystem.
///
/// Workers claim tasks by renaming them out of `_queue`, which only one
/// process can do for a given file.
pub struct TaskQueue {
    pub root: PathBuf,
    pub queue_dir: PathBuf,
    pub in_progress_dir: PathBuf,
    pub completed_dir: PathBuf,
    pub failed_dir: PathBuf,
    pub lock_dir: PathBuf,
}

impl TaskQueue {
    pub fn new(root: PathBuf) -> Self {
        Self {
            queue_dir: root.join("_queue"),
            in_progress_dir: root.join("_in_progress"),
            completed_dir: root.join("_completed"),
            failed_dir: root.join("_failed"),
            lock_dir: root.join("_locks"),
            root,
        }
    }

    /// Initialize queue directories
    pub async fn init(&self) -> Result<()> {
        for dir in self.dirs() {
            async_fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    fn dirs(&self) -> [&PathBuf; 5] {
        [
            &self.queue_dir,
            &self.in_progress_dir,
            &self.completed_dir,
            &self.failed_dir,
            &self.lock_dir,
        ]
    }

    /// Add a task to the queue. The file only appears under its final
    /// name once fully written.
    pub async fn enqueue(&self, envelope: &TaskEnvelope) -> Result<PathBuf> {
        let task_path = self.queue_dir.join(envelope.task_filename());
        let partial_path = self.queue_dir.join(format!("{}.partial", envelope.id));

        let content = serde_json::to_vec_pretty(envelope)?;
        if let Err(e) = async_fs::write(&partial_path, content).await {
            let _ = async_fs::remove_file(&partial_path).await;
            return Err(anyhow!("Failed to create task file: {}", e));
        }
        async_fs::rename(&partial_path, &task_path).await?;

        debug!("Created task: {:?}", task_path);
        Ok(task_path)
    }

    /// Atomically claim a task from the queue
    pub async fn claim(&self) -> Result<Option<ClaimedTask<'_>>> {
        let mut entries = async_fs::read_dir(&self.queue_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "task") {
                continue;
            }

            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow!("Invalid task filename"))?
                .to_string();
            let in_progress_path = self.in_progress_dir.join(&file_name);

            if async_fs::rename(&path, &in_progress_path).await.is_err() {
                // Claimed by another worker
                continue;
            }
            debug!("Claimed task: {}", file_name);

            let id = file_name.trim_end_matches(".task").to_string();
            // Once renamed the task is ours; any read failure must still end in a result
            let envelope = match async_fs::read(&in_progress_path).await {
                Ok(content) => serde_json::from_slice::<TaskEnvelope>(&content).map_err(|e| {
                    TaskError::invalid_task(format!("unreadable task file {file_name}: {e}"))
                }),
                Err(e) => Err(TaskError::invalid_task(format!(
                    "could not read task file {file_name}: {e}"
                ))),
            };

            return Ok(Some(ClaimedTask {
                queue: self,
                id,
                in_progress_path,
                envelope,
            }));
        }

        Ok(None)
    }

    /// Get count of pending tasks
    pub async fn pending_count(&self) -> Result<usize> {
        let mut count = 0;
        let mut entries = async_fs::read_dir(&self.queue_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().is_some_and(|ext| ext == "task") {
                count += 1;
            }
        }

        Ok(count)
    }

    /// Result written for a finished task, if any
    pub async fn result(&self, id: &str) -> Result<Option<TaskResult>> {
        for dir in [&self.completed_dir, &self.failed_dir] {
            let path = dir.join(result_filename(id));
            if path.exists() {
                let content = async_fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("Failed to read {:?}", path))?;
                return Ok(Some(serde_json::from_str(&content)?));
            }
        }
        Ok(None)
    }

    /// Clean up all queue directories
    pub async fn clean(&self) -> Result<()> {
        for dir in self.dirs() {
            if dir.exists() {
                async_fs::remove_dir_all(dir).await?;
            }
        }
        Ok(())
    }
}

/// A task that has been claimed by a worker
pub struct ClaimedTask<'a> {
    queue: &'a TaskQueue,
    id: String,
    in_progress_path: PathBuf,
    /// Parsed envelope, or why the task file could not be read
    pub envelope: std::result::Result<TaskEnvelope, TaskError>,
}

impl<'a> ClaimedTask<'a> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Record the result and move the task out of `_in_progress`.
    pub async fn finish(self, result: &TaskResult) -> Result<PathBuf> {
        let target_dir = if result.is_failed() {
            &self.queue.failed_dir
        } else {
            &self.queue.completed_dir
        };

        let result_path = target_dir.join(result_filename(&self.id));
        async_fs::write(&result_path, serde_json::to_vec_pretty(result)?).await?;

        let archived = target_dir.join(format!("{}.task", self.id));
        if let Err(e) = async_fs::rename(&self.in_progress_path, &archived).await {
            warn!("Failed to archive task {}: {}", self.id, e);
        }

        debug!("Finished task {} -> {:?}", self.id, result_path);
        Ok(result_path)
    }

    pub fn in_progress_path(&self) -> &Path {
        &self.in_progress_path
    }
}
