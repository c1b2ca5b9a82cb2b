use anyhow::{anyhow, Result};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::queue::TaskQueue;
use crate::task::{InputFile, TaskConfig, TaskEnvelope, TaskRequest};
use crate::timesketch::supported_extension;

/// Options for a submitted upload task
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub sketch_id: Option<String>,
    pub sketch_name: Option<String>,
    pub timeline_name: Option<String>,
    pub workflow_id: Option<String>,
    pub private: bool,
}

/// Command to put an upload task on the queue
pub struct SubmitCommand {
    queue_root: PathBuf,
    files: Vec<PathBuf>,
    options: SubmitOptions,
}

impl SubmitCommand {
    pub fn new(queue_root: PathBuf, files: Vec<PathBuf>, options: SubmitOptions) -> Self {
        Self {
            queue_root,
            files,
            options,
        }
    }

    pub async fn execute(&self) -> Result<TaskEnvelope> {
        if self.files.is_empty() {
            return Err(anyhow!("At least one --file is required"));
        }

        let mut input_files = Vec::with_capacity(self.files.len());
        for file in &self.files {
            // The worker reports these per file; warn early but still submit.
            if !file.is_file() {
                warn!("⚠️ File does not exist here: {:?}", file);
            } else if let Err(e) = supported_extension(file) {
                warn!("⚠️ {}", e);
            }

            let path = std::path::absolute(file).unwrap_or_else(|_| file.clone());
            input_files.push(InputFile::new(path));
        }

        let envelope = TaskEnvelope::upload(TaskRequest {
            input_files,
            workflow_id: self.options.workflow_id.clone(),
            task_config: TaskConfig {
                sketch_id: self.options.sketch_id.clone(),
                sketch_name: self.options.sketch_name.clone(),
                timeline_name: self.options.timeline_name.clone(),
                make_sketch_public: !self.options.private,
            },
            ..Default::default()
        });

        // Reject an unusable sketch id now rather than in the worker
        envelope
            .payload
            .task_config
            .sketch_selector(envelope.payload.workflow_id.as_deref())?;

        let queue = TaskQueue::new(self.queue_root.clone());
        queue.init().await?;
        let task_path = queue.enqueue(&envelope).await?;

        info!(
            "➕ Queued task {} with {} files: {:?}",
            envelope.id,
            self.files.len(),
            task_path
        );
        Ok(envelope)
    }
}
