use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info};

use crate::config::Config;
use crate::error::TaskError;
use crate::task::{TaskEnvelope, TaskResult, TASK_NAME};
use crate::upload::UploadTask;

/// A user-facing option of a registered task
#[derive(Debug, Clone, Serialize)]
pub struct TaskOption {
    pub name: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<bool>,
}

/// What the orchestrator needs to list and route the task
#[derive(Debug, Clone, Serialize)]
pub struct TaskMetadata {
    pub task_name: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub task_config: Vec<TaskOption>,
}

impl TaskMetadata {
    pub fn upload() -> Self {
        Self {
            task_name: TASK_NAME,
            display_name: "Upload to Timesketch",
            description: "Upload resulting file to Timesketch",
            task_config: vec![
                TaskOption {
                    name: "sketch_id",
                    label: "Add to an existing sketch",
                    description: "Provide the numerical sketch ID of the existing sketch",
                    kind: "text",
                    required: false,
                    default: None,
                },
                TaskOption {
                    name: "sketch_name",
                    label: "Name of the new sketch to create",
                    description: "Create a new sketch",
                    kind: "text",
                    required: false,
                    default: None,
                },
                TaskOption {
                    name: "timeline_name",
                    label: "Name of the timeline to create",
                    description: "Timeline name",
                    kind: "text",
                    required: false,
                    default: None,
                },
                TaskOption {
                    name: "make_sketch_public",
                    label: "Make sketch public",
                    description: "Set the sketch to be publicly accessible in Timesketch.",
                    kind: "boolean",
                    required: false,
                    default: Some(true),
                },
            ],
        }
    }
}

/// Runs claimed tasks, one at a time
pub struct Worker {
    pub id: String,
    upload: UploadTask,
}

impl Worker {
    pub fn new(id: String, config: Config, lock_dir: PathBuf) -> Self {
        Self {
            id,
            upload: UploadTask::new(config, lock_dir),
        }
    }

    /// Task names this worker consumes
    pub fn registered_tasks() -> Vec<TaskMetadata> {
        vec![TaskMetadata::upload()]
    }

    /// Run one envelope. Never fails: problems become a failed result.
    pub async fn handle(&self, envelope: &TaskEnvelope) -> TaskResult {
        match envelope.task_name.as_str() {
            TASK_NAME => {
                info!("➡️ [{}] Running {}", self.id, envelope.id);
                self.upload.run(&envelope.payload).await
            }
            other => {
                let err = TaskError::invalid_task(format!("unknown task name '{other}'"));
                error!("❌ [{}] {}", self.id, err);
                TaskResult::failed(envelope.payload.workflow_id.clone(), &err)
            }
        }
    }
}
