use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{Result, TaskError};

/// Name the upload task is registered and routed under
pub const TASK_NAME: &str = "openrelik-worker-timesketch.tasks.upload";

/// Command label reported in task results
pub const COMMAND: &str = "Timesketch Importer Client";

/// A file handed to the worker by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputFile {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

impl InputFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            display_name: None,
            uuid: None,
            data_type: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Display name, falling back to the file name
    pub fn label(&self) -> String {
        self.display_name.clone().unwrap_or_else(|| {
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
        })
    }
}

/// User-supplied options for the upload task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskConfig {
    #[serde(
        default,
        deserialize_with = "deserialize_sketch_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub sketch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sketch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline_name: Option<String>,
    #[serde(default = "default_true")]
    pub make_sketch_public: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            sketch_id: None,
            sketch_name: None,
            timeline_name: None,
            make_sketch_public: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// The orchestrator's form fields arrive as text, API callers send numbers.
fn deserialize_sketch_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(u64),
        Text(String),
    }

    Ok(match Option::<RawId>::deserialize(deserializer)? {
        Some(RawId::Number(n)) => Some(n.to_string()),
        Some(RawId::Text(s)) => Some(s),
        None => None,
    })
}

/// How the target sketch is chosen
#[derive(Debug, Clone, PartialEq)]
pub enum SketchSelector {
    /// Existing sketch
    Id(u64),
    /// Always creates a new sketch
    Name(String),
    /// Shared per-workflow sketch, created once
    Workflow(String),
}

impl SketchSelector {
    pub fn default_sketch_name(workflow_id: &str) -> String {
        format!("openrelik-workflow-{workflow_id}")
    }
}

impl TaskConfig {
    /// Decide which sketch to target. Blank values count as unset.
    pub fn sketch_selector(&self, workflow_id: Option<&str>) -> Result<SketchSelector> {
        if let Some(raw) = non_blank(self.sketch_id.as_deref()) {
            let id = raw.parse::<u64>().map_err(|_| {
                TaskError::invalid_task(format!("sketch_id must be numeric, got '{raw}'"))
            })?;
            return Ok(SketchSelector::Id(id));
        }

        if let Some(name) = non_blank(self.sketch_name.as_deref()) {
            return Ok(SketchSelector::Name(name.to_string()));
        }

        let workflow_id = non_blank(workflow_id).unwrap_or("unknown");
        Ok(SketchSelector::Workflow(SketchSelector::default_sketch_name(
            workflow_id,
        )))
    }

    /// Timeline name for one input file
    pub fn timeline_name_for(&self, file: &InputFile) -> String {
        non_blank(self.timeline_name.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| file.label())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Payload of one upload task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipe_result: Option<String>,
    #[serde(default)]
    pub input_files: Vec<InputFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub task_config: TaskConfig,
}

impl TaskRequest {
    /// Files to upload: a previous task's output when piped, else `input_files`.
    pub fn resolve_input_files(&self) -> Result<Vec<InputFile>> {
        match non_blank(self.pipe_result.as_deref()) {
            Some(encoded) => Ok(TaskResult::decode(encoded)?.output_files),
            None => Ok(self.input_files.clone()),
        }
    }
}

/// Queue envelope: the task name plus its payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEnvelope {
    pub id: String,
    pub task_name: String,
    pub payload: TaskRequest,
}

impl TaskEnvelope {
    pub fn new(task_name: impl Into<String>, payload: TaskRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_name: task_name.into(),
            payload,
        }
    }

    /// Envelope for the upload task
    pub fn upload(payload: TaskRequest) -> Self {
        Self::new(TASK_NAME, payload)
    }

    pub fn task_filename(&self) -> String {
        format!("{}.task", self.id)
    }

    pub fn result_filename(&self) -> String {
        result_filename(&self.id)
    }
}

pub fn result_filename(id: &str) -> String {
    format!("{id}.result.json")
}

/// Overall outcome of a task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    CompletedWithErrors,
    Failed,
}

/// Outcome of one file's upload
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Uploaded,
    Failed,
}

/// Indexing state observed after upload
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IndexingState {
    Ready,
    Failed,
    /// Still indexing when the poll budget ran out
    Pending,
    NotChecked,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub timeline_name: String,
    pub status: UploadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline_id: Option<u64>,
    pub indexing: IndexingState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileOutcome {
    pub fn uploaded(path: &Path, timeline_name: &str, timeline_id: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            timeline_name: timeline_name.to_string(),
            status: UploadStatus::Uploaded,
            timeline_id: Some(timeline_id),
            indexing: IndexingState::NotChecked,
            error: None,
        }
    }

    pub fn failed(path: &Path, timeline_name: &str, error: &TaskError) -> Self {
        Self {
            path: path.to_path_buf(),
            timeline_name: timeline_name.to_string(),
            status: UploadStatus::Failed,
            timeline_id: None,
            indexing: IndexingState::NotChecked,
            error: Some(error.to_string()),
        }
    }

    pub fn is_uploaded(&self) -> bool {
        self.status == UploadStatus::Uploaded
    }
}

/// Why a task failed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskFailure {
    pub kind: String,
    pub message: String,
}

impl From<&TaskError> for TaskFailure {
    fn from(err: &TaskError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Result payload returned to the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sketch_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sketch_url: Option<String>,
    #[serde(default)]
    pub uploads: Vec<FileOutcome>,
    #[serde(default)]
    pub output_files: Vec<InputFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
}

impl TaskResult {
    /// Result for a task that ran to the end; status follows the file outcomes.
    pub fn finished(
        workflow_id: Option<String>,
        sketch_id: u64,
        sketch_url: String,
        uploads: Vec<FileOutcome>,
    ) -> Self {
        let status = if uploads.iter().all(FileOutcome::is_uploaded) {
            TaskStatus::Completed
        } else {
            TaskStatus::CompletedWithErrors
        };

        Self {
            status,
            workflow_id,
            command: COMMAND.to_string(),
            sketch_id: Some(sketch_id),
            sketch_url: Some(sketch_url),
            uploads,
            output_files: Vec::new(),
            error: None,
        }
    }

    pub fn failed(workflow_id: Option<String>, error: &TaskError) -> Self {
        Self {
            status: TaskStatus::Failed,
            workflow_id,
            command: COMMAND.to_string(),
            sketch_id: None,
            sketch_url: None,
            uploads: Vec::new(),
            output_files: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == TaskStatus::Failed
    }

    /// Base64 JSON, the form a following task accepts as `pipe_result`
    pub fn encode(&self) -> Result<String> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }

    /// Decode a `pipe_result`. Only `output_files` is required.
    pub fn decode(encoded: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct Piped {
            #[serde(default)]
            output_files: Vec<InputFile>,
            #[serde(default)]
            workflow_id: Option<String>,
        }

        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| TaskError::invalid_task(format!("pipe_result is not base64: {e}")))?;
        let piped: Piped = serde_json::from_slice(&bytes)
            .map_err(|e| TaskError::invalid_task(format!("pipe_result is not valid JSON: {e}")))?;

        Ok(Self {
            status: TaskStatus::Completed,
            workflow_id: piped.workflow_id,
            command: String::new(),
            sketch_id: None,
            sketch_url: None,
            uploads: Vec::new(),
            output_files: piped.output_files,
            error: None,
        })
    }
}
