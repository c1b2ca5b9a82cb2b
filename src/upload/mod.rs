use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Result, TaskError};
use crate::lock::{LockOptions, NamedLock};
use crate::task::{
    FileOutcome, IndexingState, InputFile, SketchSelector, TaskRequest, TaskResult,
};
use crate::timesketch::{Sketch, TimesketchClient};

/// Uploads a task's files to Timesketch as timelines
pub struct UploadTask {
    config: Config,
    lock_dir: PathBuf,
    lock_options: LockOptions,
}

impl UploadTask {
    pub fn new(config: Config, lock_dir: PathBuf) -> Self {
        Self {
            config,
            lock_dir,
            lock_options: LockOptions::default(),
        }
    }

    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.lock_options = options;
        self
    }

    /// Run the task. Fatal errors come back as a failed result, never as `Err`.
    pub async fn run(&self, request: &TaskRequest) -> TaskResult {
        match self.try_run(request).await {
            Ok(result) => result,
            Err(e) => {
                error!("❌ Timesketch upload FAILED ({}): {}", e.kind(), e);
                TaskResult::failed(request.workflow_id.clone(), &e)
            }
        }
    }

    async fn try_run(&self, request: &TaskRequest) -> Result<TaskResult> {
        let input_files = request.resolve_input_files()?;
        let selector = request
            .task_config
            .sketch_selector(request.workflow_id.as_deref())?;

        if input_files.is_empty() {
            warn!("⚠️ Task has no input files");
        } else {
            info!("📦 {} input files to upload", input_files.len());
        }

        info!("🔐 Connecting to Timesketch at {}", self.config.server_url);
        let client = TimesketchClient::connect(&self.config).await?;

        let sketch = self.resolve_sketch(&client, &selector).await?;
        info!("📁 Using sketch {} ('{}')", sketch.id, sketch.name);

        if request.task_config.make_sketch_public {
            client.make_public(sketch.id).await.map_err(|e| {
                TaskError::Api(format!(
                    "Failed to make sketch {} ('{}') public: {}",
                    sketch.id, sketch.name, e
                ))
            })?;
        }

        let mut uploads = Vec::with_capacity(input_files.len());
        for input_file in &input_files {
            let timeline_name = request.task_config.timeline_name_for(input_file);
            match self
                .upload_file(&client, sketch.id, input_file, &timeline_name)
                .await
            {
                Ok(outcome) => uploads.push(outcome),
                Err(e) if e.is_per_file() => {
                    warn!("⚠️ SKIPPING {:?}: {}", input_file.path, e);
                    uploads.push(FileOutcome::failed(&input_file.path, &timeline_name, &e));
                }
                Err(e) => return Err(e),
            }
        }

        if self.config.poll.max_attempts > 0 {
            for outcome in uploads.iter_mut().filter(|o| o.is_uploaded()) {
                if let Some(timeline_id) = outcome.timeline_id {
                    outcome.indexing = self
                        .wait_for_indexing(&client, sketch.id, timeline_id)
                        .await?;
                }
            }
        }

        let sketch_url = self.config.public_link(&client.sketch_url(sketch.id));
        let result = TaskResult::finished(
            request.workflow_id.clone(),
            sketch.id,
            sketch_url,
            uploads,
        );

        info!(
            "✅ Uploaded {}/{} files to {}",
            result.uploads.iter().filter(|o| o.is_uploaded()).count(),
            result.uploads.len(),
            result.sketch_url.as_deref().unwrap_or_default()
        );
        Ok(result)
    }

    /// Find or create the sketch the selector points at.
    ///
    /// A plain name always creates a new sketch, so running the same task
    /// twice yields two sketches. Only the per-workflow default name is
    /// looked up first, under a lock, so parallel tasks share one sketch.
    async fn resolve_sketch(
        &self,
        client: &TimesketchClient,
        selector: &SketchSelector,
    ) -> Result<Sketch> {
        match selector {
            SketchSelector::Id(id) => client.get_sketch(*id).await,
            SketchSelector::Name(name) => {
                info!("➕ Creating sketch '{}'", name);
                client.create_sketch(name).await
            }
            SketchSelector::Workflow(name) => {
                let lock = NamedLock::acquire(&self.lock_dir, name, &self.lock_options).await?;
                let sketch = find_or_create_sketch(client, name).await;
                lock.release().await;
                sketch
            }
        }
    }

    async fn upload_file(
        &self,
        client: &TimesketchClient,
        sketch_id: u64,
        input_file: &InputFile,
        timeline_name: &str,
    ) -> Result<FileOutcome> {
        let path = &input_file.path;
        if !path.is_file() {
            return Err(TaskError::upload(format!(
                "input file does not exist: {}",
                path.display()
            )));
        }

        info!("⬆️ Uploading {:?} as timeline '{}'", path, timeline_name);
        let timeline = client
            .upload_timeline(sketch_id, path, timeline_name)
            .await?;

        Ok(FileOutcome::uploaded(path, timeline_name, timeline.id))
    }

    /// Poll a timeline until indexing settles or the attempt budget runs out.
    async fn wait_for_indexing(
        &self,
        client: &TimesketchClient,
        sketch_id: u64,
        timeline_id: u64,
    ) -> Result<IndexingState> {
        let poll = &self.config.poll;

        for attempt in 1..=poll.max_attempts {
            match client.get_timeline(sketch_id, timeline_id).await {
                Ok(timeline) => match timeline.current_status() {
                    Some("ready") => return Ok(IndexingState::Ready),
                    Some("fail") => {
                        warn!("⚠️ Timesketch failed to index timeline {}", timeline_id);
                        return Ok(IndexingState::Failed);
                    }
                    _ => {}
                },
                Err(e @ TaskError::Network(_)) => return Err(e),
                Err(e) => warn!("Could not check timeline {}: {}", timeline_id, e),
            }

            if attempt < poll.max_attempts {
                tokio::time::sleep(poll.interval).await;
            }
        }

        warn!(
            "⏳ Timeline {} still indexing after {} attempts; leaving it to the server",
            timeline_id, poll.max_attempts
        );
        Ok(IndexingState::Pending)
    }
}

async fn find_or_create_sketch(client: &TimesketchClient, name: &str) -> Result<Sketch> {
    let existing = client
        .list_sketches()
        .await?
        .into_iter()
        .find(|sketch| sketch.name == name);

    match existing {
        Some(sketch) => Ok(sketch),
        None => {
            info!("➕ Creating sketch '{}'", name);
            client.create_sketch(name).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollSettings;
    use crate::task::{TaskConfig, TaskStatus, UploadStatus};
    use crate::timesketch::test_support::*;
    use mockito::{Matcher, ServerGuard};
    use std::time::Duration;
    use tempfile::TempDir;

    fn config_for(url: &str) -> Config {
        Config::new(url, "https://public.example.com", "analyst", "secret")
            .with_request_timeout(Duration::from_secs(5))
    }

    fn task_for(server: &ServerGuard, lock_dir: &TempDir) -> UploadTask {
        UploadTask::new(config_for(&server.url()), lock_dir.path().to_path_buf())
    }

    fn write_file(dir: &TempDir, name: &str) -> InputFile {
        let path = dir.path().join(name);
        std::fs::write(&path, "{\"message\": \"event\"}\n").unwrap();
        InputFile::new(path)
    }

    fn request(files: Vec<InputFile>, task_config: TaskConfig) -> TaskRequest {
        TaskRequest {
            input_files: files,
            workflow_id: Some("wf-1".into()),
            task_config,
            ..Default::default()
        }
    }

    fn with_sketch_id(id: &str) -> TaskConfig {
        TaskConfig {
            sketch_id: Some(id.into()),
            ..Default::default()
        }
    }

    async fn mock_public(server: &mut ServerGuard, sketch_id: u64) -> mockito::Mock {
        server
            .mock(
                "POST",
                format!("/api/v1/sketches/{sketch_id}/collaborators/").as_str(),
            )
            .match_body(Matcher::PartialJson(serde_json::json!({"public": "true"})))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await
    }

    async fn mock_upload(server: &mut ServerGuard, hits: usize) -> mockito::Mock {
        server
            .mock("POST", "/api/v1/upload/")
            .with_status(201)
            .with_body(timeline_body(11, "tl", "processing"))
            .expect(hits)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_upload_to_existing_sketch() {
        let data = TempDir::new().unwrap();
        let locks = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let _sketch = server
            .mock("GET", "/api/v1/sketches/7/")
            .with_status(200)
            .with_body(sketch_body(7, "Case"))
            .create_async()
            .await;
        let public = mock_public(&mut server, 7).await;
        let upload = mock_upload(&mut server, 1).await;

        let file = write_file(&data, "events.jsonl");
        let result = task_for(&server, &locks)
            .run(&request(vec![file.clone()], with_sketch_id("7")))
            .await;

        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.sketch_id, Some(7));
        assert_eq!(result.workflow_id.as_deref(), Some("wf-1"));
        assert_eq!(result.uploads.len(), 1);
        assert_eq!(result.uploads[0].path, file.path);
        assert_eq!(result.uploads[0].timeline_name, "events.jsonl");
        assert_eq!(result.uploads[0].timeline_id, Some(11));
        assert_eq!(result.uploads[0].indexing, IndexingState::NotChecked);
        public.assert_async().await;
        upload.assert_async().await;
    }

    #[tokio::test]
    async fn test_sketch_url_uses_public_base() {
        let data = TempDir::new().unwrap();
        let locks = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let _sketch = server
            .mock("GET", "/api/v1/sketches/7/")
            .with_status(200)
            .with_body(sketch_body(7, "Case"))
            .create_async()
            .await;
        let _public = mock_public(&mut server, 7).await;
        let _upload = mock_upload(&mut server, 1).await;

        let result = task_for(&server, &locks)
            .run(&request(vec![write_file(&data, "a.csv")], with_sketch_id("7")))
            .await;

        assert_eq!(
            result.sketch_url.as_deref(),
            Some("https://public.example.com/sketch/7/")
        );
    }

    #[tokio::test]
    async fn test_sketch_name_creates_new_sketch_every_time() {
        let data = TempDir::new().unwrap();
        let locks = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let create = server
            .mock("POST", "/api/v1/sketches/")
            .match_body(Matcher::PartialJson(serde_json::json!({"name": "Case 42"})))
            .with_status(201)
            .with_body(sketch_body(21, "Case 42"))
            .expect(2)
            .create_async()
            .await;
        let _public = mock_public(&mut server, 21).await;
        let _upload = mock_upload(&mut server, 2).await;

        let config = TaskConfig {
            sketch_name: Some("Case 42".into()),
            ..Default::default()
        };
        let task = task_for(&server, &locks);
        let file = write_file(&data, "a.plaso");

        let first = task.run(&request(vec![file.clone()], config.clone())).await;
        let second = task.run(&request(vec![file], config)).await;

        assert_eq!(first.sketch_id, Some(21));
        assert_eq!(second.sketch_id, Some(21));
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_without_creating_sketch() {
        let data = TempDir::new().unwrap();
        let locks = TempDir::new().unwrap();
        let task = UploadTask::new(
            config_for("http://127.0.0.1:1"),
            locks.path().to_path_buf(),
        );

        let config = TaskConfig {
            sketch_name: Some("never".into()),
            ..Default::default()
        };
        let result = task
            .run(&request(vec![write_file(&data, "a.csv")], config))
            .await;

        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.sketch_id, None);
        assert!(result.uploads.is_empty());
        assert_eq!(result.error.unwrap().kind, "NetworkError");
    }

    #[tokio::test]
    async fn test_rejected_credentials_fail_without_creating_sketch() {
        let data = TempDir::new().unwrap();
        let locks = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _form = server
            .mock("GET", "/login/")
            .with_status(200)
            .with_body(LOGIN_PAGE)
            .create_async()
            .await;
        let _post = server
            .mock("POST", "/login/")
            .with_status(401)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/api/v1/sketches/")
            .expect(0)
            .create_async()
            .await;

        let config = TaskConfig {
            sketch_name: Some("never".into()),
            ..Default::default()
        };
        let result = task_for(&server, &locks)
            .run(&request(vec![write_file(&data, "a.csv")], config))
            .await;

        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.unwrap().kind, "AuthenticationError");
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_file_does_not_abort_batch() {
        let data = TempDir::new().unwrap();
        let locks = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let _sketch = server
            .mock("GET", "/api/v1/sketches/7/")
            .with_status(200)
            .with_body(sketch_body(7, "Case"))
            .create_async()
            .await;
        let _public = mock_public(&mut server, 7).await;
        let upload = mock_upload(&mut server, 2).await;

        let files = vec![
            write_file(&data, "one.jsonl"),
            InputFile::new(data.path().join("two.jsonl")),
            write_file(&data, "three.jsonl"),
        ];
        let result = task_for(&server, &locks)
            .run(&request(files, with_sketch_id("7")))
            .await;

        assert_eq!(result.status, TaskStatus::CompletedWithErrors);
        assert_eq!(result.uploads.len(), 3);
        assert_eq!(result.uploads[0].status, UploadStatus::Uploaded);
        assert_eq!(result.uploads[1].status, UploadStatus::Failed);
        assert!(result.uploads[1]
            .error
            .as_deref()
            .unwrap()
            .contains("does not exist"));
        assert_eq!(result.uploads[2].status, UploadStatus::Uploaded);
        upload.assert_async().await;
    }

    #[tokio::test]
    async fn test_unsupported_file_is_recorded_per_file() {
        let data = TempDir::new().unwrap();
        let locks = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let _sketch = server
            .mock("GET", "/api/v1/sketches/7/")
            .with_status(200)
            .with_body(sketch_body(7, "Case"))
            .create_async()
            .await;
        let _public = mock_public(&mut server, 7).await;
        let upload = mock_upload(&mut server, 0).await;

        let result = task_for(&server, &locks)
            .run(&request(vec![write_file(&data, "memory.raw")], with_sketch_id("7")))
            .await;

        assert_eq!(result.status, TaskStatus::CompletedWithErrors);
        assert!(result.uploads[0]
            .error
            .as_deref()
            .unwrap()
            .contains("unsupported file type"));
        upload.assert_async().await;
    }

    #[tokio::test]
    async fn test_unknown_sketch_id_is_not_found() {
        let data = TempDir::new().unwrap();
        let locks = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let _sketch = server
            .mock("GET", "/api/v1/sketches/404/")
            .with_status(404)
            .create_async()
            .await;
        let upload = mock_upload(&mut server, 0).await;

        let result = task_for(&server, &locks)
            .run(&request(vec![write_file(&data, "a.csv")], with_sketch_id("404")))
            .await;

        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.unwrap().kind, "NotFoundError");
        upload.assert_async().await;
    }

    #[tokio::test]
    async fn test_private_sketch_skips_acl() {
        let data = TempDir::new().unwrap();
        let locks = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let _sketch = server
            .mock("GET", "/api/v1/sketches/7/")
            .with_status(200)
            .with_body(sketch_body(7, "Case"))
            .create_async()
            .await;
        let acl = server
            .mock("POST", "/api/v1/sketches/7/collaborators/")
            .expect(0)
            .create_async()
            .await;
        let _upload = mock_upload(&mut server, 1).await;

        let config = TaskConfig {
            sketch_id: Some("7".into()),
            make_sketch_public: false,
            ..Default::default()
        };
        let result = task_for(&server, &locks)
            .run(&request(vec![write_file(&data, "a.csv")], config))
            .await;

        assert_eq!(result.status, TaskStatus::Completed);
        acl.assert_async().await;
    }

    #[tokio::test]
    async fn test_workflow_sketch_is_reused() {
        let data = TempDir::new().unwrap();
        let locks = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let _list = server
            .mock("GET", "/api/v1/sketches/")
            .with_status(200)
            .with_body(
                serde_json::json!({"objects": [
                    {"id": 3, "name": "something else"},
                    {"id": 9, "name": "openrelik-workflow-wf-1"}
                ]})
                .to_string(),
            )
            .create_async()
            .await;
        let create = server
            .mock("POST", "/api/v1/sketches/")
            .expect(0)
            .create_async()
            .await;
        let _public = mock_public(&mut server, 9).await;
        let _upload = mock_upload(&mut server, 1).await;

        let result = task_for(&server, &locks)
            .run(&request(vec![write_file(&data, "a.csv")], TaskConfig::default()))
            .await;

        assert_eq!(result.sketch_id, Some(9));
        create.assert_async().await;
        assert!(!locks.path().join("openrelik-workflow-wf-1.lock").exists());
    }

    #[tokio::test]
    async fn test_workflow_sketch_is_created_when_absent() {
        let data = TempDir::new().unwrap();
        let locks = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _login = mock_login(&mut server).await;
        let _list = server
            .mock("GET", "/api/v1/sketches/")
            .with_status(200)
            .with_body(r#"{"objects": []}"#)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/api/v1/sketches/")
            .match_body(Matcher::PartialJson(
                serde_json::json!({"name": "openrelik-workflow-wf-1"}),
            ))
            .with_status(201)
            .with_body(sketch_body(12, "openrelik-workflow-wf-1"))
            .expect(1)
            .create_async()
            .await;
        let _public = mock_public(&mut server, 12).await;
        let _upload = mock_upload(&mut server, 1).await;

        let result = task_for(&server, &locks)
            .run(&request(vec![write_file(&data, "a.csv")], TaskConfig::default()))
            .await;

        assert_eq!(result.sketch_id, Some(12));
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_held_workflow_lock_fails_task() {
        let data = TempDir::new().unwrap();
        let locks = TempDir::new().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _login = mock_login(&mut server).await;

        let options = LockOptions {
            expiry: Duration::from_secs(60),
            blocking_timeout: Duration::from_millis(200),
        };
        let _held = NamedLock::acquire(locks.path(), "openrelik-workflow-wf-1", &options)
            .await
            .unwrap();

        let result = task_for(&server, &locks)
            .with_lock_options(options)
            .run(&request(vec![write_file(&data, "a.csv")], TaskConfig::default()))
            .await;

        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.error.unwrap().kind, "LockError");
    }

    /// Server whose timeline always reports `status`; the returned mock
    /// expects exactly `hits` status checks.
    async fn polling_server(
        status: &str,
        hits: usize,
    ) -> (ServerGuard, mockito::Mock, Vec<mockito::Mock>) {
        let mut server = mockito::Server::new_async().await;
        let mut mocks = mock_login(&mut server).await;
        mocks.push(
            server
                .mock("GET", "/api/v1/sketches/7/")
                .with_status(200)
                .with_body(sketch_body(7, "Case"))
                .create_async()
                .await,
        );
        mocks.push(mock_public(&mut server, 7).await);
        mocks.push(mock_upload(&mut server, 1).await);
        let timeline = server
            .mock("GET", "/api/v1/sketches/7/timelines/11/")
            .with_status(200)
            .with_body(timeline_body(11, "tl", status))
            .expect(hits)
            .create_async()
            .await;
        (server, timeline, mocks)
    }

    fn polling(max_attempts: u32) -> PollSettings {
        PollSettings {
            max_attempts,
            interval: Duration::from_millis(1),
        }
    }

    async fn run_polling(server: &ServerGuard, max_attempts: u32) -> TaskResult {
        let data = TempDir::new().unwrap();
        let locks = TempDir::new().unwrap();
        let task = UploadTask::new(
            config_for(&server.url()).with_poll(polling(max_attempts)),
            locks.path().to_path_buf(),
        );
        task.run(&request(vec![write_file(&data, "a.csv")], with_sketch_id("7")))
            .await
    }

    #[tokio::test]
    async fn test_polling_stops_when_ready() {
        let (server, timeline, _mocks) = polling_server("ready", 1).await;

        let result = run_polling(&server, 5).await;

        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.uploads[0].indexing, IndexingState::Ready);
        timeline.assert_async().await;
    }

    #[tokio::test]
    async fn test_polling_stops_when_indexing_fails() {
        let (server, timeline, _mocks) = polling_server("fail", 1).await;

        let result = run_polling(&server, 5).await;

        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.uploads[0].indexing, IndexingState::Failed);
        timeline.assert_async().await;
    }

    #[tokio::test]
    async fn test_polling_timeout_is_not_fatal() {
        let (server, timeline, _mocks) = polling_server("processing", 3).await;

        let result = run_polling(&server, 3).await;

        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.uploads[0].indexing, IndexingState::Pending);
        timeline.assert_async().await;
    }
}
