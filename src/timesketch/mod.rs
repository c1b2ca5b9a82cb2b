//! Minimal Timesketch API client.
//!
//! Logs in through the web form (session cookie plus CSRF token) the same way
//! the official client does, then talks to the `/api/v1` JSON endpoints.

use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::redirect::Policy;
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::config::Config;
use crate::error::{Result, TaskError};

const API_PREFIX: &str = "/api/v1";

/// Slowest transfer rate an upload may run at before it counts as stalled
const MIN_UPLOAD_BYTES_PER_SEC: u64 = 1024 * 1024;

/// Value sent in the `provider` field of uploads
pub const PROVIDER: &str = "OpenRelik";

/// File extensions the Timesketch importer accepts
pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["plaso", "csv", "jsonl"];

/// Timesketch wraps every payload in `{"objects": [...], "meta": {...}}`
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default = "Vec::new")]
    objects: Vec<T>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Sketch {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Timeline {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: Vec<StatusEntry>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StatusEntry {
    pub status: String,
}

impl Timeline {
    /// Current indexing status, e.g. `processing`, `ready` or `fail`
    pub fn current_status(&self) -> Option<&str> {
        self.status.first().map(|s| s.status.as_str())
    }
}

/// Authenticated session against one Timesketch server
#[derive(Debug, Clone)]
pub struct TimesketchClient {
    client: SessionClient,
    base_url: String,
    request_timeout: Duration,
}

impl TimesketchClient {
    /// Open a session and verify the credentials.
    pub async fn connect(config: &Config) -> Result<Self> {
        let bootstrap = Client::builder()
            .cookie_store(true)
            .redirect(Policy::none())
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| TaskError::Config(format!("Failed to create HTTP client: {e}")))?;

        let base_url = config.server_url.clone();
        let login_url = format!("{base_url}/login/");

        debug!("Fetching login form from {}", login_url);
        let login_page = bootstrap
            .get(&login_url)
            .send()
            .await
            .map_err(TaskError::from_transport)?
            .text()
            .await
            .map_err(TaskError::from_transport)?;
        let csrf_token = extract_csrf_token(&login_page);

        let mut form = vec![
            ("username", config.username.clone()),
            ("password", config.password.clone()),
        ];
        if let Some(token) = &csrf_token {
            form.push(("csrf_token", token.clone()));
        }

        let response = bootstrap
            .post(&login_url)
            .form(&form)
            .send()
            .await
            .map_err(TaskError::from_transport)?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(TaskError::Authentication(format!(
                "login rejected for user '{}' ({status})",
                config.username
            )));
        }
        if !(status.is_success() || status.is_redirection()) {
            return Err(TaskError::Api(format!("login failed with status {status}")));
        }

        // The session cookie lives in this client's jar, so keep using it.
        let client = match csrf_token {
            Some(token) => {
                let mut headers = HeaderMap::new();
                let value = HeaderValue::from_str(&token)
                    .map_err(|e| TaskError::Api(format!("Invalid CSRF token: {e}")))?;
                headers.insert("X-CSRFToken", value);
                headers.insert("Referer", header_value(&base_url)?);
                SessionClient::with_headers(bootstrap, headers)
            }
            None => SessionClient::plain(bootstrap),
        };

        let session = Self {
            client,
            base_url,
            request_timeout: config.request_timeout,
        };
        session.verify_session(&config.username).await?;
        Ok(session)
    }

    async fn verify_session(&self, username: &str) -> Result<()> {
        let response = self
            .request(self.client.get(self.api_url("/users/me/")))
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(TaskError::Authentication(
                format!("credentials for user '{username}' were not accepted"),
            )),
            status if status.is_redirection() => Err(TaskError::Authentication(format!(
                "credentials for user '{username}' were not accepted (redirected to login)"
            ))),
            status if !status.is_success() => Err(api_error(response).await),
            _ => Ok(()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    /// Internal link to a sketch in the web UI
    pub fn sketch_url(&self, sketch_id: u64) -> String {
        format!("{}/sketch/{}/", self.base_url, sketch_id)
    }

    async fn request(&self, request: RequestBuilder) -> Result<Response> {
        request.send().await.map_err(TaskError::from_transport)
    }

    pub async fn get_sketch(&self, sketch_id: u64) -> Result<Sketch> {
        let response = self
            .request(self.client.get(self.api_url(&format!("/sketches/{sketch_id}/"))))
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => Err(TaskError::NotFound(format!(
                "sketch {sketch_id} does not exist or is not visible to this account"
            ))),
            _ => first_object(response, "sketch").await,
        }
    }

    pub async fn create_sketch(&self, name: &str) -> Result<Sketch> {
        let body = json!({ "name": name, "description": name });
        let response = self
            .request(self.client.post(self.api_url("/sketches/")).json(&body))
            .await?;
        first_object(response, "sketch").await
    }

    pub async fn list_sketches(&self) -> Result<Vec<Sketch>> {
        let response = self
            .request(self.client.get(self.api_url("/sketches/")))
            .await?;
        let envelope: Envelope<Sketch> = parse_json(response).await?;
        Ok(envelope.objects)
    }

    /// Grant every user on the server read access to the sketch.
    pub async fn make_public(&self, sketch_id: u64) -> Result<()> {
        let response = self
            .request(
                self.client
                    .post(self.api_url(&format!("/sketches/{sketch_id}/collaborators/")))
                    .json(&json!({ "public": "true" })),
            )
            .await?;

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(())
    }

    /// Submit a file as a new timeline. Indexing happens asynchronously on
    /// the server.
    pub async fn upload_timeline(
        &self,
        sketch_id: u64,
        path: &Path,
        timeline_name: &str,
    ) -> Result<Timeline> {
        let data_label = supported_extension(path)?;

        let file = tokio::fs::File::open(path).await.map_err(|e| {
            TaskError::upload(format!("cannot read {}: {e}", path.display()))
        })?;
        let total_file_size = file
            .metadata()
            .await
            .map_err(|e| TaskError::upload(format!("cannot stat {}: {e}", path.display())))?
            .len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("upload.{data_label}"));

        let body = Body::wrap_stream(ReaderStream::new(file));
        let form = Form::new()
            .text("name", timeline_name.to_string())
            .text("sketch_id", sketch_id.to_string())
            .text("total_file_size", total_file_size.to_string())
            .text("data_label", data_label)
            .text("provider", PROVIDER)
            .part(
                "file",
                Part::stream_with_length(body, total_file_size).file_name(file_name),
            );

        let response = self
            .request(
                self.client
                    .post(self.api_url("/upload/"))
                    .timeout(upload_timeout(self.request_timeout, total_file_size))
                    .multipart(form),
            )
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TaskError::upload(format!(
                "server rejected {} with status {}: {}",
                path.display(),
                status,
                error_text.trim()
            )));
        }

        first_object(response, "timeline")
            .await
            .map_err(|e| TaskError::upload(e.to_string()))
    }

    pub async fn get_timeline(&self, sketch_id: u64, timeline_id: u64) -> Result<Timeline> {
        let response = self
            .request(self.client.get(self.api_url(&format!(
                "/sketches/{sketch_id}/timelines/{timeline_id}/"
            ))))
            .await?;
        first_object(response, "timeline").await
    }
}

/// Client that adds the session headers to every request
#[derive(Debug, Clone)]
struct SessionClient {
    inner: Client,
    headers: HeaderMap,
}

impl SessionClient {
    fn with_headers(inner: Client, headers: HeaderMap) -> Self {
        Self { inner, headers }
    }

    fn plain(inner: Client) -> Self {
        Self::with_headers(inner, HeaderMap::new())
    }

    fn get(&self, url: String) -> RequestBuilder {
        self.inner.get(url).headers(self.headers.clone())
    }

    fn post(&self, url: String) -> RequestBuilder {
        self.inner.post(url).headers(self.headers.clone())
    }
}

/// Uploads get the normal request timeout plus time to move the file at
/// the minimum rate, so large files are not cut off mid-transfer.
fn upload_timeout(request_timeout: Duration, file_size: u64) -> Duration {
    request_timeout + Duration::from_secs(file_size / MIN_UPLOAD_BYTES_PER_SEC)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| TaskError::Config(format!("Invalid header value: {e}")))
}

/// Pull the CSRF token out of the login form.
pub fn extract_csrf_token(html: &str) -> Option<String> {
    let pattern = Regex::new(r#"<input[^>]*(?:id|name)="csrf_token"[^>]*value="([^"]*)""#).ok()?;
    pattern
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|token| !token.is_empty())
}

/// Lowercase extension of a supported timeline file
pub fn supported_extension(path: &Path) -> Result<String> {
    match path.extension() {
        Some(ext) => {
            let ext = ext.to_string_lossy().to_lowercase();
            if SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
                Ok(ext)
            } else {
                Err(TaskError::upload(format!(
                    "unsupported file type '.{ext}' for {}; expected one of: {}",
                    path.display(),
                    SUPPORTED_EXTENSIONS.join(", ")
                )))
            }
        }
        None => Err(TaskError::upload(format!(
            "file has no extension: {}; expected one of: {}",
            path.display(),
            SUPPORTED_EXTENSIONS.join(", ")
        ))),
    }
}

async fn api_error(response: Response) -> TaskError {
    let status = response.status();
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    TaskError::Api(format!(
        "request failed with status {}: {}",
        status,
        error_text.trim()
    ))
}

async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }
    response
        .json()
        .await
        .map_err(|e| TaskError::Api(format!("Failed to parse response as JSON: {e}")))
}

async fn first_object<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    let envelope: Envelope<T> = parse_json(response).await?;
    envelope
        .objects
        .into_iter()
        .next()
        .ok_or_else(|| TaskError::Api(format!("response did not contain a {what}")))
}
