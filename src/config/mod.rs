use std::env;
use std::fmt;
use std::time::Duration;

use crate::error::{Result, TaskError};

const REQUIRED_VARS: [&str; 4] = [
    "TIMESKETCH_SERVER_URL",
    "TIMESKETCH_SERVER_PUBLIC_URL",
    "TIMESKETCH_USERNAME",
    "TIMESKETCH_PASSWORD",
];

/// Connection details and worker behavior
#[derive(Clone)]
pub struct Config {
    /// Base URL used for API calls
    pub server_url: String,
    /// Base URL substituted into links handed back to users
    pub public_url: String,
    pub username: String,
    pub password: String,
    pub poll: PollSettings,
    pub request_timeout: Duration,
    /// Seconds to sleep when the queue is empty
    pub sleep_interval: u64,
}

/// Bounded polling for timeline indexing
#[derive(Debug, Clone, PartialEq)]
pub struct PollSettings {
    /// Zero disables polling
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All four `TIMESKETCH_*` connection variables are required; the error
    /// names every one that is missing or empty.
    pub fn from_env() -> Result<Self> {
        let missing: Vec<&str> = REQUIRED_VARS
            .iter()
            .copied()
            .filter(|name| env::var(name).map(|v| v.trim().is_empty()).unwrap_or(true))
            .collect();

        if !missing.is_empty() {
            return Err(TaskError::Config(format!(
                "Missing required environment variables for Timesketch worker: {}",
                missing.join(", ")
            )));
        }

        let required = |name: &str| env::var(name).unwrap_or_default();

        Ok(Self::new(
            &required("TIMESKETCH_SERVER_URL"),
            &required("TIMESKETCH_SERVER_PUBLIC_URL"),
            &required("TIMESKETCH_USERNAME"),
            &required("TIMESKETCH_PASSWORD"),
        )
        .with_poll(PollSettings {
            max_attempts: parse_or("TIMESKETCH_POLL_MAX_ATTEMPTS", 0),
            interval: Duration::from_secs(parse_or("TIMESKETCH_POLL_INTERVAL", 10)),
        })
        .with_request_timeout(Duration::from_secs(parse_or(
            "TIMESKETCH_REQUEST_TIMEOUT",
            300,
        )))
        .with_sleep_interval(parse_or("SLEEP_INTERVAL", 10)))
    }

    pub fn new(server_url: &str, public_url: &str, username: &str, password: &str) -> Self {
        Self {
            server_url: server_url.trim().trim_end_matches('/').to_string(),
            public_url: public_url.trim().trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            poll: PollSettings::default(),
            request_timeout: Duration::from_secs(300),
            sleep_interval: 10,
        }
    }

    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_sleep_interval(mut self, seconds: u64) -> Self {
        self.sleep_interval = seconds;
        self
    }

    /// Rewrite an internal link so it points at the public base URL.
    ///
    /// Links that do not start with the internal base URL are returned as is.
    pub fn public_link(&self, internal: &str) -> String {
        match internal.strip_prefix(&self.server_url) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => {
                format!("{}{}", self.public_url, rest)
            }
            _ => internal.to_string(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("server_url", &self.server_url)
            .field("public_url", &self.public_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("poll", &self.poll)
            .field("request_timeout", &self.request_timeout)
            .field("sleep_interval", &self.sleep_interval)
            .finish()
    }
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
