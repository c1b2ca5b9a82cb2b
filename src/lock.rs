//! Named lock shared by every worker that sees the same filesystem.
//!
//! The lock is a directory: `create_dir` either creates it or fails, so only
//! one process can hold a given name at a time.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs as async_fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, TaskError};

/// How long a holder may keep the lock before others treat it as abandoned
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(60);
/// How long to wait for a held lock
pub const DEFAULT_BLOCKING_TIMEOUT: Duration = Duration::from_secs(5);

const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const OWNER_FILE: &str = "owner";

/// Settings for acquiring a [`NamedLock`]
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub expiry: Duration,
    pub blocking_timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            expiry: DEFAULT_EXPIRY,
            blocking_timeout: DEFAULT_BLOCKING_TIMEOUT,
        }
    }
}

/// A held lock. Call [`NamedLock::release`] when done; dropping it releases
/// too.
///
/// Each holder writes a random token into the lock directory and only ever
/// removes a directory that still carries its own token, so a holder whose
/// lock was broken after expiry cannot release its successor's lock.
#[derive(Debug)]
pub struct NamedLock {
    path: PathBuf,
    token: String,
    released: bool,
}

impl NamedLock {
    /// Acquire `name` under `lock_dir`, waiting up to the blocking timeout.
    pub async fn acquire(lock_dir: &Path, name: &str, options: &LockOptions) -> Result<Self> {
        async_fs::create_dir_all(lock_dir).await?;
        let path = lock_dir.join(format!("{}.lock", sanitize(name)));
        let started = tokio::time::Instant::now();

        loop {
            match async_fs::create_dir(&path).await {
                Ok(()) => {
                    let token = Uuid::new_v4().to_string();
                    if let Err(e) = async_fs::write(path.join(OWNER_FILE), &token).await {
                        let _ = async_fs::remove_dir_all(&path).await;
                        return Err(e.into());
                    }
                    debug!("Acquired lock: {:?}", path);
                    return Ok(Self {
                        path,
                        token,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_expired(&path, options.expiry).await {
                        let stale_owner = read_owner(&path).await;
                        if remove_if_owned(&path, stale_owner.as_deref()).await? {
                            warn!("Broke abandoned lock: {:?}", path);
                        }
                        continue;
                    }
                }
                Err(e) => return Err(e.into()),
            }

            if started.elapsed() >= options.blocking_timeout {
                return Err(TaskError::Lock(format!(
                    "timed out after {:?} waiting for lock '{}'",
                    options.blocking_timeout, name
                )));
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock if this holder still owns it.
    pub async fn release(mut self) {
        self.released = true;
        match remove_if_owned(&self.path, Some(&self.token)).await {
            Ok(true) => debug!("Released lock: {:?}", self.path),
            Ok(false) => warn!("Lock {:?} expired and was taken over before release", self.path),
            Err(e) => warn!("Failed to release lock {:?}: {}", self.path, e),
        }
    }
}

impl Drop for NamedLock {
    // Only reached when `release` was skipped, e.g. on an early `?` return.
    // The directory holds a single small file, so blocking here is brief.
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match remove_if_owned_blocking(&self.path, Some(&self.token)) {
            Ok(true) => debug!("Released lock: {:?}", self.path),
            Ok(false) => warn!("Lock {:?} expired and was taken over before release", self.path),
            Err(e) => warn!("Failed to release lock {:?}: {}", self.path, e),
        }
    }
}

/// Unique sibling path a lock directory is moved to before it is inspected
fn aside_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", Uuid::new_v4()));
    PathBuf::from(name)
}

async fn read_owner(path: &Path) -> Option<String> {
    async_fs::read_to_string(path.join(OWNER_FILE)).await.ok()
}

/// Remove the lock directory at `path` if its owner token is `expected`.
///
/// The directory is first renamed to a unique name, so whatever is removed
/// is exactly what was checked. A directory with another owner is put back.
async fn remove_if_owned(path: &Path, expected: Option<&str>) -> std::io::Result<bool> {
    let aside = aside_path(path);
    match async_fs::rename(path, &aside).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    }

    if read_owner(&aside).await.as_deref() == expected {
        async_fs::remove_dir_all(&aside).await?;
        Ok(true)
    } else {
        async_fs::rename(&aside, path).await?;
        Ok(false)
    }
}

fn remove_if_owned_blocking(path: &Path, expected: Option<&str>) -> std::io::Result<bool> {
    let aside = aside_path(path);
    match std::fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    }

    let owner = std::fs::read_to_string(aside.join(OWNER_FILE)).ok();
    if owner.as_deref() == expected {
        std::fs::remove_dir_all(&aside)?;
        Ok(true)
    } else {
        std::fs::rename(&aside, path)?;
        Ok(false)
    }
}

async fn is_expired(path: &Path, expiry: Duration) -> bool {
    let Ok(metadata) = async_fs::metadata(path).await else {
        return false;
    };
    metadata
        .modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > expiry)
        .unwrap_or(false)
}

/// Lock names become directory names
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
