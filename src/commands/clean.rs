use anyhow::{anyhow, Result};
use std::path::PathBuf;
use tracing::info;

use crate::queue::TaskQueue;

/// Command to remove the queue directories and everything in them
pub struct CleanCommand {
    queue_root: PathBuf,
}

impl CleanCommand {
    pub fn new(queue_root: PathBuf) -> Self {
        Self { queue_root }
    }

    pub async fn execute(&self) -> Result<()> {
        if !self.queue_root.exists() {
            return Err(anyhow!(
                "Queue directory does not exist: {:?}",
                self.queue_root
            ));
        }

        if !self.queue_root.is_dir() {
            return Err(anyhow!("Path is not a directory: {:?}", self.queue_root));
        }

        info!("🧹 Cleaning up queue directories...");

        let queue = TaskQueue::new(self.queue_root.clone());
        let pending = if queue.queue_dir.exists() {
            queue.pending_count().await?
        } else {
            0
        };
        if pending > 0 {
            info!("Discarding {} pending tasks", pending);
        }
        queue.clean().await?;

        info!("✅ Cleanup complete.");
        Ok(())
    }
}
