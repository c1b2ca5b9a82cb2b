use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::queue::TaskQueue;
use crate::task::TaskResult;
use crate::worker::Worker;

/// Command to process tasks from the queue
pub struct WorkCommand {
    queue_root: PathBuf,
    once: bool,
}

impl WorkCommand {
    pub fn new(queue_root: PathBuf, once: bool) -> Self {
        Self { queue_root, once }
    }

    pub async fn execute(&self) -> Result<()> {
        if !self.queue_root.is_dir() {
            return Err(anyhow!(
                "Queue directory does not exist: {:?}",
                self.queue_root
            ));
        }

        let config = Config::from_env()?;
        let worker_id = Uuid::new_v4().to_string()[..8].to_string();

        let queue = TaskQueue::new(self.queue_root.clone());
        queue.init().await?;

        info!("✅ Starting worker {} against {}", worker_id, config.server_url);
        info!("Watching for tasks in: {:?}", queue.queue_dir);

        let sleep_interval = config.sleep_interval;
        let worker = Worker::new(worker_id, config, queue.lock_dir.clone());

        // Set up signal handling for graceful shutdown
        tokio::pin! {
            let shutdown_signal = signal::ctrl_c();
        }

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("🛑 Shutdown signal received. Exiting gracefully.");
                    break;
                }

                task_result = self.process_next_task(&queue, &worker) => {
                    match task_result {
                        Ok(true) => continue,
                        Ok(false) if self.once => {
                            info!("Queue is empty. Exiting.");
                            break;
                        }
                        Ok(false) => {
                            debug!("💤 No tasks found. Sleeping for {} seconds.", sleep_interval);
                            tokio::time::sleep(Duration::from_secs(sleep_interval)).await;
                        }
                        Err(e) => {
                            error!("Error processing task: {}", e);
                            if self.once {
                                return Err(e);
                            }
                            tokio::time::sleep(Duration::from_secs(10)).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Try to claim and run the next task from the queue.
    /// Returns Ok(true) if a task was handled, Ok(false) if the queue was empty
    async fn process_next_task(&self, queue: &TaskQueue, worker: &Worker) -> Result<bool> {
        let Some(claimed) = queue.claim().await? else {
            return Ok(false);
        };

        let result = match &claimed.envelope {
            Ok(envelope) => worker.handle(envelope).await,
            Err(e) => {
                error!("❌ Rejecting task {}: {}", claimed.id(), e);
                TaskResult::failed(None, e)
            }
        };

        let id = claimed.id().to_string();
        let result_path = claimed.finish(&result).await?;
        if result.is_failed() {
            error!("❌ Task {} failed, result: {:?}", id, result_path);
        } else {
            info!("✅ Task {} finished, result: {:?}", id, result_path);
        }

        Ok(true)
    }
}
