pub mod commands;
pub mod config;
pub mod error;
pub mod lock;
pub mod queue;
pub mod task;
pub mod timesketch;
pub mod upload;
pub mod worker;

pub use config::Config;
pub use error::TaskError;
pub use task::{TaskRequest, TaskResult, TASK_NAME};
pub use upload::UploadTask;
