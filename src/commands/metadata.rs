use anyhow::Result;

use crate::worker::Worker;

/// Command to print the registration metadata of every task this worker runs
pub struct MetadataCommand;

impl MetadataCommand {
    pub fn render(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&Worker::registered_tasks())?)
    }

    pub fn execute(&self) -> Result<()> {
        println!("{}", self.render()?);
        Ok(())
    }
}
