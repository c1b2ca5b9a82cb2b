//! # openrelik-worker-timesketch
//!
//! OpenRelik worker that uploads forensic timelines to a Timesketch server.
//!
//! ## Features
//!
//! - **Sketch handling**: add to an existing sketch, create a named one, or share one sketch per workflow
//! - **Best-effort batches**: a rejected file is reported and the rest still upload
//! - **Public links**: results point at the public Timesketch URL, not the internal one
//! - **Bounded polling**: optionally wait for Timesketch to finish indexing
//! - **Signal Handling**: Graceful shutdown on SIGINT
//!
//! ## Usage
//!
//! ```bash
//! # Queue an upload
//! openrelik-worker-timesketch submit /shared/queue --file /shared/out.plaso --sketch-id 7
//!
//! # Process tasks from the queue
//! openrelik-worker-timesketch work /shared/queue
//!
//! # Show task registration metadata
//! openrelik-worker-timesketch metadata
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use openrelik_worker_timesketch::commands::{
    clean::CleanCommand,
    metadata::MetadataCommand,
    submit::{SubmitCommand, SubmitOptions},
    work::WorkCommand,
};

/// openrelik-worker-timesketch - upload timelines to Timesketch
#[derive(Parser)]
#[command(
    name = "openrelik-worker-timesketch",
    about = "OpenRelik worker that uploads timelines to Timesketch",
    long_about = "Consumes upload tasks from a queue directory, creates or reuses Timesketch sketches and uploads each input file as a timeline.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Process upload tasks from the queue
    Work {
        /// Queue directory shared with the orchestrator
        #[arg(env = "WORKER_QUEUE_DIR")]
        queue_dir: PathBuf,
        /// Exit once the queue is empty
        #[arg(long)]
        once: bool,
    },
    /// Queue an upload task
    Submit {
        /// Queue directory shared with the worker
        #[arg(env = "WORKER_QUEUE_DIR")]
        queue_dir: PathBuf,
        /// File to upload (repeatable)
        #[arg(long = "file", short = 'f', required = true)]
        files: Vec<PathBuf>,
        /// Numerical ID of an existing sketch
        #[arg(long)]
        sketch_id: Option<String>,
        /// Name of a new sketch to create
        #[arg(long)]
        sketch_name: Option<String>,
        /// Timeline name (defaults to each file's name)
        #[arg(long)]
        timeline_name: Option<String>,
        /// Workflow ID, used for the default sketch name
        #[arg(long)]
        workflow_id: Option<String>,
        /// Do not make the sketch public
        #[arg(long)]
        private: bool,
    },
    /// Remove all queue directories
    Clean {
        /// Queue directory
        #[arg(env = "WORKER_QUEUE_DIR")]
        queue_dir: PathBuf,
    },
    /// Print task registration metadata as JSON
    Metadata,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so `metadata` output stays clean JSON
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "openrelik_worker_timesketch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Work { queue_dir, once } => {
            info!(
                "Starting work command for queue: {:?}, once: {}",
                queue_dir, once
            );
            WorkCommand::new(queue_dir, once).execute().await
        }
        Commands::Submit {
            queue_dir,
            files,
            sketch_id,
            sketch_name,
            timeline_name,
            workflow_id,
            private,
        } => {
            let options = SubmitOptions {
                sketch_id,
                sketch_name,
                timeline_name,
                workflow_id,
                private,
            };
            SubmitCommand::new(queue_dir, files, options)
                .execute()
                .await
                .map(|envelope| println!("{}", envelope.id))
        }
        Commands::Clean { queue_dir } => {
            info!("Starting clean command for queue: {:?}", queue_dir);
            CleanCommand::new(queue_dir).execute().await
        }
        Commands::Metadata => MetadataCommand.execute(),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
