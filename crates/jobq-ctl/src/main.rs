//! `jobqctl`: operator CLI for a jobq database.
//!
//! Every command prints one JSON document on stdout shaped
//! `{"status": "success"|"error", "data": ..., "message": ...}`; logs go to
//! stderr.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use jobq_core::JobqConfig;
use jobq_queue::types::DEFAULT_LIST_LIMIT;
use jobq_queue::{HandlerRegistry, JobStatus, Priority, QueueEngine, SqliteJobStore};
use tracing::info;

mod commands;
mod output;

#[derive(Parser, Debug)]
#[command(name = "jobqctl")]
#[command(about = "Inspect and manage a jobq job queue")]
#[command(version)]
struct Args {
    /// Config file (default: $JOBQ_CONFIG, then ~/.jobq/jobq.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<String>,

    /// SQLite database path, overriding database.path from the config
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Enqueue a job
    Dispatch {
        /// Job type, matched against the worker's registered handlers
        job_type: String,
        /// JSON object handed to the handler
        #[arg(long, default_value = "{}")]
        payload: String,
        /// low, normal, high, critical or an integer 1-15
        #[arg(long, short = 'p', default_value = "normal")]
        priority: Priority,
        /// Attempts before the job is marked failed (1-10)
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Earliest run time, RFC 3339
        #[arg(long, conflicts_with = "delay")]
        at: Option<String>,
        /// Earliest run time, seconds from now
        #[arg(long)]
        delay: Option<u64>,
    },
    /// List jobs, newest first
    List {
        #[arg(long, short = 's')]
        status: Option<JobStatus>,
        #[arg(long = "type", short = 't')]
        job_type: Option<String>,
        /// Page size (1-100)
        #[arg(long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Show one job
    Show { id: String },
    /// Distinct job types in the queue
    Types,
    /// Counts by status and by type
    Stats,
    /// Delete jobs that are not processing
    Cancel {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Reset failed jobs to pending
    Retry {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Delete completed and failed jobs older than N days
    Cleanup {
        /// Age threshold in days (1-365)
        #[arg(long, short = 'd', default_value_t = 30)]
        days: u32,
    },
    /// Requeue jobs stuck in processing
    Recover {
        /// Lease timeout in seconds (default: worker.lease_timeout_secs)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobqctl=info,jobq_queue=info".into()),
        )
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(data) => {
            output::success(data);
            ExitCode::SUCCESS
        }
        Err(e) => {
            output::error(&e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<serde_json::Value> {
    // config: --config > JOBQ_CONFIG env > ~/.jobq/jobq.toml
    let config_path = args.config.or_else(|| std::env::var("JOBQ_CONFIG").ok());
    let mut config = JobqConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        JobqConfig::default()
    });
    if let Some(db) = args.db {
        config.database.path = db;
    }

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store = SqliteJobStore::open(
        db_path,
        Duration::from_millis(config.database.busy_timeout_ms),
    )?;

    // Operator commands never execute jobs, so no handlers are registered.
    let engine = QueueEngine::new(
        Arc::new(store),
        Arc::new(HandlerRegistry::new()),
        config.queue.clone(),
    );
    commands::execute(&engine, &config, args.command)
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
