use std::sync::Arc;
use std::time::{Duration, Instant};

use jobq_core::config::WorkerConfig;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::engine::QueueEngine;
use crate::error::Result;
use crate::types::ProcessOutcome;

/// Totals reported when a worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    /// Jobs that reached an outcome other than `Skipped`.
    pub processed: u64,
    pub succeeded: u64,
    /// Failed attempts, whether retried or terminal.
    pub failed: u64,
}

impl WorkerSummary {
    fn record(&mut self, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::Completed => {
                self.processed += 1;
                self.succeeded += 1;
            }
            ProcessOutcome::Retrying { .. } | ProcessOutcome::Failed { .. } => {
                self.processed += 1;
                self.failed += 1;
            }
            ProcessOutcome::Skipped => {}
        }
    }
}

/// Polls a [`QueueEngine`] and runs claimed jobs with bounded concurrency.
pub struct Worker {
    engine: Arc<QueueEngine>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(engine: Arc<QueueEngine>, config: WorkerConfig) -> Self {
        Self { engine, config }
    }

    /// Run until `shutdown` broadcasts `true` (or its sender is dropped).
    ///
    /// Stops claiming on shutdown, then waits for in-flight jobs to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> WorkerSummary {
        let concurrency = self.config.concurrency.max(1);
        let base_idle = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let max_idle = Duration::from_millis(self.config.max_idle_ms).max(base_idle);
        let lease = self.config.lease_timeout_secs.map(Duration::from_secs);
        let lease_every = Duration::from_secs(self.config.lease_check_interval_secs.max(1));

        let mut summary = WorkerSummary::default();
        let mut in_flight: JoinSet<Result<ProcessOutcome>> = JoinSet::new();
        let mut idle = base_idle;
        let mut last_lease_check: Option<Instant> = None;

        info!(concurrency, lease_timeout = ?lease, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            while let Some(joined) = in_flight.try_join_next() {
                reap(joined, &mut summary);
            }

            if let Some(timeout) = lease {
                if last_lease_check.map_or(true, |t| t.elapsed() >= lease_every) {
                    last_lease_check = Some(Instant::now());
                    if let Err(e) = self.engine.recover_stale(timeout) {
                        error!("stale job recovery failed: {e}");
                    }
                }
            }

            let free = concurrency.saturating_sub(in_flight.len());
            if free > 0 {
                match self.engine.get_next_jobs(free) {
                    Ok(jobs) if !jobs.is_empty() => {
                        for job in jobs {
                            let engine = Arc::clone(&self.engine);
                            in_flight.spawn(async move { engine.process_job(job).await });
                        }
                        idle = base_idle;
                        continue;
                    }
                    Ok(_) => debug!(idle_ms = idle.as_millis() as u64, "no jobs ready"),
                    Err(e) => error!("job poll failed: {e}"),
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    reap(joined, &mut summary);
                    // A slot opened up; poll again straight away.
                    continue;
                }
                _ = tokio::time::sleep(idle) => {
                    if free > 0 {
                        idle = (idle * 2).min(max_idle);
                    }
                }
            }
        }

        info!(in_flight = in_flight.len(), "worker stopping, draining in-flight jobs");
        while let Some(joined) = in_flight.join_next().await {
            reap(joined, &mut summary);
        }
        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "worker stopped"
        );
        summary
    }
}

fn reap(
    joined: std::result::Result<Result<ProcessOutcome>, tokio::task::JoinError>,
    summary: &mut WorkerSummary,
) {
    match joined {
        Ok(Ok(outcome)) => summary.record(&outcome),
        Ok(Err(e)) => error!("job processing failed: {e}"),
        Err(e) => error!("job task aborted: {e}"),
    }
}
