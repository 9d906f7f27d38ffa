use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Utc};
use jobq_core::backoff::MAX_BACKOFF_SECS;
use jobq_core::config::{QueueConfig, MAX_MAX_ATTEMPTS, MIN_MAX_ATTEMPTS};
use jobq_core::SelectionPolicy;
use tokio::task::JoinError;
use tracing::{debug, info, instrument, warn};

use crate::{
    clock::{Clock, SystemClock},
    error::{QueueError, Result},
    registry::HandlerRegistry,
    store::{JobStore, Removal, StaleRecovery},
    types::{
        BulkResult, DispatchOptions, Job, JobFilter, JobStats, JobStatus, NewJob,
        ProcessOutcome, MAX_LIST_LIMIT,
    },
};

/// Rescans allowed in one `get_next_jobs` call when other workers keep
/// winning the claims.
pub const MAX_CLAIM_ROUNDS: usize = 3;

/// Most jobs one `get_next_jobs` call will claim.
pub const MAX_CLAIM_BATCH: usize = 1_000;

/// Latest accepted `scheduled_at` year. Stored timestamps must keep a
/// four-digit year for string order to match time order.
pub const MAX_SCHEDULE_YEAR: i32 = 9999;

/// Error recorded on jobs reclaimed by [`QueueEngine::recover_stale`].
pub const STALE_ERROR: &str = "processing timed out";

pub const MIN_CLEANUP_DAYS: u32 = 1;
pub const MAX_CLEANUP_DAYS: u32 = 365;

/// The queue: producer, worker and operator operations over a [`JobStore`].
///
/// Holds no job state of its own. Share it as `Arc<QueueEngine>`; any number
/// of engines (in one process or many) may point at the same database.
pub struct QueueEngine {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl QueueEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            registry,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Replace the wall clock, e.g. with a `ManualClock` in tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // --- producers ---------------------------------------------------------

    /// Validate and persist a new pending job.
    ///
    /// Nothing is written when validation fails.
    pub fn dispatch(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        opts: DispatchOptions,
    ) -> Result<Job> {
        let now = self.clock.now();
        let job_type = job_type.trim();
        if job_type.is_empty() {
            return Err(QueueError::validation("job type must not be empty"));
        }
        if !payload.is_object() {
            return Err(QueueError::validation("payload must be a JSON object"));
        }

        let max_attempts = opts
            .max_attempts
            .unwrap_or(self.config.default_max_attempts);
        if !(MIN_MAX_ATTEMPTS..=MAX_MAX_ATTEMPTS).contains(&max_attempts) {
            return Err(QueueError::validation(format!(
                "max_attempts must be between {MIN_MAX_ATTEMPTS} and {MAX_MAX_ATTEMPTS}, got {max_attempts}"
            )));
        }

        if let Some(at) = opts.scheduled_at {
            let grace = Duration::seconds(self.config.schedule_grace_secs.min(3_600) as i64);
            if at < now - grace {
                return Err(QueueError::validation(format!(
                    "scheduled_at {} is in the past",
                    at.to_rfc3339()
                )));
            }
            if at.year() > MAX_SCHEDULE_YEAR {
                return Err(QueueError::validation(format!(
                    "scheduled_at {} is after year {MAX_SCHEDULE_YEAR}",
                    at.to_rfc3339()
                )));
            }
        }

        let job = self.store.insert(
            &NewJob {
                job_type: job_type.to_string(),
                payload,
                priority: opts.priority,
                max_attempts,
                scheduled_at: opts.scheduled_at,
            },
            now,
        )?;
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = %job.priority,
            scheduled_at = ?job.scheduled_at,
            "job dispatched"
        );
        Ok(job)
    }

    /// Dispatch a job that becomes eligible at `scheduled_at`.
    pub fn schedule(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        scheduled_at: DateTime<Utc>,
        opts: DispatchOptions,
    ) -> Result<Job> {
        self.dispatch(job_type, payload, opts.with_scheduled_at(scheduled_at))
    }

    /// Dispatch a job that becomes eligible `delay_secs` from now.
    pub fn delay(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        delay_secs: u64,
        opts: DispatchOptions,
    ) -> Result<Job> {
        let delay = i64::try_from(delay_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| QueueError::validation(format!("delay too large: {delay_secs}s")))?;
        let at = self
            .clock
            .now()
            .checked_add_signed(delay)
            .ok_or_else(|| QueueError::validation(format!("delay too large: {delay_secs}s")))?;
        self.dispatch(job_type, payload, opts.with_scheduled_at(at))
    }

    // --- workers -----------------------------------------------------------

    /// Claim the best eligible job, if any.
    pub fn get_next_job(&self) -> Result<Option<Job>> {
        Ok(self.get_next_jobs(1)?.into_iter().next())
    }

    /// Claim up to `limit` eligible jobs (at most [`MAX_CLAIM_BATCH`]). Every
    /// returned job is already `Processing` and owned by the caller.
    pub fn get_next_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let limit = limit.min(MAX_CLAIM_BATCH);
        let mut claimed = Vec::with_capacity(limit);
        for round in 0..MAX_CLAIM_ROUNDS {
            let want = limit - claimed.len();
            if want == 0 {
                break;
            }
            let now = self.clock.now();
            let candidates = self.candidates(now, want)?;
            if candidates.is_empty() {
                break;
            }

            let mut lost = 0usize;
            for candidate in candidates {
                match self.store.claim(&candidate.id, now)? {
                    Some(job) => {
                        debug!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts, "job claimed");
                        claimed.push(job);
                    }
                    None => lost += 1,
                }
            }
            if lost == 0 {
                break;
            }
            debug!(round, lost, "claims lost, rescanning");
        }
        Ok(claimed)
    }

    fn candidates(&self, now: DateTime<Utc>, want: usize) -> Result<Vec<Job>> {
        match self.config.selection {
            SelectionPolicy::FreshFirst => {
                let mut jobs = self.store.find_ready(now, want)?;
                if jobs.len() < want {
                    jobs.extend(self.store.find_retryable(now, want - jobs.len())?);
                }
                Ok(jobs)
            }
            SelectionPolicy::Unified => self.store.find_due(now, want),
        }
    }

    /// Run one job to an outcome.
    ///
    /// A `Pending` job is claimed first; a `Processing` job is taken to be
    /// already claimed by the caller. Handler failures and panics end up in
    /// the returned outcome; only store failures surface as `Err`.
    pub async fn process_job(&self, job: Job) -> Result<ProcessOutcome> {
        let job = match job.status {
            JobStatus::Pending => match self.store.claim(&job.id, self.clock.now())? {
                Some(claimed) => claimed,
                None => return Ok(ProcessOutcome::Skipped),
            },
            JobStatus::Processing => job,
            JobStatus::Completed | JobStatus::Failed => {
                debug!(job_id = %job.id, status = %job.status, "terminal job skipped");
                return Ok(ProcessOutcome::Skipped);
            }
        };

        let handler = match self.registry.resolve(&job.job_type) {
            Ok(h) => h,
            Err(e) => {
                let error = e.to_string();
                warn!(job_id = %job.id, job_type = %job.job_type, "no handler registered");
                if !self
                    .store
                    .mark_failed(&job.id, job.attempts, &error, self.clock.now())?
                {
                    return Ok(ProcessOutcome::Skipped);
                }
                return Ok(ProcessOutcome::Failed { error });
            }
        };

        let payload = job.payload.clone();
        let result = tokio::spawn(async move { handler.handle(&payload).await }).await;
        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.message),
            Err(e) => Some(join_error_message(e)),
        };

        let now = self.clock.now();
        let Some(error) = failure else {
            if !self.store.mark_completed(&job.id, job.attempts, now)? {
                warn!(job_id = %job.id, "job no longer processing, completion dropped");
                return Ok(ProcessOutcome::Skipped);
            }
            info!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts, "job completed");
            return Ok(ProcessOutcome::Completed);
        };

        if job.attempts < job.max_attempts {
            let delay = self
                .config
                .backoff
                .delay(job.attempts)
                .as_secs()
                .min(MAX_BACKOFF_SECS);
            let retry_at = now + Duration::seconds(delay as i64);
            if !self
                .store
                .mark_retrying(&job.id, job.attempts, &error, retry_at, now)?
            {
                warn!(job_id = %job.id, "job no longer processing, retry dropped");
                return Ok(ProcessOutcome::Skipped);
            }
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                retry_in_secs = delay,
                %error,
                "job failed, will retry"
            );
            Ok(ProcessOutcome::Retrying { retry_at, error })
        } else {
            if !self.store.mark_failed(&job.id, job.attempts, &error, now)? {
                warn!(job_id = %job.id, "job no longer processing, failure dropped");
                return Ok(ProcessOutcome::Skipped);
            }
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempts,
                %error,
                "job failed permanently"
            );
            Ok(ProcessOutcome::Failed { error })
        }
    }

    /// Return jobs stuck in `Processing` for longer than `timeout` to the
    /// queue, or fail them if they have no attempts left.
    #[instrument(skip(self))]
    pub fn recover_stale(&self, timeout: std::time::Duration) -> Result<StaleRecovery> {
        let timeout = Duration::from_std(timeout)
            .map_err(|_| QueueError::validation("lease timeout too large"))?;
        let now = self.clock.now();
        let cutoff = now
            .checked_sub_signed(timeout)
            .ok_or_else(|| QueueError::validation("lease timeout too large"))?;
        let recovered = self.store.recover_stale(cutoff, STALE_ERROR, now)?;
        if recovered.requeued > 0 || recovered.failed > 0 {
            warn!(
                requeued = recovered.requeued,
                failed = recovered.failed,
                "stale jobs recovered"
            );
        }
        Ok(recovered)
    }

    // --- operators ---------------------------------------------------------

    pub fn get_job(&self, id: &str) -> Result<Job> {
        self.store.get(id)?.ok_or_else(|| QueueError::JobNotFound {
            id: id.to_string(),
        })
    }

    /// Delete a job that is not currently processing.
    pub fn cancel_job(&self, id: &str) -> Result<()> {
        match self.store.remove(id)? {
            Removal::Deleted => {
                info!(job_id = %id, "job cancelled");
                Ok(())
            }
            Removal::Processing => Err(QueueError::JobProcessing { id: id.to_string() }),
            Removal::NotFound => Err(QueueError::JobNotFound { id: id.to_string() }),
        }
    }

    /// Reset a failed job to a fresh pending one and return it.
    pub fn retry_job(&self, id: &str) -> Result<Job> {
        if self.store.reset_failed(id, self.clock.now())? {
            info!(job_id = %id, "job requeued by operator");
            return self.get_job(id);
        }
        let job = self.get_job(id)?;
        Err(QueueError::InvalidState {
            id: job.id,
            status: job.status,
        })
    }

    pub fn cancel_jobs(&self, ids: &[String]) -> Result<BulkResult> {
        bulk(ids, |id| self.cancel_job(id))
    }

    pub fn retry_jobs(&self, ids: &[String]) -> Result<BulkResult> {
        bulk(ids, |id| self.retry_job(id).map(|_| ()))
    }

    /// Delete completed and failed jobs untouched for `days` days.
    pub fn cleanup(&self, days: u32) -> Result<usize> {
        if !(MIN_CLEANUP_DAYS..=MAX_CLEANUP_DAYS).contains(&days) {
            return Err(QueueError::validation(format!(
                "days must be between {MIN_CLEANUP_DAYS} and {MAX_CLEANUP_DAYS}, got {days}"
            )));
        }
        let cutoff = self.clock.now() - Duration::days(days as i64);
        let deleted = self.store.delete_terminal_before(cutoff)?;
        info!(days, deleted, "old jobs cleaned up");
        Ok(deleted)
    }

    pub fn get_stats(&self) -> Result<JobStats> {
        self.store.stats()
    }

    /// Newest first.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        if filter.limit == 0 || filter.limit > MAX_LIST_LIMIT {
            return Err(QueueError::validation(format!(
                "limit must be between 1 and {MAX_LIST_LIMIT}, got {}",
                filter.limit
            )));
        }
        self.store.list(filter)
    }

    /// Distinct job types present in the store.
    pub fn job_types(&self) -> Result<Vec<String>> {
        self.store.job_types()
    }
}

/// Parse an RFC 3339 timestamp supplied by a textual caller.
pub fn parse_scheduled_at(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QueueError::validation(format!("invalid scheduled_at {raw:?}: {e}")))
}

/// Apply `op` to every id. Refusals are collected; store errors abort.
fn bulk<F>(ids: &[String], mut op: F) -> Result<BulkResult>
where
    F: FnMut(&str) -> Result<()>,
{
    let mut result = BulkResult::default();
    for id in ids {
        match op(id) {
            Ok(()) => result.succeeded.push(id.clone()),
            Err(
                e @ (QueueError::JobNotFound { .. }
                | QueueError::JobProcessing { .. }
                | QueueError::InvalidState { .. }),
            ) => result.failed.push((id.clone(), e.to_string())),
            Err(e) => return Err(e),
        }
    }
    Ok(result)
}

fn join_error_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "handler task cancelled".to_string();
    }
    let panic = err.into_panic();
    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    format!("handler panicked: {msg}")
}
