use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use jobq_core::config::{DEFAULT_MAX_ATTEMPTS, MAX_PRIORITY, MIN_PRIORITY};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

/// Job urgency in `[1, 15]`; higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const LOW: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(5);
    pub const HIGH: Priority = Priority(10);
    pub const CRITICAL: Priority = Priority(15);

    /// Accept a raw integer, rejecting anything outside `[1, 15]`.
    pub fn new(value: u8) -> Result<Self> {
        if (MIN_PRIORITY..=MAX_PRIORITY).contains(&value) {
            Ok(Priority(value))
        } else {
            Err(QueueError::validation(format!(
                "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}, got {value}"
            )))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl TryFrom<u8> for Priority {
    type Error = QueueError;

    fn try_from(value: u8) -> Result<Self> {
        Priority::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p.0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Priority {
    type Err = QueueError;

    /// Accepts a tier name (`low`, `normal`, `high`, `critical`) or an integer.
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::LOW),
            "normal" => Ok(Priority::NORMAL),
            "high" => Ok(Priority::HIGH),
            "critical" => Ok(Priority::CRITICAL),
            other => {
                let n: u8 = other
                    .parse()
                    .map_err(|_| QueueError::validation(format!("invalid priority: {s}")))?;
                Priority::new(n)
            }
        }
    }
}

/// Lifecycle state of a job.
///
/// A job awaiting retry is `Pending` with `attempts > 0` and a future
/// `scheduled_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed (possibly delayed).
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Handler succeeded. Terminal.
    Completed,
    /// Attempts exhausted or handler missing. Terminal.
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(QueueError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// UUIDv7 string, primary key.
    pub id: String,
    /// Key into the handler registry.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Opaque payload handed to the handler verbatim.
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub status: JobStatus,
    /// Execution attempts so far; bumped by every successful claim.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Not claimable before this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Cause of the most recent failure.
    pub error_message: Option<String>,
    /// Start of the most recent attempt.
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// True for a pending job that has failed at least once.
    pub fn is_retry(&self) -> bool {
        self.status == JobStatus::Pending && self.attempts > 0
    }
}

/// Optional arguments to [`QueueEngine::dispatch`](crate::engine::QueueEngine::dispatch).
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOptions {
    pub priority: Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// `None` uses the engine's configured default.
    pub max_attempts: Option<u32>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            priority: Priority::NORMAL,
            scheduled_at: None,
            max_attempts: None,
        }
    }
}

impl DispatchOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// A validated job about to be inserted.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub max_attempts: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            priority: Priority::NORMAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_at: None,
        }
    }
}

/// Aggregate counters for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub total: u64,
    /// Every status is present, zero when empty.
    pub by_status: BTreeMap<JobStatus, u64>,
    pub by_type: BTreeMap<String, u64>,
}

impl JobStats {
    pub fn count(&self, status: JobStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

/// Listing filter for operator views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 100;

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            status: None,
            job_type: None,
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
        }
    }
}

/// Result of a bulk operator action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResult {
    pub succeeded: Vec<String>,
    /// `(job id, reason)` for every id that was refused.
    pub failed: Vec<(String, String)>,
}

/// What happened to a job handed to `process_job`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    /// Failed with attempts left; eligible again at `retry_at`.
    Retrying {
        retry_at: DateTime<Utc>,
        error: String,
    },
    /// Terminal failure.
    Failed { error: String },
    /// Another worker owned the job, or it was already terminal.
    Skipped,
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_range_enforced() {
        assert!(Priority::new(0).is_err());
        assert!(Priority::new(16).is_err());
        assert_eq!(Priority::new(1).unwrap(), Priority::LOW);
        assert_eq!(Priority::new(15).unwrap(), Priority::CRITICAL);
    }

    #[test]
    fn priority_parses_tiers_and_integers() {
        assert_eq!("high".parse::<Priority>().unwrap(), Priority::HIGH);
        assert_eq!("Critical".parse::<Priority>().unwrap(), Priority::CRITICAL);
        assert_eq!("7".parse::<Priority>().unwrap().value(), 7);
        assert!("urgent".parse::<Priority>().is_err());
        assert!("99".parse::<Priority>().is_err());
    }

    #[test]
    fn priority_tiers_are_ordered() {
        assert!(Priority::LOW < Priority::NORMAL);
        assert!(Priority::NORMAL < Priority::HIGH);
        assert!(Priority::HIGH < Priority::CRITICAL);
    }

    #[test]
    fn priority_deserialize_rejects_out_of_range() {
        assert!(serde_json::from_str::<Priority>("0").is_err());
        assert_eq!(serde_json::from_str::<Priority>("12").unwrap().value(), 12);
    }

    #[test]
    fn status_string_roundtrip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("retrying".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn job_serializes_type_field() {
        let now = Utc::now();
        let job = Job {
            id: "j1".into(),
            job_type: "send_email".into(),
            payload: serde_json::json!({"to": "a@b.com"}),
            priority: Priority::NORMAL,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: 3,
            scheduled_at: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains(r#""type":"send_email""#));
        assert!(json.contains(r#""status":"pending""#));
        assert!(json.contains(r#""priority":5"#));
    }
}
