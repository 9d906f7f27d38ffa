//! `jobq-queue`: persistent priority job queue on SQLite.
//!
//! # Overview
//!
//! Producers [`dispatch`](engine::QueueEngine::dispatch) jobs into a SQLite
//! `jobs` table. Workers claim them with a single compare-and-swap `UPDATE`,
//! run the handler registered for the job's type, and record the outcome.
//! Failed attempts go back to `pending` with a backoff delay until
//! `max_attempts` is reached.
//!
//! # Selection
//!
//! | Policy        | Order                                                   |
//! |---------------|---------------------------------------------------------|
//! | `fresh_first` | Never-run jobs first, backed-off retries fill the rest  |
//! | `unified`     | Every due job by priority, then creation time           |
//!
//! Within a tier jobs run by priority (15 highest), then FIFO.

pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod registry;
pub mod store;
pub mod types;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{parse_scheduled_at, QueueEngine};
pub use error::{HandlerError, QueueError, Result};
pub use registry::{FnHandler, HandlerRegistry, JobHandler};
pub use store::{JobStore, Removal, SqliteJobStore, StaleRecovery};
pub use types::{
    BulkResult, DispatchOptions, Job, JobFilter, JobStats, JobStatus, NewJob, Priority,
    ProcessOutcome,
};
pub use worker::{Worker, WorkerSummary};
