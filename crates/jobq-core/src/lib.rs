//! Shared configuration for the jobq workspace: the figment-backed
//! [`JobqConfig`] loader and the retry [`BackoffPolicy`].

pub mod backoff;
pub mod config;
pub mod error;

pub use backoff::BackoffPolicy;
pub use config::{JobqConfig, SelectionPolicy};
pub use error::{ConfigError, Result};
