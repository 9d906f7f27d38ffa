use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{HandlerError, QueueError, Result};

/// Application logic for one job type.
///
/// Implementations must be `Send + Sync`: the engine shares a single handler
/// across every job of its type and runs each call on its own Tokio task.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute one job. `Err` (or a panic) counts as a failed attempt.
    async fn handle(&self, payload: &serde_json::Value) -> std::result::Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, payload: &serde_json::Value) -> std::result::Result<(), HandlerError> {
        (self.f)(payload.clone()).await
    }
}

/// Lookup table from job type to handler, populated at process start.
///
/// Share it as `Arc<HandlerRegistry>`; lookups take a read lock only.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` for `job_type`, replacing any previous one.
    pub fn register(&self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let job_type = job_type.into();
        let mut handlers = self.handlers.write().expect("handler registry poisoned");
        if handlers.insert(job_type.clone(), handler).is_some() {
            info!(%job_type, "handler replaced");
        } else {
            debug!(%job_type, "handler registered");
        }
    }

    /// Register an async closure as the handler for `job_type`.
    pub fn register_fn<F, Fut>(&self, job_type: impl Into<String>, f: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.register(job_type, Arc::new(FnHandler::new(f)));
    }

    /// Remove the handler for `job_type`. Returns whether one was registered.
    pub fn unregister(&self, job_type: &str) -> bool {
        let mut handlers = self.handlers.write().expect("handler registry poisoned");
        handlers.remove(job_type).is_some()
    }

    /// Look up the handler for `job_type`.
    pub fn resolve(&self, job_type: &str) -> Result<Arc<dyn JobHandler>> {
        let handlers = self.handlers.read().expect("handler registry poisoned");
        handlers
            .get(job_type)
            .cloned()
            .ok_or_else(|| QueueError::HandlerNotFound {
                job_type: job_type.to_string(),
            })
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let handlers = self.handlers.read().expect("handler registry poisoned");
        let mut types: Vec<String> = handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.read().expect("handler registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
