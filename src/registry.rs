// src/registry.rs
use crate::{Job, JobContext, JobRecord, PressqError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{Instrument, debug};

/// Something that processes the payload of one job type.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: &Value, ctx: &JobContext) -> Result<()>;
}

/// Result of a dispatch that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every handler registered for the type ran successfully.
    Handled { handlers: usize },
    /// Nothing is registered for the type.
    Unhandled,
}

/// Registry mapping job types to their handlers, in registration order
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Vec<Arc<dyn JobHandler>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `job_type`.
    pub fn register_handler(
        &mut self,
        job_type: impl Into<String>,
        handler: impl JobHandler + 'static,
    ) -> &mut Self {
        self.handlers
            .entry(job_type.into())
            .or_default()
            .push(Arc::new(handler));
        self
    }

    /// Append an async closure as a handler for `job_type`.
    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_handler(job_type, FnHandler(handler))
    }

    /// Register a typed job; its payload is deserialized into `T`.
    pub fn register<T: Job>(&mut self) -> &mut Self {
        self.register_handler(T::name(), TypedJobExecutor::<T>::new())
    }

    /// Run every handler for the job's type in order, stopping at the first
    /// error.
    pub async fn dispatch(&self, job: &JobRecord, ctx: &JobContext) -> Result<DispatchOutcome> {
        let Some(handlers) = self.handlers.get(&job.job_type).filter(|h| !h.is_empty()) else {
            return Ok(DispatchOutcome::Unhandled);
        };

        for (index, handler) in handlers.iter().enumerate() {
            handler
                .handle(&job.payload, ctx)
                .instrument(ctx.span.clone())
                .await
                .inspect_err(|e| {
                    debug!(job_id = %job.id, handler = index, error = %e, "handler failed");
                })?;
        }

        Ok(DispatchOutcome::Handled {
            handlers: handlers.len(),
        })
    }

    /// Get registered job types
    pub fn job_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Check if a job type has at least one handler
    pub fn contains_job(&self, job_type: &str) -> bool {
        self.handler_count(job_type) > 0
    }

    pub fn handler_count(&self, job_type: &str) -> usize {
        self.handlers.get(job_type).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<&str, usize> = self
            .handlers
            .iter()
            .map(|(job_type, handlers)| (job_type.as_str(), handlers.len()))
            .collect();
        f.debug_struct("JobRegistry")
            .field("handlers", &counts)
            .finish()
    }
}

struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, payload: &Value, ctx: &JobContext) -> Result<()> {
        (self.0)(payload.clone(), ctx.clone()).await
    }
}

struct TypedJobExecutor<T: Job> {
    _phantom: std::marker::PhantomData<fn() -> T>,
}

impl<T: Job> TypedJobExecutor<T> {
    fn new() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<T: Job> JobHandler for TypedJobExecutor<T> {
    async fn handle(&self, payload: &Value, ctx: &JobContext) -> Result<()> {
        let job: T = serde_json::from_value(payload.clone()).map_err(|e| {
            PressqError::MalformedJob(format!("payload is not a valid {}: {e}", T::name()))
        })?;
        job.perform(ctx).await
    }
}
