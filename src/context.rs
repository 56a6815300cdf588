// src/context.rs
use crate::{JobId, JobRecord};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::Span;

/// Application state shared with every handler (mailers, API clients, ...).
pub trait AppContext: AsAny + Send + Sync + 'static {}

/// Context provided to job handlers
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: String,
    pub queue_name: String,
    /// Failed attempts before this one.
    pub attempts: u32,
    pub processed_at: DateTime<Utc>,
    pub app_context: Option<Arc<dyn AppContext>>,
    pub span: Span,
}

impl JobContext {
    pub fn new(
        job: &JobRecord,
        processed_at: DateTime<Utc>,
        app_context: Option<Arc<dyn AppContext>>,
    ) -> Self {
        let span = tracing::info_span!(
            "job_execution",
            job_id = %job.id,
            job_type = %job.job_type,
            queue = %job.queue,
            attempts = job.attempts,
        );

        Self {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            queue_name: job.queue.clone(),
            attempts: job.attempts,
            processed_at,
            app_context,
            span,
        }
    }

    /// Get typed app context
    pub fn app<T: AppContext>(&self) -> Option<&T> {
        self.app_context.as_deref()?.as_any().downcast_ref::<T>()
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("queue_name", &self.queue_name)
            .field("attempts", &self.attempts)
            .field("processed_at", &self.processed_at)
            .finish_non_exhaustive()
    }
}

// Helper trait for downcasting
pub trait AsAny {
    fn as_any(&self) -> &dyn std::any::Any;
}

impl<T: AppContext> AsAny for T {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
