// src/job_store.rs
use crate::{JobId, JobRecord, PressqError, Result, store::Store};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Job records keyed by id, stored as JSON with an expiry.
#[derive(Clone)]
pub struct JobStore {
    store: Arc<dyn Store>,
    key_prefix: String,
}

impl JobStore {
    pub fn new(store: Arc<dyn Store>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn key(&self, job_id: &JobId) -> String {
        format!("{}:job:{}", self.key_prefix, job_id)
    }

    /// Writes (or overwrites) the record with a fresh TTL.
    pub async fn put(&self, job: &JobRecord, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(job)?;
        self.store.set_ex(&self.key(&job.id), &json, ttl).await
    }

    /// `Ok(None)` when the record is absent or expired; `MalformedJob` when it
    /// exists but cannot be decoded.
    pub async fn get(&self, job_id: &JobId) -> Result<Option<JobRecord>> {
        let Some(json) = self.store.get(&self.key(job_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<JobRecord>(&json) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "undecodable job record");
                Err(PressqError::MalformedJob(format!("record {job_id}: {e}")))
            }
        }
    }

    pub async fn delete(&self, job_id: &JobId) -> Result<bool> {
        Ok(self.store.del(&[self.key(job_id)]).await? > 0)
    }

    pub async fn exists(&self, job_id: &JobId) -> Result<bool> {
        self.store.exists(&self.key(job_id)).await
    }
}

impl std::fmt::Debug for JobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}
