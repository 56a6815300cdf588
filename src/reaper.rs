// src/reaper.rs
use crate::{PressqError, Queue, Result};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Error recorded on jobs reclaimed after their visibility timeout.
pub const VISIBILITY_EXPIRED: &str = "visibility timeout expired";

/// Reclaims in-flight jobs whose popper never completed or failed them.
#[derive(Debug, Clone)]
pub struct Reaper {
    queue: Arc<Queue>,
}

impl Reaper {
    pub fn new(queue: Arc<Queue>) -> Self {
        Self { queue }
    }

    /// Route every expired processing entry of `queue` through the failure
    /// path and prune dead letters past their retention. Returns how many
    /// processing entries this call claimed.
    #[instrument(skip_all, fields(queue = %queue))]
    pub async fn reap(&self, queue: &str) -> Result<usize> {
        self.queue.prune_dead_letters(queue).await?;

        let expired = self.queue.in_flight_expired(queue).await?;
        let mut reaped = 0;

        for job_id in expired {
            // Losing the claim means another reaper, or the owner, got there first.
            if !self.queue.release_in_flight(queue, &job_id).await? {
                continue;
            }
            reaped += 1;

            match self.queue.get_job(&job_id).await {
                Ok(Some(job)) => {
                    let outcome = self.queue.retry_or_bury(&job, VISIBILITY_EXPIRED).await?;
                    debug!(job_id = %job_id, ?outcome, "stalled job reclaimed");
                }
                Ok(None) => {
                    debug!(job_id = %job_id, "stalled entry had no record; removed");
                }
                Err(PressqError::MalformedJob(reason)) => {
                    warn!(job_id = %job_id, %reason, "stalled job is malformed; dropping it");
                    self.queue.delete_record(&job_id).await?;
                }
                Err(e) => return Err(e),
            }
        }

        if reaped > 0 {
            info!(reaped, "reclaimed stalled jobs");
        }
        Ok(reaped)
    }
}
