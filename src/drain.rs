// src/drain.rs
use crate::{
    AppContext, DispatchOutcome, FailOutcome, JobContext, JobRecord, JobRegistry, PressqError,
    Queue, Result, UnhandledPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Tally of one drain pass over a queue.
///
/// Every popped job counts as `processed` and lands in exactly one of
/// `completed`, `retried`, `dead_lettered` or `dropped`. `unhandled` is an
/// extra tally of jobs whose type had no handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub completed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub dropped: usize,
    pub unhandled: usize,
}

impl DrainReport {
    fn record_failure(&mut self, outcome: FailOutcome) {
        match outcome {
            FailOutcome::Retrying { .. } => self.retried += 1,
            FailOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            // Someone else already resolved the job; it is not ours to count.
            FailOutcome::NotInFlight => {}
        }
    }
}

/// Pops jobs from a queue and runs them through the registry.
pub struct Drainer {
    queue: Arc<Queue>,
    registry: Arc<JobRegistry>,
    app_context: Option<Arc<dyn AppContext>>,
}

impl Drainer {
    pub fn new(queue: Arc<Queue>, registry: Arc<JobRegistry>) -> Self {
        Self {
            queue,
            registry,
            app_context: None,
        }
    }

    pub fn with_app_context(mut self, ctx: Arc<dyn AppContext>) -> Self {
        self.app_context = Some(ctx);
        self
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Process up to `limit` jobs from `queue`, sleeping `pace_delay` after
    /// each job. Handler errors are routed through [`Queue::fail`]; only store
    /// failures are returned.
    #[instrument(skip_all, fields(queue = %queue, limit = limit))]
    pub async fn drain(&self, queue: &str, limit: usize, pace_delay: Duration) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        while report.processed < limit {
            let Some(job) = self.queue.pop(queue).await? else {
                break;
            };
            report.processed += 1;
            self.process(job, &mut report).await?;

            if report.processed < limit && !pace_delay.is_zero() {
                tokio::time::sleep(pace_delay).await;
            }
        }

        if report.processed > 0 {
            info!(
                processed = report.processed,
                completed = report.completed,
                retried = report.retried,
                dead_lettered = report.dead_lettered,
                dropped = report.dropped,
                "drain pass finished"
            );
        }
        Ok(report)
    }

    /// Drain each `(queue, limit)` in turn. A queue whose store calls fail is
    /// logged and skipped; the error is returned only if every queue failed.
    pub async fn drain_all(
        &self,
        queues: &[(String, usize)],
        pace_delay: Duration,
    ) -> Result<Vec<(String, DrainReport)>> {
        let mut reports = Vec::with_capacity(queues.len());
        let mut last_error = None;

        for (queue, limit) in queues {
            match self.drain(queue, *limit, pace_delay).await {
                Ok(report) => reports.push((queue.clone(), report)),
                Err(e) => {
                    error!(queue = %queue, error = %e, "drain pass failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if reports.is_empty() => Err(e),
            _ => Ok(reports),
        }
    }

    async fn process(&self, job: JobRecord, report: &mut DrainReport) -> Result<()> {
        if job.job_type.is_empty() {
            warn!(job_id = %job.id, queue = %job.queue, "job has no type; dropping it");
            self.queue.complete(&job).await?;
            report.dropped += 1;
            return Ok(());
        }

        let ctx = JobContext::new(&job, self.queue.clock().now(), self.app_context.clone());
        match self.registry.dispatch(&job, &ctx).await {
            Ok(DispatchOutcome::Handled { handlers }) => {
                debug!(job_id = %job.id, handlers, "job handled");
                self.queue.complete(&job).await?;
                report.completed += 1;
            }
            Ok(DispatchOutcome::Unhandled) => {
                report.unhandled += 1;
                match self.queue.options().unhandled_policy_for(&job.queue) {
                    UnhandledPolicy::Complete => {
                        warn!(
                            job_id = %job.id,
                            job_type = %job.job_type,
                            "no handler registered; completing job"
                        );
                        self.queue.complete(&job).await?;
                        report.completed += 1;
                    }
                    UnhandledPolicy::Fail => {
                        let reason = format!("no handler registered for {}", job.job_type);
                        let outcome = self.queue.fail(&job, &reason).await?;
                        report.record_failure(outcome);
                    }
                }
            }
            Err(PressqError::MalformedJob(reason)) => {
                warn!(job_id = %job.id, %reason, "malformed job; dropping it");
                self.queue.complete(&job).await?;
                report.dropped += 1;
            }
            Err(e) => {
                let outcome = self.queue.fail(&job, &e.to_string()).await?;
                report.record_failure(outcome);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Drainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drainer")
            .field("queue", &self.queue)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobState, ManualClock, QueueOptions};
    use serde_json::json;

    fn setup(options: QueueOptions) -> (Arc<Queue>, ManualClock) {
        let clock = ManualClock::starting_now();
        let queue = Queue::in_memory(Arc::new(clock.clone()), options);
        (Arc::new(queue), clock)
    }

    fn ok_registry(job_type: &str) -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry.register_fn(job_type, |_, _| async { Ok::<_, PressqError>(()) });
        registry
    }

    #[tokio::test]
    async fn drains_until_the_queue_is_empty() {
        let (queue, _) = setup(QueueOptions::default());
        for n in 0..3 {
            queue.push("emails", "send_otp", &json!({"n": n}), 0).await.unwrap();
        }

        let drainer = Drainer::new(Arc::clone(&queue), Arc::new(ok_registry("send_otp")));
        let report = drainer.drain("emails", 10, Duration::ZERO).await.unwrap();

        assert_eq!(report.processed, 3);
        assert_eq!(report.completed, 3);
        assert_eq!(queue.stats("emails").await.unwrap().completed_total, 3);
    }

    #[tokio::test]
    async fn stops_at_the_limit() {
        let (queue, _) = setup(QueueOptions::default());
        for _ in 0..5 {
            queue.push("emails", "send_otp", &json!({}), 0).await.unwrap();
        }

        let drainer = Drainer::new(Arc::clone(&queue), Arc::new(ok_registry("send_otp")));
        let report = drainer.drain("emails", 2, Duration::ZERO).await.unwrap();

        assert_eq!(report.processed, 2);
        assert_eq!(queue.size("emails").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn handler_errors_become_retries() {
        let (queue, _) = setup(QueueOptions::default());
        let id = queue.push("emails", "send_otp", &json!({}), 0).await.unwrap();

        let mut registry = JobRegistry::new();
        registry.register_fn("send_otp", |_, _| async {
            Err::<(), _>(PressqError::from(anyhow::anyhow!("smtp down")))
        });
        let drainer = Drainer::new(Arc::clone(&queue), Arc::new(registry));
        let report = drainer.drain("emails", 10, Duration::ZERO).await.unwrap();

        assert_eq!(report.retried, 1);
        let stored = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("Handler failed: smtp down"));
        assert_eq!(
            queue.state_of("emails", &id).await.unwrap(),
            Some(JobState::Delayed)
        );
    }

    #[tokio::test]
    async fn unhandled_jobs_follow_the_queue_policy() {
        let options = QueueOptions::default().with_unhandled_policy("strict", UnhandledPolicy::Fail);
        let (queue, _) = setup(options);
        let lenient = queue.push("lenient", "mystery", &json!({}), 0).await.unwrap();
        let strict = queue.push("strict", "mystery", &json!({}), 0).await.unwrap();

        let drainer = Drainer::new(Arc::clone(&queue), Arc::new(JobRegistry::new()));

        let report = drainer.drain("lenient", 10, Duration::ZERO).await.unwrap();
        assert_eq!((report.unhandled, report.completed), (1, 1));
        assert!(queue.get_job(&lenient).await.unwrap().is_none());

        let report = drainer.drain("strict", 10, Duration::ZERO).await.unwrap();
        assert_eq!((report.unhandled, report.retried), (1, 1));
        assert_eq!(
            queue.state_of("strict", &strict).await.unwrap(),
            Some(JobState::Delayed)
        );
    }

    #[tokio::test]
    async fn malformed_payloads_are_dropped_not_retried() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Welcome {
            user_id: u64,
        }

        #[async_trait::async_trait]
        impl crate::Job for Welcome {
            async fn perform(&self, _ctx: &JobContext) -> Result<()> {
                Ok(())
            }

            fn name() -> &'static str {
                "welcome"
            }
        }

        let (queue, _) = setup(QueueOptions::default());
        let id = queue
            .push("emails", "welcome", &json!({"user_id": "nope"}), 0)
            .await
            .unwrap();

        let mut registry = JobRegistry::new();
        registry.register::<Welcome>();
        let drainer = Drainer::new(Arc::clone(&queue), Arc::new(registry));
        let report = drainer.drain("emails", 10, Duration::ZERO).await.unwrap();

        assert_eq!(report.dropped, 1);
        assert_eq!(queue.state_of("emails", &id).await.unwrap(), None);
        assert!(queue.get_job(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn drain_all_reports_per_queue() {
        let (queue, _) = setup(QueueOptions::default());
        queue.push("emails", "send_otp", &json!({}), 0).await.unwrap();
        queue.push("emails", "send_otp", &json!({}), 0).await.unwrap();
        queue.push("telegram", "send_otp", &json!({}), 0).await.unwrap();

        let drainer = Drainer::new(Arc::clone(&queue), Arc::new(ok_registry("send_otp")));
        let reports = drainer
            .drain_all(
                &[("emails".to_string(), 10), ("telegram".to_string(), 10)],
                Duration::ZERO,
            )
            .await
            .unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].0, "emails");
        assert_eq!(reports[0].1.completed, 2);
        assert_eq!(reports[1].1.completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn paces_between_jobs() {
        let (queue, _) = setup(QueueOptions::default());
        for _ in 0..3 {
            queue.push("emails", "send_otp", &json!({}), 0).await.unwrap();
        }

        let drainer = Drainer::new(Arc::clone(&queue), Arc::new(ok_registry("send_otp")));
        let started = tokio::time::Instant::now();
        drainer
            .drain("emails", 3, Duration::from_millis(100))
            .await
            .unwrap();
        // No pause after the job that reaches the limit.
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }
}
