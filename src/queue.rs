// src/queue.rs
use crate::{
    BackoffPolicy, BackoffStrategy, Clock, Job, JobId, JobRecord, JobState, MAX_PRIORITY,
    PressqError, PushOptions, RedisConfig, Result, SystemClock,
    clock::{add_duration, score_of},
    job_store::JobStore,
    store::{MemoryStore, RedisStore, Store},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// What the drain loop does with a job whose type has no handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhandledPolicy {
    /// Log and complete; there is nothing a retry could change.
    #[default]
    Complete,
    /// Route through the failure path like a handler error.
    Fail,
}

/// Options for queue configuration
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub key_prefix: String,
    /// How long a popped job stays owned by its popper before the reaper may
    /// reclaim it.
    pub visibility_timeout: Duration,
    pub job_ttl: Duration,
    pub dead_letter_ttl: Duration,
    pub default_max_attempts: u32,
    /// Upper bound on a single blocking wait; promotion re-runs this often.
    pub poll_interval: Duration,
    pub unhandled_policy: UnhandledPolicy,
    /// Per-queue overrides of `unhandled_policy`.
    pub unhandled_overrides: HashMap<String, UnhandledPolicy>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            key_prefix: "pressq".to_string(),
            visibility_timeout: Duration::from_secs(300),
            job_ttl: Duration::from_secs(24 * 60 * 60),
            dead_letter_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            default_max_attempts: 3,
            poll_interval: Duration::from_secs(1),
            unhandled_policy: UnhandledPolicy::Complete,
            unhandled_overrides: HashMap::new(),
        }
    }
}

impl QueueOptions {
    /// Defaults overridden by `PRESSQ_KEY_PREFIX`,
    /// `PRESSQ_VISIBILITY_TIMEOUT_SECS` and `PRESSQ_MAX_ATTEMPTS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut options = Self::default();
        if let Some(prefix) = lookup("PRESSQ_KEY_PREFIX").filter(|v| !v.is_empty()) {
            options.key_prefix = prefix;
        }
        if let Some(secs) = lookup("PRESSQ_VISIBILITY_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                PressqError::Config(format!("invalid PRESSQ_VISIBILITY_TIMEOUT_SECS: {secs}"))
            })?;
            options.visibility_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = lookup("PRESSQ_MAX_ATTEMPTS") {
            let attempts: u32 = attempts
                .parse()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    PressqError::Config(format!("invalid PRESSQ_MAX_ATTEMPTS: {attempts}"))
                })?;
            options.default_max_attempts = attempts;
        }
        Ok(options)
    }

    pub fn with_unhandled_policy(mut self, queue: impl Into<String>, policy: UnhandledPolicy) -> Self {
        self.unhandled_overrides.insert(queue.into(), policy);
        self
    }

    pub fn unhandled_policy_for(&self, queue: &str) -> UnhandledPolicy {
        self.unhandled_overrides
            .get(queue)
            .copied()
            .unwrap_or(self.unhandled_policy)
    }
}

/// Result of [`Queue::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Parked in the delayed index until `retry_at`.
    Retrying {
        attempts: u32,
        retry_at: DateTime<Utc>,
    },
    /// Out of attempts; moved to the dead-letter index.
    DeadLettered { attempts: u32 },
    /// The job was no longer in flight (already resolved or reclaimed), so
    /// nothing changed.
    NotInFlight,
}

/// Redis-backed job queue
pub struct Queue {
    store: Arc<dyn Store>,
    jobs: JobStore,
    options: QueueOptions,
    backoff: Arc<dyn BackoffPolicy>,
    clock: Arc<dyn Clock>,
}

impl Queue {
    pub fn new(store: Arc<dyn Store>, options: QueueOptions) -> Self {
        let jobs = JobStore::new(Arc::clone(&store), options.key_prefix.clone());
        Self {
            store,
            jobs,
            options,
            backoff: Arc::new(BackoffStrategy::default()),
            clock: Arc::new(SystemClock),
        }
    }

    pub async fn connect(redis: &RedisConfig, options: QueueOptions) -> Result<Self> {
        let store = RedisStore::connect(redis).await?;
        Ok(Self::new(Arc::new(store), options))
    }

    /// Queue over a [`MemoryStore`] sharing `clock`.
    pub fn in_memory(clock: Arc<dyn Clock>, options: QueueOptions) -> Self {
        let store = MemoryStore::with_clock(Arc::clone(&clock));
        Self::new(Arc::new(store), options).with_clock(clock)
    }

    pub fn with_backoff(mut self, policy: impl BackoffPolicy + 'static) -> Self {
        self.backoff = Arc::new(policy);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn backoff(&self) -> &Arc<dyn BackoffPolicy> {
        &self.backoff
    }

    /// Push an immediately available job; lower `priority` is delivered first.
    pub async fn push<P>(&self, queue: &str, job_type: &str, payload: &P, priority: i64) -> Result<JobId>
    where
        P: Serialize + ?Sized,
    {
        self.push_with(queue, job_type, payload, PushOptions::default().priority(priority))
            .await
    }

    /// Push a job that becomes available after `delay`.
    pub async fn push_delayed<P>(
        &self,
        queue: &str,
        job_type: &str,
        payload: &P,
        delay: Duration,
        priority: i64,
    ) -> Result<JobId>
    where
        P: Serialize + ?Sized,
    {
        self.push_with(
            queue,
            job_type,
            payload,
            PushOptions::default().priority(priority).delay(delay),
        )
        .await
    }

    /// Enqueue a typed job on its own queue with its default options
    pub async fn enqueue<T: Job>(&self, job: &T) -> Result<JobId> {
        self.push_with(T::queue_name(), T::name(), job, T::default_options())
            .await
    }

    #[instrument(skip_all, fields(queue = %queue, job_type = %job_type))]
    pub async fn push_with<P>(
        &self,
        queue: &str,
        job_type: &str,
        payload: &P,
        options: PushOptions,
    ) -> Result<JobId>
    where
        P: Serialize + ?Sized,
    {
        if queue.is_empty() {
            return Err(PressqError::MalformedJob("queue name is empty".to_string()));
        }
        if job_type.is_empty() {
            return Err(PressqError::MalformedJob("job type is empty".to_string()));
        }
        if options.priority.unsigned_abs() > MAX_PRIORITY.unsigned_abs() {
            return Err(PressqError::MalformedJob(format!(
                "priority {} is outside ±{MAX_PRIORITY}",
                options.priority
            )));
        }

        let now = self.clock.now();
        let delay = options.delay.filter(|d| !d.is_zero());
        let available_at = delay.map_or(now, |d| add_duration(now, d));
        let job = JobRecord {
            id: JobId::new(),
            queue: queue.to_string(),
            job_type: job_type.to_string(),
            payload: serde_json::to_value(payload)?,
            priority: options.priority,
            attempts: 0,
            max_attempts: options
                .max_attempts
                .unwrap_or(self.options.default_max_attempts)
                .max(1),
            created_at: now,
            available_at,
            last_error: None,
            last_attempt_at: None,
        };

        // The record goes in before the index entry so an indexed id always
        // has a record to resolve to.
        let ttl = self.options.job_ttl.saturating_add(delay.unwrap_or_default());
        self.jobs.put(&job, ttl).await?;

        match delay {
            Some(_) => {
                self.store
                    .zadd(&self.delayed_key(queue), job.id.as_str(), score_of(available_at))
                    .await?
            }
            None => {
                self.store
                    .zadd(&self.ready_key(queue), job.id.as_str(), job.priority as f64)
                    .await?
            }
        }
        self.bump(queue, Counter::Pushed).await?;

        debug!(job_id = %job.id, delayed = delay.is_some(), "job pushed");
        Ok(job.id)
    }

    /// Non-blocking pop of the lowest-scored ready job.
    #[instrument(skip_all, fields(queue = %queue))]
    pub async fn pop(&self, queue: &str) -> Result<Option<JobRecord>> {
        self.promote_due(queue).await?;

        let ready = self.ready_key(queue);
        while let Some((member, _)) = self.store.zpopmin(&ready).await? {
            if let Some(job) = self.admit(queue, JobId(member)).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Pop, waiting up to `timeout` for a job to become ready.
    pub async fn pop_timeout(&self, queue: &str, timeout: Duration) -> Result<Option<JobRecord>> {
        self.pop_waiting(queue, timeout, None).await
    }

    /// Like [`Queue::pop_timeout`], giving up with `Ok(None)` as soon as
    /// `cancel` fires.
    pub async fn pop_cancellable(
        &self,
        queue: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<JobRecord>> {
        self.pop_waiting(queue, timeout, Some(cancel)).await
    }

    async fn pop_waiting(
        &self,
        queue: &str,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<JobRecord>> {
        let deadline = Instant::now() + timeout;
        let ready = self.ready_key(queue);

        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Ok(None);
            }
            if let Some(job) = self.pop(queue).await? {
                return Ok(Some(job));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Only the wait races cancellation; promotion and admission always
            // run to completion so a popped id is never abandoned here.
            let slice = self.options.poll_interval.min(deadline - now);
            let popped = match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Ok(None),
                    popped = self.store.bzpopmin(&ready, slice) => popped?,
                },
                None => self.store.bzpopmin(&ready, slice).await?,
            };

            if let Some((member, _)) = popped {
                if let Some(job) = self.admit(queue, JobId(member)).await? {
                    return Ok(Some(job));
                }
            }
        }
    }

    /// Resolve a popped id into its record and mark it in flight. Ids without a
    /// usable record are dropped.
    async fn admit(&self, queue: &str, job_id: JobId) -> Result<Option<JobRecord>> {
        let job = match self.jobs.get(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %job_id, queue = %queue, "popped job has no record; dropping it");
                return Ok(None);
            }
            Err(PressqError::MalformedJob(reason)) => {
                warn!(job_id = %job_id, queue = %queue, %reason, "popped job is malformed; dropping it");
                self.jobs.delete(&job_id).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let deadline = add_duration(self.clock.now(), self.options.visibility_timeout);
        self.store
            .zadd(&self.processing_key(queue), job_id.as_str(), score_of(deadline))
            .await?;
        // Keep the record alive for at least as long as it may sit in flight.
        self.jobs
            .put(
                &job,
                self.options
                    .job_ttl
                    .saturating_add(self.options.visibility_timeout),
            )
            .await?;

        debug!(job_id = %job_id, attempts = job.attempts, "job admitted to processing");
        Ok(Some(job))
    }

    /// Mark a job done. Completing a job that is no longer in flight (already
    /// resolved, or reclaimed by the reaper) is a no-op.
    #[instrument(skip_all, fields(job_id = %job.id, queue = %job.queue))]
    pub async fn complete(&self, job: &JobRecord) -> Result<()> {
        let was_in_flight = self
            .store
            .zrem(&self.processing_key(&job.queue), job.id.as_str())
            .await?;
        if !was_in_flight {
            debug!("complete called for a job that is not in flight; ignoring");
            return Ok(());
        }

        self.jobs.delete(&job.id).await?;
        self.bump(&job.queue, Counter::Completed).await?;
        debug!("job completed");
        Ok(())
    }

    /// Record a failed attempt and either schedule a retry or dead-letter it.
    #[instrument(skip_all, fields(job_id = %job.id, queue = %job.queue))]
    pub async fn fail(&self, job: &JobRecord, error: &str) -> Result<FailOutcome> {
        let was_in_flight = self
            .store
            .zrem(&self.processing_key(&job.queue), job.id.as_str())
            .await?;
        if !was_in_flight {
            debug!("fail called for a job that is not in flight; ignoring");
            return Ok(FailOutcome::NotInFlight);
        }
        self.retry_or_bury(job, error).await
    }

    /// Failure path for a job already removed from the processing index.
    pub(crate) async fn retry_or_bury(&self, job: &JobRecord, error: &str) -> Result<FailOutcome> {
        let mut record = match self.jobs.get(&job.id).await {
            Ok(Some(stored)) => stored,
            Ok(None) | Err(PressqError::MalformedJob(_)) => job.clone(),
            Err(e) => return Err(e),
        };

        let now = self.clock.now();
        record.attempts = record.attempts.saturating_add(1);
        record.last_error = Some(error.to_string());
        record.last_attempt_at = Some(now);

        if self.backoff.is_terminal(record.attempts, record.max_attempts) {
            self.jobs.put(&record, self.options.dead_letter_ttl).await?;
            self.store
                .zadd(&self.dead_key(&record.queue), record.id.as_str(), score_of(now))
                .await?;
            self.bump(&record.queue, Counter::DeadLettered).await?;

            warn!(
                attempts = record.attempts,
                error = %error,
                "job exhausted its attempts and was dead-lettered"
            );
            return Ok(FailOutcome::DeadLettered {
                attempts: record.attempts,
            });
        }

        let delay = self.backoff.delay(record.attempts);
        let retry_at = add_duration(now, delay);
        record.available_at = retry_at;
        // The record must outlive its stay in the delayed index.
        self.jobs
            .put(&record, self.options.job_ttl.saturating_add(delay))
            .await?;
        self.store
            .zadd(&self.delayed_key(&record.queue), record.id.as_str(), score_of(retry_at))
            .await?;
        self.bump(&record.queue, Counter::Retried).await?;

        info!(
            attempts = record.attempts,
            retry_in_secs = delay.as_secs(),
            error = %error,
            "job failed; retry scheduled"
        );
        Ok(FailOutcome::Retrying {
            attempts: record.attempts,
            retry_at,
        })
    }

    /// Move delayed jobs whose time has come into the ready index.
    pub async fn promote_due(&self, queue: &str) -> Result<usize> {
        let delayed = self.delayed_key(queue);
        let ready = self.ready_key(queue);
        let now = score_of(self.clock.now());

        let due = self
            .store
            .zrangebyscore(&delayed, f64::NEG_INFINITY, now)
            .await?;

        let mut promoted = 0;
        for member in due {
            let job_id = JobId(member);
            match self.jobs.get(&job_id).await {
                Ok(Some(job)) => {
                    // zmove only succeeds for the caller that removed the
                    // member, so concurrent promoters cannot both insert it.
                    if self
                        .store
                        .zmove(&delayed, &ready, job_id.as_str(), job.priority as f64)
                        .await?
                    {
                        promoted += 1;
                    }
                }
                Ok(None) => {
                    warn!(job_id = %job_id, queue = %queue, "delayed job has no record; dropping it");
                    self.store.zrem(&delayed, job_id.as_str()).await?;
                }
                Err(PressqError::MalformedJob(reason)) => {
                    warn!(job_id = %job_id, queue = %queue, %reason, "delayed job is malformed; dropping it");
                    self.store.zrem(&delayed, job_id.as_str()).await?;
                    self.jobs.delete(&job_id).await?;
                }
                Err(e) => return Err(e),
            }
        }

        if promoted > 0 {
            debug!(queue = %queue, promoted, "promoted delayed jobs");
        }
        Ok(promoted)
    }

    /// Number of ready jobs. Delayed, in-flight and dead jobs are not counted.
    pub async fn size(&self, queue: &str) -> Result<usize> {
        self.store.zcard(&self.ready_key(queue)).await
    }

    /// Drop all four indices of `queue`. Records are left to expire.
    pub async fn clear(&self, queue: &str) -> Result<()> {
        let keys = [
            self.ready_key(queue),
            self.delayed_key(queue),
            self.processing_key(queue),
            self.dead_key(queue),
        ];
        self.store.del(&keys).await?;
        info!(queue = %queue, "queue cleared");
        Ok(())
    }

    /// Get queue statistics
    pub async fn stats(&self, queue: &str) -> Result<QueueStats> {
        self.prune_dead_letters(queue).await?;
        Ok(QueueStats {
            ready: self.store.zcard(&self.ready_key(queue)).await?,
            delayed: self.store.zcard(&self.delayed_key(queue)).await?,
            processing: self.store.zcard(&self.processing_key(queue)).await?,
            dead_letter: self.store.zcard(&self.dead_key(queue)).await?,
            pushed_total: self.counter(queue, Counter::Pushed).await?,
            completed_total: self.counter(queue, Counter::Completed).await?,
            retried_total: self.counter(queue, Counter::Retried).await?,
            dead_lettered_total: self.counter(queue, Counter::DeadLettered).await?,
        })
    }

    /// Get job by ID
    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<JobRecord>> {
        self.jobs.get(job_id).await
    }

    /// Which index of `queue` currently holds `job_id`, if any.
    pub async fn state_of(&self, queue: &str, job_id: &JobId) -> Result<Option<JobState>> {
        let indices = [
            (JobState::Ready, self.ready_key(queue)),
            (JobState::Delayed, self.delayed_key(queue)),
            (JobState::Processing, self.processing_key(queue)),
            (JobState::DeadLetter, self.dead_key(queue)),
        ];
        for (state, key) in indices {
            if self.store.zscore(&key, job_id.as_str()).await?.is_some() {
                return Ok(Some(state));
            }
        }
        Ok(None)
    }

    /// Score of `job_id` in the index for `state`.
    pub async fn score_in(&self, queue: &str, state: JobState, job_id: &JobId) -> Result<Option<f64>> {
        let key = match state {
            JobState::Ready => self.ready_key(queue),
            JobState::Delayed => self.delayed_key(queue),
            JobState::Processing => self.processing_key(queue),
            JobState::DeadLetter => self.dead_key(queue),
        };
        self.store.zscore(&key, job_id.as_str()).await
    }

    /// Dead-lettered jobs whose records are still retained, oldest first.
    pub async fn dead_letters(&self, queue: &str) -> Result<Vec<JobRecord>> {
        self.prune_dead_letters(queue).await?;
        let members = self.store.zrange_withscores(&self.dead_key(queue)).await?;
        let mut jobs = Vec::with_capacity(members.len());
        for (member, _) in members {
            match self.jobs.get(&JobId(member)).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) | Err(PressqError::MalformedJob(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(jobs)
    }

    /// Drop dead-letter entries older than `dead_letter_ttl`; their records
    /// have expired by then. Returns how many entries were removed.
    pub async fn prune_dead_letters(&self, queue: &str) -> Result<usize> {
        let dead = self.dead_key(queue);
        let cutoff = score_of(self.clock.now()) - self.options.dead_letter_ttl.as_secs_f64();
        let stale = self
            .store
            .zrangebyscore(&dead, f64::NEG_INFINITY, cutoff)
            .await?;

        let mut pruned = 0;
        for member in stale {
            if self.store.zrem(&dead, &member).await? {
                self.jobs.delete(&JobId(member)).await?;
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!(queue = %queue, pruned, "pruned expired dead letters");
        }
        Ok(pruned)
    }

    /// Give a dead-lettered job a fresh set of attempts. Returns false if the
    /// job is not in the dead-letter index.
    #[instrument(skip_all, fields(queue = %queue, job_id = %job_id))]
    pub async fn retry_dead_letter(&self, queue: &str, job_id: &JobId) -> Result<bool> {
        let dead = self.dead_key(queue);
        if self.store.zscore(&dead, job_id.as_str()).await?.is_none() {
            return Ok(false);
        }
        let Some(mut job) = self.jobs.get(job_id).await? else {
            self.store.zrem(&dead, job_id.as_str()).await?;
            return Ok(false);
        };

        job.attempts = 0;
        job.available_at = self.clock.now();
        self.jobs.put(&job, self.options.job_ttl).await?;
        let moved = self
            .store
            .zmove(&dead, &self.ready_key(queue), job_id.as_str(), job.priority as f64)
            .await?;
        if moved {
            info!("dead-lettered job requeued");
        }
        Ok(moved)
    }

    pub(crate) async fn in_flight_expired(&self, queue: &str) -> Result<Vec<JobId>> {
        let now = score_of(self.clock.now());
        let members = self
            .store
            .zrangebyscore(&self.processing_key(queue), f64::NEG_INFINITY, now)
            .await?;
        Ok(members.into_iter().map(JobId).collect())
    }

    /// Claim an in-flight entry for reclaiming; true for exactly one caller.
    pub(crate) async fn release_in_flight(&self, queue: &str, job_id: &JobId) -> Result<bool> {
        self.store
            .zrem(&self.processing_key(queue), job_id.as_str())
            .await
    }

    pub(crate) async fn delete_record(&self, job_id: &JobId) -> Result<bool> {
        self.jobs.delete(job_id).await
    }

    async fn bump(&self, queue: &str, counter: Counter) -> Result<()> {
        self.store.incr(&self.counter_key(queue, counter), 1).await?;
        Ok(())
    }

    async fn counter(&self, queue: &str, counter: Counter) -> Result<u64> {
        let value = self.store.get(&self.counter_key(queue, counter)).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    // Store key helpers
    fn ready_key(&self, queue_name: &str) -> String {
        format!("{}:queue:{}:ready", self.options.key_prefix, queue_name)
    }

    fn delayed_key(&self, queue_name: &str) -> String {
        format!("{}:queue:{}:delayed", self.options.key_prefix, queue_name)
    }

    fn processing_key(&self, queue_name: &str) -> String {
        format!("{}:queue:{}:processing", self.options.key_prefix, queue_name)
    }

    fn dead_key(&self, queue_name: &str) -> String {
        format!("{}:queue:{}:dead", self.options.key_prefix, queue_name)
    }

    fn counter_key(&self, queue_name: &str, counter: Counter) -> String {
        format!(
            "{}:queue:{}:stats:{}",
            self.options.key_prefix,
            queue_name,
            counter.as_str()
        )
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("options", &self.options)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
enum Counter {
    Pushed,
    Completed,
    Retried,
    DeadLettered,
}

impl Counter {
    fn as_str(self) -> &'static str {
        match self {
            Counter::Pushed => "pushed",
            Counter::Completed => "completed",
            Counter::Retried => "retried",
            Counter::DeadLettered => "dead_lettered",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: usize,
    pub delayed: usize,
    pub processing: usize,
    pub dead_letter: usize,
    pub pushed_total: u64,
    pub completed_total: u64,
    pub retried_total: u64,
    pub dead_lettered_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use serde_json::json;

    fn queue() -> (Queue, ManualClock) {
        let clock = ManualClock::starting_now();
        let queue = Queue::in_memory(Arc::new(clock.clone()), QueueOptions::default());
        (queue, clock)
    }

    #[tokio::test]
    async fn push_grows_ready_size_by_one() {
        let (queue, _) = queue();
        assert_eq!(queue.size("emails").await.unwrap(), 0);
        queue.push("emails", "send_otp", &json!({}), 0).await.unwrap();
        assert_eq!(queue.size("emails").await.unwrap(), 1);
        queue.push("emails", "send_otp", &json!({}), 0).await.unwrap();
        assert_eq!(queue.size("emails").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn push_delayed_leaves_ready_size_alone() {
        let (queue, _) = queue();
        queue
            .push_delayed("emails", "send_otp", &json!({}), Duration::from_secs(60), 0)
            .await
            .unwrap();
        assert_eq!(queue.size("emails").await.unwrap(), 0);
        assert_eq!(queue.stats("emails").await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn empty_type_is_rejected_before_writing() {
        let (queue, _) = queue();
        let err = queue.push("emails", "", &json!({}), 0).await.unwrap_err();
        assert!(matches!(err, PressqError::MalformedJob(_)));
        assert_eq!(queue.stats("emails").await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn lower_priority_value_pops_first() {
        let (queue, _) = queue();
        let low = queue.push("q", "t", &json!({"n": 1}), 10).await.unwrap();
        let high = queue.push("q", "t", &json!({"n": 2}), -10).await.unwrap();
        let mid = queue.push("q", "t", &json!({"n": 3}), 0).await.unwrap();

        let order: Vec<JobId> = [
            queue.pop("q").await.unwrap().unwrap().id,
            queue.pop("q").await.unwrap().unwrap().id,
            queue.pop("q").await.unwrap().unwrap().id,
        ]
        .into();
        assert_eq!(order, vec![high, mid, low]);
        assert!(queue.pop("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pop_marks_job_in_flight_until_visibility_deadline() {
        let (queue, clock) = queue();
        let id = queue.push("q", "t", &json!({}), 0).await.unwrap();
        let job = queue.pop("q").await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.attempts, 0);

        assert_eq!(queue.state_of("q", &id).await.unwrap(), Some(JobState::Processing));
        let deadline = queue
            .score_in("q", JobState::Processing, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deadline, score_of(clock.now()) + 300.0);
    }

    #[tokio::test]
    async fn popped_ids_without_records_are_skipped() {
        let (queue, _) = queue();
        let orphan = queue.push("q", "t", &json!({}), 0).await.unwrap();
        let live = queue.push("q", "t", &json!({}), 1).await.unwrap();
        queue.jobs.delete(&orphan).await.unwrap();

        let job = queue.pop("q").await.unwrap().unwrap();
        assert_eq!(job.id, live);
        assert_eq!(queue.state_of("q", &orphan).await.unwrap(), None);
    }

    #[tokio::test]
    async fn malformed_records_are_dropped_on_pop() {
        let (queue, _) = queue();
        let id = queue.push("q", "t", &json!({}), 0).await.unwrap();
        queue
            .store
            .set_ex(&queue.jobs.key(&id), "garbage", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(queue.pop("q").await.unwrap().is_none());
        assert!(!queue.jobs.exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let (queue, _) = queue();
        queue.push("q", "t", &json!({}), 0).await.unwrap();
        let job = queue.pop("q").await.unwrap().unwrap();

        queue.complete(&job).await.unwrap();
        queue.complete(&job).await.unwrap();

        let stats = queue.stats("q").await.unwrap();
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.completed_total, 1);
        assert!(queue.get_job(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_schedules_retry_with_backoff() {
        let (queue, clock) = queue();
        queue
            .push("emails", "send_otp", &json!({"email": "a@example.com"}), 0)
            .await
            .unwrap();
        let job = queue.pop("emails").await.unwrap().unwrap();

        let outcome = queue.fail(&job, "smtp down").await.unwrap();
        let expected_at = add_duration(clock.now(), Duration::from_secs(120));
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                attempts: 1,
                retry_at: expected_at
            }
        );

        let stored = queue.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("smtp down"));
        assert_eq!(stored.last_attempt_at, Some(clock.now()));
        assert_eq!(
            queue.state_of("emails", &job.id).await.unwrap(),
            Some(JobState::Delayed)
        );
        assert_eq!(
            queue
                .score_in("emails", JobState::Delayed, &job.id)
                .await
                .unwrap(),
            Some(score_of(clock.now()) + 120.0)
        );
        assert_eq!(queue.size("emails").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fail_on_a_job_not_in_flight_changes_nothing() {
        let (queue, _) = queue();
        queue.push("q", "t", &json!({}), 0).await.unwrap();
        let job = queue.pop("q").await.unwrap().unwrap();
        queue.fail(&job, "first").await.unwrap();

        assert_eq!(
            queue.fail(&job, "late duplicate").await.unwrap(),
            FailOutcome::NotInFlight
        );
        assert_eq!(queue.get_job(&job.id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn custom_backoff_is_used_for_retries() {
        let (queue, clock) = queue();
        let queue = queue.with_backoff(BackoffStrategy::Fixed { seconds: 5 });
        queue.push("q", "t", &json!({}), 0).await.unwrap();
        let job = queue.pop("q").await.unwrap().unwrap();

        match queue.fail(&job, "boom").await.unwrap() {
            FailOutcome::Retrying { retry_at, .. } => {
                assert_eq!((retry_at - clock.now()).num_seconds(), 5)
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn promotion_uses_the_stored_priority() {
        let (queue, clock) = queue();
        let later = queue
            .push_delayed("q", "t", &json!({}), Duration::from_secs(30), 5)
            .await
            .unwrap();
        let urgent = queue
            .push_delayed("q", "t", &json!({}), Duration::from_secs(60), -5)
            .await
            .unwrap();

        clock.advance(Duration::from_secs(60));
        assert_eq!(queue.promote_due("q").await.unwrap(), 2);
        assert_eq!(queue.size("q").await.unwrap(), 2);
        assert_eq!(queue.pop("q").await.unwrap().unwrap().id, urgent);
        assert_eq!(queue.pop("q").await.unwrap().unwrap().id, later);
    }

    #[tokio::test]
    async fn clear_empties_every_index() {
        let (queue, _) = queue();
        queue.push("q", "t", &json!({}), 0).await.unwrap();
        queue.push("q", "t", &json!({}), 0).await.unwrap();
        queue
            .push_delayed("q", "t", &json!({}), Duration::from_secs(10), 0)
            .await
            .unwrap();
        let job = queue.pop("q").await.unwrap().unwrap();
        queue.clear("q").await.unwrap();

        let stats = queue.stats("q").await.unwrap();
        assert_eq!((stats.ready, stats.delayed, stats.processing, stats.dead_letter), (0, 0, 0, 0));
        assert_eq!(queue.state_of("q", &job.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn dead_letters_can_be_requeued() {
        let (queue, _) = queue();
        let id = queue
            .push_with("q", "t", &json!({}), PushOptions::default().max_attempts(1))
            .await
            .unwrap();
        let job = queue.pop("q").await.unwrap().unwrap();
        assert_eq!(
            queue.fail(&job, "fatal").await.unwrap(),
            FailOutcome::DeadLettered { attempts: 1 }
        );
        assert_eq!(queue.dead_letters("q").await.unwrap().len(), 1);

        assert!(queue.retry_dead_letter("q", &id).await.unwrap());
        assert!(!queue.retry_dead_letter("q", &id).await.unwrap());
        let again = queue.pop("q").await.unwrap().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 0);
    }

    #[tokio::test]
    async fn dead_letters_expire_with_their_records() {
        let (queue, clock) = queue();
        let id = queue
            .push_with("q", "t", &json!({}), PushOptions::default().max_attempts(1))
            .await
            .unwrap();
        let job = queue.pop("q").await.unwrap().unwrap();
        queue.fail(&job, "fatal").await.unwrap();

        clock.advance(Duration::from_secs(7 * 24 * 60 * 60 - 1));
        assert_eq!(queue.stats("q").await.unwrap().dead_letter, 1);
        assert_eq!(queue.dead_letters("q").await.unwrap().len(), 1);

        clock.advance(Duration::from_secs(2));
        assert!(queue.get_job(&id).await.unwrap().is_none());
        assert_eq!(queue.stats("q").await.unwrap().dead_letter, 0);
        assert!(queue.dead_letters("q").await.unwrap().is_empty());
        assert_eq!(queue.state_of("q", &id).await.unwrap(), None);
        assert_eq!(queue.prune_dead_letters("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn complete_ignores_jobs_no_longer_in_flight() {
        let (queue, _) = queue();
        queue.push("q", "t", &json!({}), 0).await.unwrap();
        let job = queue.pop("q").await.unwrap().unwrap();
        queue.fail(&job, "boom").await.unwrap();

        queue.complete(&job).await.unwrap();
        assert!(queue.get_job(&job.id).await.unwrap().is_some());
        assert_eq!(
            queue.state_of("q", &job.id).await.unwrap(),
            Some(JobState::Delayed)
        );
        assert_eq!(queue.stats("q").await.unwrap().completed_total, 0);
    }

    #[tokio::test]
    async fn priorities_beyond_exact_float_range_are_rejected() {
        let (queue, _) = queue();
        for priority in [i64::MAX, i64::MIN, MAX_PRIORITY + 1] {
            let err = queue.push("q", "t", &json!({}), priority).await.unwrap_err();
            assert!(matches!(err, PressqError::MalformedJob(_)), "{priority}");
        }
        assert_eq!(queue.size("q").await.unwrap(), 0);

        let edge = queue.push("q", "t", &json!({}), MAX_PRIORITY).await.unwrap();
        let below = queue.push("q", "t", &json!({}), MAX_PRIORITY - 1).await.unwrap();
        assert_eq!(queue.pop("q").await.unwrap().unwrap().id, below);
        assert_eq!(queue.pop("q").await.unwrap().unwrap().id, edge);
    }

    #[tokio::test]
    async fn options_from_env() {
        let options = QueueOptions::from_lookup(|name| match name {
            "PRESSQ_KEY_PREFIX" => Some("wp".to_string()),
            "PRESSQ_VISIBILITY_TIMEOUT_SECS" => Some("60".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(options.key_prefix, "wp");
        assert_eq!(options.visibility_timeout, Duration::from_secs(60));
        assert_eq!(options.default_max_attempts, 3);

        let err = QueueOptions::from_lookup(|name| {
            (name == "PRESSQ_MAX_ATTEMPTS").then(|| "0".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, PressqError::Config(_)));
    }

    #[tokio::test]
    async fn unhandled_policy_overrides_per_queue() {
        let options = QueueOptions::default().with_unhandled_policy("logs", UnhandledPolicy::Fail);
        assert_eq!(options.unhandled_policy_for("logs"), UnhandledPolicy::Fail);
        assert_eq!(options.unhandled_policy_for("emails"), UnhandledPolicy::Complete);
    }
}
