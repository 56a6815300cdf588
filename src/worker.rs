// src/worker.rs
use crate::{AppContext, Drainer, JobRegistry, PressqError, Queue, Reaper, Result};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::{
    task::JoinHandle,
    time::{Duration, MissedTickBehavior, interval, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queues drained on every pass, in order, each with its per-pass limit.
    pub queues: Vec<(String, usize)>,
    /// Pause after each job within a pass.
    pub pace_delay: Duration,
    pub drain_interval: Duration,
    pub reap_interval: Duration,
    pub worker_id: String,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            pace_delay: Duration::from_millis(10),
            drain_interval: Duration::from_secs(60),
            reap_interval: Duration::from_secs(30),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Worker builder for fluent configuration
pub struct WorkerBuilder {
    config: WorkerConfig,
    queue: Arc<Queue>,
    registry: JobRegistry,
    app_context: Option<Arc<dyn AppContext>>,
}

impl WorkerBuilder {
    pub fn new(queue: Arc<Queue>, registry: JobRegistry) -> Self {
        Self {
            config: WorkerConfig::default(),
            queue,
            registry,
            app_context: None,
        }
    }

    /// Drain `name` on every pass, at most `limit` jobs at a time.
    pub fn with_queue(mut self, name: impl Into<String>, limit: usize) -> Self {
        self.config.queues.push((name.into(), limit));
        self
    }

    pub fn with_app_context(mut self, ctx: Arc<dyn AppContext>) -> Self {
        self.app_context = Some(ctx);
        self
    }

    pub fn with_pace_delay(mut self, delay: Duration) -> Self {
        self.config.pace_delay = delay;
        self
    }

    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.config.drain_interval = interval;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.config.reap_interval = interval;
        self
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.config.worker_id = id.into();
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Worker> {
        if self.config.queues.is_empty() {
            return Err(PressqError::Config("worker has no queues to drain".to_string()));
        }
        if self.config.drain_interval.is_zero() || self.config.reap_interval.is_zero() {
            return Err(PressqError::Config(
                "worker intervals must be greater than zero".to_string(),
            ));
        }

        let mut drainer = Drainer::new(Arc::clone(&self.queue), Arc::new(self.registry));
        if let Some(ctx) = self.app_context {
            drainer = drainer.with_app_context(ctx);
        }
        Ok(Worker {
            config: self.config,
            drainer: Arc::new(drainer),
            reaper: Arc::new(Reaper::new(self.queue)),
            handles: Vec::new(),
            shutdown: CancellationToken::new(),
            totals: Arc::new(Totals::default()),
        })
    }
}

#[derive(Debug, Default)]
struct Totals {
    passes: AtomicU64,
    processed: AtomicU64,
    reaped: AtomicU64,
}

/// Drives periodic drain passes and reaper sweeps over the configured queues.
pub struct Worker {
    config: WorkerConfig,
    drainer: Arc<Drainer>,
    reaper: Arc<Reaper>,
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
    totals: Arc<Totals>,
}

impl Worker {
    /// Spawn the drain and reaper loops and return immediately.
    pub fn start(&mut self) {
        if !self.handles.is_empty() {
            warn!(worker_id = %self.config.worker_id, "worker already started");
            return;
        }
        info!(
            worker_id = %self.config.worker_id,
            queues = self.config.queues.len(),
            "starting worker"
        );
        let drain = self.spawn_drain_loop();
        self.handles.push(drain);
        let reap = self.spawn_reaper_loop();
        self.handles.push(reap);
    }

    /// Start, run until SIGTERM/CTRL+C or [`Worker::shutdown_token`] fires,
    /// then shut down gracefully.
    pub async fn run(mut self) -> Result<()> {
        self.start();

        let token = self.shutdown.clone();
        tokio::select! {
            _ = wait_for_shutdown_signal() => {
                info!(worker_id = %self.config.worker_id, "shutdown signal received");
            }
            _ = token.cancelled() => {}
        }

        self.stop().await;
        Ok(())
    }

    /// Token that stops the worker when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop scheduling passes and wait up to the shutdown timeout for the
    /// current one to finish. Jobs still running after that are abandoned to
    /// the reaper.
    pub async fn stop(&mut self) {
        info!(worker_id = %self.config.worker_id, "stopping worker");
        self.shutdown.cancel();

        let handles: Vec<_> = self.handles.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let joined = timeout(self.config.shutdown_timeout, async {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await;

        if joined.is_err() {
            warn!(
                worker_id = %self.config.worker_id,
                "shutdown timeout reached; aborting the running pass"
            );
            for abort in aborts {
                abort.abort();
            }
        }
        info!(worker_id = %self.config.worker_id, "worker stopped");
    }

    fn spawn_drain_loop(&self) -> JoinHandle<()> {
        let drainer = Arc::clone(&self.drainer);
        let queues = self.config.queues.clone();
        let pace_delay = self.config.pace_delay;
        let every = self.config.drain_interval;
        let shutdown = self.shutdown.clone();
        let totals = Arc::clone(&self.totals);

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match drainer.drain_all(&queues, pace_delay).await {
                    Ok(reports) => {
                        let processed: usize = reports.iter().map(|(_, r)| r.processed).sum();
                        totals.passes.fetch_add(1, Ordering::Relaxed);
                        totals.processed.fetch_add(processed as u64, Ordering::Relaxed);
                    }
                    Err(e) => error!(error = %e, "drain pass failed"),
                }
            }

            info!("drain loop terminated");
        })
    }

    fn spawn_reaper_loop(&self) -> JoinHandle<()> {
        let reaper = Arc::clone(&self.reaper);
        let queues: Vec<String> = self.config.queues.iter().map(|(q, _)| q.clone()).collect();
        let every = self.config.reap_interval;
        let shutdown = self.shutdown.clone();
        let totals = Arc::clone(&self.totals);

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                for queue in &queues {
                    match reaper.reap(queue).await {
                        Ok(n) => {
                            totals.reaped.fetch_add(n as u64, Ordering::Relaxed);
                        }
                        Err(e) => error!(queue = %queue, error = %e, "reaper sweep failed"),
                    }
                }
            }

            info!("reaper loop terminated");
        })
    }

    /// Get worker statistics
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            worker_id: self.config.worker_id.clone(),
            queues: self.config.queues.iter().map(|(q, _)| q.clone()).collect(),
            is_shutting_down: self.shutdown.is_cancelled(),
            passes: self.totals.passes.load(Ordering::Relaxed),
            processed: self.totals.processed.load(Ordering::Relaxed),
            reaped: self.totals.reaped.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("running", &!self.handles.is_empty())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub worker_id: String,
    pub queues: Vec<String>,
    pub is_shutting_down: bool,
    /// Completed drain passes.
    pub passes: u64,
    pub processed: u64,
    pub reaped: u64,
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = sigterm.recv() => info!("SIGTERM received"),
                _ = ctrl_c() => info!("CTRL+C received"),
            },
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c().await;
                info!("CTRL+C received");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c().await;
        info!("CTRL+C received");
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // Without a handler only the shutdown token can stop the worker.
        warn!(error = %e, "cannot install CTRL+C handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ManualClock, QueueOptions};
    use serde_json::json;

    fn queue() -> (Arc<Queue>, ManualClock) {
        let clock = ManualClock::starting_now();
        let queue = Queue::in_memory(Arc::new(clock.clone()), QueueOptions::default());
        (Arc::new(queue), clock)
    }

    fn registry() -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry.register_fn("send_otp", |_, _| async { Ok::<_, PressqError>(()) });
        registry
    }

    async fn wait_until(worker: &Worker, done: impl Fn(&WorkerStats) -> bool) {
        for _ in 0..200 {
            if done(&worker.stats()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker never reached the expected state: {:?}", worker.stats());
    }

    #[test]
    fn builder_requires_a_queue() {
        let (queue, _) = queue();
        let err = WorkerBuilder::new(queue, registry()).build().unwrap_err();
        assert!(matches!(err, PressqError::Config(_)));
    }

    #[tokio::test]
    async fn drains_configured_queues_until_stopped() {
        let (queue, _) = queue();
        for _ in 0..3 {
            queue.push("emails", "send_otp", &json!({}), 0).await.unwrap();
        }

        let mut worker = WorkerBuilder::new(Arc::clone(&queue), registry())
            .with_queue("emails", 10)
            .with_pace_delay(Duration::ZERO)
            .with_drain_interval(Duration::from_millis(10))
            .with_worker_id("test-worker")
            .build()
            .unwrap();
        worker.start();
        wait_until(&worker, |s| s.processed == 3).await;

        worker.stop().await;
        let stats = worker.stats();
        assert!(stats.is_shutting_down);
        assert_eq!(stats.worker_id, "test-worker");
        assert_eq!(queue.stats("emails").await.unwrap().completed_total, 3);
    }

    #[tokio::test]
    async fn reaps_stalled_jobs_in_the_background() {
        let (queue, clock) = queue();
        queue.push("emails", "send_otp", &json!({}), 0).await.unwrap();
        let stalled = queue.pop("emails").await.unwrap().unwrap();
        clock.advance(Duration::from_secs(301));

        let mut worker = WorkerBuilder::new(Arc::clone(&queue), registry())
            .with_queue("emails", 10)
            .with_reap_interval(Duration::from_millis(10))
            .build()
            .unwrap();
        worker.start();
        wait_until(&worker, |s| s.reaped == 1).await;
        worker.stop().await;

        let job = queue.get_job(&stalled.id).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn run_returns_once_the_token_is_cancelled() {
        let (queue, _) = queue();
        let worker = WorkerBuilder::new(queue, registry())
            .with_queue("emails", 10)
            .with_drain_interval(Duration::from_millis(10))
            .build()
            .unwrap();
        let token = worker.shutdown_token();

        let running = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
