// src/lib.rs
//! pressq: a Redis-backed priority job queue.
//!
//! Producers push JSON payloads tagged with a job type onto named queues.
//! Consumers register handlers per type and drain the queues; failed jobs are
//! retried with backoff and dead-lettered once they run out of attempts.
//!
//! ```no_run
//! use pressq::{Drainer, JobRegistry, Queue, QueueOptions, RedisConfig};
//! use std::{sync::Arc, time::Duration};
//!
//! # async fn run() -> pressq::Result<()> {
//! let queue = Arc::new(Queue::connect(&RedisConfig::from_env()?, QueueOptions::from_env()?).await?);
//! queue.push("emails", "send_otp", &serde_json::json!({"email": "a@example.com"}), 0).await?;
//!
//! let mut registry = JobRegistry::new();
//! registry.register_fn("send_otp", |payload, _ctx| async move {
//!     println!("sending otp to {}", payload["email"]);
//!     Ok::<_, pressq::PressqError>(())
//! });
//! let drainer = Drainer::new(queue, Arc::new(registry));
//! drainer.drain("emails", 10, Duration::from_millis(10)).await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod clock;
pub mod config;
pub mod context;
pub mod drain;
pub mod error;
pub mod job;
pub mod job_store;
pub mod lua;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod store;
pub mod worker;

pub use backoff::{Backoff, BackoffPolicy, BackoffStrategy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RedisConfig;
pub use context::{AppContext, JobContext};
pub use drain::{DrainReport, Drainer};
pub use error::{PressqError, Result};
pub use job::{Job, JobId, JobRecord, JobState, MAX_PRIORITY, PushOptions};
pub use queue::{FailOutcome, Queue, QueueOptions, QueueStats, UnhandledPolicy};
pub use reaper::Reaper;
pub use registry::{DispatchOutcome, JobHandler, JobRegistry};
pub use store::{MemoryStore, RedisStore, Store};
pub use worker::{Worker, WorkerBuilder, WorkerConfig, WorkerStats};

// Re-export commonly used types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
