// src/backoff.rs
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry decisions taken by the queue when a job fails.
pub trait BackoffPolicy: Send + Sync + std::fmt::Debug {
    /// Delay before the next attempt, given the attempts made so far.
    fn delay(&self, attempts: u32) -> Duration;

    /// Whether a job that has failed `attempts` times is done retrying.
    fn is_terminal(&self, attempts: u32, max_attempts: u32) -> bool {
        attempts >= max_attempts
    }
}

/// Backoff strategies for job retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed {
        seconds: u64,
    },
    /// `factor^attempts * base_secs`, optionally capped.
    Exponential {
        base_secs: u64,
        factor: u64,
        cap_secs: Option<u64>,
    },
    Linear {
        increment_secs: u64,
        cap_secs: Option<u64>,
    },
    /// Exponential delay stretched by a random factor in `[1, 2)`.
    ExponentialJitter {
        base_secs: u64,
        factor: u64,
        cap_secs: Option<u64>,
    },
}

impl BackoffStrategy {
    fn exponential_secs(base_secs: u64, factor: u64, attempts: u32, cap: Option<u64>) -> u64 {
        let secs = factor.saturating_pow(attempts).saturating_mul(base_secs);
        cap.map_or(secs, |cap| secs.min(cap))
    }
}

impl BackoffPolicy for BackoffStrategy {
    fn delay(&self, attempts: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed { seconds } => Duration::from_secs(*seconds),
            BackoffStrategy::Exponential {
                base_secs,
                factor,
                cap_secs,
            } => Duration::from_secs(Self::exponential_secs(
                *base_secs, *factor, attempts, *cap_secs,
            )),
            BackoffStrategy::Linear {
                increment_secs,
                cap_secs,
            } => {
                let secs = increment_secs.saturating_mul(attempts as u64);
                Duration::from_secs(cap_secs.map_or(secs, |cap| secs.min(cap)))
            }
            BackoffStrategy::ExponentialJitter {
                base_secs,
                factor,
                cap_secs,
            } => {
                let secs = Self::exponential_secs(*base_secs, *factor, attempts, *cap_secs);
                let stretch: f64 = rand::rng().random_range(1.0..2.0);
                let jittered =
                    Duration::try_from_secs_f64(secs as f64 * stretch).unwrap_or(Duration::MAX);
                match cap_secs {
                    Some(cap) => jittered.min(Duration::from_secs(*cap)),
                    None => jittered,
                }
            }
        }
    }
}

impl Default for BackoffStrategy {
    /// 2 minutes after the first failure, then 4, 8, ...
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base_secs: 60,
            factor: 2,
            cap_secs: None,
        }
    }
}

/// Convenience type alias
pub type Backoff = BackoffStrategy;
