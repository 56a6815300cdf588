// src/store/memory.rs
use super::Store;
use crate::{Clock, PressqError, Result, SystemClock};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// In-process [`Store`] with the same semantics as the Redis one.
///
/// Every operation runs under a single lock, which gives pop-min and member
/// moves the same indivisibility Redis provides. Key expiry is judged against
/// the injected [`Clock`], so a [`crate::ManualClock`] can expire records.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    changed: Arc<Notify>,
    clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Entry>,
    sets: HashMap<String, SortedSet>,
}

struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    order: BTreeSet<Scored>,
}

#[derive(Debug, Clone)]
struct Scored {
    score: f64,
    member: String,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| self.member.cmp(&other.member))
    }
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.order.remove(&Scored {
                score: old,
                member: member.to_string(),
            });
        }
        self.order.insert(Scored {
            score,
            member: member.to_string(),
        });
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.order.remove(&Scored {
                    score,
                    member: member.to_string(),
                });
                true
            }
            None => false,
        }
    }

    fn pop_min(&mut self) -> Option<(String, f64)> {
        let first = self.order.pop_first()?;
        self.scores.remove(&first.member);
        Some((first.member, first.score))
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

impl Inner {
    fn live_value(&mut self, key: &str, now: DateTime<Utc>) -> Option<&Entry> {
        let expired = self
            .values
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.values.remove(key);
        }
        self.values.get(key)
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.sets.get(key).is_some_and(SortedSet::is_empty) {
            self.sets.remove(key);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            changed: Arc::new(Notify::new()),
            clock,
        }
    }

    /// Remaining time to live of a plain key, if it has one.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let expires_at = inner.live_value(key, now)?.expires_at?;
        (expires_at - now).to_std().ok()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = crate::clock::add_duration(self.clock.now(), ttl);
        let mut inner = self.inner.lock().await;
        inner.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        Ok(inner.live_value(key, now).map(|entry| entry.value.clone()))
    }

    async fn del(&self, keys: &[String]) -> Result<usize> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let mut removed = 0;
        for key in keys {
            let had_value = inner.live_value(key, now).is_some();
            inner.values.remove(key);
            let had_set = inner.sets.remove(key).is_some();
            if had_value || had_set {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        Ok(inner.live_value(key, now).is_some() || inner.sets.contains_key(key))
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let (current, expires_at) = match inner.live_value(key, now) {
            Some(entry) => {
                let current = entry.value.parse::<i64>().map_err(|_| {
                    PressqError::StoreUnavailable(format!("value at {key} is not an integer"))
                })?;
                (current, entry.expires_at)
            }
            None => (0, None),
        };
        let next = current.checked_add(delta).ok_or_else(|| {
            PressqError::StoreUnavailable(format!("increment at {key} would overflow"))
        })?;
        inner.values.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        if score.is_nan() {
            return Err(PressqError::StoreUnavailable(
                "score is not a valid float".to_string(),
            ));
        }
        {
            let mut inner = self.inner.lock().await;
            inner
                .sets
                .entry(key.to_string())
                .or_default()
                .insert(member, score);
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<(String, f64)>> {
        let mut inner = self.inner.lock().await;
        let popped = inner.sets.get_mut(key).and_then(SortedSet::pop_min);
        inner.drop_if_empty(key);
        Ok(popped)
    }

    async fn bzpopmin(&self, key: &str, timeout: Duration) -> Result<Option<(String, f64)>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking so a zadd between the check
            // and the wait still wakes us.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(hit) = self.zpopmin(key).await? {
                return Ok(Some(hit));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sets
            .get(key)
            .map(|set| {
                set.order
                    .iter()
                    .filter(|s| s.score >= min && s.score <= max)
                    .map(|s| s.member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn zrange_withscores(&self, key: &str) -> Result<Vec<(String, f64)>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sets
            .get(key)
            .map(|set| {
                set.order
                    .iter()
                    .map(|s| (s.member.clone(), s.score))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let removed = inner
            .sets
            .get_mut(key)
            .is_some_and(|set| set.remove(member));
        inner.drop_if_empty(key);
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let inner = self.inner.lock().await;
        Ok(inner.sets.get(key).map_or(0, |set| set.scores.len()))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sets
            .get(key)
            .and_then(|set| set.scores.get(member).copied()))
    }

    async fn zmove(&self, src: &str, dst: &str, member: &str, score: f64) -> Result<bool> {
        let moved = {
            let mut inner = self.inner.lock().await;
            let removed = inner
                .sets
                .get_mut(src)
                .is_some_and(|set| set.remove(member));
            inner.drop_if_empty(src);
            if removed {
                inner
                    .sets
                    .entry(dst.to_string())
                    .or_default()
                    .insert(member, score);
            }
            removed
        };
        if moved {
            self.changed.notify_waiters();
        }
        Ok(moved)
    }
}
