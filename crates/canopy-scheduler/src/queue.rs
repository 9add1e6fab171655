//! Deduplicating, rate-limited work queue
//!
//! Semantics follow the controller work queue used by Kubernetes controllers:
//!
//! - A key added several times before a worker picks it up is processed once.
//! - A key is never handed to two workers at the same time. Adds that arrive
//!   while it is being processed are parked and re-queued by [`WorkQueue::done`].
//! - Failed keys come back through [`WorkQueue::add_rate_limited`], delayed
//!   by the larger of a per-key exponential backoff and a global token bucket.
//!   [`WorkQueue::forget`] clears the per-key backoff after a success.
//! - After [`WorkQueue::shutdown`] new adds are ignored and [`WorkQueue::get`]
//!   drains what is left before returning `None`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use canopy_common::metrics::{QUEUE_ADDS, QUEUE_DEPTH, QUEUE_RETRIES};
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Rate limiter tuning
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// First per-key retry delay
    pub base_delay: Duration,
    /// Ceiling for the per-key delay
    pub max_delay: Duration,
    /// Sustained retries per second across all keys
    pub qps: f64,
    /// Retries allowed in a burst before `qps` applies
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
        }
    }
}

/// Combined per-key exponential and global token-bucket limiter
struct RateLimiter<K> {
    config: RateLimiterConfig,
    failures: HashMap<K, u32>,
    tokens: f64,
    last: Instant,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    fn new(config: RateLimiterConfig) -> Self {
        let tokens = f64::from(config.burst);
        Self {
            config,
            failures: HashMap::new(),
            tokens,
            last: Instant::now(),
        }
    }

    /// Delay before `key` may be retried; records one more failure
    fn when(&mut self, key: &K) -> Duration {
        let exp = self.failures.entry(key.clone()).or_insert(0);
        let per_item = self
            .config
            .base_delay
            .checked_mul(2u32.saturating_pow(*exp))
            .map_or(self.config.max_delay, |d| d.min(self.config.max_delay));
        *exp = exp.saturating_add(1);

        per_item.max(self.reserve())
    }

    /// Take one token, returning how long until it is actually available
    fn reserve(&mut self) -> Duration {
        if self.config.qps <= 0.0 {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.config.qps).min(f64::from(self.config.burst));
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.config.qps)
        }
    }

    fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

/// A named work queue of keys of type `K`
pub struct WorkQueue<K> {
    name: &'static str,
    state: Mutex<QueueState<K>>,
    limiter: Mutex<RateLimiter<K>>,
    notify: Notify,
    shutdown: CancellationToken,
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create a queue with the given rate limiter settings
    pub fn new(name: &'static str, limiter: RateLimiterConfig) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            limiter: Mutex::new(RateLimiter::new(limiter)),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Queue name used in logs and metrics
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Mark `key` as needing processing
    pub fn add(&self, key: K) {
        let mut st = self.state.lock();
        if st.shutting_down || st.dirty.contains(&key) {
            return;
        }
        st.dirty.insert(key.clone());
        QUEUE_ADDS.add(1, &[KeyValue::new("queue", self.name)]);
        if st.processing.contains(&key) {
            return;
        }
        st.queue.push_back(key);
        QUEUE_DEPTH.record(st.queue.len() as u64, &[KeyValue::new("queue", self.name)]);
        drop(st);
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(queue) = queue.upgrade() {
                        queue.add(key);
                    }
                }
            }
        });
    }

    /// Re-add a failed key after its backoff
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = self.limiter.lock().when(&key);
        QUEUE_RETRIES.add(1, &[KeyValue::new("queue", self.name)]);
        self.add_after(key, delay);
    }

    /// Clear the backoff history of `key`
    pub fn forget(&self, key: &K) {
        self.limiter.lock().forget(key);
    }

    /// Number of failures recorded for `key` since it was last forgotten
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.lock().num_requeues(key)
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// True when no key is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next key; `None` once shut down and drained
    ///
    /// The caller must pass the key to [`WorkQueue::done`] when finished.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = self.state.lock();
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    QUEUE_DEPTH.record(st.queue.len() as u64, &[KeyValue::new("queue", self.name)]);
                    let more = !st.queue.is_empty();
                    drop(st);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Finish processing `key`, re-queueing it if it was added meanwhile
    pub fn done(&self, key: &K) {
        let mut st = self.state.lock();
        st.processing.remove(key);
        if st.dirty.contains(key) {
            st.queue.push_back(key.clone());
            drop(st);
            self.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    /// True after [`WorkQueue::shutdown`]
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue<String>> {
        WorkQueue::new("test", RateLimiterConfig::default())
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let q = queue();
        q.add("root|a".to_string());
        q.add("root|a".to_string());
        q.add("root|b".to_string());
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("root|a"));
        assert_eq!(q.get().await.as_deref(), Some("root|b"));
        assert!(q.is_empty());
    }

    /// Story: a key re-added while a worker holds it is not handed to a
    /// second worker; it comes back only after the first calls done().
    #[tokio::test]
    async fn story_key_is_never_processed_concurrently() {
        let q = queue();
        q.add("root|a".to_string());
        let key = q.get().await.unwrap();

        q.add(key.clone());
        assert_eq!(q.len(), 0, "re-add during processing must be parked");

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some(key));
    }

    #[tokio::test]
    async fn shutdown_drains_then_returns_none() {
        let q = queue();
        q.add("root|a".to_string());
        q.shutdown();
        q.add("root|ignored".to_string());

        assert_eq!(q.get().await.as_deref(), Some("root|a"));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn shutdown_wakes_idle_workers() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn waiting_worker_receives_new_key() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add("root|late".to_string());
        assert_eq!(waiter.await.unwrap().as_deref(), Some("root|late"));
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_delays_the_key() {
        let q = queue();
        q.add_after("root|a".to_string(), Duration::from_secs(5));
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn per_key_backoff_doubles_and_caps() {
        let mut limiter = RateLimiter::new(RateLimiterConfig {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(30),
            qps: 0.0,
            burst: 0,
        });
        let key = "root|a".to_string();
        let delays: Vec<_> = (0..5).map(|_| limiter.when(&key)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(30),
                Duration::from_millis(30),
            ]
        );
        assert_eq!(limiter.num_requeues(&key), 5);

        limiter.forget(&key);
        assert_eq!(limiter.num_requeues(&key), 0);
        assert_eq!(limiter.when(&key), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_limits_bursts() {
        let mut limiter = RateLimiter::new(RateLimiterConfig {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            qps: 10.0,
            burst: 2,
        });
        assert_eq!(limiter.when(&"a".to_string()), Duration::ZERO);
        assert_eq!(limiter.when(&"b".to_string()), Duration::ZERO);
        let third = limiter.when(&"c".to_string());
        assert!(third >= Duration::from_millis(99), "{third:?}");
    }

    #[tokio::test]
    async fn forget_resets_requeue_count() {
        let q = queue();
        let key = "root|a".to_string();
        q.add_rate_limited(key.clone());
        q.add_rate_limited(key.clone());
        assert_eq!(q.num_requeues(&key), 2);
        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);
        q.shutdown();
    }

    #[test]
    fn huge_failure_counts_saturate_at_ceiling() {
        let mut limiter = RateLimiter::new(RateLimiterConfig {
            qps: 0.0,
            ..Default::default()
        });
        limiter.failures.insert("k".to_string(), 200);
        assert_eq!(limiter.when(&"k".to_string()), Duration::from_secs(1000));
    }
}
