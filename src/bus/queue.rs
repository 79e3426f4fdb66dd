//! # Rate-limited delivery queue
//!
//! FIFO queue feeding the bus workers. Failed deliveries come back through
//! [`DeliveryQueue::add_rate_limited`], which delays the item by the larger of
//! two limits:
//!
//! - a per-item exponential backoff (`base × 2^failures`, capped at `max`)
//! - a global token bucket (`qps` sustained, `burst` ceiling) shared by all retries
//!
//! Deferred items wait in their own set ordered by deadline. Ready items keep
//! flowing while a retry waits; once its deadline passes, a retry is handed out
//! ahead of the ready items. The queue itself makes no ordering promise between
//! a retry and the items behind it; the bus does that per subscriber.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// Exponential per-item backoff.
#[derive(Debug, Clone, Copy)]
pub struct ItemBackoff {
    /// Delay after the first failure.
    pub base: Duration,
    /// Cap for any single delay.
    pub max: Duration,
}

impl ItemBackoff {
    /// Delay for an item that has already failed `failures` times.
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = i32::try_from(failures).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * 2f64.powi(exp);
        if !secs.is_finite() || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Token bucket limiting the overall retry rate.
#[derive(Debug)]
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            tokens: burst,
            last: Instant::now(),
        }
    }

    /// Takes one token, returning how long the caller must wait for it.
    ///
    /// Tokens may go negative; the debt is what later callers wait out.
    pub fn reserve(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        self.tokens -= 1.0;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}

/// Per-item backoff combined with a global token bucket; the longer delay wins.
#[derive(Debug)]
pub struct RateLimiter {
    backoff: ItemBackoff,
    bucket: TokenBucket,
    failures: HashMap<Uuid, u32>,
}

impl RateLimiter {
    pub fn new(backoff: ItemBackoff, bucket: TokenBucket) -> Self {
        Self {
            backoff,
            bucket,
            failures: HashMap::new(),
        }
    }

    /// Records one more failure for `id` and returns how long to hold it back.
    pub fn when(&mut self, id: Uuid, now: Instant) -> Duration {
        let failures = self.failures.entry(id).or_insert(0);
        let item_delay = self.backoff.delay(*failures);
        *failures = failures.saturating_add(1);

        item_delay.max(self.bucket.reserve(now))
    }

    pub fn num_requeues(&self, id: Uuid) -> u32 {
        self.failures.get(&id).copied().unwrap_or(0)
    }

    pub fn forget(&mut self, id: Uuid) {
        self.failures.remove(&id);
    }
}

struct QueueState<T> {
    ready: VecDeque<(Uuid, T)>,
    /// Keyed by deadline, then by insertion order among equal deadlines
    deferred: BTreeMap<(Instant, u64), (Uuid, T)>,
    deferrals: u64,
    shutting_down: bool,
}

impl<T> QueueState<T> {
    fn pop_due(&mut self, now: Instant) -> Option<(Uuid, T)> {
        let entry = self.deferred.first_entry()?;
        if entry.key().0 > now {
            return None;
        }
        Some(entry.remove())
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deferred.keys().next().map(|(at, _)| *at)
    }
}

/// The queue itself. All locks are synchronous and never held across an await.
pub struct DeliveryQueue<T> {
    state: Mutex<QueueState<T>>,
    limiter: Mutex<RateLimiter>,
    notify: Notify,
}

impl<T> DeliveryQueue<T> {
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                deferred: BTreeMap::new(),
                deferrals: 0,
                shutting_down: false,
            }),
            limiter: Mutex::new(limiter),
            notify: Notify::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_limiter(&self) -> MutexGuard<'_, RateLimiter> {
        self.limiter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an item. Returns `false` once the queue is shutting down.
    pub fn add(&self, id: Uuid, item: T) -> bool {
        {
            let mut state = self.lock_state();
            if state.shutting_down {
                return false;
            }
            state.ready.push_back((id, item));
        }
        self.notify.notify_waiters();
        true
    }

    /// Defers a failed item until the rate limiter lets it go.
    /// Returns `false` once the queue is shutting down; the item is dropped.
    pub fn add_rate_limited(&self, id: Uuid, item: T) -> bool {
        let now = Instant::now();
        let delay = self.lock_limiter().when(id, now);
        {
            let mut state = self.lock_state();
            if state.shutting_down {
                return false;
            }
            let order = state.deferrals;
            state.deferrals = state.deferrals.wrapping_add(1);
            state.deferred.insert((now + delay, order), (id, item));
        }
        self.notify.notify_waiters();
        true
    }

    pub fn num_requeues(&self, id: Uuid) -> u32 {
        self.lock_limiter().num_requeues(id)
    }

    /// Clears the failure history of a delivered or abandoned item.
    pub fn forget(&self, id: Uuid) {
        self.lock_limiter().forget(id);
    }

    /// Waits for the next item: a retry whose deadline has passed, otherwise
    /// the oldest ready item.
    ///
    /// After [`shut_down`](Self::shut_down) the remaining ready items are still
    /// handed out, deferred retries are discarded, and `None` marks the end.
    pub async fn get(&self) -> Option<(Uuid, T)> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock_state();
                if let Some(due) = state.pop_due(Instant::now()) {
                    return Some(due);
                }
                if let Some(ready) = state.ready.pop_front() {
                    return Some(ready);
                }
                if state.shutting_down {
                    return None;
                }
                state.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Stops accepting items and discards deferred retries.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock_state();
            state.shutting_down = true;
            state.deferred.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock_state().shutting_down
    }

    /// Ready and deferred items together.
    pub fn len(&self) -> usize {
        let state = self.lock_state();
        state.ready.len() + state.deferred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
