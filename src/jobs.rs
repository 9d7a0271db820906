//! Background job contracts
//!
//! The engine never runs its own worker threads; it describes work as
//! [`JobInfo`] values and hands them to a [`JobDispatcher`]. The bundled
//! [`LocalJobDispatcher`] gives embedders a ready-made in-process queue with
//! conflict coalescing and per-key rate limits; platform schedulers can
//! implement the trait instead.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::clock::Clock;

/// Outcome of a performed job, reported back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResult {
    /// The job finished; nothing to redo.
    Success,
    /// Transient failure; the scheduler should retry with backoff.
    Retry,
}

/// How a newly dispatched job interacts with an already-queued job for the
/// same action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// Keep the queued job; drop the new dispatch.
    Keep,
    /// Replace the queued job with the new dispatch.
    Replace,
}

/// A unit of background work.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub action: String,
    pub conflict_strategy: ConflictStrategy,
    pub rate_limit_keys: Vec<String>,
    pub network_required: bool,
}

impl JobInfo {
    pub fn builder(action: impl Into<String>) -> JobInfoBuilder {
        JobInfoBuilder {
            action: action.into(),
            conflict_strategy: ConflictStrategy::Keep,
            rate_limit_keys: Vec::new(),
            network_required: false,
        }
    }
}

/// Builder for JobInfo
#[derive(Debug)]
pub struct JobInfoBuilder {
    action: String,
    conflict_strategy: ConflictStrategy,
    rate_limit_keys: Vec<String>,
    network_required: bool,
}

impl JobInfoBuilder {
    pub fn conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn rate_limit(mut self, key: impl Into<String>) -> Self {
        self.rate_limit_keys.push(key.into());
        self
    }

    pub fn network_required(mut self, required: bool) -> Self {
        self.network_required = required;
        self
    }

    pub fn build(self) -> JobInfo {
        JobInfo {
            action: self.action,
            conflict_strategy: self.conflict_strategy,
            rate_limit_keys: self.rate_limit_keys,
            network_required: self.network_required,
        }
    }
}

/// Scheduler boundary consumed by the engine.
pub trait JobDispatcher: Send + Sync {
    /// Queues a job, applying its conflict strategy against any queued job
    /// with the same action.
    fn dispatch(&self, job: JobInfo);

    /// Registers a rate limit: at most `max` dispatches per `window`.
    fn set_rate_limit(&self, key: &str, max: u32, window: Duration);
}

struct RateLimit {
    max: u32,
    window_ms: i64,
    hits: VecDeque<i64>,
}

/// Sliding-window rate limiter keyed by string, driven by an injected clock.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    limits: Mutex<HashMap<String, RateLimit>>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            limits: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_rate_limit(&self, key: &str, max: u32, window_ms: i64) {
        self.limits.lock().unwrap().insert(
            key.to_string(),
            RateLimit {
                max,
                window_ms,
                hits: VecDeque::new(),
            },
        );
    }

    /// Milliseconds until the key may fire again; 0 when it is allowed now.
    /// Unknown keys are never limited.
    pub fn next_available_ms(&self, key: &str) -> i64 {
        let now = self.clock.now_millis();
        let mut limits = self.limits.lock().unwrap();
        let limit = match limits.get_mut(key) {
            Some(limit) => limit,
            None => return 0,
        };

        while let Some(&oldest) = limit.hits.front() {
            if now - oldest >= limit.window_ms {
                limit.hits.pop_front();
            } else {
                break;
            }
        }

        if (limit.hits.len() as u32) < limit.max {
            0
        } else {
            match limit.hits.front() {
                Some(&oldest) => oldest + limit.window_ms - now,
                None => 0,
            }
        }
    }

    /// Records a dispatch against the key.
    pub fn track(&self, key: &str) {
        let now = self.clock.now_millis();
        if let Some(limit) = self.limits.lock().unwrap().get_mut(key) {
            limit.hits.push_back(now);
        }
    }
}

/// In-process job queue with at-most-one queued job per action.
///
/// Embedders drive it from a worker loop:
///
/// ```rust,no_run
/// # async fn example(dispatcher: std::sync::Arc<skysync::jobs::LocalJobDispatcher>) {
/// loop {
///     let job = dispatcher.next_job().await;
///     // perform the job, re-dispatch on JobResult::Retry
/// }
/// # }
/// ```
pub struct LocalJobDispatcher {
    limiter: RateLimiter,
    pending: Mutex<HashMap<String, JobInfo>>,
    notify: Notify,
}

impl LocalJobDispatcher {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            limiter: RateLimiter::new(clock),
            pending: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// Removes and returns a queued job whose rate limits allow it to run
    /// now, or `None` if nothing is runnable.
    pub fn try_next_job(&self) -> Option<JobInfo> {
        let mut pending = self.pending.lock().unwrap();
        let action = pending
            .values()
            .find(|job| {
                job.rate_limit_keys
                    .iter()
                    .all(|key| self.limiter.next_available_ms(key) == 0)
            })
            .map(|job| job.action.clone())?;

        let job = pending.remove(&action)?;
        for key in &job.rate_limit_keys {
            self.limiter.track(key);
        }
        Some(job)
    }

    /// Waits until a job is runnable under its rate limits, then removes and
    /// returns it.
    pub async fn next_job(&self) -> JobInfo {
        loop {
            if let Some(job) = self.try_next_job() {
                return job;
            }

            let wait_ms = self.min_wait_ms();
            match wait_ms {
                Some(wait_ms) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(wait_ms.max(1) as u64)) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Shortest rate-limit wait across queued jobs, or `None` when the queue
    /// is empty.
    fn min_wait_ms(&self) -> Option<i64> {
        let pending = self.pending.lock().unwrap();
        pending
            .values()
            .map(|job| {
                job.rate_limit_keys
                    .iter()
                    .map(|key| self.limiter.next_available_ms(key))
                    .max()
                    .unwrap_or(0)
            })
            .min()
    }
}

impl JobDispatcher for LocalJobDispatcher {
    fn dispatch(&self, job: JobInfo) {
        {
            let mut pending = self.pending.lock().unwrap();
            match job.conflict_strategy {
                ConflictStrategy::Keep => {
                    pending.entry(job.action.clone()).or_insert(job);
                }
                ConflictStrategy::Replace => {
                    pending.insert(job.action.clone(), job);
                }
            }
        }
        self.notify.notify_waiters();
    }

    fn set_rate_limit(&self, key: &str, max: u32, window: Duration) {
        self.limiter
            .set_rate_limit(key, max, window.as_millis() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    fn job(action: &str) -> JobInfo {
        JobInfo::builder(action)
            .rate_limit("limit")
            .network_required(true)
            .build()
    }

    #[test]
    fn test_rate_limiter_window() {
        let clock = Arc::new(TestClock::new(0));
        let limiter = RateLimiter::new(clock.clone());
        limiter.set_rate_limit("limit", 1, 5000);

        assert_eq!(limiter.next_available_ms("limit"), 0);
        limiter.track("limit");
        assert_eq!(limiter.next_available_ms("limit"), 5000);

        clock.advance(4999);
        assert_eq!(limiter.next_available_ms("limit"), 1);

        clock.advance(1);
        assert_eq!(limiter.next_available_ms("limit"), 0);
    }

    #[test]
    fn test_unknown_key_is_unlimited() {
        let limiter = RateLimiter::new(Arc::new(TestClock::new(0)));
        assert_eq!(limiter.next_available_ms("missing"), 0);
    }

    #[test]
    fn test_dispatch_keep_coalesces() {
        let clock = Arc::new(TestClock::new(0));
        let dispatcher = LocalJobDispatcher::new(clock);

        dispatcher.dispatch(job("update"));
        dispatcher.dispatch(job("update"));

        assert!(dispatcher.try_next_job().is_some());
        assert!(dispatcher.try_next_job().is_none());
    }

    #[test]
    fn test_rate_limited_job_deferred() {
        let clock = Arc::new(TestClock::new(0));
        let dispatcher = LocalJobDispatcher::new(clock.clone());
        dispatcher.set_rate_limit("limit", 1, Duration::from_millis(500));

        dispatcher.dispatch(job("update"));
        assert!(dispatcher.try_next_job().is_some());

        dispatcher.dispatch(job("update"));
        assert!(dispatcher.try_next_job().is_none());

        clock.advance(500);
        assert!(dispatcher.try_next_job().is_some());
    }
}
