//! Time abstractions
//!
//! All expiry and rate-limit logic in the crate reads time through the
//! [`Clock`] trait so tests can drive it deterministically without sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

/// Millisecond wall-clock source.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// Clock backed by the system time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually-advanced clock for tests.
#[derive(Debug, Default)]
pub struct TestClock {
    millis: AtomicI64,
}

impl TestClock {
    pub fn new(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Formats epoch milliseconds as an ISO 8601 timestamp without a zone suffix,
/// the format the contact API expects for mutation timestamps.
pub fn iso_timestamp(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string()
}

/// A single value with an expiry deadline, checked against an injected clock.
pub struct CachedValue<T> {
    clock: Arc<dyn Clock>,
    entry: Mutex<Option<(T, i64)>>,
}

impl<T: Clone> CachedValue<T> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entry: Mutex::new(None),
        }
    }

    /// Stores a value that expires `lifetime_ms` from now.
    pub fn set(&self, value: T, lifetime_ms: i64) {
        let expiry = self.clock.now_millis() + lifetime_ms;
        *self.entry.lock().unwrap() = Some((value, expiry));
    }

    /// Returns the value if it has not expired.
    pub fn get(&self) -> Option<T> {
        let guard = self.entry.lock().unwrap();
        match guard.as_ref() {
            Some((value, expiry)) if self.clock.now_millis() < *expiry => Some(value.clone()),
            _ => None,
        }
    }

    pub fn invalidate(&self) {
        *self.entry.lock().unwrap() = None;
    }
}
