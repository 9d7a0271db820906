//! Privacy manager
//!
//! Tracks which SDK features the application has enabled. Contact mutators
//! check these flags before queueing work; disabled features turn public
//! calls into logged no-ops.

use std::ops::BitOr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Bitmask of togglable SDK features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feature(u32);

impl Feature {
    pub const NONE: Feature = Feature(0);
    pub const CONTACTS: Feature = Feature(1);
    pub const TAGS_AND_ATTRIBUTES: Feature = Feature(1 << 1);
    pub const ALL: Feature = Feature(u32::MAX);
}

impl BitOr for Feature {
    type Output = Feature;

    fn bitor(self, rhs: Feature) -> Feature {
        Feature(self.0 | rhs.0)
    }
}

/// Tracks enabled features and notifies listeners on change.
pub struct PrivacyManager {
    enabled: AtomicU32,
    listeners: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl PrivacyManager {
    pub fn new(enabled: Feature) -> Self {
        Self {
            enabled: AtomicU32::new(enabled.0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Returns true when every bit of `features` is enabled.
    pub fn is_enabled(&self, features: Feature) -> bool {
        self.enabled.load(Ordering::SeqCst) & features.0 == features.0
    }

    pub fn enable(&self, features: Feature) {
        let previous = self.enabled.fetch_or(features.0, Ordering::SeqCst);
        if previous | features.0 != previous {
            self.notify_listeners();
        }
    }

    pub fn disable(&self, features: Feature) {
        let previous = self.enabled.fetch_and(!features.0, Ordering::SeqCst);
        if previous & !features.0 != previous {
            self.notify_listeners();
        }
    }

    pub fn set_enabled(&self, features: Feature) {
        let previous = self.enabled.swap(features.0, Ordering::SeqCst);
        if previous != features.0 {
            self.notify_listeners();
        }
    }

    /// Registers a callback fired whenever the enabled set changes.
    pub fn add_listener(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }

    fn notify_listeners(&self) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener();
        }
    }
}

impl Default for PrivacyManager {
    fn default() -> Self {
        Self::new(Feature::ALL)
    }
}
