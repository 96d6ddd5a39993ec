use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use chrono::{DateTime, Utc};

/// Global "LLM quota exhausted" flag.
///
/// Set when the provider reports a billing/quota failure; while set, the
/// gateway refuses classification so every message is deferred instead of
/// burning requests. Cleared by a successful probe.
#[derive(Default)]
pub struct QuotaFlag {
    exhausted: AtomicBool,
    since: Mutex<Option<DateTime<Utc>>>,
}

impl QuotaFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    /// Set the flag. Returns `true` only on the transition, so callers can
    /// alert once instead of on every failed request.
    pub fn set(&self) -> bool {
        let was = self.exhausted.swap(true, Ordering::SeqCst);
        if !was {
            if let Ok(mut since) = self.since.lock() {
                *since = Some(Utc::now());
            }
        }
        !was
    }

    /// Clear the flag. Returns `true` only on the transition.
    pub fn clear(&self) -> bool {
        let was = self.exhausted.swap(false, Ordering::SeqCst);
        if was {
            if let Ok(mut since) = self.since.lock() {
                *since = None;
            }
        }
        was
    }

    pub fn exhausted_since(&self) -> Option<DateTime<Utc>> {
        self.since.lock().ok().and_then(|g| *g)
    }
}
