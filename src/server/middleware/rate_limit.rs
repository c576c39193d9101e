use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

/// Configuration changes one client may push per window.
pub const MAX_CONFIG_CHANGES_PER_WINDOW: usize = 15;
pub const CONFIG_WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window limiter for `config` messages, keyed per client.
///
/// Keeps the timestamps of recent accepted requests; rejected requests are
/// not recorded.
#[derive(Clone, Debug)]
pub struct ConfigRateLimiter {
    attempts: Arc<Mutex<HashMap<String, Vec<Instant>>>>,
    max_per_window: usize,
    window: Duration,
}

impl ConfigRateLimiter {
    /// Creates a limiter allowing `max_per_window` requests per `window` and key.
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            attempts: Arc::new(Mutex::new(HashMap::new())),
            max_per_window,
            window,
        }
    }

    /// Returns whether a request for `key` is allowed now, recording it if so.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let recent = attempts.entry(key.to_string()).or_default();
        recent.retain(|t| now.duration_since(*t) < self.window);

        if recent.len() >= self.max_per_window {
            return false;
        }
        recent.push(now);
        true
    }

    /// Drops the history of a client that went away.
    pub fn forget(&self, key: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

impl Default for ConfigRateLimiter {
    fn default() -> Self {
        Self::new(MAX_CONFIG_CHANGES_PER_WINDOW, CONFIG_WINDOW)
    }
}
