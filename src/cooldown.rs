use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Per-key restart gate.
///
/// The check and the timestamp update happen under one lock with no await in
/// between, so two callers can never both pass for the same window.
#[derive(Debug)]
pub struct CooldownGate<K> {
    last_attempt: Mutex<HashMap<K, Instant>>,
}

impl<K: Eq + Hash + Clone> Default for CooldownGate<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> CooldownGate<K> {
    pub fn new() -> Self {
        Self {
            last_attempt: Mutex::new(HashMap::new()),
        }
    }

    /// Records `now` and returns true when no attempt for `key` happened within
    /// `window`. A rejected call leaves the recorded timestamp untouched.
    pub fn try_acquire(&self, key: &K, window: Duration, now: Instant) -> bool {
        let mut attempts = self.last_attempt.lock().unwrap();
        if let Some(last) = attempts.get(key) {
            if now.saturating_duration_since(*last) < window {
                return false;
            }
        }
        attempts.insert(key.clone(), now);
        true
    }

    /// Drops keys whose window has passed; they would be admitted anyway.
    pub fn prune(&self, window: Duration, now: Instant) {
        self.last_attempt
            .lock()
            .unwrap()
            .retain(|_, last| now.saturating_duration_since(*last) < window);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.last_attempt.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.last_attempt.lock().unwrap().clear();
    }
}
