use crate::engine::Engine;
use crate::process::ProcessControl;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Runtime state of one supervised process.
pub struct Session<T = ()> {
    /// Distinguishes successive sessions for the same key
    pub generation: u64,
    pub control: ProcessControl,
    pub started_at: Instant,
    /// Last diagnostic output (used for staleness)
    pub last_activity: Instant,
    /// Supervisor specific payload (viewers for live streams)
    pub attached: T,
}

/// Session table keyed by feed id or source address.
///
/// At most one session exists per key: `insert` refuses an occupied key, so
/// callers must stop before starting again.
pub struct SessionRegistry<K, T = ()> {
    sessions: Mutex<HashMap<K, Session<T>>>,
    generations: AtomicU64,
}

impl<K: Eq + Hash + Clone, T> Default for SessionRegistry<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, T> SessionRegistry<K, T> {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(1),
        }
    }

    /// Registers a freshly launched process and returns its generation.
    pub fn insert(&self, key: K, control: ProcessControl, attached: T) -> anyhow::Result<u64> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(existing) = sessions.get(&key) {
            anyhow::bail!(
                "a session (pid {}) is already active for this key",
                existing.control.pid()
            );
        }
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        sessions.insert(
            key,
            Session {
                generation,
                control,
                started_at: now,
                last_activity: now,
                attached,
            },
        );
        Ok(generation)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.sessions.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn keys(&self) -> Vec<K> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .map(|s| s.control.pid())
            .collect()
    }

    /// Refreshes last-activity, ignoring stale generations.
    pub fn touch(&self, key: &K, generation: u64) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(key) {
            if session.generation == generation {
                session.last_activity = Instant::now();
            }
        }
    }

    /// Keys whose last activity is older than `threshold`.
    pub fn stale_keys(&self, threshold: Duration, now: Instant) -> Vec<K> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_activity) > threshold)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn remove(&self, key: &K) -> Option<Session<T>> {
        self.sessions.lock().unwrap().remove(key)
    }

    /// Removes the session only if it still belongs to `generation`.
    pub fn remove_generation(&self, key: &K, generation: u64) -> Option<Session<T>> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get(key) {
            Some(session) if session.generation == generation => sessions.remove(key),
            _ => None,
        }
    }

    pub fn drain(&self) -> Vec<(K, Session<T>)> {
        self.sessions.lock().unwrap().drain().collect()
    }

    pub fn with_session<R>(&self, key: &K, f: impl FnOnce(&mut Session<T>) -> R) -> Option<R> {
        self.sessions.lock().unwrap().get_mut(key).map(f)
    }

    pub fn with_generation<R>(
        &self,
        key: &K,
        generation: u64,
        f: impl FnOnce(&mut Session<T>) -> R,
    ) -> Option<R> {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(key) {
            Some(session) if session.generation == generation => Some(f(session)),
            _ => None,
        }
    }
}

/// 全局应用上下文
pub type SharedState = Arc<Engine>;
