//! Per-identity cooldown tracking.
//!
//! Suppresses repeat recognition events for the same identity inside a
//! configurable window. All callers go through [`CooldownTracker::try_accept`]
//! so that check and record happen under one lock.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Last-accepted-time map for identities, guarded by a mutex.
#[derive(Debug)]
pub struct CooldownTracker {
    window: Duration,
    /// Soft bound on tracked identities; `None` = unbounded.
    max_entries: Option<usize>,
    entries: Mutex<HashMap<String, Instant>>,
}

impl CooldownTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            max_entries: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Bound the map. Only entries whose window has elapsed are ever pruned.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// True iff `identity_id` has no entry or its window has elapsed at `now`.
    pub fn should_accept(&self, identity_id: &str, now: Instant) -> bool {
        let entries = self.lock();
        Self::eligible(&entries, identity_id, now, self.window)
    }

    /// Unconditionally overwrite the entry for `identity_id`.
    pub fn record_accepted(&self, identity_id: &str, now: Instant) {
        let mut entries = self.lock();
        entries.insert(identity_id.to_string(), now);
        self.prune(&mut entries, now);
    }

    /// Atomic check-and-record. Returns true if the identity was accepted.
    pub fn try_accept(&self, identity_id: &str, now: Instant) -> bool {
        let mut entries = self.lock();
        if !Self::eligible(&entries, identity_id, now, self.window) {
            return false;
        }
        entries.insert(identity_id.to_string(), now);
        self.prune(&mut entries, now);
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn eligible(
        entries: &HashMap<String, Instant>,
        identity_id: &str,
        now: Instant,
        window: Duration,
    ) -> bool {
        match entries.get(identity_id) {
            None => true,
            // saturating: a `now` earlier than the record never passes
            Some(&last) => now.saturating_duration_since(last) >= window,
        }
    }

    fn prune(&self, entries: &mut HashMap<String, Instant>, now: Instant) {
        let Some(max) = self.max_entries else {
            return;
        };
        if entries.len() <= max {
            return;
        }
        let before = entries.len();
        let window = self.window;
        entries.retain(|_, last| now.saturating_duration_since(*last) < window);
        tracing::debug!(
            pruned = before - entries.len(),
            remaining = entries.len(),
            "cooldown: pruned expired entries"
        );
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        // The map holds plain timestamps; a panic mid-insert cannot leave it inconsistent.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
