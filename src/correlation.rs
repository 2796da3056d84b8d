//! Correlation Table
//!
//! Remembers when a self-issued event left the bridge so that the round-trip
//! time can be measured when an event with the same id comes back over MQTT.
//!
//! Lookups are destructive: an id correlates at most once. Entries that never
//! see a reply stay until the process exits unless an [`EvictionPolicy`] bounds
//! the table.

use std::time::{Duration, Instant};

use ahash::AHashMap;
use tracing::debug;

/// Optional bounds on the number and age of unmatched entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Evict the oldest entry when a new id would exceed this many entries
    pub max_entries: Option<usize>,
    /// Drop entries recorded longer ago than this
    pub ttl: Option<Duration>,
}

impl EvictionPolicy {
    /// No bounds at all
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_entries.is_none() && self.ttl.is_none()
    }
}

/// Event id -> time the event was sent
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: AHashMap<String, Instant>,
    policy: EvictionPolicy,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: EvictionPolicy) -> Self {
        Self {
            entries: AHashMap::new(),
            policy,
        }
    }

    /// Record (or overwrite) the send time for `id`
    pub fn record(&mut self, id: impl Into<String>, at: Instant) {
        self.expire(at);

        let id = id.into();
        if let Some(max) = self.policy.max_entries {
            if !self.entries.contains_key(&id) {
                while !self.entries.is_empty() && self.entries.len() >= max {
                    self.evict_oldest();
                }
            }
        }

        self.entries.insert(id, at);
    }

    /// Remove `id` and return the time elapsed since it was recorded
    pub fn take_elapsed(&mut self, id: &str, now: Instant) -> Option<Duration> {
        self.expire(now);
        self.entries
            .remove(id)
            .map(|recorded_at| now.saturating_duration_since(recorded_at))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    fn expire(&mut self, now: Instant) {
        let Some(ttl) = self.policy.ttl else {
            return;
        };

        let before = self.entries.len();
        self.entries
            .retain(|_, recorded_at| now.saturating_duration_since(*recorded_at) <= ttl);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!("Correlation: expired {} unmatched entries", dropped);
        }
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, recorded_at)| **recorded_at)
            .map(|(id, _)| id.clone());

        if let Some(id) = oldest {
            debug!("Correlation: table full, evicting {}", id);
            self.entries.remove(&id);
        }
    }
}
