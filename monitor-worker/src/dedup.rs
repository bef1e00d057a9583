//! # Dedup
//!
//! Suppression of repeated notifications for the same trigger key within a cooldown window.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use monitor_common::event::TriggerKey;

/// Storage of the last accepted notification time per trigger key.
///
/// Every method must be atomic per key: two concurrent `claim` calls for the same key must never
/// both succeed within one cooldown. Calls for different keys must not block each other.
pub trait CooldownStore: Send + Sync {
    /// Record `now` for `key` and return true iff the key has no entry, or its entry is at least
    /// `cooldown` old.
    fn claim(&self, key: &TriggerKey, now: DateTime<Utc>, cooldown: Duration) -> bool;

    /// Remove the entry for `key` if it still holds `claimed_at`. Returns whether it was removed.
    fn release(&self, key: &TriggerKey, claimed_at: DateTime<Utc>) -> bool;

    /// Whether the entry for `key` is the claim made at `claimed_at`.
    fn holds(&self, key: &TriggerKey, claimed_at: DateTime<Utc>) -> bool;

    /// Remove every entry recorded before `cutoff` and return how many were removed.
    fn purge_before(&self, cutoff: DateTime<Utc>) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A `CooldownStore` kept in process memory, on a sharded map. Entries are lost on restart.
#[derive(Default)]
pub struct MemoryCooldownStore {
    entries: DashMap<TriggerKey, DateTime<Utc>>,
}

impl MemoryCooldownStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn elapsed_since(then: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    // Negative when the clock went backwards, which we treat as no time having passed.
    now.signed_duration_since(then)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

impl CooldownStore for MemoryCooldownStore {
    fn claim(&self, key: &TriggerKey, now: DateTime<Utc>, cooldown: Duration) -> bool {
        // The entry guard holds the shard lock, serializing claims on the same key.
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if elapsed_since(*entry.get(), now) >= cooldown {
                    entry.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    fn release(&self, key: &TriggerKey, claimed_at: DateTime<Utc>) -> bool {
        self.entries
            .remove_if(key, |_, last| *last == claimed_at)
            .is_some()
    }

    fn holds(&self, key: &TriggerKey, claimed_at: DateTime<Utc>) -> bool {
        self.entries
            .get(key)
            .is_some_and(|last| *last == claimed_at)
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, last| *last >= cutoff);
        before.saturating_sub(self.entries.len())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Decides whether a `NotificationTrigger` may reach dispatch.
///
/// Checks never suspend: they only touch the `CooldownStore`.
#[derive(Clone)]
pub struct Deduplicator {
    store: Arc<dyn CooldownStore>,
    cooldown: Duration,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn CooldownStore>, cooldown: Duration) -> Self {
        Self { store, cooldown }
    }

    pub fn in_memory(cooldown: Duration) -> Self {
        Self::new(Arc::new(MemoryCooldownStore::new()), cooldown)
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// True iff no notification was accepted for `key` within the cooldown. A true answer is a
    /// claim: `now` is recorded and the next call within the cooldown will answer false.
    pub fn should_notify(&self, key: &TriggerKey, now: DateTime<Utc>) -> bool {
        let allowed = self.store.claim(key, now, self.cooldown);
        if !allowed {
            metrics::counter!("monitor_dedup_suppressed_total").increment(1);
        }
        allowed
    }

    /// Give back a claim whose notification could not be delivered, so the next trigger for the
    /// key is not suppressed. Does nothing if a newer claim replaced it.
    pub fn release(&self, key: &TriggerKey, claimed_at: DateTime<Utc>) -> bool {
        self.store.release(key, claimed_at)
    }

    /// Whether the claim made at `claimed_at` still stands for `key`.
    pub fn holds(&self, key: &TriggerKey, claimed_at: DateTime<Utc>) -> bool {
        self.store.holds(key, claimed_at)
    }

    /// Drop the entries that can no longer suppress anything.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        match chrono::Duration::from_std(self.cooldown) {
            Ok(cooldown) => self.store.purge_before(now - cooldown),
            Err(_) => 0,
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.store.len()
    }
}
