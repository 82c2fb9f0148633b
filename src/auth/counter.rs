//! Windowed counters, the substrate for every quota in the crate.
//!
//! A counter is keyed by an opaque string and forgotten once its TTL elapses;
//! expiry is checked lazily at read time, no sweeper required. The in-memory
//! implementation is suitable for a single instance; multi-instance
//! deployments substitute a shared store behind the same trait.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::clock::Clock;

/// Counter snapshot: current count plus when the window resets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterValue {
    pub count: u64,
    /// Absent when no live window exists for the key.
    pub resets_at_ms: Option<i64>,
}

/// Key-value store with per-key expiry and atomic increment.
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key`. A fresh window of `ttl` starts when the key
    /// is absent or its previous window has elapsed.
    fn increment(&self, key: &str, ttl: Duration) -> Result<CounterValue>;

    /// Current count, `0` when the key is absent or expired.
    fn get(&self, key: &str) -> Result<CounterValue>;

    /// Drop the key and its window.
    fn reset(&self, key: &str) -> Result<()>;
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    count: u64,
    expires_at_ms: i64,
}

/// Process-local counter store with lazy TTL expiry.
pub struct MemoryCounterStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCounterStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A poisoned lock means another thread panicked mid-update; counters
        // are monotonic within a window, so the stored state is still usable.
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl CounterStore for MemoryCounterStore {
    fn increment(&self, key: &str, ttl: Duration) -> Result<CounterValue> {
        let now = self.clock.now_ms();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let mut entries = self.lock();
        entries.retain(|_, entry| entry.expires_at_ms > now);

        let entry = entries
            .entry(key.to_string())
            .and_modify(|entry| entry.count = entry.count.saturating_add(1))
            .or_insert(Entry {
                count: 1,
                expires_at_ms: now.saturating_add(ttl_ms),
            });

        Ok(CounterValue {
            count: entry.count,
            resets_at_ms: Some(entry.expires_at_ms),
        })
    }

    fn get(&self, key: &str) -> Result<CounterValue> {
        let now = self.clock.now_ms();
        let entries = self.lock();
        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at_ms > now)
            .map_or_else(CounterValue::default, |entry| CounterValue {
                count: entry.count,
                resets_at_ms: Some(entry.expires_at_ms),
            }))
    }

    fn reset(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, MemoryCounterStore) {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryCounterStore::new(clock.clone());
        (clock, store)
    }

    #[test]
    fn increment_counts_within_window() -> Result<()> {
        let (_clock, store) = store();
        assert_eq!(store.increment("k", Duration::from_secs(60))?.count, 1);
        assert_eq!(store.increment("k", Duration::from_secs(60))?.count, 2);
        assert_eq!(store.get("k")?.count, 2);
        Ok(())
    }

    #[test]
    fn window_expiry_forgets_the_counter() -> Result<()> {
        let (clock, store) = store();
        store.increment("k", Duration::from_secs(60))?;
        clock.advance_ms(59_999);
        assert_eq!(store.get("k")?.count, 1);
        clock.advance_ms(1);
        assert_eq!(store.get("k")?.count, 0);
        // A fresh increment starts a new window rather than resuming the old one.
        let value = store.increment("k", Duration::from_secs(60))?;
        assert_eq!(value.count, 1);
        assert_eq!(value.resets_at_ms, Some(clock.now_ms() + 60_000));
        Ok(())
    }

    #[test]
    fn ttl_is_fixed_at_window_start() -> Result<()> {
        let (clock, store) = store();
        let first = store.increment("k", Duration::from_secs(60))?;
        clock.advance_ms(30_000);
        let second = store.increment("k", Duration::from_secs(60))?;
        assert_eq!(first.resets_at_ms, second.resets_at_ms);
        Ok(())
    }

    #[test]
    fn reset_drops_the_key() -> Result<()> {
        let (_clock, store) = store();
        store.increment("k", Duration::from_secs(60))?;
        store.reset("k")?;
        assert_eq!(store.get("k")?, CounterValue::default());
        Ok(())
    }

    #[test]
    fn keys_are_independent() -> Result<()> {
        let (_clock, store) = store();
        store.increment("a", Duration::from_secs(60))?;
        store.increment("a", Duration::from_secs(60))?;
        store.increment("b", Duration::from_secs(60))?;
        assert_eq!(store.get("a")?.count, 2);
        assert_eq!(store.get("b")?.count, 1);
        Ok(())
    }
}
