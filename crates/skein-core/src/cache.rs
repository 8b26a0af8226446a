//! Bounded map with write-time expiry.
//!
//! Used for chunk collectors, open pings and unite cooldowns. Entries expire
//! a fixed time after they were written; mutating a value in place through
//! [`ExpiringMap::with_or_insert`] does not refresh it. When the map is full
//! the oldest entry is evicted. Expired and evicted entries are handed to an
//! optional removal listener, invoked outside the map's lock.
//!
//! Time is read from [`tokio::time::Instant`], so tests can pause and
//! advance the clock.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Why an entry left the map without being removed explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// Time-to-live elapsed
    Expired,
    /// Capacity reached and the entry was the oldest
    Evicted,
}

type RemovalListener<K, V> = Box<dyn Fn(K, V, RemovalCause) + Send + Sync>;

struct Slot<V> {
    written: Instant,
    value: V,
}

struct Inner<K, V> {
    entries: HashMap<K, Slot<V>>,
    // Write order. May hold stale keys whose slot was removed or rewritten;
    // those are recognised by a mismatching write time.
    order: VecDeque<(K, Instant)>,
}

/// Concurrent map with capacity bound and expire-after-write.
pub struct ExpiringMap<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
    ttl: Duration,
    listener: Option<RemovalListener<K, V>>,
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a map holding at most `capacity` entries for `ttl` each.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
            ttl,
            listener: None,
        }
    }

    /// Install a listener for expired and evicted entries.
    #[must_use]
    pub fn with_removal_listener(
        mut self,
        listener: impl Fn(K, V, RemovalCause) + Send + Sync + 'static,
    ) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    /// Time-to-live of an entry.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, removed: Vec<(K, V, RemovalCause)>) {
        if let Some(listener) = &self.listener {
            for (key, value, cause) in removed {
                listener(key, value, cause);
            }
        }
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let removed = {
            let mut inner = self.lock();
            self.take_expired(&mut inner, Instant::now())
        };
        let count = removed.len();
        self.notify(removed);
        count
    }

    fn take_expired(&self, inner: &mut Inner<K, V>, now: Instant) -> Vec<(K, V, RemovalCause)> {
        let mut removed = Vec::new();
        while let Some((_, written)) = inner.order.front() {
            if now.duration_since(*written) < self.ttl {
                break;
            }
            let Some((key, written)) = inner.order.pop_front() else {
                break;
            };
            if inner.entries.get(&key).is_some_and(|slot| slot.written == written) {
                if let Some(slot) = inner.entries.remove(&key) {
                    removed.push((key, slot.value, RemovalCause::Expired));
                }
            }
        }
        removed
    }

    fn make_room(&self, inner: &mut Inner<K, V>, removed: &mut Vec<(K, V, RemovalCause)>) {
        while inner.entries.len() >= self.capacity {
            let Some((key, written)) = inner.order.pop_front() else {
                break;
            };
            if inner.entries.get(&key).is_some_and(|slot| slot.written == written) {
                if let Some(slot) = inner.entries.remove(&key) {
                    removed.push((key, slot.value, RemovalCause::Evicted));
                }
            }
        }
    }

    fn write(&self, inner: &mut Inner<K, V>, key: K, value: V, now: Instant) -> Option<V> {
        inner.order.push_back((key.clone(), now));
        inner
            .entries
            .insert(key, Slot {
                written: now,
                value,
            })
            .map(|slot| slot.value)
    }

    /// Insert or overwrite `key`, resetting its write time.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let now = Instant::now();
        let (previous, removed) = {
            let mut inner = self.lock();
            let mut removed = self.take_expired(&mut inner, now);
            if !inner.entries.contains_key(&key) {
                self.make_room(&mut inner, &mut removed);
            }
            (self.write(&mut inner, key, value, now), removed)
        };
        self.notify(removed);
        previous
    }

    /// Insert only if `key` is absent (or expired). Returns whether the value
    /// was inserted.
    pub fn put_if_absent(&self, key: K, value: V) -> bool {
        let now = Instant::now();
        let (inserted, removed) = {
            let mut inner = self.lock();
            let mut removed = self.take_expired(&mut inner, now);
            if inner.entries.contains_key(&key) {
                (false, removed)
            } else {
                self.make_room(&mut inner, &mut removed);
                self.write(&mut inner, key, value, now);
                (true, removed)
            }
        };
        self.notify(removed);
        inserted
    }

    /// Run `f` on the value of `key`, creating it with `make` if absent.
    ///
    /// Creation counts as a write; the mutation done by `f` does not.
    pub fn with_or_insert<R>(
        &self,
        key: K,
        make: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let now = Instant::now();
        let (result, removed) = {
            let mut inner = self.lock();
            let mut removed = self.take_expired(&mut inner, now);
            if !inner.entries.contains_key(&key) {
                self.make_room(&mut inner, &mut removed);
                inner.order.push_back((key.clone(), now));
            }
            let slot = inner.entries.entry(key).or_insert_with(|| Slot {
                written: now,
                value: make(),
            });
            (f(&mut slot.value), removed)
        };
        self.notify(removed);
        result
    }

    /// Remove and return the value of `key` if it is present and alive.
    pub fn remove(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let (value, removed) = {
            let mut inner = self.lock();
            let removed = self.take_expired(&mut inner, now);
            (inner.entries.remove(key).map(|slot| slot.value), removed)
        };
        self.notify(removed);
        value
    }

    /// Whether `key` is present and alive.
    pub fn contains_key(&self, key: &K) -> bool {
        let inner = self.lock();
        inner
            .entries
            .get(key)
            .is_some_and(|slot| Instant::now().duration_since(slot.written) < self.ttl)
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry without notifying the listener.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}
