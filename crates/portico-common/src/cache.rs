//! Bounded in-memory cache with per-entry TTL and least-recently-used eviction.
//!
//! Backs the router's SNI route cache, the CA's leaf cache and the auth
//! replay cache. Entries expire a fixed `ttl` after insertion; reads refresh
//! recency but not expiry. When full, expired entries are purged first and
//! then the least recently used entry is evicted.

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Result of [`BoundedCache::insert_if_absent_at`].
#[derive(Debug, PartialEq, Eq)]
pub enum Insertion<K> {
    /// Stored. Carries the live entry pushed out to make room, if any.
    Inserted { evicted: Option<K> },
    /// A live entry already existed; nothing changed.
    AlreadyPresent,
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
    inserted_seq: u64,
    used_seq: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    by_insert: BTreeMap<u64, K>,
    by_use: BTreeMap<u64, K>,
    seq: u64,
}

pub struct BoundedCache<K, V> {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// `capacity` is clamped to at least one entry.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                by_insert: BTreeMap::new(),
                by_use: BTreeMap::new(),
                seq: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_at(key, Instant::now())
    }

    /// Live value for `key`, marking it most recently used.
    pub fn get_at<Q>(&self, key: &Q, now: Instant) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut inner = self.lock();
        let expired = match inner.entries.get(key) {
            None => return None,
            Some(entry) => entry.expires_at <= now,
        };
        if expired {
            inner.remove_entry(key);
            return None;
        }
        inner.touch(key);
        inner.entries.get(key).map(|e| e.value.clone())
    }

    pub fn insert(&self, key: K, value: V) -> Option<K> {
        self.insert_at(key, value, Instant::now())
    }

    /// Insert or replace. Returns the key of a live entry evicted for room.
    pub fn insert_at(&self, key: K, value: V, now: Instant) -> Option<K> {
        let mut inner = self.lock();
        inner.remove_entry(&key);
        let evicted = inner.make_room(self.capacity, now);
        inner.store(key, value, now + self.ttl);
        evicted
    }

    /// Insert only when no live entry exists for `key`.
    ///
    /// The check and the insert happen under one lock, so two racing
    /// callers with the same key see exactly one `Inserted`.
    pub fn insert_if_absent_at(&self, key: K, value: V, now: Instant) -> Insertion<K> {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get(&key) {
            if entry.expires_at > now {
                return Insertion::AlreadyPresent;
            }
            inner.remove_entry(&key);
        }
        let evicted = inner.make_room(self.capacity, now);
        inner.store(key, value, now + self.ttl);
        Insertion::Inserted { evicted }
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock().remove_entry(key)
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone,
{
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn store(&mut self, key: K, value: V, expires_at: Instant) {
        let seq = self.next_seq();
        self.by_insert.insert(seq, key.clone());
        self.by_use.insert(seq, key.clone());
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at,
                inserted_seq: seq,
                used_seq: seq,
            },
        );
    }

    fn touch<Q>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let seq = self.next_seq();
        if let Some(entry) = self.entries.get_mut(key) {
            if let Some(k) = self.by_use.remove(&entry.used_seq) {
                self.by_use.insert(seq, k);
            }
            entry.used_seq = seq;
        }
    }

    fn remove_entry<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entry = self.entries.remove(key)?;
        self.by_insert.remove(&entry.inserted_seq);
        self.by_use.remove(&entry.used_seq);
        Some(entry.value)
    }

    /// TTL is fixed, so insertion order is expiry order.
    fn purge_expired(&mut self, now: Instant) {
        while let Some((_, key)) = self.by_insert.first_key_value() {
            let expired = self
                .entries
                .get(key)
                .map(|e| e.expires_at <= now)
                .unwrap_or(true);
            if !expired {
                break;
            }
            let key = key.clone();
            if self.remove_entry(&key).is_none() {
                self.by_insert.pop_first();
            }
        }
    }

    fn make_room(&mut self, capacity: usize, now: Instant) -> Option<K> {
        if self.entries.len() < capacity {
            return None;
        }
        self.purge_expired(now);
        if self.entries.len() < capacity {
            return None;
        }
        let (_, lru) = self.by_use.first_key_value()?;
        let lru = lru.clone();
        self.remove_entry(&lru);
        Some(lru)
    }
}
