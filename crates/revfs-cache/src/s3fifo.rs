//! Byte-budgeted S3-FIFO blob cache.
//!
//! Three queues:
//! - `small`: admission queue for first-time keys
//! - `main`: long-lived queue with bounded reinsertion
//! - `ghost`: metadata-only queue remembering keys recently evicted from
//!   `small`, so re-referenced keys skip the admission queue
//!
//! Entry cost is `key length + blob length`; `small` is budgeted at 10% of
//! the total capacity. Blobs are handed out as `Arc<[u8]>`, so eviction
//! never invalidates data a reader still holds.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::keys::CacheKey;
use crate::BlobCache;

/// Access frequency saturates at this value.
const MAX_FREQUENCY: u8 = 3;

/// `small` queue share of the total byte budget.
const SMALL_RATIO_NUM: usize = 1;
const SMALL_RATIO_DEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueKind {
    Small,
    Main,
}

#[derive(Debug)]
struct Entry {
    data: Arc<[u8]>,
    freq: u8,
    queue: QueueKind,
    cost: usize,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<CacheKey, Entry>,
    small: VecDeque<CacheKey>,
    main: VecDeque<CacheKey>,
    ghost: VecDeque<CacheKey>,
    ghost_keys: HashSet<CacheKey>,
    small_bytes: usize,
    main_bytes: usize,
}

#[derive(Debug, Default)]
struct Stats {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// In-memory [`BlobCache`] implementation.
#[derive(Debug)]
pub struct MemoryBlobCache {
    inner: Mutex<Inner>,
    capacity: usize,
    small_capacity: usize,
    ghost_capacity: usize,
    stats: Stats,
}

impl MemoryBlobCache {
    /// Create a cache bounded to `capacity` bytes of keys + blobs.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");

        let scaled = capacity.saturating_mul(SMALL_RATIO_NUM);
        let mut small_capacity = scaled / SMALL_RATIO_DEN;
        if scaled % SMALL_RATIO_DEN != 0 {
            small_capacity += 1;
        }

        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
            small_capacity,
            // Ghost entries store keys only; bound their count rather than
            // their bytes.
            ghost_capacity: (capacity / 1024).max(16),
            stats: Stats::default(),
        }
    }

    /// `(hits, misses)` counters.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.hits.load(Ordering::Relaxed),
            self.stats.misses.load(Ordering::Relaxed),
        )
    }

    /// Number of resident entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_to_fit(&self, inner: &mut Inner, incoming: usize) {
        while inner.small_bytes + inner.main_bytes + incoming > self.capacity {
            let evicted = if inner.small_bytes > self.small_capacity || inner.main.is_empty() {
                self.evict_small(inner) || self.evict_main(inner)
            } else {
                self.evict_main(inner) || self.evict_small(inner)
            };
            if !evicted {
                break;
            }
        }
    }

    /// Evict one entry from `small`: promoted to `main` when referenced,
    /// demoted to `ghost` otherwise. Returns false when `small` is empty.
    fn evict_small(&self, inner: &mut Inner) -> bool {
        while let Some(key) = inner.small.pop_front() {
            let Some(entry) = inner.entries.get_mut(&key) else {
                continue;
            };
            if entry.freq > 0 {
                entry.queue = QueueKind::Main;
                inner.small_bytes -= entry.cost;
                inner.main_bytes += entry.cost;
                inner.main.push_back(key);
            } else {
                let cost = entry.cost;
                inner.entries.remove(&key);
                inner.small_bytes -= cost;
                self.remember_ghost(inner, key);
                return true;
            }
        }
        false
    }

    /// Evict one entry from `main`, giving referenced entries another round.
    /// Returns false when `main` is empty.
    fn evict_main(&self, inner: &mut Inner) -> bool {
        while let Some(key) = inner.main.pop_front() {
            let Some(entry) = inner.entries.get_mut(&key) else {
                continue;
            };
            if entry.freq > 0 {
                entry.freq -= 1;
                inner.main.push_back(key);
            } else {
                let cost = entry.cost;
                inner.entries.remove(&key);
                inner.main_bytes -= cost;
                return true;
            }
        }
        false
    }

    fn remember_ghost(&self, inner: &mut Inner, key: CacheKey) {
        if inner.ghost.len() >= self.ghost_capacity {
            if let Some(old) = inner.ghost.pop_front() {
                inner.ghost_keys.remove(&old);
            }
        }
        inner.ghost_keys.insert(key.clone());
        inner.ghost.push_back(key);
    }
}

impl BlobCache for MemoryBlobCache {
    fn get(&self, key: &CacheKey) -> Option<Arc<[u8]>> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.freq = (entry.freq + 1).min(MAX_FREQUENCY);
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            Some(Arc::clone(&entry.data))
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    fn has_key(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    fn set(&self, key: &CacheKey, value: Vec<u8>) {
        let cost = key.len() + value.len();
        let data: Arc<[u8]> = value.into();

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        // Replace in place; queue membership is unchanged.
        if let Some(entry) = inner.entries.get_mut(key) {
            let old_cost = entry.cost;
            let queue = entry.queue;
            entry.data = data;
            entry.cost = cost;
            match queue {
                QueueKind::Small => inner.small_bytes = inner.small_bytes - old_cost + cost,
                QueueKind::Main => inner.main_bytes = inner.main_bytes - old_cost + cost,
            }
            self.evict_to_fit(inner, 0);
            return;
        }

        // Oversized values would immediately evict everything else; skip
        // them. The cache contract allows dropping any set.
        if cost > self.capacity {
            return;
        }

        self.evict_to_fit(inner, cost);

        let recently_evicted = inner.ghost_keys.remove(key);
        if recently_evicted {
            if let Some(at) = inner.ghost.iter().position(|k| k == key) {
                inner.ghost.remove(at);
            }
        }

        let queue = if recently_evicted {
            inner.main_bytes += cost;
            inner.main.push_back(key.clone());
            QueueKind::Main
        } else {
            inner.small_bytes += cost;
            inner.small.push_back(key.clone());
            QueueKind::Small
        };

        inner.entries.insert(
            key.clone(),
            Entry {
                data,
                freq: 0,
                queue,
                cost,
            },
        );
    }
}
