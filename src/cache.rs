//! Fingerprint-keyed response cache with TTL and LRU eviction (spec.md
//! §4.D). Grounded in the teacher's `cache_integration.rs` (content-hash
//! keyed entries, capacity-bounded map) reworked from a Bevy `Resource`
//! into a plain `dashmap`-backed store so it can be shared across tasks
//! without a world lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use glob::Pattern;

use crate::fingerprint::Fingerprint;
use crate::transport::RawResponse;

struct CacheEntry {
    response: RawResponse,
    inserted_at: Instant,
    ttl: Duration,
    last_accessed: AtomicU64,
    /// Demoted high-priority entries are evicted last (spec.md §4.D
    /// "eviction prefers low-priority, least-recently-used entries").
    high_priority: bool,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Keys are stored alongside entries so `invalidate(pattern)` can match
/// against the original cache-key string (spec.md §4.D "invalidate").
pub struct ResponseCache {
    entries: DashMap<Fingerprint, (String, CacheEntry)>,
    capacity: usize,
    clock: AtomicU64,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity.min(1024)),
            capacity,
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// `get(fingerprint)`: returns `None` on miss or expiry, touching the
    /// LRU clock on hit (spec.md §4.D).
    pub fn get(&self, fingerprint: Fingerprint) -> Option<RawResponse> {
        let now = Instant::now();
        let entry = self.entries.get(&fingerprint)?;
        if entry.1.is_expired(now) {
            drop(entry);
            self.entries.remove(&fingerprint);
            return None;
        }
        entry.1.last_accessed.store(self.tick(), Ordering::Relaxed);
        Some(entry.1.response.clone())
    }

    /// `put(fingerprint, key, response, ttl)`. Evicts the least-recently
    /// accessed low-priority entry first when over capacity (spec.md
    /// §4.D).
    /// Refuses the insert (a no-op) when the cache is full of high-priority
    /// entries and the incoming entry is not itself high-priority — a
    /// low-priority admission never displaces high-priority content
    /// (spec.md §4.D "high-priority demotion").
    pub fn put(
        &self,
        fingerprint: Fingerprint,
        key: String,
        response: RawResponse,
        ttl: Duration,
        high_priority: bool,
    ) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&fingerprint) {
            match self.find_eviction_victim(high_priority) {
                Some(victim) => {
                    self.entries.remove(&victim);
                }
                None => return,
            }
        }
        let entry = CacheEntry {
            response,
            inserted_at: Instant::now(),
            ttl,
            last_accessed: AtomicU64::new(self.tick()),
            high_priority,
        };
        self.entries.insert(fingerprint, (key, entry));
    }

    /// Picks the LRU low-priority entry if one exists; only considers
    /// high-priority entries as victims when the incoming entry is itself
    /// high-priority. Returns `None` when nothing may be evicted.
    fn find_eviction_victim(&self, incoming_high_priority: bool) -> Option<Fingerprint> {
        let mut low_priority_victim: Option<(Fingerprint, u64)> = None;
        let mut high_priority_victim: Option<(Fingerprint, u64)> = None;
        for entry in self.entries.iter() {
            let last = entry.value().1.last_accessed.load(Ordering::Relaxed);
            let candidate = (*entry.key(), last);
            if entry.value().1.high_priority {
                high_priority_victim = Some(match high_priority_victim {
                    None => candidate,
                    Some(current) => if candidate.1 < current.1 { candidate } else { current },
                });
            } else {
                low_priority_victim = Some(match low_priority_victim {
                    None => candidate,
                    Some(current) => if candidate.1 < current.1 { candidate } else { current },
                });
            }
        }
        low_priority_victim
            .map(|(fp, _)| fp)
            .or_else(|| if incoming_high_priority { high_priority_victim.map(|(fp, _)| fp) } else { None })
    }

    /// `invalidate(pattern)`: removes every entry whose original cache
    /// key matches a glob `pattern` (spec.md §4.D).
    pub fn invalidate(&self, pattern: &str) -> usize {
        let Ok(glob) = Pattern::new(pattern) else {
            return 0;
        };
        let matched: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|entry| glob.matches(&entry.value().0))
            .map(|entry| *entry.key())
            .collect();
        let count = matched.len();
        for fp in matched {
            self.entries.remove(&fp);
        }
        count
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
