//! In-memory fetch cache: content-addressed keys, TTL expiry, LRU
//! eviction, and single-flight coalescing.
//!
//! The key is a blake3 hash of (source, sorted canonical params, batch
//! entity ids), so identical requests collapse to one entry regardless of
//! who built them. Concurrent requests for an identical in-flight key wait
//! on a condvar for the leader's result instead of issuing a redundant
//! provider call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::provider::FetchError;
use crate::frame::{EntityId, FactorFrame};

/// Content-addressed cache key (blake3 hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Serialize)]
struct KeyMaterial<'a> {
    source: &'a str,
    params: &'a BTreeMap<String, String>,
    entities: &'a [EntityId],
}

/// Build the cache key for one batch request. Params arrive already sorted
/// (BTreeMap) and the entity batch is sorted by the fetcher, so equal
/// requests always hash equal.
pub fn cache_key(source: &str, params: &BTreeMap<String, String>, entities: &[EntityId]) -> CacheKey {
    let material = KeyMaterial {
        source,
        params,
        entities,
    };
    let json = serde_json::to_vec(&material).expect("cache key material serializes");
    CacheKey(blake3::hash(&json).to_hex().to_string())
}

struct Entry {
    frame: Arc<FactorFrame>,
    expires_at: Instant,
    last_used: u64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    in_flight: HashSet<String>,
    tick: u64,
    hits: u64,
    misses: u64,
}

/// Cache hit/miss counters, mainly for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// The read-through fetch cache.
pub struct FetchCache {
    inner: Mutex<Inner>,
    available: Condvar,
    ttl: Duration,
    capacity: usize,
}

impl FetchCache {
    /// `ttl` bounds entry freshness (default 24h at the config layer);
    /// `capacity` bounds entry count, evicting least-recently-used.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                in_flight: HashSet::new(),
                tick: 0,
                hits: 0,
                misses: 0,
            }),
            available: Condvar::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Read-through lookup with single-flight coalescing.
    ///
    /// Exactly one caller per key runs `fetch` at a time; concurrent
    /// callers for the same key block until the leader finishes and then
    /// read the fresh entry. If the leader fails, one waiter takes over as
    /// the new leader (the fetcher's retry policy already ran inside
    /// `fetch`, so this only happens on surfaced failures).
    pub fn get_or_fetch<F>(&self, key: &CacheKey, fetch: F) -> Result<Arc<FactorFrame>, FetchError>
    where
        F: FnOnce() -> Result<FactorFrame, FetchError>,
    {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(entry) = inner.entries.get(key.as_str()) {
                if entry.expires_at > Instant::now() {
                    let frame = entry.frame.clone();
                    inner.tick += 1;
                    let tick = inner.tick;
                    inner.entries.get_mut(key.as_str()).unwrap().last_used = tick;
                    inner.hits += 1;
                    return Ok(frame);
                }
                inner.entries.remove(key.as_str());
            }

            if inner.in_flight.contains(key.as_str()) {
                inner = self.available.wait(inner).unwrap();
                continue;
            }

            inner.in_flight.insert(key.as_str().to_string());
            inner.misses += 1;
            break;
        }
        drop(inner);

        let result = fetch();

        let mut inner = self.inner.lock().unwrap();
        inner.in_flight.remove(key.as_str());
        let outcome = match result {
            Ok(frame) => {
                let frame = Arc::new(frame);
                inner.tick += 1;
                let tick = inner.tick;
                inner.entries.insert(
                    key.as_str().to_string(),
                    Entry {
                        frame: frame.clone(),
                        expires_at: Instant::now() + self.ttl,
                        last_used: tick,
                    },
                );
                Self::evict(&mut inner, self.capacity);
                Ok(frame)
            }
            Err(e) => Err(e),
        };
        drop(inner);
        self.available.notify_all();
        outcome
    }

    fn evict(inner: &mut Inner, capacity: usize) {
        let now = Instant::now();
        inner.entries.retain(|_, e| e.expires_at > now);
        while inner.entries.len() > capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    inner.entries.remove(&k);
                }
                None => break,
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            entries: inner.entries.len(),
        }
    }
}
