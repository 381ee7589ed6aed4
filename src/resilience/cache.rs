//! Response cache with single-flight computation.
//!
//! Content-addressed: the key is a SHA-256 over the normalised prompt and
//! every output-affecting parameter. The tenant is deliberately not part of
//! the key, so identical requests from different tenants share one entry.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let key = CacheKey::for_request(&request);
//! let (response, origin) = cache
//!     .lookup_or_compute(&key, || async { run_backend().await })
//!     .await?;
//! ```
//!
//! At most one `compute` runs per key at a time. Callers that arrive while a
//! computation is in flight park on a broadcast channel and receive the
//! leader's value. If the leader fails or is cancelled, its in-flight marker
//! is removed and the parked callers retry; failures are never cached.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use crate::backend::Backend;
use crate::config::SharedConfig;
use crate::metrics;
use crate::InferenceRequest;

// ── Key ──────────────────────────────────────────────────────────────────

/// Normalised content hash identifying a cacheable request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key covering prompt, `max_tokens`, sampling parameters and the model
    /// override (`auto` when none).
    ///
    /// The prompt is trimmed and whitespace runs collapse to one space;
    /// floats are rendered with four decimal places.
    pub fn for_request(request: &InferenceRequest) -> Self {
        let prompt = request.prompt.split_whitespace().collect::<Vec<_>>().join(" ");
        let top_p = request
            .params
            .top_p
            .map_or_else(|| "none".to_string(), |p| format!("{p:.4}"));
        let model = request.model_override.map_or("auto", Backend::name);

        let mut hasher = Sha256::new();
        hasher.update(prompt.as_bytes());
        hasher.update(b"\x00");
        hasher.update(
            format!(
                "max_tokens={};temperature={:.4};top_p={};model={}",
                request.max_tokens, request.params.temperature, top_p, model
            )
            .as_bytes(),
        );
        Self(hex::encode(hasher.finalize()))
    }

    /// Hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Values ───────────────────────────────────────────────────────────────

/// A completed response stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedResponse {
    /// Generated text.
    pub text: String,
    /// Backend that produced it.
    pub backend: Backend,
    /// Cost charged when it was computed.
    pub cost: f64,
    /// Prompt tokens consumed.
    pub tokens_in: u64,
    /// Completion tokens produced.
    pub tokens_out: u64,
    /// When the value was computed.
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Where a [`ResponseCache::lookup_or_compute`] result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOrigin {
    /// Served from a fresh entry.
    Hit,
    /// Shared from another caller's in-flight computation.
    Coalesced,
    /// Computed by this caller.
    Computed,
}

impl CacheOrigin {
    /// Whether the caller did not run the computation itself.
    pub fn is_cached(self) -> bool {
        !matches!(self, Self::Computed)
    }
}

struct Entry {
    value: CachedResponse,
    inserted: Instant,
    ttl: Duration,
    last_access: u64,
}

enum Slot {
    Ready(Entry),
    InFlight {
        generation: u64,
        tx: broadcast::Sender<CachedResponse>,
    },
}

enum Claim {
    Hit(CachedResponse),
    Wait(broadcast::Receiver<CachedResponse>),
    Lead(u64),
}

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Ready entries (fresh or not yet purged).
    pub entries: usize,
    /// Keys with a computation in flight.
    pub in_flight: usize,
    /// Lookups served from a fresh entry.
    pub hits: u64,
    /// Lookups that computed.
    pub misses: u64,
    /// Lookups that shared another caller's computation.
    pub coalesced: u64,
    /// Entries evicted for capacity.
    pub evictions: u64,
    /// Entries found stale.
    pub expirations: u64,
}

impl CacheStats {
    /// Fraction of lookups that avoided a computation.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.coalesced;
        if total == 0 {
            0.0
        } else {
            (self.hits + self.coalesced) as f64 / total as f64
        }
    }
}

// ── Cache ────────────────────────────────────────────────────────────────

/// TTL + LRU response cache with per-key single-flight.
pub struct ResponseCache {
    slots: DashMap<CacheKey, Slot>,
    config: SharedConfig,
    tick: AtomicU64,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl ResponseCache {
    /// Create an empty cache sized by `config.cache`.
    pub fn new(config: SharedConfig) -> Self {
        Self {
            slots: DashMap::new(),
            config,
            tick: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    fn in_flight_slot(&self) -> (u64, Slot) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (tx, _) = broadcast::channel(1);
        (generation, Slot::InFlight { generation, tx })
    }

    fn claim(&self, key: &CacheKey) -> Claim {
        let now = Instant::now();
        match self.slots.entry(key.clone()) {
            MapEntry::Occupied(mut occupied) => {
                match occupied.get_mut() {
                    Slot::Ready(entry)
                        if now.saturating_duration_since(entry.inserted) < entry.ttl =>
                    {
                        entry.last_access = self.next_tick();
                        return Claim::Hit(entry.value.clone());
                    }
                    Slot::InFlight { tx, .. } => return Claim::Wait(tx.subscribe()),
                    Slot::Ready(_) => {}
                }
                self.expirations.fetch_add(1, Ordering::Relaxed);
                metrics::inc_cache_event("expired");
                let (generation, slot) = self.in_flight_slot();
                occupied.insert(slot);
                Claim::Lead(generation)
            }
            MapEntry::Vacant(vacant) => {
                let (generation, slot) = self.in_flight_slot();
                vacant.insert(slot);
                Claim::Lead(generation)
            }
        }
    }

    /// Return the cached value for `key`, or run `compute` exactly once among
    /// concurrent callers and cache its success.
    ///
    /// With the cache disabled in config, `compute` always runs.
    ///
    /// # Errors
    ///
    /// Propagates the error of this caller's own `compute`. An error from
    /// another caller's computation makes this caller retry instead.
    pub async fn lookup_or_compute<F, Fut, E>(
        &self,
        key: &CacheKey,
        compute: F,
    ) -> Result<(CachedResponse, CacheOrigin), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedResponse, E>>,
    {
        if !self.config.current().cache.enabled {
            return compute().await.map(|v| (v, CacheOrigin::Computed));
        }

        let generation = loop {
            match self.claim(key) {
                Claim::Hit(value) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    metrics::inc_cache_event("hit");
                    debug!(key = %key, "cache hit");
                    return Ok((value, CacheOrigin::Hit));
                }
                Claim::Wait(mut rx) => match rx.recv().await {
                    Ok(value) => {
                        self.coalesced.fetch_add(1, Ordering::Relaxed);
                        metrics::inc_cache_event("coalesced");
                        debug!(key = %key, "joined in-flight computation");
                        return Ok((value, CacheOrigin::Coalesced));
                    }
                    // Leader failed or was cancelled.
                    Err(_) => continue,
                },
                Claim::Lead(generation) => break generation,
            }
        };

        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::inc_cache_event("miss");

        let guard = LeaderGuard {
            cache: self,
            key,
            generation,
            armed: true,
        };
        let value = compute().await?;
        guard.disarm();
        self.publish(key, generation, value.clone());
        Ok((value, CacheOrigin::Computed))
    }

    fn publish(&self, key: &CacheKey, generation: u64, value: CachedResponse) {
        let ttl = Duration::from_secs(self.config.current().cache.ttl_secs);
        let tx = {
            let Some(mut slot) = self.slots.get_mut(key) else {
                return;
            };
            // Invalidated or cleared while computing.
            if !matches!(&*slot, Slot::InFlight { generation: g, .. } if *g == generation) {
                return;
            }
            let ready = Slot::Ready(Entry {
                value: value.clone(),
                inserted: Instant::now(),
                ttl,
                last_access: self.next_tick(),
            });
            match std::mem::replace(&mut *slot, ready) {
                Slot::InFlight { tx, .. } => Some(tx),
                Slot::Ready(_) => None,
            }
        };
        if let Some(tx) = tx {
            // Parked callers may all have gone away.
            let _ = tx.send(value);
            self.evict_to_capacity();
        }
    }

    fn abandon(&self, key: &CacheKey, generation: u64) {
        let removed = self.slots.remove_if(key, |_, slot| {
            matches!(slot, Slot::InFlight { generation: g, .. } if *g == generation)
        });
        if removed.is_some() {
            debug!(key = %key, "in-flight marker cleared");
        }
    }

    fn evict_to_capacity(&self) {
        let capacity = self.config.current().cache.capacity.max(1);
        while self.slots.len() > capacity {
            let victim = self
                .slots
                .iter()
                .filter_map(|e| match e.value() {
                    Slot::Ready(entry) => Some((entry.last_access, e.key().clone())),
                    Slot::InFlight { .. } => None,
                })
                .min_by_key(|(tick, _)| *tick);
            let Some((tick, key)) = victim else {
                return;
            };
            let removed = self.slots.remove_if(&key, |_, slot| {
                matches!(slot, Slot::Ready(entry) if entry.last_access == tick)
            });
            if removed.is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                metrics::inc_cache_event("evicted");
                debug!(key = %key, "cache entry evicted");
            }
        }
    }

    /// Remove `key` (ready or in flight). Returns whether anything was removed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.slots.remove(key).is_some()
    }

    /// Remove every entry. In-flight callers retry; their results are not stored.
    pub fn clear(&self) {
        self.slots.clear();
    }

    /// Drop stale entries. Lookups already treat them as misses; this only
    /// reclaims memory.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot {
            Slot::Ready(entry) => now.saturating_duration_since(entry.inserted) < entry.ttl,
            Slot::InFlight { .. } => true,
        });
        before.saturating_sub(self.slots.len())
    }

    /// Number of slots (ready and in flight).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Counters and occupancy.
    pub fn stats(&self) -> CacheStats {
        let (mut entries, mut in_flight) = (0, 0);
        for slot in self.slots.iter() {
            match slot.value() {
                Slot::Ready(_) => entries += 1,
                Slot::InFlight { .. } => in_flight += 1,
            }
        }
        CacheStats {
            entries,
            in_flight,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Clears the leader's in-flight marker unless the computation succeeded.
struct LeaderGuard<'a> {
    cache: &'a ResponseCache,
    key: &'a CacheKey,
    generation: u64,
    armed: bool,
}

impl LeaderGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.abandon(self.key, self.generation);
        }
    }
}
