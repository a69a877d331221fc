//! In-memory result cache.
//!
//! Entries expire after a per-entry TTL and are evicted lazily on read.
//! An optional capacity bound evicts the least-recently-accessed entry.
//! All state lives behind one mutex, held only for short critical sections.

use crate::error::{DispatchError, DispatchResult};
use crate::models::AnalysisArtifact;
use crate::normalizer::Fingerprint;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Expiry used when `now + ttl` is not representable. Matches the horizon
/// tokio uses for its own "never" deadlines.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// A cached artifact and its expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub artifact: Arc<AnalysisArtifact>,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Counters describing cache behavior since construction (or `clear`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries removed to make room under the capacity bound.
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,
    pub entries: usize,
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    /// Key into `Inner::recency`.
    touched: u64,
}

#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<Fingerprint, Slot>,
    /// Access tick -> fingerprint, oldest first.
    recency: BTreeMap<u64, Fingerprint>,
    tick: u64,
    stats: CacheStats,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, fingerprint: &Fingerprint) {
        let tick = self.next_tick();
        if let Some(slot) = self.slots.get_mut(fingerprint) {
            self.recency.remove(&slot.touched);
            slot.touched = tick;
            self.recency.insert(tick, fingerprint.clone());
        }
    }

    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<Slot> {
        let slot = self.slots.remove(fingerprint)?;
        self.recency.remove(&slot.touched);
        Some(slot)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<Fingerprint> = self
            .slots
            .iter()
            .filter(|(_, slot)| !slot.entry.is_valid_at(now))
            .map(|(fp, _)| fp.clone())
            .collect();

        for fp in &expired {
            self.remove(fp);
        }
        self.stats.expirations += expired.len() as u64;
        expired.len()
    }

    fn evict_least_recent(&mut self) -> Option<Fingerprint> {
        let (_, fingerprint) = self.recency.pop_first()?;
        self.slots.remove(&fingerprint);
        self.stats.evictions += 1;
        Some(fingerprint)
    }
}

/// Thread-safe fingerprint -> artifact cache.
///
/// Constructed explicitly and owned by whoever builds it; there is no
/// process-wide instance. Call [`ResultCache::clear`] on teardown.
#[derive(Debug)]
pub struct ResultCache {
    inner: Mutex<Inner>,
    max_entries: Option<usize>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl ResultCache {
    /// Cache with no capacity bound.
    pub fn unbounded() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_entries: None,
        }
    }

    /// Cache holding at most `max_entries` entries (minimum 1).
    pub fn bounded(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_entries: Some(max_entries.max(1)),
        }
    }

    pub fn with_capacity(max_entries: Option<usize>) -> Self {
        match max_entries {
            Some(n) => Self::bounded(n),
            None => Self::unbounded(),
        }
    }

    pub fn max_entries(&self) -> Option<usize> {
        self.max_entries
    }

    /// Poisoning only means another thread panicked mid-update; the maps
    /// themselves are always left consistent, so keep going.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up an unexpired artifact. Hits refresh recency; misses do not.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<AnalysisArtifact>> {
        let now = Instant::now();
        let mut inner = self.lock();

        match inner.slots.get(fingerprint).map(|slot| slot.entry.is_valid_at(now)) {
            None => {
                inner.stats.misses += 1;
                return None;
            }
            Some(false) => {
                inner.remove(fingerprint);
                inner.stats.expirations += 1;
                inner.stats.misses += 1;
                debug!("Lazily evicted expired entry {}", fingerprint.short());
                return None;
            }
            Some(true) => {}
        }

        inner.touch(fingerprint);
        inner.stats.hits += 1;
        inner
            .slots
            .get(fingerprint)
            .map(|slot| Arc::clone(&slot.entry.artifact))
    }

    /// Insert or replace an entry that expires `ttl` from now.
    ///
    /// TTLs too large to add to the clock saturate to an expiry decades
    /// away instead of overflowing.
    pub fn put(
        &self,
        fingerprint: Fingerprint,
        artifact: Arc<AnalysisArtifact>,
        ttl: Duration,
    ) -> DispatchResult<()> {
        if ttl.is_zero() {
            return Err(DispatchError::InvalidTtl);
        }

        let now = Instant::now();
        let expires_at = now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE);
        let entry = CacheEntry {
            artifact,
            expires_at,
        };

        let mut inner = self.lock();

        if let Some(max) = self.max_entries {
            if !inner.slots.contains_key(&fingerprint) && inner.slots.len() >= max {
                let purged = inner.purge_expired(now);
                if purged > 0 {
                    debug!("Purged {} expired entries before insert", purged);
                }
                while inner.slots.len() >= max {
                    match inner.evict_least_recent() {
                        Some(evicted) => {
                            debug!("Evicted least-recently-used entry {}", evicted.short())
                        }
                        None => break,
                    }
                }
            }
        }

        inner.remove(&fingerprint);
        let touched = inner.next_tick();
        inner.recency.insert(touched, fingerprint.clone());
        inner.slots.insert(fingerprint, Slot { entry, touched });

        Ok(())
    }

    /// Remove an entry if present.
    pub fn invalidate(&self, fingerprint: &Fingerprint) {
        if self.lock().remove(fingerprint).is_some() {
            debug!("Invalidated entry {}", fingerprint.short());
        }
    }

    /// Drop every expired entry now rather than waiting for reads.
    #[allow(dead_code)] // Maintenance hook for long-lived embedders
    pub fn purge_expired(&self) -> usize {
        self.lock().purge_expired(Instant::now())
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    #[allow(dead_code)] // Pairs with len()
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all entries and reset counters.
    pub fn clear(&self) {
        let mut inner = self.lock();
        *inner = Inner::default();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.slots.len(),
            ..inner.stats
        }
    }
}
