//! Distance and geocode cache.
//!
//! Keys round coordinates to a fixed number of decimals, so near-duplicate
//! queries (the same doorstep geocoded twice) hit the same entry on purpose.
//! Geocodes live far longer than point-to-point distances because addresses
//! rarely move while traffic does. Addresses the provider could not resolve
//! are remembered for a short while so they are not looked up on every call.
//!
//! Entries live in a [`CacheStore`]. [`MemoryCacheStore`] keeps them in the
//! process; [`PgCacheStore`] shares them between replicas through the order
//! database. Hit and miss counters are per process either way.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use utoipa::ToSchema;

use crate::clock::Clock;
use crate::config::ttl_duration;
use crate::domain::{Coordinate, TravelMode};
use crate::error::StoreError;

use super::{DistanceEstimate, GeocodeResult};

pub mod memory;
pub mod postgres;

pub use memory::MemoryCacheStore;
pub use postgres::PgCacheStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Decimal places kept in cache keys (4 ≈ 11 m).
    pub precision: u32,
    pub distance_ttl_secs: u64,
    pub geocode_ttl_secs: u64,
    /// How long an address the provider could not resolve stays unresolved.
    pub negative_geocode_ttl_secs: u64,
    /// Entry cap per kind; sweeps evict the least recently used beyond it.
    pub max_entries: usize,
    /// Sweep expired and excess entries after this many writes.
    pub sweep_every_writes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            precision: 4,
            distance_ttl_secs: 6 * 3600,
            geocode_ttl_secs: 30 * 24 * 3600,
            negative_geocode_ttl_secs: 3600,
            max_entries: 50_000,
            sweep_every_writes: 256,
        }
    }
}

/// Cache key for a directed pair of points.
///
/// ```
/// use courier_dispatch::distance::cache::DistanceKey;
/// use courier_dispatch::domain::{Coordinate, TravelMode};
///
/// let a = DistanceKey::new(Coordinate::new(25.04781, 121.51701), Coordinate::new(25.0340, 121.5645), TravelMode::Driving, 4);
/// let b = DistanceKey::new(Coordinate::new(25.04779, 121.51698), Coordinate::new(25.0340, 121.5645), TravelMode::Driving, 4);
/// assert_eq!(a, b);
///
/// let walking = DistanceKey::new(Coordinate::new(25.04781, 121.51701), Coordinate::new(25.0340, 121.5645), TravelMode::Walking, 4);
/// assert_ne!(a, walking);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DistanceKey {
    origin: (i64, i64),
    destination: (i64, i64),
    mode: TravelMode,
    precision: u32,
}

impl DistanceKey {
    pub fn new(origin: Coordinate, destination: Coordinate, mode: TravelMode, precision: u32) -> Self {
        Self {
            origin: origin.rounded_key(precision),
            destination: destination.rounded_key(precision),
            mode,
            precision,
        }
    }
}

/// A cached distance lookup.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DistanceCacheEntry {
    pub origin: Coordinate,
    pub destination: Coordinate,
    pub mode: TravelMode,
    pub distance_km: f64,
    pub duration_minutes: f64,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
    pub last_used: DateTime<Utc>,
}

/// What the cache knows about an address.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedGeocode {
    Resolved(GeocodeResult),
    /// The provider found nothing for it.
    Unresolvable,
}

/// Outcome of a store read.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<T> {
    Hit(T),
    /// An entry existed but had expired; the store deleted it.
    Expired,
    Miss,
}

/// Entries removed by [`CacheStore::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Swept {
    pub expired: usize,
    pub evicted: usize,
}

/// Which entries a purge removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PurgeScope {
    #[default]
    All,
    Distances,
    Geocodes,
    Expired,
}

/// Counters exposed for cost control.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub distance_entries: usize,
    pub geocode_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evictions: u64,
}

/// Storage behind [`DistanceCache`].
///
/// An entry is live while `expires_at > now`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Returns a live entry and records the hit on it. An expired entry is
    /// deleted and reported as [`CacheLookup::Expired`].
    async fn get_distance(
        &self,
        key: &DistanceKey,
        now: DateTime<Utc>,
    ) -> Result<CacheLookup<DistanceCacheEntry>, StoreError>;

    /// Inserts `entry`. If the key exists, its value, expiry and `last_used`
    /// are replaced and its hit count is incremented instead.
    async fn put_distance(
        &self,
        key: &DistanceKey,
        entry: &DistanceCacheEntry,
    ) -> Result<DistanceCacheEntry, StoreError>;

    async fn get_geocode(&self, address_key: &str, now: DateTime<Utc>)
        -> Result<CacheLookup<CachedGeocode>, StoreError>;

    async fn put_geocode(
        &self,
        address_key: &str,
        geocode: &CachedGeocode,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Deletes expired entries, then the least recently used ones beyond
    /// `max_entries` of each kind.
    async fn sweep(&self, now: DateTime<Utc>, max_entries: usize) -> Result<Swept, StoreError>;

    /// Removes entries in `scope`; returns how many were dropped.
    async fn purge(&self, scope: PurgeScope, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Number of stored distance and geocode entries, live or not.
    async fn counts(&self) -> Result<(usize, usize), StoreError>;
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    evictions: AtomicU64,
}

/// TTL cache in front of the distance provider.
pub struct DistanceCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn CacheStore>,
    writes: AtomicU64,
    counters: Counters,
}

impl DistanceCache {
    /// Cache held in this process.
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_store(config, clock, Arc::new(MemoryCacheStore::new()))
    }

    pub fn with_store(config: CacheConfig, clock: Arc<dyn Clock>, store: Arc<dyn CacheStore>) -> Self {
        Self {
            config,
            clock,
            store,
            writes: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    fn key(&self, origin: Coordinate, destination: Coordinate, mode: TravelMode) -> DistanceKey {
        DistanceKey::new(origin, destination, mode, self.config.precision)
    }

    fn record<T>(&self, lookup: CacheLookup<T>) -> Option<T> {
        match lookup {
            CacheLookup::Hit(value) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            CacheLookup::Expired => {
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            CacheLookup::Miss => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Looks up a distance. Expired entries are removed and reported as misses.
    pub async fn get(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        mode: TravelMode,
    ) -> Result<Option<DistanceCacheEntry>, StoreError> {
        let key = self.key(origin, destination, mode);
        let lookup = self.store.get_distance(&key, self.clock.now()).await?;
        Ok(self.record(lookup))
    }

    /// Stores a distance with the distance TTL.
    ///
    /// Writing an existing key refreshes its value and expiry and counts as a hit
    /// on that entry instead of adding a duplicate.
    pub async fn put(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        mode: TravelMode,
        estimate: &DistanceEstimate,
    ) -> Result<DistanceCacheEntry, StoreError> {
        let ttl = ttl_duration(self.config.distance_ttl_secs);
        self.put_with_ttl(origin, destination, mode, estimate, ttl).await
    }

    pub async fn put_with_ttl(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        mode: TravelMode,
        estimate: &DistanceEstimate,
        ttl: Duration,
    ) -> Result<DistanceCacheEntry, StoreError> {
        let key = self.key(origin, destination, mode);
        let now = self.clock.now();
        let entry = DistanceCacheEntry {
            origin,
            destination,
            mode,
            distance_km: estimate.distance_km,
            duration_minutes: estimate.duration_minutes,
            expires_at: now + ttl,
            hit_count: 0,
            last_used: now,
        };

        let stored = self.store.put_distance(&key, &entry).await?;
        self.after_write(now).await;
        Ok(stored)
    }

    pub async fn get_geocode(&self, address: &str) -> Result<Option<CachedGeocode>, StoreError> {
        let lookup = self
            .store
            .get_geocode(&normalize_address(address), self.clock.now())
            .await?;
        Ok(self.record(lookup))
    }

    /// Stores a geocode. Unresolvable addresses get the short negative TTL.
    pub async fn put_geocode(&self, address: &str, geocode: &CachedGeocode) -> Result<(), StoreError> {
        let now = self.clock.now();
        let ttl_secs = match geocode {
            CachedGeocode::Resolved(_) => self.config.geocode_ttl_secs,
            CachedGeocode::Unresolvable => self.config.negative_geocode_ttl_secs,
        };
        let expires_at = now + ttl_duration(ttl_secs);
        self.store
            .put_geocode(&normalize_address(address), geocode, expires_at, now)
            .await?;
        self.after_write(now).await;
        Ok(())
    }

    /// Removes expired entries and the least recently used ones beyond the
    /// cap; returns how many were dropped.
    pub async fn sweep_expired(&self) -> Result<usize, StoreError> {
        self.sweep_at(self.clock.now()).await
    }

    async fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let swept = self.store.sweep(now, self.config.max_entries).await?;
        self.counters
            .expired
            .fetch_add(swept.expired as u64, Ordering::Relaxed);
        self.counters
            .evictions
            .fetch_add(swept.evicted as u64, Ordering::Relaxed);
        if swept.expired + swept.evicted > 0 {
            debug!(expired = swept.expired, evicted = swept.evicted, "Swept cache entries");
        }
        Ok(swept.expired + swept.evicted)
    }

    /// Removes entries in `scope`; returns how many were dropped.
    pub async fn purge(&self, scope: PurgeScope) -> Result<usize, StoreError> {
        let removed = self.store.purge(scope, self.clock.now()).await?;
        if scope == PurgeScope::Expired {
            self.counters.expired.fetch_add(removed as u64, Ordering::Relaxed);
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats, StoreError> {
        let (distance_entries, geocode_entries) = self.store.counts().await?;
        Ok(CacheStats {
            distance_entries,
            geocode_entries,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        })
    }

    async fn after_write(&self, now: DateTime<Utc>) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.config.sweep_every_writes.max(1) != 0 {
            return;
        }
        if let Err(e) = self.sweep_at(now).await {
            warn!(error = %e, backend = self.backend(), "Cache sweep failed");
        }
    }
}

/// Lowercases and collapses whitespace so trivially different spellings share a key.
fn normalize_address(address: &str) -> String {
    address
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
