//! Process-local cache store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;

use super::{CacheLookup, CacheStore, CachedGeocode, DistanceCacheEntry, DistanceKey, PurgeScope, Swept};
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct GeocodeEntry {
    geocode: CachedGeocode,
    expires_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
}

#[derive(Default)]
struct CacheState {
    distances: HashMap<DistanceKey, DistanceCacheEntry>,
    geocodes: HashMap<String, GeocodeEntry>,
}

/// Cache entries held in hash maps behind one mutex.
#[derive(Default)]
pub struct MemoryCacheStore {
    state: Mutex<CacheState>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Drops the least recently used entries until `map` holds at most `cap`.
fn evict_lru<K, V>(map: &mut HashMap<K, V>, cap: usize, last_used: impl Fn(&V) -> DateTime<Utc>) -> usize
where
    K: Eq + Hash + Clone,
{
    if map.len() <= cap {
        return 0;
    }
    let mut by_age: Vec<(DateTime<Utc>, K)> = map.iter().map(|(k, v)| (last_used(v), k.clone())).collect();
    by_age.sort_by_key(|(used, _)| *used);
    let excess = map.len() - cap;
    for (_, key) in by_age.into_iter().take(excess) {
        map.remove(&key);
    }
    excess
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get_distance(
        &self,
        key: &DistanceKey,
        now: DateTime<Utc>,
    ) -> Result<CacheLookup<DistanceCacheEntry>, StoreError> {
        let mut state = self.state.lock();
        let expired = match state.distances.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.hit_count += 1;
                entry.last_used = now;
                return Ok(CacheLookup::Hit(entry.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.distances.remove(key);
            return Ok(CacheLookup::Expired);
        }
        Ok(CacheLookup::Miss)
    }

    async fn put_distance(
        &self,
        key: &DistanceKey,
        entry: &DistanceCacheEntry,
    ) -> Result<DistanceCacheEntry, StoreError> {
        let mut state = self.state.lock();
        let stored = state
            .distances
            .entry(*key)
            .and_modify(|e| {
                e.distance_km = entry.distance_km;
                e.duration_minutes = entry.duration_minutes;
                e.expires_at = entry.expires_at;
                e.hit_count += 1;
                e.last_used = entry.last_used;
            })
            .or_insert_with(|| entry.clone())
            .clone();
        Ok(stored)
    }

    async fn get_geocode(
        &self,
        address_key: &str,
        now: DateTime<Utc>,
    ) -> Result<CacheLookup<CachedGeocode>, StoreError> {
        let mut state = self.state.lock();
        let expired = match state.geocodes.get_mut(address_key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_used = now;
                return Ok(CacheLookup::Hit(entry.geocode.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.geocodes.remove(address_key);
            return Ok(CacheLookup::Expired);
        }
        Ok(CacheLookup::Miss)
    }

    async fn put_geocode(
        &self,
        address_key: &str,
        geocode: &CachedGeocode,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state
            .geocodes
            .entry(address_key.to_string())
            .and_modify(|e| {
                e.geocode = geocode.clone();
                e.expires_at = expires_at;
                e.last_used = now;
            })
            .or_insert_with(|| GeocodeEntry {
                geocode: geocode.clone(),
                expires_at,
                last_used: now,
            });
        Ok(())
    }

    async fn sweep(&self, now: DateTime<Utc>, max_entries: usize) -> Result<Swept, StoreError> {
        let mut state = self.state.lock();
        let before = state.distances.len() + state.geocodes.len();
        state.distances.retain(|_, e| e.expires_at > now);
        state.geocodes.retain(|_, e| e.expires_at > now);
        let expired = before - (state.distances.len() + state.geocodes.len());

        let evicted = evict_lru(&mut state.distances, max_entries, |e| e.last_used)
            + evict_lru(&mut state.geocodes, max_entries, |e| e.last_used);
        Ok(Swept { expired, evicted })
    }

    async fn purge(&self, scope: PurgeScope, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        let removed = match scope {
            PurgeScope::All => {
                let n = state.distances.len() + state.geocodes.len();
                state.distances.clear();
                state.geocodes.clear();
                n
            }
            PurgeScope::Distances => {
                let n = state.distances.len();
                state.distances.clear();
                n
            }
            PurgeScope::Geocodes => {
                let n = state.geocodes.len();
                state.geocodes.clear();
                n
            }
            PurgeScope::Expired => {
                let before = state.distances.len() + state.geocodes.len();
                state.distances.retain(|_, e| e.expires_at > now);
                state.geocodes.retain(|_, e| e.expires_at > now);
                before - (state.distances.len() + state.geocodes.len())
            }
        };
        Ok(removed)
    }

    async fn counts(&self) -> Result<(usize, usize), StoreError> {
        let state = self.state.lock();
        Ok((state.distances.len(), state.geocodes.len()))
    }
}
