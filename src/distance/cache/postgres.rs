//! Cache store shared by every replica through Postgres.
//!
//! Reads bump `hit_count` in the same `UPDATE ... RETURNING` that checks
//! expiry; writes are upserts. Tables come from the crate's migrations, which
//! `PgOrderStore::connect` runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::instrument;

use super::{CacheLookup, CacheStore, CachedGeocode, DistanceCacheEntry, DistanceKey, PurgeScope, Swept};
use crate::distance::GeocodeResult;
use crate::domain::Coordinate;
use crate::error::StoreError;

const KEY_MATCH: &str = "key_precision = $1 AND origin_lat_key = $2 AND origin_lng_key = $3 \
     AND dest_lat_key = $4 AND dest_lng_key = $5 AND mode = $6";

const DISTANCE_COLUMNS: &str = "origin_lat, origin_lng, dest_lat, dest_lng, distance_km, \
     duration_minutes, expires_at, hit_count, last_used";

#[derive(Clone)]
pub struct PgCacheStore {
    pool: PgPool,
}

impl PgCacheStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct DistanceRow {
    origin_lat: f64,
    origin_lng: f64,
    dest_lat: f64,
    dest_lng: f64,
    distance_km: f64,
    duration_minutes: f64,
    expires_at: DateTime<Utc>,
    hit_count: i64,
    last_used: DateTime<Utc>,
}

impl DistanceRow {
    fn into_entry(self, key: &DistanceKey) -> DistanceCacheEntry {
        DistanceCacheEntry {
            origin: Coordinate::new(self.origin_lat, self.origin_lng),
            destination: Coordinate::new(self.dest_lat, self.dest_lng),
            mode: key.mode,
            distance_km: self.distance_km,
            duration_minutes: self.duration_minutes,
            expires_at: self.expires_at,
            hit_count: self.hit_count.max(0) as u64,
            last_used: self.last_used,
        }
    }
}

#[derive(Debug, FromRow)]
struct GeocodeRow {
    lat: Option<f64>,
    lng: Option<f64>,
    formatted_address: Option<String>,
}

impl From<GeocodeRow> for CachedGeocode {
    fn from(row: GeocodeRow) -> Self {
        match (row.lat, row.lng) {
            (Some(lat), Some(lng)) => CachedGeocode::Resolved(GeocodeResult {
                coordinate: Coordinate::new(lat, lng),
                formatted_address: row.formatted_address.unwrap_or_default(),
            }),
            _ => CachedGeocode::Unresolvable,
        }
    }
}

#[async_trait]
impl CacheStore for PgCacheStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn get_distance(
        &self,
        key: &DistanceKey,
        now: DateTime<Utc>,
    ) -> Result<CacheLookup<DistanceCacheEntry>, StoreError> {
        let hit: Option<DistanceRow> = sqlx::query_as(&format!(
            "UPDATE distance_cache SET hit_count = hit_count + 1, last_used = $7
             WHERE {KEY_MATCH} AND expires_at > $7
             RETURNING {DISTANCE_COLUMNS}"
        ))
        .bind(key.precision as i32)
        .bind(key.origin.0)
        .bind(key.origin.1)
        .bind(key.destination.0)
        .bind(key.destination.1)
        .bind(key.mode.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = hit {
            return Ok(CacheLookup::Hit(row.into_entry(key)));
        }

        let expired = sqlx::query(&format!(
            "DELETE FROM distance_cache WHERE {KEY_MATCH} AND expires_at <= $7"
        ))
        .bind(key.precision as i32)
        .bind(key.origin.0)
        .bind(key.origin.1)
        .bind(key.destination.0)
        .bind(key.destination.1)
        .bind(key.mode.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        if expired.rows_affected() > 0 {
            Ok(CacheLookup::Expired)
        } else {
            Ok(CacheLookup::Miss)
        }
    }

    async fn put_distance(
        &self,
        key: &DistanceKey,
        entry: &DistanceCacheEntry,
    ) -> Result<DistanceCacheEntry, StoreError> {
        let row: DistanceRow = sqlx::query_as(&format!(
            "INSERT INTO distance_cache (key_precision, origin_lat_key, origin_lng_key,
                 dest_lat_key, dest_lng_key, mode, origin_lat, origin_lng, dest_lat, dest_lng,
                 distance_km, duration_minutes, expires_at, hit_count, last_used)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 0, $14)
             ON CONFLICT (key_precision, origin_lat_key, origin_lng_key, dest_lat_key,
                          dest_lng_key, mode) DO UPDATE SET
                 distance_km = EXCLUDED.distance_km,
                 duration_minutes = EXCLUDED.duration_minutes,
                 expires_at = EXCLUDED.expires_at,
                 hit_count = distance_cache.hit_count + 1,
                 last_used = EXCLUDED.last_used
             RETURNING {DISTANCE_COLUMNS}"
        ))
        .bind(key.precision as i32)
        .bind(key.origin.0)
        .bind(key.origin.1)
        .bind(key.destination.0)
        .bind(key.destination.1)
        .bind(key.mode.as_str())
        .bind(entry.origin.lat)
        .bind(entry.origin.lng)
        .bind(entry.destination.lat)
        .bind(entry.destination.lng)
        .bind(entry.distance_km)
        .bind(entry.duration_minutes)
        .bind(entry.expires_at)
        .bind(entry.last_used)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into_entry(key))
    }

    async fn get_geocode(
        &self,
        address_key: &str,
        now: DateTime<Utc>,
    ) -> Result<CacheLookup<CachedGeocode>, StoreError> {
        let hit: Option<GeocodeRow> = sqlx::query_as(
            "UPDATE geocode_cache SET hit_count = hit_count + 1, last_used = $2
             WHERE address_key = $1 AND expires_at > $2
             RETURNING lat, lng, formatted_address",
        )
        .bind(address_key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = hit {
            return Ok(CacheLookup::Hit(row.into()));
        }

        let expired = sqlx::query("DELETE FROM geocode_cache WHERE address_key = $1 AND expires_at <= $2")
            .bind(address_key)
            .bind(now)
            .execute(&self.pool)
            .await?;
        if expired.rows_affected() > 0 {
            Ok(CacheLookup::Expired)
        } else {
            Ok(CacheLookup::Miss)
        }
    }

    async fn put_geocode(
        &self,
        address_key: &str,
        geocode: &CachedGeocode,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let resolved = match geocode {
            CachedGeocode::Resolved(result) => Some(result),
            CachedGeocode::Unresolvable => None,
        };
        sqlx::query(
            "INSERT INTO geocode_cache (address_key, lat, lng, formatted_address, expires_at,
                 hit_count, last_used)
             VALUES ($1, $2, $3, $4, $5, 0, $6)
             ON CONFLICT (address_key) DO UPDATE SET
                 lat = EXCLUDED.lat,
                 lng = EXCLUDED.lng,
                 formatted_address = EXCLUDED.formatted_address,
                 expires_at = EXCLUDED.expires_at,
                 hit_count = geocode_cache.hit_count + 1,
                 last_used = EXCLUDED.last_used",
        )
        .bind(address_key)
        .bind(resolved.map(|r| r.coordinate.lat))
        .bind(resolved.map(|r| r.coordinate.lng))
        .bind(resolved.map(|r| r.formatted_address.as_str()))
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn sweep(&self, now: DateTime<Utc>, max_entries: usize) -> Result<Swept, StoreError> {
        let cap = i64::try_from(max_entries).unwrap_or(i64::MAX);
        let mut tx = self.pool.begin().await?;

        let mut expired = 0;
        for table in ["distance_cache", "geocode_cache"] {
            expired += sqlx::query(&format!("DELETE FROM {table} WHERE expires_at <= $1"))
                .bind(now)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }

        let mut evicted = 0;
        for table in ["distance_cache", "geocode_cache"] {
            evicted += sqlx::query(&format!(
                "DELETE FROM {table} WHERE ctid IN (
                     SELECT ctid FROM {table} ORDER BY last_used DESC OFFSET $1
                 )"
            ))
            .bind(cap)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        Ok(Swept {
            expired: expired as usize,
            evicted: evicted as usize,
        })
    }

    async fn purge(&self, scope: PurgeScope, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let statements: &[&str] = match scope {
            PurgeScope::All => &["DELETE FROM distance_cache", "DELETE FROM geocode_cache"],
            PurgeScope::Distances => &["DELETE FROM distance_cache"],
            PurgeScope::Geocodes => &["DELETE FROM geocode_cache"],
            PurgeScope::Expired => &[
                "DELETE FROM distance_cache WHERE expires_at <= $1",
                "DELETE FROM geocode_cache WHERE expires_at <= $1",
            ],
        };

        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for sql in statements {
            let query = sqlx::query(*sql);
            let query = if scope == PurgeScope::Expired { query.bind(now) } else { query };
            removed += query.execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(removed as usize)
    }

    async fn counts(&self) -> Result<(usize, usize), StoreError> {
        let (distances, geocodes): (i64, i64) = sqlx::query_as(
            "SELECT (SELECT count(*) FROM distance_cache), (SELECT count(*) FROM geocode_cache)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((distances.max(0) as usize, geocodes.max(0) as usize))
    }
}

#[cfg(all(test, feature = "test-postgres"))]
mod pg_tests {
    use super::*;
    use crate::distance::cache::CacheConfig;
    use crate::distance::{DistanceCache, DistanceEstimate, EstimateSource};
    use crate::clock::ManualClock;
    use crate::domain::TravelMode;
    use chrono::Duration;
    use std::sync::Arc;

    const A: Coordinate = Coordinate { lat: 25.0478, lng: 121.5170 };
    const B: Coordinate = Coordinate { lat: 25.0340, lng: 121.5645 };

    fn estimate(km: f64) -> DistanceEstimate {
        DistanceEstimate {
            distance_km: km,
            duration_minutes: km * 2.0,
            source: EstimateSource::Provider,
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_replicas_share_entries(pool: PgPool) {
        let clock = ManualClock::new();
        let replica = |pool: PgPool| {
            DistanceCache::with_store(
                CacheConfig::default(),
                Arc::new(clock.clone()),
                Arc::new(PgCacheStore::new(pool)),
            )
        };
        let first = replica(pool.clone());
        let second = replica(pool);

        first.put(A, B, TravelMode::Driving, &estimate(5.2)).await.unwrap();
        let entry = second.put(A, B, TravelMode::Driving, &estimate(5.4)).await.unwrap();
        assert_eq!(entry.hit_count, 1);

        let hit = first.get(A, B, TravelMode::Driving).await.unwrap().unwrap();
        assert_eq!(hit.distance_km, 5.4);
        assert_eq!(hit.hit_count, 2);

        assert_eq!(second.purge(PurgeScope::Distances).await.unwrap(), 1);
        assert!(first.get(A, B, TravelMode::Driving).await.unwrap().is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_expiry_and_negative_geocodes(pool: PgPool) {
        let clock = ManualClock::new();
        let cache = DistanceCache::with_store(
            CacheConfig {
                distance_ttl_secs: 60,
                negative_geocode_ttl_secs: 120,
                ..CacheConfig::default()
            },
            Arc::new(clock.clone()),
            Arc::new(PgCacheStore::new(pool)),
        );
        cache.put(A, B, TravelMode::Scooter, &estimate(3.0)).await.unwrap();
        cache
            .put_geocode("Lane 99 Nowhere", &CachedGeocode::Unresolvable)
            .await
            .unwrap();

        clock.advance(Duration::seconds(61));
        assert!(cache.get(A, B, TravelMode::Scooter).await.unwrap().is_none());
        assert_eq!(cache.stats().await.unwrap().expired, 1);
        assert_eq!(
            cache.get_geocode("lane 99 nowhere").await.unwrap(),
            Some(CachedGeocode::Unresolvable)
        );

        clock.advance(Duration::seconds(60));
        assert_eq!(cache.sweep_expired().await.unwrap(), 1);
        assert_eq!(cache.stats().await.unwrap().geocode_entries, 0);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_sweep_evicts_least_recently_used(pool: PgPool) {
        let store = PgCacheStore::new(pool);
        let now = Utc::now();
        let c = Coordinate::new(25.0, 121.0);
        for (i, (from, to)) in [(A, B), (A, c), (B, c)].into_iter().enumerate() {
            let used = now + Duration::seconds(i as i64);
            let key = DistanceKey::new(from, to, TravelMode::Driving, 4);
            let entry = DistanceCacheEntry {
                origin: from,
                destination: to,
                mode: TravelMode::Driving,
                distance_km: 1.0,
                duration_minutes: 2.0,
                expires_at: now + Duration::hours(1),
                hit_count: 0,
                last_used: used,
            };
            store.put_distance(&key, &entry).await.unwrap();
        }

        let swept = store.sweep(now, 2).await.unwrap();
        assert_eq!(swept, Swept { expired: 0, evicted: 1 });
        let oldest = DistanceKey::new(A, B, TravelMode::Driving, 4);
        assert_eq!(store.get_distance(&oldest, now).await.unwrap(), CacheLookup::Miss);
    }
}
