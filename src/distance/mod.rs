//! Cache-first distance and geocode lookups.
//!
//! [`DistanceService`] is what the rest of the crate talks to: it answers from
//! the [`DistanceCache`] when it can, calls the [`DistanceProvider`] on a miss
//! and counts both so spend can be watched from outside.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use utoipa::ToSchema;

use crate::domain::{Coordinate, TravelMode};
use crate::error::{ProviderError, StoreError};

pub mod cache;
pub mod provider;

pub use cache::{
    CacheConfig, CacheStats, CacheStore, CachedGeocode, DistanceCache, MemoryCacheStore, PgCacheStore,
    PurgeScope,
};
pub use provider::{DistanceProvider, HaversineProvider, HttpDistanceProvider, ProviderConfig};

/// Where an estimate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EstimateSource {
    Provider,
    Cache,
    /// Beeline fallback after a provider failure.
    Haversine,
    /// Origin and destination share a cache key.
    SamePoint,
}

/// Distance and travel time between two points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DistanceEstimate {
    pub distance_km: f64,
    pub duration_minutes: f64,
    pub source: EstimateSource,
}

impl DistanceEstimate {
    /// Beeline estimate scaled by `road_factor`, timed at the mode's average speed.
    ///
    /// ```
    /// use courier_dispatch::distance::{DistanceEstimate, EstimateSource};
    /// use courier_dispatch::domain::{Coordinate, TravelMode};
    ///
    /// let a = Coordinate::new(25.0330, 121.5654);
    /// let e = DistanceEstimate::haversine(a, a, TravelMode::Driving, 1.3);
    /// assert_eq!(e.distance_km, 0.0);
    /// assert_eq!(e.source, EstimateSource::Haversine);
    /// ```
    pub fn haversine(
        origin: Coordinate,
        destination: Coordinate,
        mode: TravelMode,
        road_factor: f64,
    ) -> Self {
        let distance_km = origin.distance_km(&destination) * road_factor;
        Self {
            distance_km,
            duration_minutes: distance_km / mode.average_speed_kmph() * 60.0,
            source: EstimateSource::Haversine,
        }
    }
}

/// A geocoded address.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeResult {
    pub coordinate: Coordinate,
    pub formatted_address: String,
}

/// Anything the sequencer can ask for pairwise distances.
#[async_trait]
pub trait DistanceSource: Send + Sync {
    async fn lookup(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        mode: TravelMode,
    ) -> Result<DistanceEstimate, ProviderError>;

    /// Estimate used when [`DistanceSource::lookup`] fails.
    fn fallback(&self, origin: Coordinate, destination: Coordinate, mode: TravelMode) -> DistanceEstimate {
        DistanceEstimate::haversine(origin, destination, mode, 1.0)
    }
}

/// Provider call counts and cache statistics.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DistanceTelemetry {
    pub provider: String,
    pub distance_calls: u64,
    pub geocode_calls: u64,
    pub provider_failures: u64,
    pub fallbacks: u64,
    /// Where cache entries live: `memory` or `postgres`.
    pub cache_backend: String,
    pub cache: CacheStats,
}

#[derive(Debug, Default)]
struct Counters {
    distance_calls: AtomicU64,
    geocode_calls: AtomicU64,
    provider_failures: AtomicU64,
    fallbacks: AtomicU64,
}

/// Distance cache in front of a provider.
pub struct DistanceService {
    cache: Arc<DistanceCache>,
    provider: Arc<dyn DistanceProvider>,
    road_factor: f64,
    counters: Counters,
}

impl DistanceService {
    pub fn new(cache: Arc<DistanceCache>, provider: Arc<dyn DistanceProvider>, road_factor: f64) -> Self {
        Self {
            cache,
            provider,
            road_factor,
            counters: Counters::default(),
        }
    }

    pub fn cache(&self) -> &DistanceCache {
        &self.cache
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Whether [`DistanceService::geocode`] can resolve anything at all.
    pub fn can_geocode(&self) -> bool {
        self.provider.can_geocode()
    }

    /// Resolves an address to a coordinate, cache first.
    ///
    /// Addresses the provider found nothing for are cached as unresolvable and
    /// answered with [`ProviderError::NoResult`] until that entry expires.
    #[instrument(skip(self))]
    pub async fn geocode(&self, address: &str) -> Result<GeocodeResult, ProviderError> {
        if !self.provider.can_geocode() {
            return Err(ProviderError::Unsupported(self.provider.name()));
        }

        match self.cache.get_geocode(address).await {
            Ok(Some(CachedGeocode::Resolved(hit))) => return Ok(hit),
            Ok(Some(CachedGeocode::Unresolvable)) => return Err(ProviderError::NoResult),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Geocode cache read failed"),
        }

        self.counters.geocode_calls.fetch_add(1, Ordering::Relaxed);
        let (outcome, cached) = match self.provider.geocode(address).await {
            Ok(result) => {
                let cached = CachedGeocode::Resolved(result.clone());
                (Ok(result), Some(cached))
            }
            Err(ProviderError::NoResult) => {
                debug!("Address could not be resolved");
                (Err(ProviderError::NoResult), Some(CachedGeocode::Unresolvable))
            }
            Err(e) => {
                self.counters.provider_failures.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "Geocoding failed");
                (Err(e), None)
            }
        };
        if let Some(cached) = cached {
            if let Err(e) = self.cache.put_geocode(address, &cached).await {
                warn!(error = %e, "Geocode cache write failed");
            }
        }
        outcome
    }

    pub async fn telemetry(&self) -> Result<DistanceTelemetry, StoreError> {
        Ok(DistanceTelemetry {
            provider: self.provider.name().to_string(),
            distance_calls: self.counters.distance_calls.load(Ordering::Relaxed),
            geocode_calls: self.counters.geocode_calls.load(Ordering::Relaxed),
            provider_failures: self.counters.provider_failures.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            cache_backend: self.cache.backend().to_string(),
            cache: self.cache.stats().await?,
        })
    }
}

#[async_trait]
impl DistanceSource for DistanceService {
    async fn lookup(
        &self,
        origin: Coordinate,
        destination: Coordinate,
        mode: TravelMode,
    ) -> Result<DistanceEstimate, ProviderError> {
        let precision = self.cache.config().precision;
        if origin.rounded_key(precision) == destination.rounded_key(precision) {
            return Ok(DistanceEstimate {
                distance_km: 0.0,
                duration_minutes: 0.0,
                source: EstimateSource::SamePoint,
            });
        }

        match self.cache.get(origin, destination, mode).await {
            Ok(Some(hit)) => {
                return Ok(DistanceEstimate {
                    distance_km: hit.distance_km,
                    duration_minutes: hit.duration_minutes,
                    source: EstimateSource::Cache,
                })
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Distance cache read failed"),
        }

        self.counters.distance_calls.fetch_add(1, Ordering::Relaxed);
        match self.provider.distance(origin, destination, mode).await {
            Ok(d) => {
                let estimate = DistanceEstimate {
                    distance_km: d.distance_meters / 1000.0,
                    duration_minutes: d.duration_seconds / 60.0,
                    source: EstimateSource::Provider,
                };
                if let Err(e) = self.cache.put(origin, destination, mode, &estimate).await {
                    warn!(error = %e, "Distance cache write failed");
                }
                Ok(estimate)
            }
            Err(e) => {
                self.counters.provider_failures.fetch_add(1, Ordering::Relaxed);
                warn!(%origin, %destination, error = %e, "Distance lookup failed");
                Err(e)
            }
        }
    }

    fn fallback(&self, origin: Coordinate, destination: Coordinate, mode: TravelMode) -> DistanceEstimate {
        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        DistanceEstimate::haversine(origin, destination, mode, self.road_factor)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Provider doubles shared by unit tests.

    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Haversine provider that counts calls and can be switched to fail.
    #[derive(Default)]
    pub struct CountingProvider {
        pub distance_calls: AtomicUsize,
        pub geocode_calls: AtomicUsize,
        pub failing: std::sync::atomic::AtomicBool,
        /// Geocodes answer `NoResult` while set.
        pub no_results: std::sync::atomic::AtomicBool,
    }

    impl CountingProvider {
        pub fn failing() -> Self {
            let p = Self::default();
            p.failing.store(true, Ordering::SeqCst);
            p
        }

        pub fn calls(&self) -> usize {
            self.distance_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DistanceProvider for CountingProvider {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn distance(
            &self,
            origin: Coordinate,
            destination: Coordinate,
            mode: TravelMode,
        ) -> Result<provider::ProviderDistance, ProviderError> {
            self.distance_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ProviderError::Timeout);
            }
            HaversineProvider::new(1.0).distance(origin, destination, mode).await
        }

        async fn geocode(&self, address: &str) -> Result<GeocodeResult, ProviderError> {
            self.geocode_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ProviderError::Timeout);
            }
            if self.no_results.load(Ordering::SeqCst) {
                return Err(ProviderError::NoResult);
            }
            Ok(GeocodeResult {
                coordinate: Coordinate::new(25.0330, 121.5654),
                formatted_address: address.to_uppercase(),
            })
        }
    }
}
