//! Visiting-order optimization for one route group.
//!
//! Routes are open paths: they start at the courier (or depot) and end at the
//! last stop. Pairwise distances come from a [`DistanceSource`], fetched
//! concurrently before any optimization starts; a failed lookup is replaced by
//! the source's haversine fallback and the whole result is marked
//! [`Confidence::Low`].
//!
//! Construction is nearest-neighbor from the origin. [`SequenceStrategy::TwoOpt`]
//! then reverses sub-sequences while that strictly shortens the path, bounded
//! by a pass cap. If the result is not shorter than the input order, the input
//! order is returned unchanged.
//!
//! One wall-clock budget covers both the lookups and 2-opt. Lookups still in
//! flight at the deadline are abandoned and estimated by the fallback.

use futures::stream::{self, StreamExt};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, instrument, warn};
use utoipa::ToSchema;

use crate::distance::{DistanceEstimate, DistanceSource};
use crate::domain::{Coordinate, OrderId, TravelMode};
use crate::error::{DispatchError, Result};
use crate::geometry::route_polyline;

/// Improvements smaller than this (km) are treated as ties.
const EPSILON_KM: f64 = 1e-9;

/// Most stops one route may have. Lookups grow with the square of this.
pub const MAX_ROUTE_STOPS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStrategy {
    /// Greedy construction only.
    NearestNeighbor,
    #[default]
    TwoOpt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub strategy: SequenceStrategy,
    pub travel_mode: TravelMode,
    /// Upper bound on full 2-opt passes.
    pub max_passes: usize,
    pub time_budget_ms: u64,
    /// Distance lookups in flight at once.
    pub lookup_concurrency: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            strategy: SequenceStrategy::TwoOpt,
            travel_mode: TravelMode::Scooter,
            max_passes: 50,
            time_budget_ms: 2_000,
            lookup_concurrency: 8,
        }
    }
}

/// `Low` when any leg was estimated by the haversine fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Low,
}

/// A point to visit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Stop {
    pub order_id: OrderId,
    pub coordinate: Coordinate,
}

/// Result of [`RouteSequencer::optimize_route`].
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteSequence {
    pub sequence: Vec<OrderId>,
    pub origin: Coordinate,
    pub total_distance_km: f64,
    /// Exact total in minutes.
    pub total_duration_minutes: f64,
    /// `total_duration_minutes` rounded up, for display.
    pub display_duration_minutes: u64,
    /// Length of the route in input order.
    pub baseline_distance_km: f64,
    pub improvement_percentage: f64,
    pub confidence: Confidence,
    pub strategy: SequenceStrategy,
    pub passes: usize,
    /// True if the time budget cut distance lookups short, or a pass or time
    /// limit stopped 2-opt before it converged.
    pub budget_exhausted: bool,
    /// Google-encoded polyline from the origin through every stop.
    pub polyline: String,
}

/// Percentage saved relative to `baseline`, never negative.
///
/// ```
/// use courier_dispatch::sequencer::improvement_percentage;
///
/// assert_eq!(improvement_percentage(10.0, 7.5), 25.0);
/// assert_eq!(improvement_percentage(10.0, 12.0), 0.0);
/// assert_eq!(improvement_percentage(0.0, 0.0), 0.0);
/// ```
pub fn improvement_percentage(baseline: f64, optimized: f64) -> f64 {
    if baseline <= 0.0 || optimized >= baseline {
        return 0.0;
    }
    ((baseline - optimized) / baseline * 100.0).max(0.0)
}

/// Directed distance and duration between the origin (index 0) and each stop.
struct CostMatrix {
    distance: Vec<Vec<f64>>,
    duration: Vec<Vec<f64>>,
}

impl CostMatrix {
    /// Total distance of origin followed by `path` (stop indices, 1-based).
    fn path_distance(&self, path: &[usize]) -> f64 {
        let mut prev = 0;
        let mut total = 0.0;
        for &node in path {
            total += self.distance[prev][node];
            prev = node;
        }
        total
    }

    fn path_duration(&self, path: &[usize]) -> f64 {
        let mut prev = 0;
        let mut total = 0.0;
        for &node in path {
            total += self.duration[prev][node];
            prev = node;
        }
        total
    }
}

pub struct RouteSequencer {
    config: SequencerConfig,
}

impl RouteSequencer {
    pub fn new(config: SequencerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// Computes a low-cost visiting order for `stops` starting at `origin`.
    ///
    /// Never fails because of the distance source; only invalid input is
    /// rejected. Returns within roughly `time_budget_ms` however slow the
    /// source is.
    #[instrument(skip(self, stops, source), fields(stops = stops.len()))]
    pub async fn optimize_route(
        &self,
        origin: Coordinate,
        stops: &[Stop],
        source: &dyn DistanceSource,
    ) -> Result<RouteSequence> {
        validate(origin, stops)?;

        let deadline = Instant::now() + Duration::from_millis(self.config.time_budget_ms);
        let (matrix, confidence, lookups_cut) = self.build_matrix(origin, stops, source, deadline).await;
        let n = stops.len();
        let input_order: Vec<usize> = (1..=n).collect();
        let baseline = matrix.path_distance(&input_order);

        let mut path = nearest_neighbor(&matrix, n);
        let mut passes = 0;
        let mut budget_exhausted = lookups_cut;
        if self.config.strategy == SequenceStrategy::TwoOpt {
            let (ran, cut) = two_opt(&matrix, &mut path, self.config.max_passes, deadline);
            passes = ran;
            budget_exhausted |= cut;
        }

        if matrix.path_distance(&path) > baseline {
            path = input_order;
        }

        let total_distance_km = matrix.path_distance(&path);
        let total_duration_minutes = matrix.path_duration(&path);
        let ordered: Vec<&Stop> = path.iter().map(|&i| &stops[i - 1]).collect();

        debug!(
            total_distance_km,
            baseline_km = baseline,
            passes,
            budget_exhausted,
            "Route sequenced"
        );

        Ok(RouteSequence {
            sequence: ordered.iter().map(|s| s.order_id).collect(),
            origin,
            total_distance_km,
            total_duration_minutes,
            display_duration_minutes: total_duration_minutes.ceil().max(0.0) as u64,
            baseline_distance_km: baseline,
            improvement_percentage: improvement_percentage(baseline, total_distance_km),
            confidence,
            strategy: self.config.strategy,
            passes,
            budget_exhausted,
            polyline: route_polyline(origin, ordered.iter().map(|s| &s.coordinate)),
        })
    }

    /// Fills the matrix, giving up on lookups that outlive `deadline`.
    /// The flag is true when at least one lookup was abandoned.
    async fn build_matrix(
        &self,
        origin: Coordinate,
        stops: &[Stop],
        source: &dyn DistanceSource,
        deadline: Instant,
    ) -> (CostMatrix, Confidence, bool) {
        let nodes: Vec<Coordinate> = std::iter::once(origin)
            .chain(stops.iter().map(|s| s.coordinate))
            .collect();
        let n = nodes.len();
        let mode = self.config.travel_mode;

        // No leg ever returns to the origin
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| (1..n).filter(move |&j| j != i).map(move |j| (i, j)))
            .collect();

        let nodes_ref = &nodes;
        let results: Vec<(usize, usize, DistanceEstimate, Lookup)> = stream::iter(pairs)
            .map(|(i, j)| async move {
                let (from, to) = (nodes_ref[i], nodes_ref[j]);
                match timeout_at(deadline, source.lookup(from, to, mode)).await {
                    Ok(Ok(estimate)) => (i, j, estimate, Lookup::Resolved),
                    Ok(Err(_)) => (i, j, source.fallback(from, to, mode), Lookup::Failed),
                    Err(_) => (i, j, source.fallback(from, to, mode), Lookup::TimedOut),
                }
            })
            .buffer_unordered(self.config.lookup_concurrency.max(1))
            .collect()
            .await;

        let mut matrix = CostMatrix {
            distance: vec![vec![0.0; n]; n],
            duration: vec![vec![0.0; n]; n],
        };
        let mut confidence = Confidence::High;
        let mut timed_out = 0usize;
        for (i, j, estimate, lookup) in results {
            matrix.distance[i][j] = estimate.distance_km;
            matrix.duration[i][j] = estimate.duration_minutes;
            match lookup {
                Lookup::Resolved => {}
                Lookup::Failed => confidence = Confidence::Low,
                Lookup::TimedOut => {
                    confidence = Confidence::Low;
                    timed_out += 1;
                }
            }
        }
        if timed_out > 0 {
            warn!(timed_out, budget_ms = self.config.time_budget_ms, "Distance lookups exceeded the time budget");
        }
        (matrix, confidence, timed_out > 0)
    }
}

enum Lookup {
    Resolved,
    Failed,
    TimedOut,
}

fn validate(origin: Coordinate, stops: &[Stop]) -> Result<()> {
    if stops.len() > MAX_ROUTE_STOPS {
        return Err(DispatchError::validation(format!(
            "route has {} stops, at most {} are allowed",
            stops.len(),
            MAX_ROUTE_STOPS
        )));
    }
    if !origin.is_valid() {
        return Err(DispatchError::validation(format!("invalid origin {}", origin)));
    }
    for (i, stop) in stops.iter().enumerate() {
        if !stop.coordinate.is_valid() {
            return Err(DispatchError::validation(format!(
                "order {} has an invalid coordinate",
                stop.order_id
            )));
        }
        if stops[..i].iter().any(|s| s.order_id == stop.order_id) {
            return Err(DispatchError::validation(format!(
                "order {} appears twice",
                stop.order_id
            )));
        }
    }
    Ok(())
}

/// Greedy path from the origin; ties go to the lower stop index.
fn nearest_neighbor(matrix: &CostMatrix, n: usize) -> Vec<usize> {
    let mut visited = vec![false; n + 1];
    let mut path = Vec::with_capacity(n);
    let mut current = 0;

    for _ in 0..n {
        let Some(next) = (1..=n)
            .filter(|&i| !visited[i])
            .min_by_key(|&i| OrderedFloat(matrix.distance[current][i]))
        else {
            break;
        };
        visited[next] = true;
        path.push(next);
        current = next;
    }
    path
}

/// Improves `path` in place by segment reversal. Returns the number of passes
/// run and whether a limit cut the search short.
///
/// Each candidate is scored on the full path so asymmetric distances are
/// handled correctly.
fn two_opt(matrix: &CostMatrix, path: &mut [usize], max_passes: usize, deadline: Instant) -> (usize, bool) {
    let n = path.len();
    if n < 2 {
        return (0, false);
    }

    let mut best = matrix.path_distance(path);
    let mut passes = 0;

    loop {
        if passes >= max_passes {
            return (passes, true);
        }
        passes += 1;

        let mut improved = false;
        for i in 0..n - 1 {
            for k in i + 1..n {
                if Instant::now() >= deadline {
                    return (passes, true);
                }
                path[i..=k].reverse();
                let candidate = matrix.path_distance(path);
                if candidate < best - EPSILON_KM {
                    best = candidate;
                    improved = true;
                } else {
                    path[i..=k].reverse();
                }
            }
        }

        if !improved {
            return (passes, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Symmetric beeline distances, 30 km/h.
    struct Beeline;

    #[async_trait]
    impl DistanceSource for Beeline {
        async fn lookup(
            &self,
            origin: Coordinate,
            destination: Coordinate,
            mode: TravelMode,
        ) -> std::result::Result<DistanceEstimate, ProviderError> {
            let mut estimate = DistanceEstimate::haversine(origin, destination, mode, 1.0);
            estimate.source = crate::distance::EstimateSource::Provider;
            Ok(estimate)
        }
    }

    /// Fails every `nth` lookup.
    struct Flaky {
        nth: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DistanceSource for Flaky {
        async fn lookup(
            &self,
            origin: Coordinate,
            destination: Coordinate,
            mode: TravelMode,
        ) -> std::result::Result<DistanceEstimate, ProviderError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) % self.nth == 0 {
                return Err(ProviderError::Timeout);
            }
            Beeline.lookup(origin, destination, mode).await
        }
    }

    /// Answers correctly, but only after `delay`.
    struct Slow {
        delay: Duration,
    }

    #[async_trait]
    impl DistanceSource for Slow {
        async fn lookup(
            &self,
            origin: Coordinate,
            destination: Coordinate,
            mode: TravelMode,
        ) -> std::result::Result<DistanceEstimate, ProviderError> {
            tokio::time::sleep(self.delay).await;
            Beeline.lookup(origin, destination, mode).await
        }
    }

    fn stop(order_id: OrderId, lat: f64, lng: f64) -> Stop {
        Stop {
            order_id,
            coordinate: Coordinate::new(lat, lng),
        }
    }

    fn sequencer(strategy: SequenceStrategy) -> RouteSequencer {
        RouteSequencer::new(SequencerConfig {
            strategy,
            ..SequencerConfig::default()
        })
    }

    const ORIGIN: Coordinate = Coordinate { lat: 25.0330, lng: 121.5000 };

    /// Stops along one street, given out of order.
    fn scrambled_street() -> Vec<Stop> {
        vec![
            stop(3, 25.0330, 121.5300),
            stop(1, 25.0330, 121.5100),
            stop(5, 25.0330, 121.5500),
            stop(2, 25.0330, 121.5200),
            stop(4, 25.0330, 121.5400),
        ]
    }

    #[tokio::test]
    async fn test_five_stops_are_deterministic() {
        let seq = sequencer(SequenceStrategy::TwoOpt);
        let stops = scrambled_street();

        let first = seq.optimize_route(ORIGIN, &stops, &Beeline).await.unwrap();
        let second = seq.optimize_route(ORIGIN, &stops, &Beeline).await.unwrap();

        assert_eq!(first.sequence, vec![1, 2, 3, 4, 5]);
        assert_eq!(first, second);
        assert_eq!(first.confidence, Confidence::High);
        assert!(first.improvement_percentage > 0.0);
        assert_eq!(
            first.display_duration_minutes,
            first.total_duration_minutes.ceil() as u64
        );
    }

    #[tokio::test]
    async fn test_never_worse_than_input_order() {
        let mut rng = StdRng::seed_from_u64(7);
        for strategy in [SequenceStrategy::NearestNeighbor, SequenceStrategy::TwoOpt] {
            let seq = sequencer(strategy);
            for _ in 0..20 {
                let stops: Vec<Stop> = (0..9)
                    .map(|i| stop(i, 25.0 + rng.gen_range(0.0..0.05), 121.5 + rng.gen_range(0.0..0.05)))
                    .collect();
                let route = seq.optimize_route(ORIGIN, &stops, &Beeline).await.unwrap();

                assert!(route.total_distance_km <= route.baseline_distance_km + 1e-9);
                assert!(route.improvement_percentage >= 0.0);
                let mut ids = route.sequence.clone();
                ids.sort_unstable();
                assert_eq!(ids, (0..9).collect::<Vec<_>>());
            }
        }
    }

    #[tokio::test]
    async fn test_two_opt_untangles_crossing() {
        // Nearest neighbor from the origin walks into a crossing that 2-opt removes
        let stops = vec![
            stop(1, 25.0330, 121.5010),
            stop(2, 25.0430, 121.5100),
            stop(3, 25.0230, 121.5100),
            stop(4, 25.0430, 121.5200),
            stop(5, 25.0230, 121.5200),
        ];
        let nn = sequencer(SequenceStrategy::NearestNeighbor)
            .optimize_route(ORIGIN, &stops, &Beeline)
            .await
            .unwrap();
        let opt = sequencer(SequenceStrategy::TwoOpt)
            .optimize_route(ORIGIN, &stops, &Beeline)
            .await
            .unwrap();

        assert!(opt.total_distance_km <= nn.total_distance_km + 1e-9);
        assert!(opt.passes >= 1);
        assert!(!opt.budget_exhausted);
    }

    #[tokio::test]
    async fn test_provider_failure_falls_back_with_low_confidence() {
        let flaky = Flaky {
            nth: 3,
            calls: AtomicUsize::new(0),
        };
        let route = sequencer(SequenceStrategy::TwoOpt)
            .optimize_route(ORIGIN, &scrambled_street(), &flaky)
            .await
            .unwrap();

        assert_eq!(route.confidence, Confidence::Low);
        // The default fallback is also beeline, so the answer is unchanged
        assert_eq!(route.sequence, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_zero_budget_returns_best_so_far() {
        let seq = RouteSequencer::new(SequencerConfig {
            max_passes: 0,
            ..SequencerConfig::default()
        });
        let route = seq.optimize_route(ORIGIN, &scrambled_street(), &Beeline).await.unwrap();
        assert!(route.budget_exhausted);
        assert_eq!(route.sequence.len(), 5);
    }

    #[tokio::test]
    async fn test_slow_source_cannot_outlast_the_budget() {
        let seq = RouteSequencer::new(SequencerConfig {
            time_budget_ms: 100,
            ..SequencerConfig::default()
        });
        let stops: Vec<Stop> = (0..8)
            .map(|i| stop(i, 25.0300 + 0.002 * i as f64, 121.5100 + 0.003 * (i % 3) as f64))
            .collect();
        let slow = Slow {
            delay: Duration::from_millis(500),
        };

        let started = std::time::Instant::now();
        let route = seq.optimize_route(ORIGIN, &stops, &slow).await.unwrap();

        // 64 lookups at 8 in flight would take 4s without the budget
        assert!(started.elapsed() < Duration::from_millis(1_500));
        assert!(route.budget_exhausted);
        assert_eq!(route.confidence, Confidence::Low);
        assert_eq!(route.sequence.len(), 8);
        assert!(route.total_distance_km <= route.baseline_distance_km + 1e-9);
    }

    #[tokio::test]
    async fn test_rejects_oversized_route() {
        let seq = sequencer(SequenceStrategy::NearestNeighbor);
        let stops: Vec<Stop> = (0..=MAX_ROUTE_STOPS as OrderId)
            .map(|i| stop(i, 25.0 + 0.0001 * i as f64, 121.5))
            .collect();
        assert!(matches!(
            seq.optimize_route(ORIGIN, &stops, &Beeline).await,
            Err(DispatchError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_trivial_inputs() {
        let seq = sequencer(SequenceStrategy::TwoOpt);

        let empty = seq.optimize_route(ORIGIN, &[], &Beeline).await.unwrap();
        assert!(empty.sequence.is_empty());
        assert_eq!(empty.total_distance_km, 0.0);
        assert_eq!(empty.improvement_percentage, 0.0);

        let single = seq
            .optimize_route(ORIGIN, &[stop(9, 25.04, 121.51)], &Beeline)
            .await
            .unwrap();
        assert_eq!(single.sequence, vec![9]);
        assert!(single.total_distance_km > 0.0);
    }

    #[tokio::test]
    async fn test_rejects_invalid_input() {
        let seq = sequencer(SequenceStrategy::TwoOpt);
        let dup = vec![stop(1, 25.0, 121.5), stop(1, 25.01, 121.5)];
        assert!(matches!(
            seq.optimize_route(ORIGIN, &dup, &Beeline).await,
            Err(DispatchError::Validation(_))
        ));

        let bad = vec![stop(1, 95.0, 121.5)];
        assert!(seq.optimize_route(ORIGIN, &bad, &Beeline).await.is_err());
    }
}
