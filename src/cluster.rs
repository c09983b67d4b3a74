//! Geographic clustering of orders into route groups.
//!
//! # Algorithms
//!
//! [`ClusterAlgorithm::KMeans`] seeds `k = ceil(n / max_group_size)` centroids
//! by furthest-point selection, then alternates assign-to-nearest and recenter
//! until assignments stop changing or the iteration cap is hit. When a group
//! spreads wider than `max_distance_km`, `k` grows and the run repeats (a
//! bounded number of times). Groups still larger than `max_group_size` are
//! bisected along their longest axis.
//!
//! [`ClusterAlgorithm::Sweep`] sorts orders by polar angle around the overall
//! centroid and cuts the sweep into groups whenever the size cap or the
//! radius would be exceeded.
//!
//! The size cap is a hard constraint for both; the radius is best effort and
//! reported per group as `within_radius`.
//!
//! Both are deterministic for a given input order.

use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::debug;
use utoipa::ToSchema;

use crate::domain::{Coordinate, Order, OrderId};
use crate::error::{DispatchError, Result};
use crate::sequencer::MAX_ROUTE_STOPS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ClusterAlgorithm {
    #[default]
    #[serde(rename = "kmeans")]
    KMeans,
    Sweep,
}

impl ClusterAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterAlgorithm::KMeans => "kmeans",
            ClusterAlgorithm::Sweep => "sweep",
        }
    }
}

impl FromStr for ClusterAlgorithm {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "kmeans" | "k_means" | "k-means" => Ok(ClusterAlgorithm::KMeans),
            "sweep" => Ok(ClusterAlgorithm::Sweep),
            other => Err(DispatchError::validation(format!(
                "unknown clustering algorithm '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    /// Multiplier turning beeline distance into an approximate road distance.
    pub road_factor: f64,
    pub average_speed_kmph: f64,
    pub max_iterations: usize,
    /// How many times `k` may grow to satisfy the radius.
    pub max_radius_refinements: usize,
    /// Geocode coordinate-less orders before clustering.
    pub geocode_missing: bool,
    pub default_max_group_size: usize,
    pub default_max_distance_km: f64,
    pub default_algorithm: ClusterAlgorithm,
    /// Planning groups older than this are discarded on the next clustering run.
    pub planning_ttl_secs: u64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            road_factor: 1.3,
            average_speed_kmph: 25.0,
            max_iterations: 50,
            max_radius_refinements: 8,
            geocode_missing: true,
            default_max_group_size: 8,
            default_max_distance_km: 5.0,
            default_algorithm: ClusterAlgorithm::KMeans,
            planning_ttl_secs: 3600,
        }
    }
}

/// Per-call clustering parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterParams {
    pub max_group_size: usize,
    pub max_distance_km: f64,
    pub algorithm: ClusterAlgorithm,
}

impl ClusterParams {
    pub fn validate(&self) -> Result<()> {
        if self.max_group_size == 0 || self.max_group_size > MAX_ROUTE_STOPS {
            return Err(DispatchError::validation(format!(
                "maxGroupSize must be in 1..={}",
                MAX_ROUTE_STOPS
            )));
        }
        if !(self.max_distance_km.is_finite() && self.max_distance_km > 0.0) {
            return Err(DispatchError::validation("maxDistanceKm must be a positive number"));
        }
        Ok(())
    }
}

/// One proposed route group.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderCluster {
    pub order_ids: Vec<OrderId>,
    pub centroid: Coordinate,
    /// Largest centroid-to-member distance.
    pub max_radius_km: f64,
    pub estimated_distance_km: f64,
    pub estimated_duration_minutes: f64,
    pub within_radius: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOutcome {
    pub groups: Vec<OrderCluster>,
    /// Orders without a usable coordinate; none of them is in `groups`.
    pub needs_geocoding: Vec<OrderId>,
}

#[derive(Debug, Clone, Copy)]
struct Point {
    id: OrderId,
    at: Coordinate,
}

pub struct ClusteringEngine {
    config: ClusteringConfig,
}

impl ClusteringEngine {
    pub fn new(config: ClusteringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClusteringConfig {
        &self.config
    }

    /// Parameters filled in from configuration defaults.
    pub fn params(
        &self,
        max_group_size: Option<usize>,
        max_distance_km: Option<f64>,
        algorithm: Option<ClusterAlgorithm>,
    ) -> ClusterParams {
        ClusterParams {
            max_group_size: max_group_size.unwrap_or(self.config.default_max_group_size),
            max_distance_km: max_distance_km.unwrap_or(self.config.default_max_distance_km),
            algorithm: algorithm.unwrap_or(self.config.default_algorithm),
        }
    }

    /// Partitions `orders` into groups of at most `max_group_size`.
    pub fn cluster_orders(&self, orders: &[Order], params: &ClusterParams) -> Result<ClusterOutcome> {
        params.validate()?;

        let mut points = Vec::with_capacity(orders.len());
        let mut needs_geocoding = Vec::new();
        for order in orders {
            match order.coordinate {
                Some(at) if at.is_valid() => points.push(Point { id: order.id, at }),
                _ => needs_geocoding.push(order.id),
            }
        }

        let groups = match params.algorithm {
            ClusterAlgorithm::KMeans => self.kmeans(&points, params),
            ClusterAlgorithm::Sweep => sweep(&points, params),
        };

        let mut groups: Vec<OrderCluster> = groups
            .into_iter()
            .filter(|g| !g.is_empty())
            .map(|g| self.describe(&g, params.max_distance_km))
            .collect();
        groups.sort_by_key(|g| g.order_ids.iter().min().copied());

        debug!(
            algorithm = params.algorithm.as_str(),
            orders = points.len(),
            groups = groups.len(),
            needs_geocoding = needs_geocoding.len(),
            "Clustered orders"
        );

        Ok(ClusterOutcome {
            groups,
            needs_geocoding,
        })
    }

    fn kmeans(&self, points: &[Point], params: &ClusterParams) -> Vec<Vec<Point>> {
        if points.is_empty() {
            return Vec::new();
        }

        let mut k = points.len().div_ceil(params.max_group_size);
        let mut groups = lloyd(points, k, self.config.max_iterations);
        let mut refinements = 0;
        while refinements < self.config.max_radius_refinements
            && k < points.len()
            && groups.iter().any(|g| radius_km(g) > params.max_distance_km)
        {
            k += 1;
            refinements += 1;
            groups = lloyd(points, k, self.config.max_iterations);
        }

        groups
            .into_iter()
            .flat_map(|g| bisect(g, params.max_group_size))
            .collect()
    }

    fn describe(&self, group: &[Point], max_distance_km: f64) -> OrderCluster {
        let centroid = centroid(group);
        let beeline: f64 = group.iter().map(|p| centroid.distance_km(&p.at)).sum();
        let max_radius_km = radius_km(group);
        let estimated_distance_km = beeline * self.config.road_factor;

        OrderCluster {
            order_ids: group.iter().map(|p| p.id).collect(),
            centroid,
            max_radius_km,
            estimated_distance_km,
            estimated_duration_minutes: estimated_distance_km / self.config.average_speed_kmph * 60.0,
            within_radius: max_radius_km <= max_distance_km,
        }
    }
}

fn centroid(points: &[Point]) -> Coordinate {
    Coordinate::centroid(points.iter().map(|p| &p.at)).unwrap_or(Coordinate::new(0.0, 0.0))
}

fn radius_km(points: &[Point]) -> f64 {
    let c = centroid(points);
    points
        .iter()
        .map(|p| c.distance_km(&p.at))
        .fold(0.0, f64::max)
}

/// Index of the nearest centroid; ties go to the lower index.
fn nearest(at: &Coordinate, centroids: &[Coordinate]) -> usize {
    let mut best = 0;
    let mut best_d = f64::INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let d = at.distance_km(c);
        if d < best_d {
            best = i;
            best_d = d;
        }
    }
    best
}

/// Picks `k` seeds: the point furthest from the overall centroid, then
/// repeatedly the point furthest from every seed chosen so far.
fn furthest_point_seeds(points: &[Point], k: usize) -> Vec<Coordinate> {
    let overall = centroid(points);
    let mut min_dist: Vec<f64> = points.iter().map(|p| overall.distance_km(&p.at)).collect();
    let mut seeds = Vec::with_capacity(k);

    while seeds.len() < k.min(points.len()) {
        let (idx, _) = min_dist
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, (i, &d)| if d > best.1 { (i, d) } else { best });
        let seed = points[idx].at;
        seeds.push(seed);
        for (d, p) in min_dist.iter_mut().zip(points) {
            let to_seed = seed.distance_km(&p.at);
            if seeds.len() == 1 || to_seed < *d {
                *d = to_seed;
            }
        }
    }
    seeds
}

/// Lloyd iterations from furthest-point seeds. Empty clusters are dropped.
fn lloyd(points: &[Point], k: usize, max_iterations: usize) -> Vec<Vec<Point>> {
    let mut centroids = furthest_point_seeds(points, k);
    let mut assignment: Vec<usize> = Vec::new();

    for _ in 0..max_iterations.max(1) {
        let next: Vec<usize> = points
            .par_iter()
            .map(|p| nearest(&p.at, &centroids))
            .collect();
        if next == assignment {
            break;
        }
        assignment = next;

        for (c, centroid) in centroids.iter_mut().enumerate() {
            let members = points
                .iter()
                .zip(&assignment)
                .filter(|(_, &a)| a == c)
                .map(|(p, _)| &p.at);
            if let Some(updated) = Coordinate::centroid(members) {
                *centroid = updated;
            }
        }
    }

    let mut groups = vec![Vec::new(); centroids.len()];
    for (p, &a) in points.iter().zip(&assignment) {
        groups[a].push(*p);
    }
    groups.retain(|g| !g.is_empty());
    groups
}

/// Splits `group` in half along its two mutually distant extremes until every
/// part fits `max_size`.
fn bisect(group: Vec<Point>, max_size: usize) -> Vec<Vec<Point>> {
    if group.len() <= max_size {
        return vec![group];
    }

    let c = centroid(&group);
    let far = |from: Coordinate| {
        group
            .iter()
            .map(|p| p.at)
            .max_by_key(|p| OrderedFloat(from.distance_km(p)))
            .unwrap_or(from)
    };
    let a = far(c);
    let b = far(a);

    let mut ordered = group;
    ordered.sort_by_key(|p| (OrderedFloat(p.at.distance_km(&a) - p.at.distance_km(&b)), p.id));
    let right = ordered.split_off(ordered.len() / 2);

    let mut parts = bisect(ordered, max_size);
    parts.extend(bisect(right, max_size));
    parts
}

fn sweep(points: &[Point], params: &ClusterParams) -> Vec<Vec<Point>> {
    if points.is_empty() {
        return Vec::new();
    }

    let origin = centroid(points);
    let mut by_angle: Vec<(f64, Point)> = points
        .iter()
        .map(|p| ((p.at.lat - origin.lat).atan2(p.at.lng - origin.lng), *p))
        .collect();
    by_angle.sort_by_key(|(angle, p)| (OrderedFloat(*angle), p.id));

    let mut groups = Vec::new();
    let mut current: Vec<Point> = Vec::new();
    for (_, p) in by_angle {
        if !current.is_empty() {
            let mut candidate = current.clone();
            candidate.push(p);
            if candidate.len() > params.max_group_size || radius_km(&candidate) > params.max_distance_km {
                groups.push(std::mem::take(&mut current));
            }
        }
        current.push(p);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn order(id: OrderId, lat: f64, lng: f64) -> Order {
        Order::new(id, format!("{} Fuxing S Rd", id), 50_000, Utc::now())
            .with_coordinate(Coordinate::new(lat, lng))
    }

    /// Six orders near Da'an and six near Taoyuan, roughly 25 km apart.
    fn two_districts() -> Vec<Order> {
        let mut orders = Vec::new();
        for i in 0..6 {
            let d = i as f64 * 0.002;
            orders.push(order(100 + i, 25.026 + d, 121.543 - d));
            orders.push(order(200 + i, 24.993 - d, 121.301 + d));
        }
        orders
    }

    fn params(max_group_size: usize, max_distance_km: f64, algorithm: ClusterAlgorithm) -> ClusterParams {
        ClusterParams {
            max_group_size,
            max_distance_km,
            algorithm,
        }
    }

    fn all_ids(outcome: &ClusterOutcome) -> Vec<OrderId> {
        let mut ids: Vec<OrderId> = outcome.groups.iter().flat_map(|g| g.order_ids.clone()).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_two_distant_districts_form_two_groups() {
        let engine = ClusteringEngine::new(ClusteringConfig::default());
        let outcome = engine
            .cluster_orders(&two_districts(), &params(8, 5.0, ClusterAlgorithm::KMeans))
            .unwrap();

        assert_eq!(outcome.groups.len(), 2);
        for group in &outcome.groups {
            assert_eq!(group.order_ids.len(), 6);
            assert!(group.within_radius);
            assert!(group.max_radius_km <= 5.0);
            // Each group stays inside one district
            let district = group.order_ids[0] / 100;
            assert!(group.order_ids.iter().all(|id| id / 100 == district));
        }
        assert!(outcome.needs_geocoding.is_empty());
    }

    #[test]
    fn test_group_size_is_a_hard_cap() {
        let engine = ClusteringEngine::new(ClusteringConfig::default());
        // Everything in one spot, so only bisection can split it
        let orders: Vec<Order> = (0..23).map(|i| order(i, 25.04, 121.55)).collect();

        for algorithm in [ClusterAlgorithm::KMeans, ClusterAlgorithm::Sweep] {
            let outcome = engine.cluster_orders(&orders, &params(4, 5.0, algorithm)).unwrap();
            assert!(outcome.groups.iter().all(|g| g.order_ids.len() <= 4));
            assert_eq!(all_ids(&outcome), (0..23).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_orders_without_coordinates_are_reported() {
        let engine = ClusteringEngine::new(ClusteringConfig::default());
        let mut orders = two_districts();
        orders.push(Order::new(900, "Unknown alley", 1_000, Utc::now()));
        orders.push(order(901, f64::NAN, 121.5));

        let outcome = engine
            .cluster_orders(&orders, &params(8, 5.0, ClusterAlgorithm::KMeans))
            .unwrap();

        assert_eq!(outcome.needs_geocoding, vec![900, 901]);
        assert_eq!(all_ids(&outcome).len(), 12);
        assert!(!all_ids(&outcome).contains(&900));
    }

    #[test]
    fn test_radius_refinement_splits_wide_group() {
        let engine = ClusteringEngine::new(ClusteringConfig::default());
        // Three small groups ~10 km apart but a size cap that would allow one group
        let mut orders = Vec::new();
        for (g, (lat, lng)) in [(25.03, 121.45), (25.03, 121.55), (25.12, 121.50)].into_iter().enumerate() {
            for i in 0..3 {
                orders.push(order((g * 10 + i) as OrderId, lat + i as f64 * 0.001, lng));
            }
        }

        let outcome = engine
            .cluster_orders(&orders, &params(20, 2.0, ClusterAlgorithm::KMeans))
            .unwrap();
        assert_eq!(outcome.groups.len(), 3);
        assert!(outcome.groups.iter().all(|g| g.within_radius));
    }

    #[test]
    fn test_sweep_keeps_districts_apart() {
        let engine = ClusteringEngine::new(ClusteringConfig::default());
        let outcome = engine
            .cluster_orders(&two_districts(), &params(8, 5.0, ClusterAlgorithm::Sweep))
            .unwrap();

        assert_eq!(all_ids(&outcome).len(), 12);
        for group in &outcome.groups {
            assert!(group.order_ids.len() <= 8);
            let district = group.order_ids[0] / 100;
            assert!(group.order_ids.iter().all(|id| id / 100 == district));
        }
    }

    #[test]
    fn test_estimate_uses_road_factor() {
        let engine = ClusteringEngine::new(ClusteringConfig {
            road_factor: 2.0,
            average_speed_kmph: 30.0,
            ..ClusteringConfig::default()
        });
        let orders = vec![order(1, 25.0, 121.5), order(2, 25.0, 121.52)];
        let outcome = engine
            .cluster_orders(&orders, &params(8, 5.0, ClusterAlgorithm::KMeans))
            .unwrap();

        let group = &outcome.groups[0];
        let beeline = 2.0 * group.centroid.distance_km(&Coordinate::new(25.0, 121.5));
        assert!((group.estimated_distance_km - beeline * 2.0).abs() < 1e-6);
        assert!((group.estimated_duration_minutes - group.estimated_distance_km * 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_input_and_bad_params() {
        let engine = ClusteringEngine::new(ClusteringConfig::default());
        let outcome = engine
            .cluster_orders(&[], &params(8, 5.0, ClusterAlgorithm::KMeans))
            .unwrap();
        assert!(outcome.groups.is_empty());

        assert!(engine.cluster_orders(&[], &params(0, 5.0, ClusterAlgorithm::KMeans)).is_err());
        let oversized = params(MAX_ROUTE_STOPS + 1, 5.0, ClusterAlgorithm::KMeans);
        assert!(matches!(oversized.validate(), Err(DispatchError::Validation(_))));
        params(MAX_ROUTE_STOPS, 5.0, ClusterAlgorithm::KMeans).validate().unwrap();
        assert!(engine.cluster_orders(&[], &params(8, -1.0, ClusterAlgorithm::Sweep)).is_err());
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("K-Means".parse::<ClusterAlgorithm>().unwrap(), ClusterAlgorithm::KMeans);
        assert_eq!("sweep".parse::<ClusterAlgorithm>().unwrap(), ClusterAlgorithm::Sweep);
        assert!("dbscan".parse::<ClusterAlgorithm>().is_err());
    }
}
