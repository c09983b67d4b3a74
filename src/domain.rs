//! Domain model for courier dispatch.
//!
//! # Overview
//!
//! - [`Coordinate`]: WGS84 point with haversine distance
//! - [`Order`]: customer order moving through the dispatch lifecycle
//! - [`RouteGroup`]: batch of orders delivered together by one courier
//! - [`Courier`]: person fulfilling deliveries
//!
//! Orders are never deleted; terminal states (`delivered`, `cancelled`,
//! `failed`) stay in the store as the audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// Order identifier as used by the storefront.
pub type OrderId = i64;

/// Courier identifier.
pub type CourierId = i64;

/// Route group identifier.
pub type RouteGroupId = Uuid;

/// Mean earth radius in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6_371.0;

/// A geographic coordinate in decimal degrees.
///
/// # Examples
///
/// ```
/// use courier_dispatch::domain::Coordinate;
///
/// let taipei_101 = Coordinate::new(25.0340, 121.5645);
/// let main_station = Coordinate::new(25.0478, 121.5170);
///
/// // About 5 km apart
/// let km = taipei_101.distance_km(&main_station);
/// assert!(km > 4.5 && km < 5.5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Coordinate {
    /// Latitude in degrees (-90 to 90).
    pub lat: f64,
    /// Longitude in degrees (-180 to 180).
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Returns true if both components are finite and inside the WGS84 range.
    ///
    /// ```
    /// use courier_dispatch::domain::Coordinate;
    ///
    /// assert!(Coordinate::new(25.03, 121.56).is_valid());
    /// assert!(!Coordinate::new(91.0, 0.0).is_valid());
    /// assert!(!Coordinate::new(f64::NAN, 0.0).is_valid());
    /// ```
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Great-circle distance in kilometers using the haversine formula.
    ///
    /// ```
    /// use courier_dispatch::domain::Coordinate;
    ///
    /// let a = Coordinate::new(0.0, 0.0);
    /// let b = Coordinate::new(0.0, 1.0);
    ///
    /// // 1 degree of longitude at the equator is about 111 km
    /// let km = a.distance_km(&b);
    /// assert!(km > 110.0 && km < 112.0);
    /// ```
    pub fn distance_km(&self, other: &Coordinate) -> f64 {
        if self.lat == other.lat && self.lng == other.lng {
            return 0.0;
        }

        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlng = (other.lng - self.lng).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().min(1.0).asin();

        EARTH_RADIUS_KM * c
    }

    /// Fixed-point key with `precision` decimal places.
    ///
    /// Near-duplicate coordinates collapse onto the same key.
    ///
    /// ```
    /// use courier_dispatch::domain::Coordinate;
    ///
    /// let a = Coordinate::new(25.033_41, 121.564_49);
    /// let b = Coordinate::new(25.033_44, 121.564_52);
    /// assert_eq!(a.rounded_key(4), b.rounded_key(4));
    /// assert_eq!(a.rounded_key(4), (250_334, 1_215_645));
    /// ```
    pub fn rounded_key(&self, precision: u32) -> (i64, i64) {
        let scale = 10f64.powi(precision as i32);
        (
            (self.lat * scale).round() as i64,
            (self.lng * scale).round() as i64,
        )
    }

    /// Arithmetic mean of a set of coordinates.
    ///
    /// Adequate for city-scale clusters; returns `None` for an empty set.
    pub fn centroid<'a, I>(points: I) -> Option<Coordinate>
    where
        I: IntoIterator<Item = &'a Coordinate>,
    {
        let (mut lat, mut lng, mut n) = (0.0, 0.0, 0usize);
        for p in points {
            lat += p.lat;
            lng += p.lng;
            n += 1;
        }
        (n > 0).then(|| Coordinate::new(lat / n as f64, lng / n as f64))
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6},{:.6}", self.lat, self.lng)
    }
}

/// Rectangular area used for "orders near me" queries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lng: f64,
    pub max_lat: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    pub fn new(min_lat: f64, min_lng: f64, max_lat: f64, max_lng: f64) -> Self {
        Self {
            min_lat,
            min_lng,
            max_lat,
            max_lng,
        }
    }

    /// Square box of `radius_km` around `center` (approximate, fine away from the poles).
    pub fn around(center: Coordinate, radius_km: f64) -> Self {
        let dlat = (radius_km / EARTH_RADIUS_KM).to_degrees();
        let dlng = dlat / center.lat.to_radians().cos().max(1e-6);
        Self::new(
            center.lat - dlat,
            center.lng - dlng,
            center.lat + dlat,
            center.lng + dlng,
        )
    }

    pub fn contains(&self, point: &Coordinate) -> bool {
        (self.min_lat..=self.max_lat).contains(&point.lat)
            && (self.min_lng..=self.max_lng).contains(&point.lng)
    }

    pub fn is_valid(&self) -> bool {
        Coordinate::new(self.min_lat, self.min_lng).is_valid()
            && Coordinate::new(self.max_lat, self.max_lng).is_valid()
            && self.min_lat <= self.max_lat
            && self.min_lng <= self.max_lng
    }
}

/// Travel mode used for distance lookups and cache keys.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum TravelMode {
    #[default]
    Driving,
    Scooter,
    Bicycling,
    Walking,
}

impl TravelMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TravelMode::Driving => "driving",
            TravelMode::Scooter => "scooter",
            TravelMode::Bicycling => "bicycling",
            TravelMode::Walking => "walking",
        }
    }

    /// Typical urban speed used when only a beeline estimate is available.
    pub fn average_speed_kmph(self) -> f64 {
        match self {
            TravelMode::Driving => 30.0,
            TravelMode::Scooter => 25.0,
            TravelMode::Bicycling => 15.0,
            TravelMode::Walking => 5.0,
        }
    }
}

/// Order lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Available,
    TemporarilyLocked,
    Assigned,
    Delivering,
    Delivered,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Available => "available",
            OrderStatus::TemporarilyLocked => "temporarily_locked",
            OrderStatus::Assigned => "assigned",
            OrderStatus::Delivering => "delivering",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(OrderStatus::Available),
            "temporarily_locked" => Ok(OrderStatus::TemporarilyLocked),
            "assigned" => Ok(OrderStatus::Assigned),
            "delivering" => Ok(OrderStatus::Delivering),
            "delivered" => Ok(OrderStatus::Delivered),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "failed" => Ok(OrderStatus::Failed),
            other => Err(format!("unknown order status '{}'", other)),
        }
    }
}

/// A customer order as seen by dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    /// `None` until the address has been geocoded.
    pub coordinate: Option<Coordinate>,
    pub address: String,
    /// Order total in the smallest currency unit.
    pub total_cents: i64,
    pub status: OrderStatus,
    pub locked_by: Option<CourierId>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub driver_id: Option<CourierId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Creates an available order.
    pub fn new(id: OrderId, address: impl Into<String>, total_cents: i64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            coordinate: None,
            address: address.into(),
            total_cents,
            status: OrderStatus::Available,
            locked_by: None,
            lock_expires_at: None,
            driver_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_coordinate(mut self, coordinate: Coordinate) -> Self {
        self.coordinate = Some(coordinate);
        self
    }

    /// Returns true if the order holds a lock whose expiry is strictly in the past.
    pub fn is_lock_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == OrderStatus::TemporarilyLocked
            && self.lock_expires_at.is_some_and(|at| at < now)
    }

    /// Returns true if `courier_id` may take a lock on this order at `now`.
    ///
    /// Claimable means available, already locked by the same courier, or held
    /// under a lock that has expired but not yet been swept.
    pub fn is_claimable_by(&self, courier_id: CourierId, now: DateTime<Utc>) -> bool {
        match self.status {
            OrderStatus::Available => true,
            OrderStatus::TemporarilyLocked => {
                self.locked_by == Some(courier_id) || self.is_lock_expired(now)
            }
            _ => false,
        }
    }

    /// Returns true if the order is currently held by `courier_id` under a live lock.
    pub fn is_locked_by(&self, courier_id: CourierId, now: DateTime<Utc>) -> bool {
        self.status == OrderStatus::TemporarilyLocked
            && self.locked_by == Some(courier_id)
            && !self.is_lock_expired(now)
    }

    /// Returns the order to `available`, clearing lock ownership.
    pub fn release_lock(&mut self, now: DateTime<Utc>) {
        self.status = OrderStatus::Available;
        self.locked_by = None;
        self.lock_expires_at = None;
        self.updated_at = now;
    }
}

/// Route group lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RouteGroupStatus {
    Planning,
    Assigned,
    InProgress,
    Completed,
}

impl RouteGroupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteGroupStatus::Planning => "planning",
            RouteGroupStatus::Assigned => "assigned",
            RouteGroupStatus::InProgress => "in_progress",
            RouteGroupStatus::Completed => "completed",
        }
    }

    /// Assigned or in progress.
    pub fn is_active(self) -> bool {
        matches!(self, RouteGroupStatus::Assigned | RouteGroupStatus::InProgress)
    }
}

impl FromStr for RouteGroupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(RouteGroupStatus::Planning),
            "assigned" => Ok(RouteGroupStatus::Assigned),
            "in_progress" => Ok(RouteGroupStatus::InProgress),
            "completed" => Ok(RouteGroupStatus::Completed),
            other => Err(format!("unknown route group status '{}'", other)),
        }
    }
}

/// A batch of orders delivered together.
///
/// `order_ids` is the visiting sequence once `sequenced` is set; before that it
/// is the order the clustering engine or the courier produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteGroup {
    #[schema(value_type = String)]
    pub id: RouteGroupId,
    pub order_ids: Vec<OrderId>,
    pub centroid: Option<Coordinate>,
    pub estimated_distance_km: f64,
    pub estimated_duration_minutes: f64,
    pub status: RouteGroupStatus,
    pub courier_id: Option<CourierId>,
    pub sequenced: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RouteGroup {
    pub fn new(order_ids: Vec<OrderId>, centroid: Option<Coordinate>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_ids,
            centroid,
            estimated_distance_km: 0.0,
            estimated_duration_minutes: 0.0,
            status: RouteGroupStatus::Planning,
            courier_id: None,
            sequenced: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_estimate(mut self, distance_km: f64, duration_minutes: f64) -> Self {
        self.estimated_distance_km = distance_km;
        self.estimated_duration_minutes = duration_minutes;
        self
    }
}

/// Courier availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CourierStatus {
    Offline,
    Online,
    Busy,
    Delivering,
}

impl CourierStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CourierStatus::Offline => "offline",
            CourierStatus::Online => "online",
            CourierStatus::Busy => "busy",
            CourierStatus::Delivering => "delivering",
        }
    }
}

impl FromStr for CourierStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offline" => Ok(CourierStatus::Offline),
            "online" => Ok(CourierStatus::Online),
            "busy" => Ok(CourierStatus::Busy),
            "delivering" => Ok(CourierStatus::Delivering),
            other => Err(format!("unknown courier status '{}'", other)),
        }
    }
}

/// A courier known to dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Courier {
    pub id: CourierId,
    pub name: String,
    pub status: CourierStatus,
    pub location: Option<Coordinate>,
    /// The single route group the courier is working on, if any.
    #[schema(value_type = Option<String>)]
    pub active_group: Option<RouteGroupId>,
}

impl Courier {
    pub fn new(id: CourierId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: CourierStatus::Online,
            location: None,
            active_group: None,
        }
    }

    pub fn with_location(mut self, location: Coordinate) -> Self {
        self.location = Some(location);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_haversine_is_symmetric() {
        let a = Coordinate::new(25.0330, 121.5654);
        let b = Coordinate::new(24.9936, 121.3010);
        assert!((a.distance_km(&b) - b.distance_km(&a)).abs() < 1e-9);
        assert_eq!(a.distance_km(&a), 0.0);
    }

    #[test]
    fn test_centroid() {
        let pts = [Coordinate::new(0.0, 0.0), Coordinate::new(2.0, 4.0)];
        let c = Coordinate::centroid(pts.iter()).unwrap();
        assert_eq!(c, Coordinate::new(1.0, 2.0));
        assert!(Coordinate::centroid(std::iter::empty::<&Coordinate>()).is_none());
    }

    #[test]
    fn test_bbox_around_contains_center() {
        let center = Coordinate::new(25.03, 121.56);
        let bbox = BoundingBox::around(center, 2.0);
        assert!(bbox.is_valid());
        assert!(bbox.contains(&center));
        assert!(!bbox.contains(&Coordinate::new(25.2, 121.56)));
    }

    #[test]
    fn test_order_claimable() {
        let now = Utc::now();
        let mut order = Order::new(1, "Xinyi Rd", 1200, now);
        assert!(order.is_claimable_by(7, now));

        order.status = OrderStatus::TemporarilyLocked;
        order.locked_by = Some(7);
        order.lock_expires_at = Some(now + Duration::seconds(30));
        assert!(order.is_claimable_by(7, now));
        assert!(!order.is_claimable_by(9, now));
        assert!(order.is_locked_by(7, now));

        // Expired locks are claimable by anyone
        let later = now + Duration::seconds(31);
        assert!(order.is_lock_expired(later));
        assert!(order.is_claimable_by(9, later));
        assert!(!order.is_locked_by(7, later));

        order.status = OrderStatus::Assigned;
        assert!(!order.is_claimable_by(7, now));
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            OrderStatus::Available,
            OrderStatus::TemporarilyLocked,
            OrderStatus::Assigned,
            OrderStatus::Delivering,
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
            OrderStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert!("picked_up".parse::<OrderStatus>().is_err());
    }
}
