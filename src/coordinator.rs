//! Batch dispatch orchestration.
//!
//! `assign_batch` walks a small state machine:
//!
//! ```text
//! REQUESTED -> LOCK_ATTEMPTED -> LOCK_FAILED
//!                             -> LOCKED -> ASSIGNED -> ROUTED -> COMMITTED
//!                                       -> RETRY -> ASSIGNED ...
//! ```
//!
//! Between LOCKED and the commit the courier is claimed: the store records
//! the new route group as the courier's active one, or refuses if another
//! batch got there first. Every failure before the assignment commit unlocks
//! the orders this call acquired (orders the courier already held beforehand
//! are left alone) and releases the claim. Routing runs after the commit and
//! never undoes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;

use crate::clock::Clock;
use crate::cluster::{ClusterOutcome, ClusterParams, ClusteringEngine, OrderCluster};
use crate::config::{ttl_duration, DispatchConfig};
use crate::distance::DistanceService;
use crate::domain::{
    BoundingBox, Coordinate, Courier, CourierId, CourierStatus, Order, OrderId, OrderStatus,
    RouteGroup, RouteGroupId, RouteGroupStatus,
};
use crate::error::{DispatchError, Result, StoreError};
use crate::events::{DispatchEvent, EventPublisher};
use crate::lock::{normalize_order_ids, rejection_error, OrderLockManager};
use crate::sequencer::{RouteSequence, RouteSequencer, Stop};
use crate::store::{ClaimOutcome, OrderStore};

/// Largest id list accepted by `cluster_orders`.
const MAX_CLUSTER_REQUEST: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts for a store write that fails transiently, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each further failure.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
        }
    }
}

/// Steps of a batch assignment, in the order they happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchPhase {
    Requested,
    LockAttempted,
    LockFailed,
    Locked,
    Retry,
    Assigned,
    Routed,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchAssignment {
    #[schema(value_type = String)]
    pub route_group_id: RouteGroupId,
    pub courier_id: CourierId,
    pub assigned_order_ids: Vec<OrderId>,
    /// `None` when sequencing was skipped or failed.
    pub route: Option<RouteSequence>,
    pub phases: Vec<DispatchPhase>,
}

/// A cluster persisted as a planning route group.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlannedGroup {
    #[schema(value_type = String)]
    pub route_group_id: RouteGroupId,
    #[serde(flatten)]
    pub cluster: OrderCluster,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusteringResult {
    pub groups: Vec<PlannedGroup>,
    pub needs_geocoding: Vec<OrderId>,
    /// Orders that got a coordinate from the geocoder during this call.
    pub geocoded: Vec<OrderId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOutcome {
    pub order_id: OrderId,
    pub status: OrderStatus,
    /// True when this order was the last open one of its route group.
    pub route_group_completed: bool,
}

pub struct DispatchCoordinator {
    store: Arc<dyn OrderStore>,
    clock: Arc<dyn Clock>,
    locks: Arc<OrderLockManager>,
    clustering: ClusteringEngine,
    sequencer: RouteSequencer,
    distance: Arc<DistanceService>,
    events: Arc<dyn EventPublisher>,
    retry: RetryConfig,
    depot: Option<Coordinate>,
}

impl DispatchCoordinator {
    pub fn new(
        store: Arc<dyn OrderStore>,
        distance: Arc<DistanceService>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventPublisher>,
        config: &DispatchConfig,
    ) -> Self {
        let locks = OrderLockManager::new(store.clone(), clock.clone(), config.locks.clone())
            .with_events(events.clone());
        Self {
            store,
            clock,
            locks: Arc::new(locks),
            clustering: ClusteringEngine::new(config.clustering.clone()),
            sequencer: RouteSequencer::new(config.sequencer.clone()),
            distance,
            events,
            retry: config.retry.clone(),
            depot: config.depot,
        }
    }

    pub fn locks(&self) -> &Arc<OrderLockManager> {
        &self.locks
    }

    pub fn distance(&self) -> &Arc<DistanceService> {
        &self.distance
    }

    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.store
    }

    pub fn clustering(&self) -> &ClusteringEngine {
        &self.clustering
    }

    /// Available orders, optionally inside `area`. Expired locks are swept first.
    pub async fn available_orders(&self, area: Option<BoundingBox>) -> Result<Vec<Order>> {
        if let Some(bbox) = &area {
            if !bbox.is_valid() {
                return Err(DispatchError::validation("invalid bounding box"));
            }
        }
        self.locks.sweep_expired().await?;
        Ok(self.store.available_orders(area).await?)
    }

    /// Locks, re-validates and assigns `order_ids` to `courier_id` as one batch.
    #[instrument(skip(self, order_ids), fields(order_count = order_ids.len()))]
    pub async fn assign_batch(&self, courier_id: CourierId, order_ids: &[OrderId]) -> Result<BatchAssignment> {
        let mut phases = vec![DispatchPhase::Requested];
        let ids = normalize_order_ids(order_ids, self.locks.config().max_batch_size)?;
        let courier = self.courier(courier_id).await?;
        self.ensure_no_active_group(&courier).await?;

        let held_before: Vec<OrderId> = self
            .store
            .locks_held_by(courier_id, self.clock.now())
            .await?
            .into_iter()
            .map(|o| o.id)
            .collect();

        phases.push(DispatchPhase::LockAttempted);
        if let Err(e) = self.locks.lock(&ids, courier_id, None).await {
            phases.push(DispatchPhase::LockFailed);
            info!(courier_id, error = %e, "Batch lock failed");
            return Err(e);
        }
        phases.push(DispatchPhase::Locked);
        let acquired: Vec<OrderId> = ids
            .iter()
            .copied()
            .filter(|id| !held_before.contains(id))
            .collect();

        let mut group = RouteGroup::new(ids.clone(), None, self.clock.now());
        group.status = RouteGroupStatus::Assigned;
        group.courier_id = Some(courier_id);

        // Concurrent batches for one courier race here; only one claim wins
        let claimed = self
            .with_retry("claim_courier", &mut phases, || self.store.claim_courier(&group))
            .await;
        match claimed {
            Ok(true) => {}
            Ok(false) => {
                self.roll_back(courier_id, &acquired).await;
                phases.push(DispatchPhase::RolledBack);
                info!(courier_id, "Courier claimed by a concurrent batch");
                return Err(DispatchError::validation(format!(
                    "courier {} already has an active route group",
                    courier_id
                )));
            }
            Err(e) => {
                self.roll_back(courier_id, &acquired).await;
                phases.push(DispatchPhase::RolledBack);
                return Err(e);
            }
        }

        let orders = match self.commit(courier_id, &ids, &mut phases).await {
            Ok(orders) => orders,
            Err(e) => {
                self.roll_back(courier_id, &acquired).await;
                self.release_claim(courier_id, group.id).await;
                phases.push(DispatchPhase::RolledBack);
                return Err(e);
            }
        };
        phases.push(DispatchPhase::Assigned);

        group.centroid = Coordinate::centroid(orders.iter().filter_map(|o| o.coordinate.as_ref()));
        let route = match self.sequence(&mut group, &orders, courier.location).await {
            Ok(route) => {
                if route.is_some() {
                    phases.push(DispatchPhase::Routed);
                }
                route
            }
            Err(e) => {
                warn!(courier_id, error = %e, "Routing failed, keeping unsequenced batch");
                None
            }
        };

        self.persist_assignment(&group).await;
        phases.push(DispatchPhase::Committed);

        info!(courier_id, route_group = %group.id, orders = ?ids, "Batch assigned");
        self.events.publish(DispatchEvent::BatchAssigned {
            courier_id,
            route_group_id: group.id,
            order_ids: ids.clone(),
        });
        if let Some(route) = &route {
            self.publish_route(group.id, route);
        }

        Ok(BatchAssignment {
            route_group_id: group.id,
            courier_id,
            assigned_order_ids: group.order_ids.clone(),
            route,
            phases,
        })
    }

    /// Re-validates the batch, then commits the assignment with bounded retry.
    async fn commit(
        &self,
        courier_id: CourierId,
        ids: &[OrderId],
        phases: &mut Vec<DispatchPhase>,
    ) -> Result<Vec<Order>> {
        let now = self.clock.now();
        let orders = self.store.get_orders(ids).await?;
        let stale: Vec<OrderId> = ids
            .iter()
            .copied()
            .filter(|id| {
                !orders.iter().any(|o| {
                    o.id == *id && (o.status == OrderStatus::Available || o.is_locked_by(courier_id, now))
                })
            })
            .collect();
        if !stale.is_empty() {
            return Err(DispatchError::conflict(stale));
        }

        let outcome = self
            .with_retry("commit_assignment", phases, || {
                self.store
                    .commit_assignment(ids, courier_id, self.clock.now())
            })
            .await?;

        match outcome {
            ClaimOutcome::Applied(_) => Ok(orders),
            rejected => Err(rejection_error(rejected)),
        }
    }

    /// Runs a store write, retrying transient failures with exponential backoff.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        phases: &mut Vec<DispatchPhase>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, StoreError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.base_delay_ms.saturating_mul(1 << (attempt - 1).min(16));
                    warn!(operation, attempt, delay_ms = delay, error = %e, "Transient store failure, retrying");
                    phases.push(DispatchPhase::Retry);
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    return Err(DispatchError::TransientStore {
                        attempts: attempt,
                        source: e,
                    })
                }
                Err(e) => return Err(DispatchError::Store(e)),
            }
        }
    }

    async fn roll_back(&self, courier_id: CourierId, acquired: &[OrderId]) {
        if acquired.is_empty() {
            return;
        }
        match self.store.release_locks(acquired, courier_id, self.clock.now()).await {
            Ok(released) => {
                info!(courier_id, orders = ?released, "Rolled back batch locks");
                if !released.is_empty() {
                    self.events.publish(DispatchEvent::OrdersUnlocked {
                        courier_id,
                        order_ids: released,
                    });
                }
            }
            // The locks still expire on their own
            Err(e) => warn!(courier_id, error = %e, "Rollback unlock failed"),
        }
    }

    /// Saves the sequenced route group over the claimed one.
    ///
    /// Runs after the orders are assigned, so failures are logged rather than
    /// unwinding the assignment.
    async fn persist_assignment(&self, group: &RouteGroup) {
        if let Err(e) = self.store.save_route_group(group).await {
            warn!(route_group = %group.id, error = %e, "Could not save route group");
        }
    }

    async fn release_claim(&self, courier_id: CourierId, group_id: RouteGroupId) {
        if let Err(e) = self.store.release_courier(courier_id, group_id).await {
            warn!(courier_id, route_group = %group_id, error = %e, "Could not release courier claim");
        }
    }

    async fn courier(&self, courier_id: CourierId) -> Result<Courier> {
        match self.store.get_courier(courier_id).await? {
            Some(courier) => Ok(courier),
            None => {
                debug!(courier_id, "Registering unknown courier");
                let courier = Courier::new(courier_id, format!("Courier {}", courier_id));
                self.store.save_courier(&courier).await?;
                Ok(courier)
            }
        }
    }

    async fn ensure_no_active_group(&self, courier: &Courier) -> Result<()> {
        let Some(group_id) = courier.active_group else {
            return Ok(());
        };
        match self.store.get_route_group(group_id).await? {
            Some(group) if group.status.is_active() => Err(DispatchError::validation(format!(
                "courier {} already has active route group {}",
                courier.id, group_id
            ))),
            _ => Ok(()),
        }
    }

    /// Route origin: courier location, then depot, then the first stop.
    fn origin(&self, courier_location: Option<Coordinate>, stops: &[Stop]) -> Option<Coordinate> {
        courier_location
            .filter(Coordinate::is_valid)
            .or(self.depot)
            .or_else(|| stops.first().map(|s| s.coordinate))
    }

    /// Sequences `group` in place from `orders`.
    ///
    /// Orders without a coordinate keep their relative order after the
    /// sequenced ones. Returns `None` if there is nothing to sequence.
    async fn sequence(
        &self,
        group: &mut RouteGroup,
        orders: &[Order],
        courier_location: Option<Coordinate>,
    ) -> Result<Option<RouteSequence>> {
        let mut stops = Vec::new();
        let mut unplaced = Vec::new();
        for id in &group.order_ids {
            match orders.iter().find(|o| o.id == *id) {
                Some(Order {
                    coordinate: Some(c),
                    ..
                }) if c.is_valid() => stops.push(Stop {
                    order_id: *id,
                    coordinate: *c,
                }),
                _ => unplaced.push(*id),
            }
        }

        let Some(origin) = self.origin(courier_location, &stops) else {
            return Ok(None);
        };
        if stops.is_empty() {
            return Ok(None);
        }

        let route = self
            .sequencer
            .optimize_route(origin, &stops, self.distance.as_ref())
            .await?;

        group.order_ids = route.sequence.iter().copied().chain(unplaced).collect();
        group.sequenced = true;
        group.estimated_distance_km = route.total_distance_km;
        group.estimated_duration_minutes = route.total_duration_minutes;
        group.updated_at = self.clock.now();
        Ok(Some(route))
    }

    fn publish_route(&self, route_group_id: RouteGroupId, route: &RouteSequence) {
        self.events.publish(DispatchEvent::RouteOptimized {
            route_group_id,
            sequence: route.sequence.clone(),
            total_distance_km: route.total_distance_km,
            total_duration_minutes: route.total_duration_minutes,
            confidence: route.confidence,
        });
    }

    /// Clusters orders into planning route groups.
    ///
    /// With `order_ids`, exactly those orders are clustered and each must be
    /// available. Without, every available order (inside `area`, if given) is.
    #[instrument(skip(self, order_ids, params))]
    pub async fn cluster_orders(
        &self,
        order_ids: Option<&[OrderId]>,
        area: Option<BoundingBox>,
        params: ClusterParams,
    ) -> Result<ClusteringResult> {
        params.validate()?;
        self.locks.sweep_expired().await?;

        let mut orders = match order_ids {
            Some(ids) => {
                let ids = normalize_order_ids(ids, MAX_CLUSTER_REQUEST)?;
                let found = self.store.get_orders(&ids).await?;
                let missing: Vec<OrderId> = ids
                    .iter()
                    .copied()
                    .filter(|id| !found.iter().any(|o| o.id == *id))
                    .collect();
                if !missing.is_empty() {
                    return Err(DispatchError::NotFound(format!("orders {:?}", missing)));
                }
                let unavailable: Vec<OrderId> = found
                    .iter()
                    .filter(|o| o.status != OrderStatus::Available)
                    .map(|o| o.id)
                    .collect();
                if !unavailable.is_empty() {
                    return Err(DispatchError::conflict(unavailable));
                }
                found
            }
            None => self.available_orders(area).await?,
        };

        let geocoded = if self.clustering.config().geocode_missing {
            self.geocode_missing(&mut orders).await
        } else {
            Vec::new()
        };

        let ClusterOutcome {
            groups,
            needs_geocoding,
        } = self.clustering.cluster_orders(&orders, &params)?;

        let now = self.clock.now();
        let clustered: Vec<OrderId> = orders.iter().map(|o| o.id).collect();
        let stale_before = now - ttl_duration(self.clustering.config().planning_ttl_secs);
        let discarded = self.store.discard_planning_groups(&clustered, stale_before).await?;
        if !discarded.is_empty() {
            debug!(discarded = discarded.len(), "Replaced planning route groups");
        }

        let mut planned = Vec::with_capacity(groups.len());
        for cluster in groups {
            let group = RouteGroup::new(cluster.order_ids.clone(), Some(cluster.centroid), now)
                .with_estimate(cluster.estimated_distance_km, cluster.estimated_duration_minutes);
            self.store.save_route_group(&group).await?;
            planned.push(PlannedGroup {
                route_group_id: group.id,
                cluster,
            });
        }

        info!(
            groups = planned.len(),
            needs_geocoding = needs_geocoding.len(),
            geocoded = geocoded.len(),
            "Orders clustered"
        );
        Ok(ClusteringResult {
            groups: planned,
            needs_geocoding,
            geocoded,
        })
    }

    /// Fills in coordinates through the cached geocoder. Failures leave the
    /// order without a coordinate.
    async fn geocode_missing(&self, orders: &mut [Order]) -> Vec<OrderId> {
        let mut geocoded = Vec::new();
        if !self.distance.can_geocode() {
            return geocoded;
        }
        for order in orders.iter_mut().filter(|o| !o.coordinate.is_some_and(|c| c.is_valid())) {
            match self.distance.geocode(&order.address).await {
                Ok(result) => {
                    let now = self.clock.now();
                    if let Err(e) = self.store.update_coordinate(order.id, result.coordinate, now).await {
                        warn!(order_id = order.id, error = %e, "Could not store geocoded coordinate");
                        continue;
                    }
                    order.coordinate = Some(result.coordinate);
                    geocoded.push(order.id);
                }
                Err(e) => debug!(order_id = order.id, error = %e, "Order still needs geocoding"),
            }
        }
        geocoded
    }

    pub async fn route_group(&self, group_id: RouteGroupId) -> Result<RouteGroup> {
        self.store
            .get_route_group(group_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("route group {}", group_id)))
    }

    /// Sequences the orders of a stored route group and saves the new order.
    #[instrument(skip(self))]
    pub async fn optimize_group(&self, group_id: RouteGroupId) -> Result<RouteSequence> {
        let mut group = self.route_group(group_id).await?;
        let orders = self.store.get_orders(&group.order_ids).await?;

        let courier_location = match group.courier_id {
            Some(id) => self.store.get_courier(id).await?.and_then(|c| c.location),
            None => None,
        };

        let route = self
            .sequence(&mut group, &orders, courier_location)
            .await?
            .ok_or_else(|| {
                DispatchError::validation(format!("route group {} has no geocoded orders", group_id))
            })?;

        self.store.save_route_group(&group).await?;
        self.publish_route(group.id, &route);
        Ok(route)
    }

    /// Moves an assigned group and its orders to delivering.
    #[instrument(skip(self))]
    pub async fn start_delivery(&self, courier_id: CourierId, group_id: RouteGroupId) -> Result<RouteGroup> {
        let mut group = self.route_group(group_id).await?;
        if group.courier_id != Some(courier_id) {
            return Err(DispatchError::validation(format!(
                "route group {} is not assigned to courier {}",
                group_id, courier_id
            )));
        }
        if group.status != RouteGroupStatus::Assigned {
            return Err(DispatchError::validation(format!(
                "route group {} is {}, expected assigned",
                group_id,
                group.status.as_str()
            )));
        }

        let mut phases = Vec::new();
        let outcome = self
            .with_retry("start_delivery", &mut phases, || {
                self.store.transition_orders(
                    &group.order_ids,
                    courier_id,
                    OrderStatus::Assigned,
                    OrderStatus::Delivering,
                    self.clock.now(),
                )
            })
            .await?;
        if !outcome.is_applied() {
            return Err(rejection_error(outcome));
        }

        group.status = RouteGroupStatus::InProgress;
        group.updated_at = self.clock.now();
        self.store.save_route_group(&group).await?;

        let mut courier = self.courier(courier_id).await?;
        courier.status = CourierStatus::Delivering;
        courier.active_group = Some(group.id);
        self.store.save_courier(&courier).await?;

        info!(courier_id, route_group = %group.id, "Delivery started");
        self.events.publish(DispatchEvent::DeliveryStarted {
            courier_id,
            route_group_id: group.id,
        });
        Ok(group)
    }

    /// Records the outcome of one delivery. Completes the courier's route
    /// group once every order in it is terminal.
    #[instrument(skip(self))]
    pub async fn complete_order(
        &self,
        courier_id: CourierId,
        order_id: OrderId,
        delivered: bool,
    ) -> Result<CompletionOutcome> {
        let status = if delivered {
            OrderStatus::Delivered
        } else {
            OrderStatus::Failed
        };

        let ids = [order_id];
        let mut phases = Vec::new();
        let outcome = self
            .with_retry("complete_order", &mut phases, || {
                self.store.transition_orders(
                    &ids,
                    courier_id,
                    OrderStatus::Delivering,
                    status,
                    self.clock.now(),
                )
            })
            .await?;
        if !outcome.is_applied() {
            return Err(rejection_error(outcome));
        }

        self.events.publish(DispatchEvent::DeliveryCompleted {
            courier_id,
            order_id,
            delivered,
        });

        let route_group_completed = self.close_group_if_done(courier_id, self.clock.now()).await?;
        Ok(CompletionOutcome {
            order_id,
            status,
            route_group_completed,
        })
    }

    async fn close_group_if_done(&self, courier_id: CourierId, now: DateTime<Utc>) -> Result<bool> {
        let Some(mut courier) = self.store.get_courier(courier_id).await? else {
            return Ok(false);
        };
        let Some(group_id) = courier.active_group else {
            return Ok(false);
        };
        let Some(mut group) = self.store.get_route_group(group_id).await? else {
            return Ok(false);
        };

        let orders = self.store.get_orders(&group.order_ids).await?;
        if !orders.iter().all(|o| o.status.is_terminal()) {
            return Ok(false);
        }

        group.status = RouteGroupStatus::Completed;
        group.updated_at = now;
        self.store.save_route_group(&group).await?;
        courier.status = CourierStatus::Online;
        courier.active_group = None;
        self.store.save_courier(&courier).await?;

        info!(courier_id, route_group = %group.id, "Route group completed");
        Ok(true)
    }
}
