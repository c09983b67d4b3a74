//! In-process order store.
//!
//! All state sits behind one mutex, so each trait call is atomic. Useful for
//! tests and single-node demos; not shared between replicas.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::{classify_rejection, unclaimed_group, ClaimOutcome, LockRequest, NewOrder, OrderStore};
use crate::domain::{
    BoundingBox, Coordinate, Courier, CourierId, CourierStatus, Order, OrderId, OrderStatus,
    RouteGroup, RouteGroupId, RouteGroupStatus,
};
use crate::error::StoreError;

#[derive(Default)]
struct MemoryState {
    // BTreeMap keeps listing order stable.
    orders: BTreeMap<OrderId, Order>,
    groups: HashMap<RouteGroupId, RouteGroup>,
    couriers: HashMap<CourierId, Courier>,
}

/// Order store held in memory.
#[derive(Default)]
pub struct MemoryOrderStore {
    state: Mutex<MemoryState>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored orders.
    pub fn len(&self) -> usize {
        self.state.lock().orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies `update` to every order in `ids` if `is_ok` holds for all of them.
    fn update_all<P, U>(&self, ids: &[OrderId], is_ok: P, mut update: U) -> ClaimOutcome
    where
        P: Fn(&Order) -> bool,
        U: FnMut(&mut Order),
    {
        let mut state = self.state.lock();
        let all_ok = ids
            .iter()
            .all(|id| state.orders.get(id).is_some_and(&is_ok));

        if !all_ok {
            let found: Vec<Order> = ids
                .iter()
                .filter_map(|id| state.orders.get(id).cloned())
                .collect();
            return classify_rejection(ids, &found, is_ok);
        }

        for id in ids {
            if let Some(order) = state.orders.get_mut(id) {
                update(order);
            }
        }
        ClaimOutcome::Applied(ids.to_vec())
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn insert_order(&self, order: NewOrder, now: DateTime<Utc>) -> Result<Order, StoreError> {
        let mut state = self.state.lock();
        if state.orders.contains_key(&order.id) {
            return Err(StoreError::Backend(format!("order {} already exists", order.id)));
        }
        let mut created = Order::new(order.id, order.address, order.total_cents, now);
        created.coordinate = order.coordinate;
        state.orders.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_orders(&self, ids: &[OrderId]) -> Result<Vec<Order>, StoreError> {
        let state = self.state.lock();
        Ok(ids
            .iter()
            .filter_map(|id| state.orders.get(id).cloned())
            .collect())
    }

    async fn available_orders(&self, area: Option<BoundingBox>) -> Result<Vec<Order>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Available)
            .filter(|o| match (&area, &o.coordinate) {
                (None, _) => true,
                (Some(bbox), Some(c)) => bbox.contains(c),
                (Some(_), None) => false,
            })
            .cloned()
            .collect())
    }

    async fn update_coordinate(
        &self,
        id: OrderId,
        coordinate: Coordinate,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let order = state
            .orders
            .get_mut(&id)
            .ok_or_else(|| StoreError::Backend(format!("order {} not found", id)))?;
        order.coordinate = Some(coordinate);
        order.updated_at = now;
        Ok(())
    }

    async fn release_expired_locks(&self, now: DateTime<Utc>) -> Result<Vec<OrderId>, StoreError> {
        let mut state = self.state.lock();
        let mut released = Vec::new();
        for order in state.orders.values_mut() {
            if order.is_lock_expired(now) {
                order.release_lock(now);
                released.push(order.id);
            }
        }
        Ok(released)
    }

    async fn acquire_locks(&self, request: LockRequest<'_>) -> Result<ClaimOutcome, StoreError> {
        let LockRequest {
            order_ids,
            courier_id,
            now,
            expires_at,
        } = request;
        Ok(self.update_all(
            order_ids,
            |o| o.is_claimable_by(courier_id, now),
            |o| {
                o.status = OrderStatus::TemporarilyLocked;
                o.locked_by = Some(courier_id);
                o.lock_expires_at = Some(expires_at);
                o.updated_at = now;
            },
        ))
    }

    async fn release_locks(
        &self,
        ids: &[OrderId],
        courier_id: CourierId,
        now: DateTime<Utc>,
    ) -> Result<Vec<OrderId>, StoreError> {
        let mut state = self.state.lock();
        let mut released = Vec::new();
        for id in ids {
            if let Some(order) = state.orders.get_mut(id) {
                if order.status == OrderStatus::TemporarilyLocked
                    && order.locked_by == Some(courier_id)
                {
                    order.release_lock(now);
                    released.push(*id);
                }
            }
        }
        Ok(released)
    }

    async fn locks_held_by(
        &self,
        courier_id: CourierId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Order>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .orders
            .values()
            .filter(|o| o.is_locked_by(courier_id, now))
            .cloned()
            .collect())
    }

    async fn commit_assignment(
        &self,
        ids: &[OrderId],
        courier_id: CourierId,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        Ok(self.update_all(
            ids,
            |o| o.status == OrderStatus::Available || o.is_locked_by(courier_id, now),
            |o| {
                o.status = OrderStatus::Assigned;
                o.driver_id = Some(courier_id);
                o.locked_by = None;
                o.lock_expires_at = None;
                o.updated_at = now;
            },
        ))
    }

    async fn transition_orders(
        &self,
        ids: &[OrderId],
        courier_id: CourierId,
        from: OrderStatus,
        to: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        Ok(self.update_all(
            ids,
            |o| o.status == from && o.driver_id == Some(courier_id),
            |o| {
                o.status = to;
                o.updated_at = now;
            },
        ))
    }

    async fn save_route_group(&self, group: &RouteGroup) -> Result<(), StoreError> {
        self.state.lock().groups.insert(group.id, group.clone());
        Ok(())
    }

    async fn get_route_group(&self, id: RouteGroupId) -> Result<Option<RouteGroup>, StoreError> {
        Ok(self.state.lock().groups.get(&id).cloned())
    }

    async fn discard_planning_groups(
        &self,
        order_ids: &[OrderId],
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<RouteGroupId>, StoreError> {
        let mut state = self.state.lock();
        let discarded: Vec<RouteGroupId> = state
            .groups
            .values()
            .filter(|g| g.status == RouteGroupStatus::Planning)
            .filter(|g| g.updated_at < stale_before || g.order_ids.iter().any(|id| order_ids.contains(id)))
            .map(|g| g.id)
            .collect();
        for id in &discarded {
            state.groups.remove(id);
        }
        Ok(discarded)
    }

    async fn claim_courier(&self, group: &RouteGroup) -> Result<bool, StoreError> {
        let courier_id = group.courier_id.ok_or_else(|| unclaimed_group(group))?;
        let mut state = self.state.lock();
        let MemoryState { groups, couriers, .. } = &mut *state;

        let courier = couriers
            .get_mut(&courier_id)
            .ok_or_else(|| StoreError::Backend(format!("courier {} not found", courier_id)))?;
        let busy = courier
            .active_group
            .and_then(|id| groups.get(&id))
            .is_some_and(|g| g.status.is_active());
        if busy {
            return Ok(false);
        }

        courier.active_group = Some(group.id);
        courier.status = CourierStatus::Busy;
        groups.insert(group.id, group.clone());
        Ok(true)
    }

    async fn release_courier(&self, courier_id: CourierId, group_id: RouteGroupId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(courier) = state.couriers.get_mut(&courier_id) {
            if courier.active_group == Some(group_id) {
                courier.active_group = None;
                courier.status = CourierStatus::Online;
            }
        }
        state.groups.remove(&group_id);
        Ok(())
    }

    async fn save_courier(&self, courier: &Courier) -> Result<(), StoreError> {
        self.state.lock().couriers.insert(courier.id, courier.clone());
        Ok(())
    }

    async fn get_courier(&self, id: CourierId) -> Result<Option<Courier>, StoreError> {
        Ok(self.state.lock().couriers.get(&id).cloned())
    }
}
