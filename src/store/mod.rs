//! Order store interface.
//!
//! The store is the only authority on order state. Every lock and assignment
//! goes through a conditional update that succeeds for exactly one concurrent
//! caller, so correctness holds across server replicas as long as the backend
//! does (see [`postgres::PgOrderStore`]). [`memory::MemoryOrderStore`] gives the
//! same guarantees inside one process and is used by tests and the demo.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    BoundingBox, Coordinate, Courier, CourierId, Order, OrderId, OrderStatus, RouteGroup,
    RouteGroupId,
};
use crate::error::StoreError;

pub mod memory;
pub mod postgres;

pub use memory::MemoryOrderStore;
pub use postgres::PgOrderStore;

/// A batch lock request.
#[derive(Debug, Clone)]
pub struct LockRequest<'a> {
    pub order_ids: &'a [OrderId],
    pub courier_id: CourierId,
    pub now: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of a conditional batch update.
///
/// `Applied` means every requested order was updated; `Rejected` means none was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Applied(Vec<OrderId>),
    Rejected {
        /// Orders that exist but are not in a claimable state.
        conflicting: Vec<OrderId>,
        /// Ids unknown to the store.
        missing: Vec<OrderId>,
    },
}

impl ClaimOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ClaimOutcome::Applied(_))
    }
}

/// Input for creating an order.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub id: OrderId,
    pub address: String,
    pub coordinate: Option<Coordinate>,
    pub total_cents: i64,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    async fn insert_order(&self, order: NewOrder, now: DateTime<Utc>) -> Result<Order, StoreError>;

    /// Returns the orders that exist among `ids`, in no particular order.
    async fn get_orders(&self, ids: &[OrderId]) -> Result<Vec<Order>, StoreError>;

    /// Available orders, optionally restricted to those with a coordinate inside `area`.
    async fn available_orders(&self, area: Option<BoundingBox>) -> Result<Vec<Order>, StoreError>;

    async fn update_coordinate(&self, id: OrderId, coordinate: Coordinate, now: DateTime<Utc>)
        -> Result<(), StoreError>;

    /// Returns every lock with `lock_expires_at < now` to `available`.
    async fn release_expired_locks(&self, now: DateTime<Utc>) -> Result<Vec<OrderId>, StoreError>;

    /// Locks every order in the request or none of them.
    ///
    /// An order is claimable when it is available, already locked by the same
    /// courier (the expiry is then refreshed) or held under an expired lock.
    async fn acquire_locks(&self, request: LockRequest<'_>) -> Result<ClaimOutcome, StoreError>;

    /// Releases the subset of `ids` locked by `courier_id`; returns that subset.
    async fn release_locks(
        &self,
        ids: &[OrderId],
        courier_id: CourierId,
        now: DateTime<Utc>,
    ) -> Result<Vec<OrderId>, StoreError>;

    /// Orders currently locked by `courier_id` with an unexpired lock.
    async fn locks_held_by(&self, courier_id: CourierId, now: DateTime<Utc>)
        -> Result<Vec<Order>, StoreError>;

    /// Sets `assigned` + driver on every order, or on none.
    ///
    /// Each order must be available or locked by `courier_id` with an unexpired lock.
    async fn commit_assignment(
        &self,
        ids: &[OrderId],
        courier_id: CourierId,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Moves every order from `from` to `to`, or none; all must belong to `courier_id`.
    async fn transition_orders(
        &self,
        ids: &[OrderId],
        courier_id: CourierId,
        from: OrderStatus,
        to: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Inserts or replaces a route group.
    async fn save_route_group(&self, group: &RouteGroup) -> Result<(), StoreError>;

    async fn get_route_group(&self, id: RouteGroupId) -> Result<Option<RouteGroup>, StoreError>;

    /// Deletes planning groups that share an order with `order_ids` or were
    /// last updated before `stale_before`; returns their ids.
    async fn discard_planning_groups(
        &self,
        order_ids: &[OrderId],
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<RouteGroupId>, StoreError>;

    /// Stores `group` and makes it the active group of `group.courier_id`,
    /// unless that courier already has an assigned or in-progress group.
    ///
    /// The check and both writes happen atomically. Returns `false` when the
    /// courier was busy, in which case nothing is written.
    async fn claim_courier(&self, group: &RouteGroup) -> Result<bool, StoreError>;

    /// Undoes [`OrderStore::claim_courier`]: frees the courier if `group_id`
    /// is still its active group and deletes the group.
    async fn release_courier(&self, courier_id: CourierId, group_id: RouteGroupId) -> Result<(), StoreError>;

    /// Inserts or replaces a courier.
    async fn save_courier(&self, courier: &Courier) -> Result<(), StoreError>;

    async fn get_courier(&self, id: CourierId) -> Result<Option<Courier>, StoreError>;
}

pub(crate) fn unclaimed_group(group: &RouteGroup) -> StoreError {
    StoreError::Backend(format!("route group {} has no courier to claim", group.id))
}

/// Splits rejected ids into "exists but unavailable" and "unknown".
pub(crate) fn classify_rejection(
    requested: &[OrderId],
    found: &[Order],
    is_ok: impl Fn(&Order) -> bool,
) -> ClaimOutcome {
    let mut conflicting = Vec::new();
    let mut missing = Vec::new();
    for id in requested {
        match found.iter().find(|o| o.id == *id) {
            Some(order) if is_ok(order) => {}
            Some(_) => conflicting.push(*id),
            None => missing.push(*id),
        }
    }
    ClaimOutcome::Rejected {
        conflicting,
        missing,
    }
}
