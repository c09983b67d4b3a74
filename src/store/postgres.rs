//! Postgres order store.
//!
//! Locks and assignments are single conditional `UPDATE ... RETURNING id`
//! statements. Under READ COMMITTED a concurrent writer blocks on the row lock
//! and then re-evaluates the `WHERE` clause, so only one courier wins. The
//! statement runs inside a transaction that is committed only if every
//! requested row was updated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{classify_rejection, unclaimed_group, ClaimOutcome, LockRequest, NewOrder, OrderStore};
use crate::domain::{
    BoundingBox, Coordinate, Courier, CourierId, Order, OrderId, OrderStatus, RouteGroup,
    RouteGroupId, RouteGroupStatus,
};
use crate::error::StoreError;

const ORDER_COLUMNS: &str = "id, address, lat, lng, total_cents, status, locked_by, \
     lock_expires_at, driver_id, created_at, updated_at";

/// Order store backed by a Postgres pool.
#[derive(Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects and runs pending migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration failed: {}", e)))?;

        info!(max_connections, "Connected to Postgres order store");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs `sql` (an UPDATE returning ids) and keeps it only if every id was touched.
    async fn update_all<'q>(
        &self,
        ids: &[OrderId],
        query: sqlx::query::QueryScalar<'q, sqlx::Postgres, i64, sqlx::postgres::PgArguments>,
    ) -> Result<ClaimOutcome, StoreError> {
        let wanted: HashSet<OrderId> = ids.iter().copied().collect();
        let mut tx = self.pool.begin().await?;
        let updated: Vec<i64> = query.fetch_all(&mut *tx).await?;

        if updated.len() == wanted.len() {
            tx.commit().await?;
            return Ok(ClaimOutcome::Applied(ids.to_vec()));
        }

        tx.rollback().await?;
        debug!(
            requested = wanted.len(),
            updated = updated.len(),
            "Conditional update rolled back"
        );
        let found = self.get_orders(ids).await?;
        let updated: HashSet<OrderId> = updated.into_iter().collect();
        Ok(classify_rejection(ids, &found, |o| updated.contains(&o.id)))
    }
}

#[derive(Debug, FromRow)]
struct OrderRow {
    id: i64,
    address: String,
    lat: Option<f64>,
    lng: Option<f64>,
    total_cents: i64,
    status: String,
    locked_by: Option<i64>,
    lock_expires_at: Option<DateTime<Utc>>,
    driver_id: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            id: row.id,
            coordinate: coordinate(row.lat, row.lng),
            address: row.address,
            total_cents: row.total_cents,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            locked_by: row.locked_by,
            lock_expires_at: row.lock_expires_at,
            driver_id: row.driver_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RouteGroupRow {
    id: Uuid,
    order_ids: Vec<i64>,
    centroid_lat: Option<f64>,
    centroid_lng: Option<f64>,
    estimated_distance_km: f64,
    estimated_duration_minutes: f64,
    status: String,
    courier_id: Option<i64>,
    sequenced: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RouteGroupRow> for RouteGroup {
    type Error = StoreError;

    fn try_from(row: RouteGroupRow) -> Result<Self, Self::Error> {
        Ok(RouteGroup {
            id: row.id,
            order_ids: row.order_ids,
            centroid: coordinate(row.centroid_lat, row.centroid_lng),
            estimated_distance_km: row.estimated_distance_km,
            estimated_duration_minutes: row.estimated_duration_minutes,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            courier_id: row.courier_id,
            sequenced: row.sequenced,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct CourierRow {
    id: i64,
    name: String,
    status: String,
    lat: Option<f64>,
    lng: Option<f64>,
    active_group: Option<Uuid>,
}

impl TryFrom<CourierRow> for Courier {
    type Error = StoreError;

    fn try_from(row: CourierRow) -> Result<Self, Self::Error> {
        Ok(Courier {
            id: row.id,
            name: row.name,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            location: coordinate(row.lat, row.lng),
            active_group: row.active_group,
        })
    }
}

fn coordinate(lat: Option<f64>, lng: Option<f64>) -> Option<Coordinate> {
    match (lat, lng) {
        (Some(lat), Some(lng)) => Some(Coordinate::new(lat, lng)),
        _ => None,
    }
}

fn into_orders(rows: Vec<OrderRow>) -> Result<Vec<Order>, StoreError> {
    rows.into_iter().map(Order::try_from).collect()
}

async fn upsert_route_group<'e, E>(executor: E, group: &RouteGroup) -> Result<(), StoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO route_groups (id, order_ids, centroid_lat, centroid_lng,
             estimated_distance_km, estimated_duration_minutes, status, courier_id,
             sequenced, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
         ON CONFLICT (id) DO UPDATE SET
             order_ids = EXCLUDED.order_ids,
             centroid_lat = EXCLUDED.centroid_lat,
             centroid_lng = EXCLUDED.centroid_lng,
             estimated_distance_km = EXCLUDED.estimated_distance_km,
             estimated_duration_minutes = EXCLUDED.estimated_duration_minutes,
             status = EXCLUDED.status,
             courier_id = EXCLUDED.courier_id,
             sequenced = EXCLUDED.sequenced,
             updated_at = EXCLUDED.updated_at",
    )
    .bind(group.id)
    .bind(&group.order_ids)
    .bind(group.centroid.map(|c| c.lat))
    .bind(group.centroid.map(|c| c.lng))
    .bind(group.estimated_distance_km)
    .bind(group.estimated_duration_minutes)
    .bind(group.status.as_str())
    .bind(group.courier_id)
    .bind(group.sequenced)
    .bind(group.created_at)
    .bind(group.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl OrderStore for PgOrderStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn insert_order(&self, order: NewOrder, now: DateTime<Utc>) -> Result<Order, StoreError> {
        let row: OrderRow = sqlx::query_as(&format!(
            "INSERT INTO orders (id, address, lat, lng, total_cents, status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, 'available', $6, $6)
             RETURNING {ORDER_COLUMNS}"
        ))
        .bind(order.id)
        .bind(&order.address)
        .bind(order.coordinate.map(|c| c.lat))
        .bind(order.coordinate.map(|c| c.lng))
        .bind(order.total_cents)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_orders(&self, ids: &[OrderId]) -> Result<Vec<Order>, StoreError> {
        let rows: Vec<OrderRow> =
            sqlx::query_as(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ANY($1)"))
                .bind(ids)
                .fetch_all(&self.pool)
                .await?;
        into_orders(rows)
    }

    async fn available_orders(&self, area: Option<BoundingBox>) -> Result<Vec<Order>, StoreError> {
        let rows: Vec<OrderRow> = match area {
            None => {
                sqlx::query_as(&format!(
                    "SELECT {ORDER_COLUMNS} FROM orders WHERE status = 'available' ORDER BY id"
                ))
                .fetch_all(&self.pool)
                .await?
            }
            Some(bbox) => {
                sqlx::query_as(&format!(
                    "SELECT {ORDER_COLUMNS} FROM orders
                     WHERE status = 'available'
                       AND lat BETWEEN $1 AND $3 AND lng BETWEEN $2 AND $4
                     ORDER BY id"
                ))
                .bind(bbox.min_lat)
                .bind(bbox.min_lng)
                .bind(bbox.max_lat)
                .bind(bbox.max_lng)
                .fetch_all(&self.pool)
                .await?
            }
        };
        into_orders(rows)
    }

    async fn update_coordinate(
        &self,
        id: OrderId,
        coordinate: Coordinate,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE orders SET lat = $2, lng = $3, updated_at = $4 WHERE id = $1")
            .bind(id)
            .bind(coordinate.lat)
            .bind(coordinate.lng)
            .bind(now)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Backend(format!("order {} not found", id)));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn release_expired_locks(&self, now: DateTime<Utc>) -> Result<Vec<OrderId>, StoreError> {
        let released: Vec<i64> = sqlx::query_scalar(
            "UPDATE orders
             SET status = 'available', locked_by = NULL, lock_expires_at = NULL, updated_at = $1
             WHERE status = 'temporarily_locked' AND lock_expires_at < $1
             RETURNING id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(released)
    }

    #[instrument(skip(self, request), fields(courier_id = request.courier_id, orders = request.order_ids.len()))]
    async fn acquire_locks(&self, request: LockRequest<'_>) -> Result<ClaimOutcome, StoreError> {
        let query = sqlx::query_scalar(
            "UPDATE orders
             SET status = 'temporarily_locked', locked_by = $2, lock_expires_at = $3, updated_at = $4
             WHERE id = ANY($1)
               AND (status = 'available'
                    OR (status = 'temporarily_locked'
                        AND (locked_by = $2 OR lock_expires_at < $4)))
             RETURNING id",
        )
        .bind(request.order_ids)
        .bind(request.courier_id)
        .bind(request.expires_at)
        .bind(request.now);
        self.update_all(request.order_ids, query).await
    }

    async fn release_locks(
        &self,
        ids: &[OrderId],
        courier_id: CourierId,
        now: DateTime<Utc>,
    ) -> Result<Vec<OrderId>, StoreError> {
        let released: Vec<i64> = sqlx::query_scalar(
            "UPDATE orders
             SET status = 'available', locked_by = NULL, lock_expires_at = NULL, updated_at = $3
             WHERE id = ANY($1) AND status = 'temporarily_locked' AND locked_by = $2
             RETURNING id",
        )
        .bind(ids)
        .bind(courier_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(released)
    }

    async fn locks_held_by(
        &self,
        courier_id: CourierId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Order>, StoreError> {
        let rows: Vec<OrderRow> = sqlx::query_as(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE status = 'temporarily_locked' AND locked_by = $1 AND lock_expires_at >= $2
             ORDER BY id"
        ))
        .bind(courier_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        into_orders(rows)
    }

    #[instrument(skip(self, ids), fields(orders = ids.len()))]
    async fn commit_assignment(
        &self,
        ids: &[OrderId],
        courier_id: CourierId,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let query = sqlx::query_scalar(
            "UPDATE orders
             SET status = 'assigned', driver_id = $2, locked_by = NULL, lock_expires_at = NULL,
                 updated_at = $3
             WHERE id = ANY($1)
               AND (status = 'available'
                    OR (status = 'temporarily_locked' AND locked_by = $2 AND lock_expires_at >= $3))
             RETURNING id",
        )
        .bind(ids)
        .bind(courier_id)
        .bind(now);
        self.update_all(ids, query).await
    }

    async fn transition_orders(
        &self,
        ids: &[OrderId],
        courier_id: CourierId,
        from: OrderStatus,
        to: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let query = sqlx::query_scalar(
            "UPDATE orders SET status = $4, updated_at = $5
             WHERE id = ANY($1) AND driver_id = $2 AND status = $3
             RETURNING id",
        )
        .bind(ids)
        .bind(courier_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now);
        self.update_all(ids, query).await
    }

    async fn save_route_group(&self, group: &RouteGroup) -> Result<(), StoreError> {
        upsert_route_group(&self.pool, group).await
    }

    async fn get_route_group(&self, id: RouteGroupId) -> Result<Option<RouteGroup>, StoreError> {
        let row: Option<RouteGroupRow> = sqlx::query_as(
            "SELECT id, order_ids, centroid_lat, centroid_lng, estimated_distance_km,
                    estimated_duration_minutes, status, courier_id, sequenced, created_at, updated_at
             FROM route_groups WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RouteGroup::try_from).transpose()
    }

    async fn discard_planning_groups(
        &self,
        order_ids: &[OrderId],
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<RouteGroupId>, StoreError> {
        let discarded: Vec<Uuid> = sqlx::query_scalar(
            "DELETE FROM route_groups
             WHERE status = 'planning' AND (order_ids && $1 OR updated_at < $2)
             RETURNING id",
        )
        .bind(order_ids)
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(discarded)
    }

    #[instrument(skip(self, group), fields(route_group = %group.id, courier_id = ?group.courier_id))]
    async fn claim_courier(&self, group: &RouteGroup) -> Result<bool, StoreError> {
        let courier_id = group.courier_id.ok_or_else(|| unclaimed_group(group))?;
        let mut tx = self.pool.begin().await?;

        // Row lock first: the status read below then sees any claim that
        // committed while this one waited.
        let current: Option<Option<Uuid>> =
            sqlx::query_scalar("SELECT active_group FROM couriers WHERE id = $1 FOR UPDATE")
                .bind(courier_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(current) = current else {
            tx.rollback().await?;
            return Err(StoreError::Backend(format!("courier {} not found", courier_id)));
        };

        if let Some(active) = current {
            let status: Option<String> = sqlx::query_scalar("SELECT status FROM route_groups WHERE id = $1")
                .bind(active)
                .fetch_optional(&mut *tx)
                .await?;
            let busy = match status {
                Some(status) => status
                    .parse::<RouteGroupStatus>()
                    .map_err(StoreError::Corrupt)?
                    .is_active(),
                None => false,
            };
            if busy {
                tx.rollback().await?;
                debug!(courier_id, active = %active, "Courier already has an active route group");
                return Ok(false);
            }
        }

        upsert_route_group(&mut *tx, group).await?;
        sqlx::query("UPDATE couriers SET active_group = $2, status = 'busy' WHERE id = $1")
            .bind(courier_id)
            .bind(group.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn release_courier(&self, courier_id: CourierId, group_id: RouteGroupId) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE couriers SET active_group = NULL, status = 'online'
             WHERE id = $1 AND active_group = $2",
        )
        .bind(courier_id)
        .bind(group_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM route_groups WHERE id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save_courier(&self, courier: &Courier) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO couriers (id, name, status, lat, lng, active_group)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE SET
                 name = EXCLUDED.name,
                 status = EXCLUDED.status,
                 lat = EXCLUDED.lat,
                 lng = EXCLUDED.lng,
                 active_group = EXCLUDED.active_group",
        )
        .bind(courier.id)
        .bind(&courier.name)
        .bind(courier.status.as_str())
        .bind(courier.location.map(|c| c.lat))
        .bind(courier.location.map(|c| c.lng))
        .bind(courier.active_group)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_courier(&self, id: CourierId) -> Result<Option<Courier>, StoreError> {
        let row: Option<CourierRow> = sqlx::query_as(
            "SELECT id, name, status, lat, lng, active_group FROM couriers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Courier::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_row(status: &str) -> OrderRow {
        let now = Utc::now();
        OrderRow {
            id: 42,
            address: "No. 7 Section 5 Xinyi Rd".into(),
            lat: Some(25.033),
            lng: None,
            total_cents: 9_900,
            status: status.into(),
            locked_by: None,
            lock_expires_at: None,
            driver_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_order_row_requires_both_coordinates() {
        let order = Order::try_from(order_row("available")).unwrap();
        assert_eq!(order.status, OrderStatus::Available);
        assert!(order.coordinate.is_none());
    }

    #[test]
    fn test_unknown_status_is_corrupt() {
        let err = Order::try_from(order_row("lost")).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }
}

/// Runs against a real database: `DATABASE_URL=... cargo test --features test-postgres`.
/// Each test gets a fresh database with the migrations applied.
#[cfg(all(test, feature = "test-postgres"))]
mod pg_tests {
    use super::*;
    use chrono::Duration;

    async fn store_with(pool: PgPool, ids: &[OrderId], now: DateTime<Utc>) -> PgOrderStore {
        let store = PgOrderStore::new(pool);
        for &id in ids {
            store
                .insert_order(
                    NewOrder {
                        id,
                        address: format!("No. {} Roosevelt Rd", id),
                        coordinate: Some(Coordinate::new(25.02, 121.53)),
                        total_cents: 52_000,
                    },
                    now,
                )
                .await
                .unwrap();
        }
        store
    }

    fn request(ids: &[OrderId], courier_id: CourierId, now: DateTime<Utc>, ttl_secs: i64) -> LockRequest<'_> {
        LockRequest {
            order_ids: ids,
            courier_id,
            now,
            expires_at: now + Duration::seconds(ttl_secs),
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_lock_rejection_names_conflicts_and_locks_nothing(pool: PgPool) {
        let now = Utc::now();
        let store = store_with(pool, &[1, 2, 3], now).await;
        assert!(store.acquire_locks(request(&[2], 9, now, 30)).await.unwrap().is_applied());

        let outcome = store.acquire_locks(request(&[1, 2, 3, 4], 7, now, 30)).await.unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Rejected {
                conflicting: vec![2],
                missing: vec![4]
            }
        );

        let untouched = store.get_orders(&[1, 3]).await.unwrap();
        assert!(untouched.iter().all(|o| o.status == OrderStatus::Available && o.locked_by.is_none()));
        assert!(store.locks_held_by(7, now).await.unwrap().is_empty());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_expired_lock_can_be_taken_over(pool: PgPool) {
        let now = Utc::now();
        let store = store_with(pool, &[1], now).await;
        store.acquire_locks(request(&[1], 9, now, 5)).await.unwrap();

        let early = store.acquire_locks(request(&[1], 7, now + Duration::seconds(4), 30)).await.unwrap();
        assert!(!early.is_applied());

        let later = now + Duration::seconds(6);
        let taken = store.acquire_locks(request(&[1], 7, later, 30)).await.unwrap();
        assert_eq!(taken, ClaimOutcome::Applied(vec![1]));
        let order = &store.get_orders(&[1]).await.unwrap()[0];
        assert_eq!(order.locked_by, Some(7));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_relock_by_same_courier_refreshes_expiry(pool: PgPool) {
        let now = Utc::now();
        let store = store_with(pool, &[1, 2], now).await;
        store.acquire_locks(request(&[1], 7, now, 30)).await.unwrap();

        let later = now + Duration::seconds(20);
        let outcome = store.acquire_locks(request(&[1, 2], 7, later, 30)).await.unwrap();
        assert!(outcome.is_applied());

        let orders = store.get_orders(&[1, 2]).await.unwrap();
        for order in orders {
            let expires = order.lock_expires_at.unwrap();
            assert!((expires - (later + Duration::seconds(30))).num_milliseconds().abs() < 1);
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_commit_rejected_after_lock_expiry(pool: PgPool) {
        let now = Utc::now();
        let store = store_with(pool, &[1, 2], now).await;
        store.acquire_locks(request(&[1, 2], 7, now, 10)).await.unwrap();

        let late = now + Duration::seconds(11);
        store.release_expired_locks(late).await.unwrap();
        store.acquire_locks(request(&[2], 9, late, 30)).await.unwrap();

        let outcome = store.commit_assignment(&[1, 2], 7, late).await.unwrap();
        assert_eq!(
            outcome,
            ClaimOutcome::Rejected {
                conflicting: vec![2],
                missing: vec![]
            }
        );
        let first = &store.get_orders(&[1]).await.unwrap()[0];
        assert_eq!(first.status, OrderStatus::Available);
        assert!(first.driver_id.is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_courier_claim_is_exclusive(pool: PgPool) {
        let now = Utc::now();
        let store = store_with(pool, &[1, 2], now).await;
        store.save_courier(&Courier::new(7, "Bravo")).await.unwrap();

        let mut first = RouteGroup::new(vec![1], None, now);
        first.status = RouteGroupStatus::Assigned;
        first.courier_id = Some(7);
        let mut second = RouteGroup::new(vec![2], None, now);
        second.status = RouteGroupStatus::Assigned;
        second.courier_id = Some(7);

        assert!(store.claim_courier(&first).await.unwrap());
        assert!(!store.claim_courier(&second).await.unwrap());
        assert!(store.get_route_group(second.id).await.unwrap().is_none());

        store.release_courier(7, first.id).await.unwrap();
        assert!(store.get_route_group(first.id).await.unwrap().is_none());
        assert!(store.claim_courier(&second).await.unwrap());
        let courier = store.get_courier(7).await.unwrap().unwrap();
        assert_eq!(courier.active_group, Some(second.id));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_discard_planning_groups_by_overlap_and_age(pool: PgPool) {
        let now = Utc::now();
        let store = store_with(pool, &[1, 2, 3], now).await;
        let overlapping = RouteGroup::new(vec![1, 2], None, now);
        let stale = RouteGroup::new(vec![3], None, now - Duration::hours(2));
        let fresh = RouteGroup::new(vec![3], None, now);
        for group in [&overlapping, &stale, &fresh] {
            store.save_route_group(group).await.unwrap();
        }

        let discarded = store
            .discard_planning_groups(&[2], now - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(discarded.len(), 2);
        assert!(!discarded.contains(&fresh.id));
        assert!(store.get_route_group(fresh.id).await.unwrap().is_some());
    }
}
