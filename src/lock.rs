//! Time-bounded order locks.
//!
//! A courier locks a batch while reviewing it. Locks are all-or-nothing per
//! call, owned by exactly one courier and expire on their own after the TTL.
//! Expired locks are swept back to `available` before any lock is evaluated,
//! so the periodic sweeper only keeps listings tidy; correctness never waits
//! for it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;

use crate::clock::Clock;
use crate::config::ttl_duration;
use crate::domain::{CourierId, Order, OrderId};
use crate::error::{DispatchError, Result};
use crate::events::{DispatchEvent, EventPublisher, NoopPublisher};
use crate::store::{ClaimOutcome, LockRequest, OrderStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub default_ttl_secs: u64,
    pub min_ttl_secs: u64,
    pub max_ttl_secs: u64,
    /// Largest number of orders one call may lock.
    pub max_batch_size: usize,
    pub sweep_interval_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 30,
            min_ttl_secs: 1,
            max_ttl_secs: 300,
            max_batch_size: 20,
            sweep_interval_secs: 15,
        }
    }
}

/// Locks granted by a successful [`OrderLockManager::lock`].
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LockGrant {
    pub locked_order_ids: Vec<OrderId>,
    pub expires_at: DateTime<Utc>,
}

/// Checks a requested id list and removes duplicates, keeping first occurrences.
///
/// ```
/// use courier_dispatch::lock::normalize_order_ids;
///
/// assert_eq!(normalize_order_ids(&[3, 1, 3, 2], 10).unwrap(), vec![3, 1, 2]);
/// assert!(normalize_order_ids(&[], 10).is_err());
/// assert!(normalize_order_ids(&[1, 2, 3], 2).is_err());
/// ```
pub fn normalize_order_ids(order_ids: &[OrderId], max_batch_size: usize) -> Result<Vec<OrderId>> {
    if order_ids.is_empty() {
        return Err(DispatchError::validation("order id list is empty"));
    }
    let mut ids = Vec::with_capacity(order_ids.len());
    for id in order_ids {
        if !ids.contains(id) {
            ids.push(*id);
        }
    }
    if ids.len() > max_batch_size {
        return Err(DispatchError::validation(format!(
            "{} orders requested, at most {} allowed",
            ids.len(),
            max_batch_size
        )));
    }
    Ok(ids)
}

/// Turns a store rejection into the matching error.
pub(crate) fn rejection_error(outcome: ClaimOutcome) -> DispatchError {
    match outcome {
        ClaimOutcome::Rejected { missing, .. } if !missing.is_empty() => {
            DispatchError::NotFound(format!("orders {:?}", missing))
        }
        ClaimOutcome::Rejected { conflicting, .. } => DispatchError::conflict(conflicting),
        ClaimOutcome::Applied(_) => DispatchError::conflict(Vec::new()),
    }
}

pub struct OrderLockManager {
    store: Arc<dyn OrderStore>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventPublisher>,
    config: LockConfig,
}

impl OrderLockManager {
    pub fn new(store: Arc<dyn OrderStore>, clock: Arc<dyn Clock>, config: LockConfig) -> Self {
        Self {
            store,
            clock,
            events: Arc::new(NoopPublisher),
            config,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn ttl(&self, ttl_secs: Option<u64>) -> Result<Duration> {
        let secs = ttl_secs.unwrap_or(self.config.default_ttl_secs);
        if !(self.config.min_ttl_secs..=self.config.max_ttl_secs).contains(&secs) {
            return Err(DispatchError::validation(format!(
                "ttl must be between {} and {} seconds",
                self.config.min_ttl_secs, self.config.max_ttl_secs
            )));
        }
        Ok(ttl_duration(secs))
    }

    /// Locks every order in `order_ids` for `courier_id`, or none of them.
    ///
    /// Orders the courier already holds count as lockable; their expiry moves
    /// to `now + ttl` along with the rest of the batch.
    #[instrument(skip(self, order_ids), fields(order_count = order_ids.len()))]
    pub async fn lock(
        &self,
        order_ids: &[OrderId],
        courier_id: CourierId,
        ttl_secs: Option<u64>,
    ) -> Result<LockGrant> {
        let ids = normalize_order_ids(order_ids, self.config.max_batch_size)?;
        let ttl = self.ttl(ttl_secs)?;

        self.sweep_expired().await?;

        let now = self.clock.now();
        let expires_at = now + ttl;
        let outcome = self
            .store
            .acquire_locks(LockRequest {
                order_ids: &ids,
                courier_id,
                now,
                expires_at,
            })
            .await?;

        match outcome {
            ClaimOutcome::Applied(locked) => {
                info!(courier_id, orders = ?locked, %expires_at, "Orders locked");
                self.events.publish(DispatchEvent::OrdersLocked {
                    courier_id,
                    order_ids: locked.clone(),
                    expires_at,
                });
                Ok(LockGrant {
                    locked_order_ids: locked,
                    expires_at,
                })
            }
            rejected => {
                debug!(courier_id, ?rejected, "Lock rejected");
                Err(rejection_error(rejected))
            }
        }
    }

    /// Releases the locks `courier_id` holds among `order_ids`.
    ///
    /// Ids locked by someone else, or not locked at all, are skipped.
    #[instrument(skip(self, order_ids))]
    pub async fn unlock(&self, order_ids: &[OrderId], courier_id: CourierId) -> Result<Vec<OrderId>> {
        let ids = normalize_order_ids(order_ids, self.config.max_batch_size)?;
        let released = self
            .store
            .release_locks(&ids, courier_id, self.clock.now())
            .await?;

        if !released.is_empty() {
            info!(courier_id, orders = ?released, "Orders unlocked");
            self.events.publish(DispatchEvent::OrdersUnlocked {
                courier_id,
                order_ids: released.clone(),
            });
        }
        Ok(released)
    }

    /// Orders `courier_id` currently holds, after sweeping expired locks.
    #[instrument(skip(self))]
    pub async fn check_locks(&self, courier_id: CourierId) -> Result<Vec<Order>> {
        self.sweep_expired().await?;
        Ok(self
            .store
            .locks_held_by(courier_id, self.clock.now())
            .await?)
    }

    /// Returns every lock whose expiry has passed to `available`.
    pub async fn sweep_expired(&self) -> Result<Vec<OrderId>> {
        let released = self.store.release_expired_locks(self.clock.now()).await?;
        if !released.is_empty() {
            info!(orders = ?released, "Expired locks released");
            self.events.publish(DispatchEvent::LocksExpired {
                order_ids: released.clone(),
            });
        }
        Ok(released)
    }

    /// Runs [`Self::sweep_expired`] every `sweep_interval_secs` until the task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        let period = std::time::Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_expired().await {
                    warn!(error = %e, "Lock sweep failed");
                }
            }
        })
    }
}
