//! Outbound dispatch events.
//!
//! Core operations publish to an [`EventPublisher`] and move on; delivery to
//! couriers (push, chat bots, ...) happens elsewhere and may fail without
//! affecting dispatch state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::domain::{CourierId, OrderId, RouteGroupId};
use crate::sequencer::Confidence;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    OrdersLocked {
        courier_id: CourierId,
        order_ids: Vec<OrderId>,
        expires_at: DateTime<Utc>,
    },
    OrdersUnlocked {
        courier_id: CourierId,
        order_ids: Vec<OrderId>,
    },
    LocksExpired {
        order_ids: Vec<OrderId>,
    },
    BatchAssigned {
        courier_id: CourierId,
        route_group_id: RouteGroupId,
        order_ids: Vec<OrderId>,
    },
    RouteOptimized {
        route_group_id: RouteGroupId,
        sequence: Vec<OrderId>,
        total_distance_km: f64,
        total_duration_minutes: f64,
        confidence: Confidence,
    },
    DeliveryStarted {
        courier_id: CourierId,
        route_group_id: RouteGroupId,
    },
    DeliveryCompleted {
        courier_id: CourierId,
        order_id: OrderId,
        delivered: bool,
    },
}

impl DispatchEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchEvent::OrdersLocked { .. } => "orders_locked",
            DispatchEvent::OrdersUnlocked { .. } => "orders_unlocked",
            DispatchEvent::LocksExpired { .. } => "locks_expired",
            DispatchEvent::BatchAssigned { .. } => "batch_assigned",
            DispatchEvent::RouteOptimized { .. } => "route_optimized",
            DispatchEvent::DeliveryStarted { .. } => "delivery_started",
            DispatchEvent::DeliveryCompleted { .. } => "delivery_completed",
        }
    }
}

/// Fire-and-forget sink for [`DispatchEvent`]s.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: DispatchEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: DispatchEvent) {}
}

/// Pushes events onto an unbounded queue.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<DispatchEvent>,
}

impl EventPublisher for ChannelPublisher {
    fn publish(&self, event: DispatchEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!(kind = e.0.kind(), "Event dropped, no subscriber");
        }
    }
}

/// Creates a publisher and the receiving end of its queue.
pub fn channel() -> (ChannelPublisher, mpsc::UnboundedReceiver<DispatchEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelPublisher { tx }, rx)
}

/// Drains the queue, handing each event to the notification log.
pub fn spawn_notification_relay(mut rx: mpsc::UnboundedReceiver<DispatchEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let payload = serde_json::to_string(&event).unwrap_or_default();
            info!(target: "courier_dispatch::notify", kind = event.kind(), %payload, "Notification");
        }
        debug!("Notification relay stopped");
    })
}
