//! Courier Dispatch
//!
//! Dispatch core for a grocery delivery service: couriers claim batches of
//! orders, nearby orders are grouped into route groups, and each group is
//! sequenced into a short delivery route.
//!
//! # Domain Model
//!
//! - [`Order`](domain::Order): Delivery with an address, optional coordinate and lock state
//! - [`Courier`](domain::Courier): Driver with a location and at most one active route group
//! - [`RouteGroup`](domain::RouteGroup): Orders delivered together by one courier
//!
//! # Components
//!
//! - [`OrderLockManager`](lock::OrderLockManager): All-or-nothing order locks with expiry
//! - [`ClusteringEngine`](cluster::ClusteringEngine): Groups orders by proximity under size and radius limits
//! - [`RouteSequencer`](sequencer::RouteSequencer): Nearest-neighbour plus 2-opt stop ordering
//! - [`DistanceService`](distance::DistanceService): Cached distance and geocoding lookups
//! - [`DispatchCoordinator`](coordinator::DispatchCoordinator): Lock, validate, assign and sequence as one operation

pub mod api;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod console;
pub mod coordinator;
pub mod demo_data;
pub mod distance;
pub mod domain;
pub mod error;
pub mod events;
pub mod geometry;
pub mod lock;
pub mod sequencer;
pub mod store;
