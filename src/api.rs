//! REST API for courier dispatch.
//!
//! Provides endpoints for:
//! - Listing available orders, optionally by area
//! - Locking and unlocking orders, checking a courier's locks
//! - Clustering orders into route groups and sequencing them
//! - Batch assignment and the delivery lifecycle
//! - Distance provider telemetry and cache purge
//! - Swagger UI at /q/swagger-ui
//!
//! The acting courier is identified by the `x-courier-id` header.

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::cluster::{ClusterAlgorithm, ClusterParams, OrderCluster};
use crate::console;
use crate::coordinator::{
    BatchAssignment, ClusteringResult, CompletionOutcome, DispatchCoordinator, DispatchPhase,
    PlannedGroup,
};
use crate::distance::{CacheStats, DistanceTelemetry, PurgeScope};
use crate::domain::{
    BoundingBox, Coordinate, CourierId, Order, OrderId, OrderStatus, RouteGroup, RouteGroupStatus,
    TravelMode,
};
use crate::error::DispatchError;
use crate::lock::LockGrant;
use crate::sequencer::{Confidence, RouteSequence, SequenceStrategy};

/// Header carrying the acting courier's id.
pub const COURIER_HEADER: &str = "x-courier-id";

/// Application state shared across handlers.
pub struct AppState {
    pub coordinator: Arc<DispatchCoordinator>,
    /// Print dispatch summaries to the console.
    pub console: bool,
}

impl AppState {
    pub fn new(coordinator: Arc<DispatchCoordinator>) -> Self {
        Self {
            coordinator,
            console: false,
        }
    }

    pub fn with_console(mut self, enabled: bool) -> Self {
        self.console = enabled;
        self
    }
}

/// Creates the API router with CORS, request tracing and Swagger UI enabled.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health & Info
        .route("/health", get(health))
        .route("/info", get(info))
        // Orders and locks
        .route("/orders/available", get(available_orders))
        .route("/orders/lock", post(lock_orders))
        .route("/orders/unlock", post(unlock_orders))
        .route("/orders/{id}/complete", post(complete_order))
        .route("/couriers/{id}/locks", get(check_locks))
        // Route groups
        .route("/route-groups", post(cluster_orders))
        .route("/route-groups/{id}", get(get_route_group))
        .route("/route-groups/{id}/optimize", post(optimize_route))
        .route("/route-groups/{id}/start", post(start_delivery))
        // Dispatch
        .route("/dispatch/assign", post(assign_batch))
        // Distance provider
        .route("/distance/telemetry", get(distance_telemetry))
        .route("/distance/cache", delete(purge_cache))
        // Swagger UI at /q/swagger-ui (Quarkus-style path)
        .merge(SwaggerUi::new("/q/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

// ============================================================================
// Errors & Extractors
// ============================================================================

/// Error body returned for every failed request.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Machine-readable error kind.
    pub error: String,
    pub message: String,
    /// Orders that blocked a lock or assignment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicting_order_ids: Vec<OrderId>,
}

fn error_response(status: StatusCode, kind: &str, message: String, conflicting: Vec<OrderId>) -> Response {
    let body = ErrorResponse {
        error: kind.to_string(),
        message,
        conflicting_order_ids: conflicting,
    };
    (status, Json(body)).into_response()
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            DispatchError::Validation(_) => {
                error_response(StatusCode::BAD_REQUEST, "validation", message, Vec::new())
            }
            DispatchError::Conflict { order_ids } => {
                error_response(StatusCode::CONFLICT, "conflict", message, order_ids)
            }
            DispatchError::NotFound(_) => {
                error_response(StatusCode::NOT_FOUND, "not_found", message, Vec::new())
            }
            DispatchError::ProviderUnavailable(_) => {
                error_response(StatusCode::BAD_GATEWAY, "provider_unavailable", message, Vec::new())
            }
            DispatchError::TransientStore { .. } => error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                message,
                Vec::new(),
            ),
            DispatchError::Store(_) => {
                tracing::error!(error = %message, "Store failure");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", message, Vec::new())
            }
        }
    }
}

/// Courier id taken from the `x-courier-id` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CourierIdentity(pub CourierId);

impl<S: Send + Sync> FromRequestParts<S> for CourierIdentity {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(COURIER_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                error_response(
                    StatusCode::UNAUTHORIZED,
                    "missing_courier",
                    format!("{} header is required", COURIER_HEADER),
                    Vec::new(),
                )
            })?;

        raw.trim().parse::<CourierId>().map(CourierIdentity).map_err(|_| {
            error_response(
                StatusCode::BAD_REQUEST,
                "validation",
                format!("{} must be an integer", COURIER_HEADER),
                Vec::new(),
            )
        })
    }
}

// ============================================================================
// Health & Info
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Status indicator ("UP" when healthy).
    pub status: &'static str,
}

/// GET /health - Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "UP" })
}

/// Application info response.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub name: &'static str,
    pub version: &'static str,
    /// Order store backend.
    pub store: &'static str,
    /// Distance provider in use.
    pub distance_provider: &'static str,
}

/// GET /info - Application info endpoint.
#[utoipa::path(
    get,
    path = "/info",
    responses((status = 200, description = "Application info", body = InfoResponse))
)]
async fn info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        name: "Courier Dispatch",
        version: env!("CARGO_PKG_VERSION"),
        store: state.coordinator.store().backend(),
        distance_provider: state.coordinator.distance().provider_name(),
    })
}

// ============================================================================
// Orders & Locks
// ============================================================================

/// Area filter: either a full bounding box or a center with a radius.
#[derive(Debug, Default, Deserialize, utoipa::IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct AreaQuery {
    pub min_lat: Option<f64>,
    pub min_lng: Option<f64>,
    pub max_lat: Option<f64>,
    pub max_lng: Option<f64>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub radius_km: Option<f64>,
}

impl AreaQuery {
    /// Resolves the query into an optional area.
    ///
    /// ```
    /// use courier_dispatch::api::AreaQuery;
    ///
    /// assert!(AreaQuery::default().to_area().unwrap().is_none());
    ///
    /// let near = AreaQuery { lat: Some(25.03), lng: Some(121.56), radius_km: Some(2.0), ..Default::default() };
    /// assert!(near.to_area().unwrap().is_some());
    ///
    /// let partial = AreaQuery { min_lat: Some(25.0), ..Default::default() };
    /// assert!(partial.to_area().is_err());
    /// ```
    pub fn to_area(&self) -> Result<Option<BoundingBox>, DispatchError> {
        let bbox = [self.min_lat, self.min_lng, self.max_lat, self.max_lng];
        let circle = [self.lat, self.lng, self.radius_km];

        let area = match (bbox, circle) {
            ([None, None, None, None], [None, None, None]) => None,
            ([Some(a), Some(b), Some(c), Some(d)], [None, None, None]) => Some(BoundingBox::new(a, b, c, d)),
            ([None, None, None, None], [Some(lat), Some(lng), Some(radius)]) => {
                if !(radius.is_finite() && radius > 0.0) {
                    return Err(DispatchError::validation("radiusKm must be positive"));
                }
                let center = Coordinate::new(lat, lng);
                if !center.is_valid() {
                    return Err(DispatchError::validation(format!("invalid center {}", center)));
                }
                Some(BoundingBox::around(center, radius))
            }
            _ => {
                return Err(DispatchError::validation(
                    "give either minLat/minLng/maxLat/maxLng or lat/lng/radiusKm",
                ))
            }
        };
        Ok(area)
    }
}

/// GET /orders/available - Available orders, optionally within an area.
#[utoipa::path(
    get,
    path = "/orders/available",
    params(AreaQuery),
    responses(
        (status = 200, description = "Available orders", body = Vec<Order>),
        (status = 400, description = "Invalid area", body = ErrorResponse)
    )
)]
async fn available_orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AreaQuery>,
) -> Result<Json<Vec<Order>>, DispatchError> {
    let area = query.to_area()?;
    Ok(Json(state.coordinator.available_orders(area).await?))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LockOrdersRequest {
    pub order_ids: Vec<OrderId>,
    /// Lock lifetime; the configured default when omitted.
    pub ttl_seconds: Option<u64>,
}

/// POST /orders/lock - Lock a batch of orders for the calling courier.
#[utoipa::path(
    post,
    path = "/orders/lock",
    request_body = LockOrdersRequest,
    params(("x-courier-id" = i64, Header, description = "Acting courier")),
    responses(
        (status = 200, description = "All orders locked", body = LockGrant),
        (status = 409, description = "Some orders are unavailable; none were locked", body = ErrorResponse)
    )
)]
async fn lock_orders(
    State(state): State<Arc<AppState>>,
    CourierIdentity(courier_id): CourierIdentity,
    Json(request): Json<LockOrdersRequest>,
) -> Result<Json<LockGrant>, DispatchError> {
    let grant = state
        .coordinator
        .locks()
        .lock(&request.order_ids, courier_id, request.ttl_seconds)
        .await?;
    Ok(Json(grant))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnlockOrdersRequest {
    pub order_ids: Vec<OrderId>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnlockOrdersResponse {
    pub unlocked_order_ids: Vec<OrderId>,
}

/// POST /orders/unlock - Release the caller's locks on the given orders.
#[utoipa::path(
    post,
    path = "/orders/unlock",
    request_body = UnlockOrdersRequest,
    params(("x-courier-id" = i64, Header, description = "Acting courier")),
    responses((status = 200, description = "Orders released", body = UnlockOrdersResponse))
)]
async fn unlock_orders(
    State(state): State<Arc<AppState>>,
    CourierIdentity(courier_id): CourierIdentity,
    Json(request): Json<UnlockOrdersRequest>,
) -> Result<Json<UnlockOrdersResponse>, DispatchError> {
    let unlocked = state
        .coordinator
        .locks()
        .unlock(&request.order_ids, courier_id)
        .await?;
    Ok(Json(UnlockOrdersResponse {
        unlocked_order_ids: unlocked,
    }))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocksResponse {
    pub courier_id: CourierId,
    pub locked_orders: Vec<Order>,
}

/// GET /couriers/{id}/locks - Orders a courier holds, after sweeping expired locks.
#[utoipa::path(
    get,
    path = "/couriers/{id}/locks",
    params(("id" = i64, Path, description = "Courier ID")),
    responses((status = 200, description = "Locked orders", body = LocksResponse))
)]
async fn check_locks(
    State(state): State<Arc<AppState>>,
    Path(courier_id): Path<CourierId>,
) -> Result<Json<LocksResponse>, DispatchError> {
    let locked_orders = state.coordinator.locks().check_locks(courier_id).await?;
    Ok(Json(LocksResponse {
        courier_id,
        locked_orders,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompleteOrderRequest {
    /// False records a failed delivery.
    #[serde(default = "default_delivered")]
    pub delivered: bool,
}

fn default_delivered() -> bool {
    true
}

/// POST /orders/{id}/complete - Record the outcome of a delivery.
#[utoipa::path(
    post,
    path = "/orders/{id}/complete",
    request_body = CompleteOrderRequest,
    params(
        ("id" = i64, Path, description = "Order ID"),
        ("x-courier-id" = i64, Header, description = "Acting courier")
    ),
    responses(
        (status = 200, description = "Order completed", body = CompletionOutcome),
        (status = 409, description = "Order is not being delivered by this courier", body = ErrorResponse)
    )
)]
async fn complete_order(
    State(state): State<Arc<AppState>>,
    CourierIdentity(courier_id): CourierIdentity,
    Path(order_id): Path<OrderId>,
    Json(request): Json<CompleteOrderRequest>,
) -> Result<Json<CompletionOutcome>, DispatchError> {
    let outcome = state
        .coordinator
        .complete_order(courier_id, order_id, request.delivered)
        .await?;
    Ok(Json(outcome))
}

// ============================================================================
// Route Groups
// ============================================================================

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRequest {
    /// Orders to cluster; every available order (in `area`) when omitted.
    pub order_ids: Option<Vec<OrderId>>,
    pub max_group_size: Option<usize>,
    pub max_distance_km: Option<f64>,
    pub algorithm: Option<ClusterAlgorithm>,
    pub area: Option<BoundingBox>,
}

/// POST /route-groups - Cluster orders into planning route groups.
#[utoipa::path(
    post,
    path = "/route-groups",
    request_body = ClusterRequest,
    responses(
        (status = 200, description = "Planned groups", body = ClusteringResult),
        (status = 400, description = "Invalid parameters", body = ErrorResponse)
    )
)]
async fn cluster_orders(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ClusterRequest>,
) -> Result<Json<ClusteringResult>, DispatchError> {
    let params: ClusterParams = state.coordinator.clustering().params(
        request.max_group_size,
        request.max_distance_km,
        request.algorithm,
    );
    let result = state
        .coordinator
        .cluster_orders(request.order_ids.as_deref(), request.area, params)
        .await?;
    if state.console {
        console::print_clustering(&result);
    }
    Ok(Json(result))
}

/// GET /route-groups/{id} - Get a route group.
#[utoipa::path(
    get,
    path = "/route-groups/{id}",
    params(("id" = String, Path, description = "Route group ID")),
    responses(
        (status = 200, description = "Route group", body = RouteGroup),
        (status = 404, description = "Not found", body = ErrorResponse)
    )
)]
async fn get_route_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RouteGroup>, DispatchError> {
    Ok(Json(state.coordinator.route_group(id).await?))
}

/// POST /route-groups/{id}/optimize - Sequence a route group.
#[utoipa::path(
    post,
    path = "/route-groups/{id}/optimize",
    params(("id" = String, Path, description = "Route group ID")),
    responses(
        (status = 200, description = "Optimized sequence", body = RouteSequence),
        (status = 404, description = "Not found", body = ErrorResponse)
    )
)]
async fn optimize_route(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RouteSequence>, DispatchError> {
    let route = state.coordinator.optimize_group(id).await?;
    if state.console {
        console::print_route(id, &route);
    }
    Ok(Json(route))
}

/// POST /route-groups/{id}/start - Start delivering an assigned group.
#[utoipa::path(
    post,
    path = "/route-groups/{id}/start",
    params(
        ("id" = String, Path, description = "Route group ID"),
        ("x-courier-id" = i64, Header, description = "Acting courier")
    ),
    responses(
        (status = 200, description = "Delivery started", body = RouteGroup),
        (status = 400, description = "Group not assigned to this courier", body = ErrorResponse)
    )
)]
async fn start_delivery(
    State(state): State<Arc<AppState>>,
    CourierIdentity(courier_id): CourierIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<RouteGroup>, DispatchError> {
    Ok(Json(state.coordinator.start_delivery(courier_id, id).await?))
}

// ============================================================================
// Dispatch
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssignBatchRequest {
    pub order_ids: Vec<OrderId>,
}

/// POST /dispatch/assign - Lock, validate and assign a batch to the caller.
#[utoipa::path(
    post,
    path = "/dispatch/assign",
    request_body = AssignBatchRequest,
    params(("x-courier-id" = i64, Header, description = "Acting courier")),
    responses(
        (status = 200, description = "Batch assigned", body = BatchAssignment),
        (status = 409, description = "Conflicting orders; nothing was assigned", body = ErrorResponse),
        (status = 503, description = "Store unavailable after retries", body = ErrorResponse)
    )
)]
async fn assign_batch(
    State(state): State<Arc<AppState>>,
    CourierIdentity(courier_id): CourierIdentity,
    Json(request): Json<AssignBatchRequest>,
) -> Result<Json<BatchAssignment>, DispatchError> {
    let assignment = state
        .coordinator
        .assign_batch(courier_id, &request.order_ids)
        .await?;
    if state.console {
        console::print_batch_assigned(&assignment);
    }
    Ok(Json(assignment))
}

// ============================================================================
// Distance Provider
// ============================================================================

/// GET /distance/telemetry - Provider call counts and cache statistics.
#[utoipa::path(
    get,
    path = "/distance/telemetry",
    responses(
        (status = 200, description = "Telemetry", body = DistanceTelemetry),
        (status = 503, description = "Cache store unavailable")
    )
)]
async fn distance_telemetry(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DistanceTelemetry>, DispatchError> {
    Ok(Json(state.coordinator.distance().telemetry().await?))
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PurgeQuery {
    /// all, distances, geocodes or expired (default all).
    #[serde(default)]
    pub scope: PurgeScope,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PurgeResponse {
    pub scope: PurgeScope,
    pub removed: usize,
}

/// DELETE /distance/cache - Purge cached distances and geocodes.
#[utoipa::path(
    delete,
    path = "/distance/cache",
    params(PurgeQuery),
    responses((status = 200, description = "Entries removed", body = PurgeResponse))
)]
async fn purge_cache(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PurgeQuery>,
) -> Result<Json<PurgeResponse>, DispatchError> {
    let removed = state.coordinator.distance().cache().purge(query.scope).await?;
    tracing::info!(scope = ?query.scope, removed, "Distance cache purged");
    Ok(Json(PurgeResponse {
        scope: query.scope,
        removed,
    }))
}

// ============================================================================
// OpenAPI Documentation
// ============================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        info,
        available_orders,
        lock_orders,
        unlock_orders,
        check_locks,
        complete_order,
        cluster_orders,
        get_route_group,
        optimize_route,
        start_delivery,
        assign_batch,
        distance_telemetry,
        purge_cache,
    ),
    components(schemas(
        HealthResponse,
        InfoResponse,
        ErrorResponse,
        LockOrdersRequest,
        UnlockOrdersRequest,
        UnlockOrdersResponse,
        LocksResponse,
        CompleteOrderRequest,
        ClusterRequest,
        AssignBatchRequest,
        PurgeResponse,
        Coordinate,
        BoundingBox,
        Order,
        OrderStatus,
        RouteGroup,
        RouteGroupStatus,
        TravelMode,
        LockGrant,
        ClusterAlgorithm,
        OrderCluster,
        PlannedGroup,
        ClusteringResult,
        RouteSequence,
        SequenceStrategy,
        Confidence,
        BatchAssignment,
        DispatchPhase,
        CompletionOutcome,
        DistanceTelemetry,
        CacheStats,
        PurgeScope,
    ))
)]
struct ApiDoc;
