//! HTTP API tests driven through the router without a socket.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Duration;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use courier_dispatch::api::{create_router, AppState, COURIER_HEADER};
use courier_dispatch::clock::{Clock, ManualClock};
use courier_dispatch::config::DispatchConfig;
use courier_dispatch::coordinator::DispatchCoordinator;
use courier_dispatch::distance::{CacheConfig, DistanceCache, DistanceService, HaversineProvider};
use courier_dispatch::domain::Coordinate;
use courier_dispatch::events::NoopPublisher;
use courier_dispatch::store::{MemoryOrderStore, NewOrder, OrderStore};

struct TestApp {
    router: Router,
    clock: ManualClock,
}

async fn app() -> TestApp {
    let store = Arc::new(MemoryOrderStore::new());
    let clock = ManualClock::new();
    let orders = [
        (101, Some((25.0260, 121.5430))),
        (102, Some((25.0300, 121.5480))),
        (103, Some((25.0220, 121.5400))),
        (104, None),
    ];
    for (id, coordinate) in orders {
        store
            .insert_order(
                NewOrder {
                    id,
                    address: format!("No. {}, Sec. 2, Heping E. Rd.", id),
                    coordinate: coordinate.map(|(lat, lng)| Coordinate::new(lat, lng)),
                    total_cents: 32_000,
                },
                clock.now(),
            )
            .await
            .unwrap();
    }

    let cache = Arc::new(DistanceCache::new(CacheConfig::default(), Arc::new(clock.clone())));
    let distance = Arc::new(DistanceService::new(cache, Arc::new(HaversineProvider::new(1.3)), 1.3));
    let coordinator = Arc::new(DispatchCoordinator::new(
        store,
        distance,
        Arc::new(clock.clone()),
        Arc::new(NoopPublisher),
        &DispatchConfig::default(),
    ));

    TestApp {
        router: create_router(Arc::new(AppState::new(coordinator))),
        clock,
    }
}

async fn send(app: &TestApp, method: &str, uri: &str, courier: Option<i64>, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(courier) = courier {
        request = request.header(COURIER_HEADER, courier.to_string());
    }
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_health_and_info() {
    let app = app().await;

    let (status, body) = send(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "UP");

    let (status, body) = send(&app, "GET", "/info", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store"], "memory");
    assert_eq!(body["distanceProvider"], "haversine");
}

#[tokio::test]
async fn test_lock_conflict_returns_409_with_ids() {
    let app = app().await;

    let (status, body) = send(&app, "POST", "/orders/lock", Some(7), Some(json!({"orderIds": [101, 102]}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["lockedOrderIds"], json!([101, 102]));

    let (status, body) = send(&app, "POST", "/orders/lock", Some(9), Some(json!({"orderIds": [102, 103]}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "conflict");
    assert_eq!(body["conflictingOrderIds"], json!([102]));

    let (_, body) = send(&app, "GET", "/couriers/9/locks", None, None).await;
    assert_eq!(body["lockedOrders"], json!([]));
}

#[tokio::test]
async fn test_lock_expiry_and_unlock() {
    let app = app().await;

    send(&app, "POST", "/orders/lock", Some(7), Some(json!({"orderIds": [101], "ttlSeconds": 2}))).await;
    let (_, body) = send(&app, "GET", "/couriers/7/locks", None, None).await;
    assert_eq!(body["lockedOrders"].as_array().unwrap().len(), 1);

    app.clock.advance(Duration::seconds(3));
    let (_, body) = send(&app, "GET", "/couriers/7/locks", None, None).await;
    assert_eq!(body["lockedOrders"], json!([]));

    send(&app, "POST", "/orders/lock", Some(9), Some(json!({"orderIds": [101]}))).await;
    let (status, body) = send(&app, "POST", "/orders/unlock", Some(7), Some(json!({"orderIds": [101]}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["unlockedOrderIds"], json!([]));

    let (_, body) = send(&app, "POST", "/orders/unlock", Some(9), Some(json!({"orderIds": [101]}))).await;
    assert_eq!(body["unlockedOrderIds"], json!([101]));
}

#[tokio::test]
async fn test_missing_or_bad_courier_header() {
    let app = app().await;

    let (status, body) = send(&app, "POST", "/orders/lock", None, Some(json!({"orderIds": [101]}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "missing_courier");

    let request = Request::builder()
        .method("POST")
        .uri("/orders/lock")
        .header(COURIER_HEADER, "seven")
        .header("content-type", "application/json")
        .body(Body::from(json!({"orderIds": [101]}).to_string()))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_validation_errors_are_400() {
    let app = app().await;

    let (status, body) = send(&app, "POST", "/orders/lock", Some(7), Some(json!({"orderIds": []}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation");

    let (status, _) = send(&app, "GET", "/orders/available?minLat=25.0", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "POST", "/route-groups", None, Some(json!({"maxGroupSize": 0}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_available_orders_by_area() {
    let app = app().await;

    let (status, body) = send(&app, "GET", "/orders/available", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 4);

    let (_, body) = send(&app, "GET", "/orders/available?lat=25.0220&lng=121.5400&radiusKm=0.2", None, None).await;
    let ids: Vec<i64> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![103]);
}

#[tokio::test]
async fn test_cluster_then_optimize() {
    let app = app().await;

    let (status, body) = send(
        &app,
        "POST",
        "/route-groups",
        None,
        Some(json!({"maxGroupSize": 8, "maxDistanceKm": 5.0, "algorithm": "sweep"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["groups"].as_array().unwrap().len(), 1);
    assert_eq!(body["needsGeocoding"], json!([104]));

    let group_id = body["groups"][0]["routeGroupId"].as_str().unwrap().to_string();
    let (status, group) = send(&app, "GET", &format!("/route-groups/{}", group_id), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(group["status"], "planning");

    let (status, route) = send(&app, "POST", &format!("/route-groups/{}/optimize", group_id), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(route["sequence"].as_array().unwrap().len(), 3);
    assert_eq!(route["confidence"], "high");
}

#[tokio::test]
async fn test_unknown_route_group_is_404() {
    let app = app().await;
    let (status, body) = send(
        &app,
        "GET",
        "/route-groups/67e55044-10b1-426f-9247-bb680e5fe0c8",
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_assign_start_complete() {
    let app = app().await;

    let (status, assignment) = send(
        &app,
        "POST",
        "/dispatch/assign",
        Some(5),
        Some(json!({"orderIds": [101, 102, 104]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(assignment["phases"].as_array().unwrap().last().unwrap(), "COMMITTED");
    // Ungeocoded order goes last
    assert_eq!(assignment["assignedOrderIds"][2], 104);

    let group_id = assignment["routeGroupId"].as_str().unwrap().to_string();
    let (status, group) = send(&app, "POST", &format!("/route-groups/{}/start", group_id), Some(5), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(group["status"], "in_progress");

    for id in [101, 102] {
        let (status, outcome) = send(
            &app,
            "POST",
            &format!("/orders/{}/complete", id),
            Some(5),
            Some(json!({"delivered": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["routeGroupCompleted"], false);
    }
    let (_, outcome) = send(&app, "POST", "/orders/104/complete", Some(5), Some(json!({"delivered": false}))).await;
    assert_eq!(outcome["status"], "failed");
    assert_eq!(outcome["routeGroupCompleted"], true);
}

#[tokio::test]
async fn test_distance_telemetry_and_purge() {
    let app = app().await;

    let (_, body) = send(&app, "GET", "/distance/telemetry", None, None).await;
    assert_eq!(body["provider"], "haversine");
    assert_eq!(body["cacheBackend"], "memory");

    send(&app, "POST", "/dispatch/assign", Some(5), Some(json!({"orderIds": [101, 102, 103]}))).await;
    let (_, body) = send(&app, "GET", "/distance/telemetry", None, None).await;
    let cached = body["cache"]["distanceEntries"].as_u64().unwrap();
    assert!(cached > 0);

    let (status, body) = send(&app, "DELETE", "/distance/cache?scope=distances", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scope"], "distances");
    assert_eq!(body["removed"].as_u64().unwrap(), cached);
}
