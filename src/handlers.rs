// =============================================================================
// HANDLERS MODULE
// =============================================================================
// HTTP controller layer. Handlers translate requests into engine calls and
// engine results into JSON; no booking rule lives here.
//
// NOTES:
// - Identity arrives as `X-User-Id` / `X-User-Role` headers and is extracted
//   into an `Actor` before the handler runs
// - Malformed JSON bodies and query strings surface as VALIDATION_ERROR
// - Every handler records `http_requests_total` and latency through `track`
// - Writes that touch a lot bump its availability cache generation
// =============================================================================

use axum::{
    async_trait,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRequest, FromRequestParts, Path, Query, Request, State,
    },
    http::{request::Parts, HeaderMap, StatusCode},
    Json,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::cache::CacheLookup;
use crate::directory::compute_slot_status;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::*;
use crate::occupancy::{OccupancyReport, TrafficReport};
use crate::timerange::TimeRange;
use crate::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

// =============================================================================
// EXTRACTORS
// =============================================================================

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        actor_from_headers(&parts.headers)
    }
}

fn actor_from_headers(headers: &HeaderMap) -> AppResult<Actor> {
    let raw_id = headers
        .get(USER_ID_HEADER)
        .ok_or_else(|| AppError::Validation("missing X-User-Id header".to_string()))?;
    let user_id = raw_id
        .to_str()
        .ok()
        .and_then(|value| Uuid::parse_str(value.trim()).ok())
        .ok_or_else(|| AppError::Validation("X-User-Id must be a UUID".to_string()))?;

    let role = match headers.get(USER_ROLE_HEADER) {
        None => Role::default(),
        Some(raw) => raw.to_str().ok().and_then(Role::parse).ok_or_else(|| {
            AppError::Validation(
                "X-User-Role must be customer, manager or administrator".to_string(),
            )
        })?,
    };
    Ok(Actor::new(user_id, role))
}

/// `Json<T>` whose rejection renders as a validation error.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection: JsonRejection| AppError::Validation(rejection.body_text()))?;
        Ok(Self(value))
    }
}

/// `Query<T>` whose rejection renders as a validation error.
pub struct QueryParams<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for QueryParams<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection: QueryRejection| AppError::Validation(rejection.body_text()))?;
        Ok(Self(value))
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Record the request metric for `result` and pass it through.
fn track<T>(
    method: &str,
    endpoint: &str,
    ok: StatusCode,
    started: Instant,
    result: AppResult<T>,
) -> AppResult<T> {
    let status = match &result {
        Ok(_) => ok,
        Err(e) => e.status(),
    };
    metrics::record_http_request(
        method,
        endpoint,
        status.as_u16(),
        started.elapsed().as_secs_f64(),
    );
    result
}

async fn invalidate(state: &AppState, lot_id: Uuid) {
    if let Some(cache) = &state.cache {
        cache.invalidate(lot_id).await;
    }
}

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "parking-reservation-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /ready
///
/// 503 when the store, or a configured cache, is unreachable.
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadinessResponse>, StatusCode> {
    let store_healthy = state.engine.health_check().await;
    let redis_healthy = match &state.cache {
        Some(cache) => Some(cache.ping().await),
        None => None,
    };

    if store_healthy && redis_healthy.unwrap_or(true) {
        Ok(Json(ReadinessResponse {
            status: "ready".to_string(),
            checks: ReadinessChecks {
                store: store_healthy,
                redis: redis_healthy,
            },
        }))
    } else {
        tracing::warn!(store = store_healthy, redis = ?redis_healthy, "Readiness check failed");
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// CATALOG
// =============================================================================

/// POST /parking-lots
pub async fn create_lot(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    JsonBody(request): JsonBody<CreateLotRequest>,
) -> AppResult<(StatusCode, Json<ParkingLot>)> {
    let started = Instant::now();
    let result = state.engine.create_lot(&actor, request).await;
    track("POST", "/parking-lots", StatusCode::CREATED, started, result)
        .map(|lot| (StatusCode::CREATED, Json(lot)))
}

/// GET /parking-lots
pub async fn list_lots(State(state): State<Arc<AppState>>) -> AppResult<Json<Vec<ParkingLot>>> {
    let started = Instant::now();
    let result = state.engine.list_lots().await;
    track("GET", "/parking-lots", StatusCode::OK, started, result).map(Json)
}

/// GET /parking-lots/:id
pub async fn get_lot(
    State(state): State<Arc<AppState>>,
    Path(lot_id): Path<Uuid>,
) -> AppResult<Json<LotDetailResponse>> {
    let started = Instant::now();
    let result = state.engine.get_lot(lot_id).await;
    track("GET", "/parking-lots/:id", StatusCode::OK, started, result).map(Json)
}

/// POST /parking-lots/:id/zones
pub async fn create_zone(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(lot_id): Path<Uuid>,
    JsonBody(request): JsonBody<CreateZoneRequest>,
) -> AppResult<(StatusCode, Json<Zone>)> {
    let started = Instant::now();
    let result = state.engine.create_zone(&actor, lot_id, request).await;
    track("POST", "/parking-lots/:id/zones", StatusCode::CREATED, started, result)
        .map(|zone| (StatusCode::CREATED, Json(zone)))
}

/// POST /zones/:id/slots
pub async fn create_slot(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(zone_id): Path<Uuid>,
    JsonBody(request): JsonBody<CreateSlotRequest>,
) -> AppResult<(StatusCode, Json<Slot>)> {
    let started = Instant::now();
    let result = state.engine.create_slot(&actor, zone_id, request).await;
    let slot = track("POST", "/zones/:id/slots", StatusCode::CREATED, started, result)?;
    invalidate(&state, slot.lot_id).await;
    Ok((StatusCode::CREATED, Json(slot)))
}

/// POST /slots/:id/disable
pub async fn disable_slot(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(slot_id): Path<Uuid>,
) -> AppResult<Json<Slot>> {
    set_slot_disabled(&state, &actor, slot_id, true, "/slots/:id/disable").await
}

/// POST /slots/:id/enable
pub async fn enable_slot(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(slot_id): Path<Uuid>,
) -> AppResult<Json<Slot>> {
    set_slot_disabled(&state, &actor, slot_id, false, "/slots/:id/enable").await
}

async fn set_slot_disabled(
    state: &AppState,
    actor: &Actor,
    slot_id: Uuid,
    disabled: bool,
    endpoint: &str,
) -> AppResult<Json<Slot>> {
    let started = Instant::now();
    let result = state.engine.set_slot_disabled(actor, slot_id, disabled).await;
    let slot = track("POST", endpoint, StatusCode::OK, started, result)?;
    invalidate(state, slot.lot_id).await;
    Ok(Json(slot))
}

// =============================================================================
// SLOT DIRECTORY & REPORTING
// =============================================================================

/// GET /parking-lots/:id/available-slots?start=&end=
///
/// Served from the availability cache when one is configured.
pub async fn available_slots(
    State(state): State<Arc<AppState>>,
    Path(lot_id): Path<Uuid>,
    QueryParams(window): QueryParams<WindowQuery>,
) -> AppResult<Json<AvailableSlotsResponse>> {
    let started = Instant::now();
    let result = find_available(&state, lot_id, window).await;
    track(
        "GET",
        "/parking-lots/:id/available-slots",
        StatusCode::OK,
        started,
        result,
    )
    .map(Json)
}

async fn find_available(
    state: &AppState,
    lot_id: Uuid,
    window: WindowQuery,
) -> AppResult<AvailableSlotsResponse> {
    let range = TimeRange::new(window.start, window.end)?;
    // generation read before the engine read, so a concurrent booking
    // orphans what gets cached below
    let mut generation = None;
    if let Some(cache) = &state.cache {
        match cache.get(lot_id, &range).await {
            CacheLookup::Hit(hit) => return Ok(hit),
            CacheLookup::Miss { generation: seen } => generation = seen,
        }
    }

    let available = state.engine.find_available_slots(lot_id, range).await?;
    let slots: Vec<SlotView> = available
        .iter()
        .map(|slot| SlotView {
            slot_id: slot.id,
            zone_id: slot.zone_id,
            slot_number: slot.slot_number,
            status: compute_slot_status(slot, available.claims(), range.start),
        })
        .collect();
    let response = AvailableSlotsResponse {
        lot_id,
        range: available.range(),
        count: slots.len(),
        slots,
    };

    if let (Some(cache), Some(generation)) = (&state.cache, generation) {
        cache.put(lot_id, generation, &range, &response).await;
    }
    Ok(response)
}

/// GET /parking-lots/:id/slots?at=
pub async fn lot_slots(
    State(state): State<Arc<AppState>>,
    Path(lot_id): Path<Uuid>,
    QueryParams(query): QueryParams<AtQuery>,
) -> AppResult<Json<Vec<SlotView>>> {
    let started = Instant::now();
    let at = query.at.unwrap_or_else(|| state.engine.now());
    let result = state.engine.lot_slot_statuses(lot_id, at).await;
    track("GET", "/parking-lots/:id/slots", StatusCode::OK, started, result).map(Json)
}

/// GET /parking-lots/:id/occupancy?at=
pub async fn occupancy(
    State(state): State<Arc<AppState>>,
    Path(lot_id): Path<Uuid>,
    QueryParams(query): QueryParams<AtQuery>,
) -> AppResult<Json<OccupancyReport>> {
    let started = Instant::now();
    let at = query.at.unwrap_or_else(|| state.engine.now());
    let result = state.engine.occupancy(lot_id, at).await;
    track("GET", "/parking-lots/:id/occupancy", StatusCode::OK, started, result).map(Json)
}

/// GET /parking-lots/:id/traffic?start=&end=
pub async fn traffic(
    State(state): State<Arc<AppState>>,
    Path(lot_id): Path<Uuid>,
    QueryParams(window): QueryParams<WindowQuery>,
) -> AppResult<Json<TrafficReport>> {
    let started = Instant::now();
    let result = match TimeRange::new(window.start, window.end) {
        Ok(range) => state.engine.traffic(lot_id, range).await,
        Err(e) => Err(e),
    };
    track("GET", "/parking-lots/:id/traffic", StatusCode::OK, started, result).map(Json)
}

// =============================================================================
// VEHICLES
// =============================================================================

/// POST /vehicles
pub async fn register_vehicle(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    JsonBody(request): JsonBody<RegisterVehicleRequest>,
) -> AppResult<(StatusCode, Json<Vehicle>)> {
    let started = Instant::now();
    let result = state.engine.register_vehicle(&actor, request).await;
    track("POST", "/vehicles", StatusCode::CREATED, started, result)
        .map(|vehicle| (StatusCode::CREATED, Json(vehicle)))
}

/// GET /vehicles/:id
pub async fn get_vehicle(
    State(state): State<Arc<AppState>>,
    Path(vehicle_id): Path<Uuid>,
) -> AppResult<Json<Vehicle>> {
    let started = Instant::now();
    let result = state.engine.get_vehicle(vehicle_id).await;
    track("GET", "/vehicles/:id", StatusCode::OK, started, result).map(Json)
}

// =============================================================================
// RESERVATIONS
// =============================================================================

/// POST /reservations
///
/// # Responses
/// - 201 Created: reservation in `pending`
/// - 409 Conflict: SLOT_CONFLICT (requested slot taken) or NO_AVAILABILITY
/// - 400 Bad Request: VALIDATION_ERROR (inverted or past range, bad slot)
pub async fn create_reservation(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    JsonBody(request): JsonBody<CreateReservationRequest>,
) -> AppResult<(StatusCode, Json<Reservation>)> {
    let started = Instant::now();
    let result = state.engine.create_reservation(&actor, request).await;
    let reservation = track("POST", "/reservations", StatusCode::CREATED, started, result)?;
    invalidate(&state, reservation.lot_id).await;
    Ok((StatusCode::CREATED, Json(reservation)))
}

/// GET /reservations?user_id=
pub async fn list_reservations(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    QueryParams(query): QueryParams<ReservationListQuery>,
) -> AppResult<Json<Vec<Reservation>>> {
    let started = Instant::now();
    let result = state.engine.list_reservations(&actor, query.user_id).await;
    track("GET", "/reservations", StatusCode::OK, started, result).map(Json)
}

/// GET /reservations/:id
pub async fn get_reservation(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(reservation_id): Path<Uuid>,
) -> AppResult<Json<Reservation>> {
    let started = Instant::now();
    let result = state.engine.get_reservation(&actor, reservation_id).await;
    track("GET", "/reservations/:id", StatusCode::OK, started, result).map(Json)
}

/// POST /reservations/:id/confirm
pub async fn confirm_reservation(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(reservation_id): Path<Uuid>,
) -> AppResult<Json<Reservation>> {
    let started = Instant::now();
    let result = state.engine.confirm_reservation(&actor, reservation_id).await;
    let reservation = track("POST", "/reservations/:id/confirm", StatusCode::OK, started, result)?;
    invalidate(&state, reservation.lot_id).await;
    Ok(Json(reservation))
}

/// POST /reservations/:id/cancel
///
/// Optional body: `{ "reason": "..." }`
pub async fn cancel_reservation(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(reservation_id): Path<Uuid>,
    body: Option<JsonBody<CancelReservationRequest>>,
) -> AppResult<Json<Reservation>> {
    let started = Instant::now();
    let reason = body.and_then(|JsonBody(request)| request.reason);
    let result = state
        .engine
        .cancel_reservation(&actor, reservation_id, reason)
        .await;
    let reservation = track("POST", "/reservations/:id/cancel", StatusCode::OK, started, result)?;
    invalidate(&state, reservation.lot_id).await;
    Ok(Json(reservation))
}

/// POST /reservations/:id/check-in
///
/// Optional body: `{ "slot_id": "..." }` when the vehicle parked elsewhere.
pub async fn check_in(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(reservation_id): Path<Uuid>,
    body: Option<JsonBody<CheckInRequest>>,
) -> AppResult<Json<Reservation>> {
    let started = Instant::now();
    let request = body.map(|JsonBody(request)| request).unwrap_or_default();
    let result = state.engine.check_in(&actor, reservation_id, request).await;
    let reservation = track("POST", "/reservations/:id/check-in", StatusCode::OK, started, result)?;
    invalidate(&state, reservation.lot_id).await;
    Ok(Json(reservation))
}

/// POST /reservations/:id/complete
pub async fn complete_reservation(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(reservation_id): Path<Uuid>,
) -> AppResult<Json<Reservation>> {
    let started = Instant::now();
    let result = state.engine.complete_reservation(&actor, reservation_id).await;
    let reservation = track("POST", "/reservations/:id/complete", StatusCode::OK, started, result)?;
    invalidate(&state, reservation.lot_id).await;
    Ok(Json(reservation))
}

// =============================================================================
// SESSIONS & PAYMENTS
// =============================================================================

/// POST /sessions
pub async fn start_session(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    JsonBody(request): JsonBody<StartSessionRequest>,
) -> AppResult<(StatusCode, Json<ParkingSession>)> {
    let started = Instant::now();
    let result = state.engine.start_session(&actor, request).await;
    let session = track("POST", "/sessions", StatusCode::CREATED, started, result)?;
    invalidate(&state, session.lot_id).await;
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /sessions/:id
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(session_id): Path<Uuid>,
) -> AppResult<Json<ParkingSession>> {
    let started = Instant::now();
    let result = state.engine.get_session(&actor, session_id).await;
    track("GET", "/sessions/:id", StatusCode::OK, started, result).map(Json)
}

/// POST /sessions/:id/complete
pub async fn complete_session(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(session_id): Path<Uuid>,
) -> AppResult<Json<ParkingSession>> {
    let started = Instant::now();
    let result = state.engine.complete_session(&actor, session_id).await;
    let session = track("POST", "/sessions/:id/complete", StatusCode::OK, started, result)?;
    invalidate(&state, session.lot_id).await;
    Ok(Json(session))
}

/// POST /sessions/:id/payment
pub async fn record_payment(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(session_id): Path<Uuid>,
    JsonBody(request): JsonBody<RecordPaymentRequest>,
) -> AppResult<Json<ParkingSession>> {
    let started = Instant::now();
    let result = state.engine.record_payment(&actor, session_id, request).await;
    track("POST", "/sessions/:id/payment", StatusCode::OK, started, result).map(Json)
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

/// POST /subscriptions
pub async fn create_subscription(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    JsonBody(request): JsonBody<CreateSubscriptionRequest>,
) -> AppResult<(StatusCode, Json<Subscription>)> {
    let started = Instant::now();
    let result = state.engine.create_subscription(&actor, request).await;
    track("POST", "/subscriptions", StatusCode::CREATED, started, result)
        .map(|subscription| (StatusCode::CREATED, Json(subscription)))
}

/// GET /subscriptions/:id
pub async fn get_subscription(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(subscription_id): Path<Uuid>,
) -> AppResult<Json<SubscriptionResponse>> {
    let started = Instant::now();
    let result = state.engine.get_subscription(&actor, subscription_id).await;
    track("GET", "/subscriptions/:id", StatusCode::OK, started, result).map(Json)
}

/// POST /subscriptions/:id/renew
pub async fn renew_subscription(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(subscription_id): Path<Uuid>,
) -> AppResult<Json<Subscription>> {
    let started = Instant::now();
    let result = state.engine.renew_subscription(&actor, subscription_id).await;
    track("POST", "/subscriptions/:id/renew", StatusCode::OK, started, result).map(Json)
}

/// POST /subscriptions/:id/cancel-auto-renew
pub async fn cancel_auto_renew(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(subscription_id): Path<Uuid>,
) -> AppResult<Json<Subscription>> {
    let started = Instant::now();
    let result = state.engine.cancel_auto_renew(&actor, subscription_id).await;
    track(
        "POST",
        "/subscriptions/:id/cancel-auto-renew",
        StatusCode::OK,
        started,
        result,
    )
    .map(Json)
}

/// POST /subscriptions/:id/cancel
pub async fn cancel_subscription(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(subscription_id): Path<Uuid>,
) -> AppResult<Json<Subscription>> {
    let started = Instant::now();
    let result = state.engine.cancel_subscription(&actor, subscription_id).await;
    track("POST", "/subscriptions/:id/cancel", StatusCode::OK, started, result).map(Json)
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::testing::t0;
    use crate::engine::{EngineConfig, ReservationEngine};
    use crate::events::EventBus;
    use crate::store::{MemoryStore, Store};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::Router;
    use chrono::Duration;
    use http_body_util::BodyExt;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        store: Arc<MemoryStore>,
        clock: ManualClock,
        admin: Uuid,
        driver: Uuid,
    }

    fn test_app() -> TestApp {
        let clock = ManualClock::new(t0());
        let store = Arc::new(MemoryStore::new());
        let mut config = EngineConfig::default();
        config.retry.initial_delay = std::time::Duration::from_millis(1);
        let engine = ReservationEngine::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(clock.clone()),
            EventBus::new(64),
            config,
        );
        let state = Arc::new(AppState {
            engine: Arc::new(engine),
            cache: None,
            metrics_handle: PrometheusBuilder::new().build_recorder().handle(),
        });
        TestApp {
            router: crate::build_router(state),
            store,
            clock,
            admin: Uuid::new_v4(),
            driver: Uuid::new_v4(),
        }
    }

    impl TestApp {
        async fn send(
            &self,
            method: &str,
            uri: &str,
            identity: Option<(Uuid, &str)>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut builder = HttpRequest::builder().method(method).uri(uri);
            if let Some((user_id, role)) = identity {
                builder = builder
                    .header(USER_ID_HEADER, user_id.to_string())
                    .header(USER_ROLE_HEADER, role);
            }
            let request = match body {
                Some(json) => builder
                    .header("content-type", "application/json")
                    .body(Body::from(json.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };

            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, value)
        }

        async fn as_admin(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            self.send(method, uri, Some((self.admin, "administrator")), body).await
        }

        async fn as_driver(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            self.send(method, uri, Some((self.driver, "customer")), body).await
        }

        /// Lot with `slots` numbered slots; returns (lot id, vehicle id).
        async fn seed(&self, slots: i32) -> (String, String) {
            let (status, lot) = self
                .as_admin(
                    "POST",
                    "/parking-lots",
                    Some(json!({
                        "name": "Central",
                        "capacity": slots + 2,
                        "rates": { "hourly_rate": 1000, "daily_rate": 6000 }
                    })),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED, "{lot}");
            let lot_id = lot["id"].as_str().unwrap().to_string();

            let (status, zone) = self
                .as_admin(
                    "POST",
                    &format!("/parking-lots/{lot_id}/zones"),
                    Some(json!({ "name": "Ground", "category": "regular" })),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED, "{zone}");
            let zone_id = zone["id"].as_str().unwrap().to_string();

            for number in 1..=slots {
                let (status, _) = self
                    .as_admin(
                        "POST",
                        &format!("/zones/{zone_id}/slots"),
                        Some(json!({ "slot_number": number })),
                    )
                    .await;
                assert_eq!(status, StatusCode::CREATED);
            }

            let (status, vehicle) = self
                .as_driver("POST", "/vehicles", Some(json!({ "plate": "b 123 xy" })))
                .await;
            assert_eq!(status, StatusCode::CREATED, "{vehicle}");
            assert_eq!(vehicle["plate"], "B123XY");
            (lot_id, vehicle["id"].as_str().unwrap().to_string())
        }
    }

    #[tokio::test]
    async fn test_health_and_readiness() {
        let app = test_app();
        let (status, body) = app.send("GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "parking-reservation-service");

        let (status, body) = app.send("GET", "/ready", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["store"], true);
        assert!(body["checks"]["redis"].is_null());
    }

    #[tokio::test]
    async fn test_identity_headers_are_required_and_validated() {
        let app = test_app();
        let body = json!({ "plate": "ABC1" });

        let (status, err) = app.send("POST", "/vehicles", None, Some(body.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["error"], "VALIDATION_ERROR");

        let (status, _) = app
            .send("POST", "/vehicles", Some((Uuid::new_v4(), "superuser")), Some(body))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_customers_cannot_administer_the_catalog() {
        let app = test_app();
        let (status, err) = app
            .as_driver(
                "POST",
                "/parking-lots",
                Some(json!({ "name": "Mine", "capacity": 1, "rates": { "hourly_rate": 1 } })),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(err["error"], "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_booking_flow_over_http() {
        let app = test_app();
        let (lot_id, vehicle_id) = app.seed(1).await;
        let booking = json!({
            "lot_id": lot_id,
            "vehicle_id": vehicle_id,
            "range": { "start": "2026-03-02T10:00:00Z", "end": "2026-03-02T12:00:00Z" }
        });

        let (status, available) = app
            .send(
                "GET",
                &format!(
                    "/parking-lots/{lot_id}/available-slots?start=2026-03-02T10:00:00Z&end=2026-03-02T12:00:00Z"
                ),
                None,
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(available["count"], 1);
        assert_eq!(available["slots"][0]["status"], "available");

        let (status, reservation) = app
            .as_driver("POST", "/reservations", Some(booking.clone()))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{reservation}");
        assert_eq!(reservation["status"], "pending");
        let id = reservation["id"].as_str().unwrap().to_string();

        let (status, err) = app.as_driver("POST", "/reservations", Some(booking)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["error"], "NO_AVAILABILITY");

        let (status, confirmed) = app
            .as_driver("POST", &format!("/reservations/{id}/confirm"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(confirmed["status"], "confirmed");

        app.clock.advance(Duration::hours(2));
        let (status, checked_in) = app
            .as_driver("POST", &format!("/reservations/{id}/check-in"), None)
            .await;
        assert_eq!(status, StatusCode::OK, "{checked_in}");
        assert_eq!(checked_in["status"], "checked_in");

        let (status, occupancy) = app
            .send("GET", &format!("/parking-lots/{lot_id}/occupancy"), None, None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(occupancy["occupied"], 1);
        assert_eq!(occupancy["percentage"], 100.0);

        app.clock.advance(Duration::minutes(90));
        let (status, completed) = app
            .as_driver("POST", &format!("/reservations/{id}/complete"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(completed["status"], "completed");

        let (status, traffic) = app
            .send(
                "GET",
                &format!(
                    "/parking-lots/{lot_id}/traffic?start=2026-03-02T08:00:00Z&end=2026-03-02T18:00:00Z"
                ),
                None,
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(traffic["entries"], 1);
        assert_eq!(traffic["exits"], 1);
    }

    #[tokio::test]
    async fn test_cancellation_window_maps_to_422() {
        let app = test_app();
        let (lot_id, vehicle_id) = app.seed(1).await;
        let (_, reservation) = app
            .as_driver(
                "POST",
                "/reservations",
                Some(json!({
                    "lot_id": lot_id,
                    "vehicle_id": vehicle_id,
                    "range": { "start": "2026-03-02T09:00:00Z", "end": "2026-03-02T10:00:00Z" }
                })),
            )
            .await;
        let id = reservation["id"].as_str().unwrap();

        let (status, err) = app
            .as_driver(
                "POST",
                &format!("/reservations/{id}/cancel"),
                Some(json!({ "reason": "plans changed" })),
            )
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err["error"], "CANCELLATION_WINDOW_EXPIRED");

        let (status, cancelled) = app
            .as_admin("POST", &format!("/reservations/{id}/cancel"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["status"], "cancelled");
    }

    #[tokio::test]
    async fn test_storage_outage_is_503_engine_unavailable() {
        let app = test_app();
        let (lot_id, vehicle_id) = app.seed(1).await;
        app.store.fail_reservation_inserts(true);

        let (status, err) = app
            .as_driver(
                "POST",
                "/reservations",
                Some(json!({
                    "lot_id": lot_id,
                    "vehicle_id": vehicle_id,
                    "range": { "start": "2026-03-02T10:00:00Z", "end": "2026-03-02T12:00:00Z" }
                })),
            )
            .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err["error"], "ENGINE_UNAVAILABLE");

        let (status, list) = app.as_driver("GET", "/reservations", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list, json!([]));
    }

    #[tokio::test]
    async fn test_inverted_window_is_a_validation_error() {
        let app = test_app();
        let (lot_id, _) = app.seed(1).await;
        let (status, err) = app
            .send(
                "GET",
                &format!(
                    "/parking-lots/{lot_id}/available-slots?start=2026-03-02T12:00:00Z&end=2026-03-02T10:00:00Z"
                ),
                None,
                None,
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(err["error"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_unknown_lot_is_404() {
        let app = test_app();
        let (status, err) = app
            .send("GET", &format!("/parking-lots/{}", Uuid::new_v4()), None, None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["error"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_subscription_lifecycle_over_http() {
        let app = test_app();
        let (status, sub) = app
            .as_driver(
                "POST",
                "/subscriptions",
                Some(json!({ "tier": "vip", "period": "quarterly" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{sub}");
        assert_eq!(sub["amount"], 540_000);
        let id = sub["id"].as_str().unwrap();

        let (status, view) = app
            .as_driver("GET", &format!("/subscriptions/{id}"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["status"], "active");

        let (status, cancelled) = app
            .as_driver("POST", &format!("/subscriptions/{id}/cancel"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(cancelled["cancelled_at"].is_string());

        let (status, err) = app
            .as_driver("POST", &format!("/subscriptions/{id}/renew"), None)
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["error"], "SUBSCRIPTION_NOT_ACTIVE");
    }

    #[test]
    fn test_role_header_defaults_to_customer() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, Uuid::nil().to_string().parse().unwrap());
        let actor = actor_from_headers(&headers).unwrap();
        assert_eq!(actor.role, Role::Customer);

        headers.insert(USER_ROLE_HEADER, "Manager".parse().unwrap());
        assert_eq!(actor_from_headers(&headers).unwrap().role, Role::Manager);
    }
}
