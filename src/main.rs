// =============================================================================
// PARKING RESERVATION SERVICE - Main Entry Point
// =============================================================================
// Slot reservation engine of the parking-management platform.
//
// WHAT THIS SERVICE DOES:
// - Answers "which slots are free between start and end" for a lot
// - Books slots without double-booking, under concurrent requests
// - Drives reservations through pending → confirmed → checked_in → completed
// - Prices stays and subscriptions, renews subscriptions on their anchor
// - Reports occupancy and traffic per lot
// =============================================================================

mod cache;
mod clock;
mod config;
mod directory;
mod engine;
mod error;
mod events;
mod handlers;
mod metrics;
mod models;
mod occupancy;
mod pricing;
mod retry;
mod store;
mod sweeper;
mod timerange;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::AvailabilityCache;
use crate::clock::SystemClock;
use crate::config::Config;
use crate::engine::ReservationEngine;
use crate::events::{spawn_event_logger, EventBus};
use crate::metrics::setup_metrics;
use crate::store::{MemoryStore, PgStore, Store};

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
pub struct AppState {
    pub engine: Arc<ReservationEngine>,

    /// Availability cache; `None` without REDIS_URL
    pub cache: Option<AvailabilityCache>,

    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}

// -----------------------------------------------------------------------------
// ROUTES
// -----------------------------------------------------------------------------
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // ----- Health, readiness, metrics -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        // ----- Catalog -----
        .route(
            "/parking-lots",
            get(handlers::list_lots).post(handlers::create_lot),
        )
        .route("/parking-lots/:id", get(handlers::get_lot))
        .route("/parking-lots/:id/zones", post(handlers::create_zone))
        .route("/zones/:id/slots", post(handlers::create_slot))
        .route("/slots/:id/disable", post(handlers::disable_slot))
        .route("/slots/:id/enable", post(handlers::enable_slot))
        // ----- Slot directory & reporting -----
        .route("/parking-lots/:id/slots", get(handlers::lot_slots))
        .route(
            "/parking-lots/:id/available-slots",
            get(handlers::available_slots),
        )
        .route("/parking-lots/:id/occupancy", get(handlers::occupancy))
        .route("/parking-lots/:id/traffic", get(handlers::traffic))
        // ----- Vehicles -----
        .route("/vehicles", post(handlers::register_vehicle))
        .route("/vehicles/:id", get(handlers::get_vehicle))
        // ----- Reservations -----
        .route(
            "/reservations",
            get(handlers::list_reservations).post(handlers::create_reservation),
        )
        .route("/reservations/:id", get(handlers::get_reservation))
        .route("/reservations/:id/confirm", post(handlers::confirm_reservation))
        .route("/reservations/:id/cancel", post(handlers::cancel_reservation))
        .route("/reservations/:id/check-in", post(handlers::check_in))
        .route("/reservations/:id/complete", post(handlers::complete_reservation))
        // ----- Walk-in sessions & payments -----
        .route("/sessions", post(handlers::start_session))
        .route("/sessions/:id", get(handlers::get_session))
        .route("/sessions/:id/complete", post(handlers::complete_session))
        .route("/sessions/:id/payment", post(handlers::record_payment))
        // ----- Subscriptions -----
        .route("/subscriptions", post(handlers::create_subscription))
        .route("/subscriptions/:id", get(handlers::get_subscription))
        .route("/subscriptions/:id/renew", post(handlers::renew_subscription))
        .route(
            "/subscriptions/:id/cancel-auto-renew",
            post(handlers::cancel_auto_renew),
        )
        .route("/subscriptions/:id/cancel", post(handlers::cancel_subscription))
        // ----- Middleware -----
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// -----------------------------------------------------------------------------
// MAIN FUNCTION
// -----------------------------------------------------------------------------
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -------------------------------------------------------------------------
    // STEP 1: Environment and logging
    // -------------------------------------------------------------------------
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,parking_reservation_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Parking Reservation Service...");

    // -------------------------------------------------------------------------
    // STEP 2: Configuration and metrics
    // -------------------------------------------------------------------------
    let config = Config::from_env()?;
    info!(port = config.port, "Configuration loaded");

    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // -------------------------------------------------------------------------
    // STEP 3: Storage
    // -------------------------------------------------------------------------
    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let db = PgStore::connect(url).await?;
            info!("Connected to PostgreSQL");
            db.run_migrations().await?;
            info!("Database migrations completed");
            Arc::new(db)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    // -------------------------------------------------------------------------
    // STEP 4: Availability cache
    // -------------------------------------------------------------------------
    let cache = match &config.redis_url {
        Some(url) => {
            let cache = AvailabilityCache::connect(url, config.availability_cache_ttl_secs).await?;
            info!("Connected to Redis");
            Some(cache)
        }
        None => None,
    };

    // -------------------------------------------------------------------------
    // STEP 5: Engine and background tasks
    // -------------------------------------------------------------------------
    let engine = Arc::new(ReservationEngine::new(
        store,
        Arc::new(SystemClock),
        EventBus::default(),
        config.engine_config(),
    ));
    spawn_event_logger(engine.subscribe_events());
    sweeper::spawn_sweeper(
        Arc::clone(&engine),
        cache.clone(),
        Duration::from_secs(config.sweep_interval_secs),
    );

    let state = Arc::new(AppState {
        engine,
        cache,
        metrics_handle,
    });

    // -------------------------------------------------------------------------
    // STEP 6: Serve
    // -------------------------------------------------------------------------
    let app = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Parking Reservation Service is listening");
    axum::serve(listener, app).await?;

    Ok(())
}
