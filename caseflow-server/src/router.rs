//! Router construction for the case workflow server.

use axum::{
    routing::{get, patch, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Build the full axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        // Appointments
        .route("/appointments", post(handlers::appointments::book))
        .route(
            "/appointments/:id/status",
            patch(handlers::appointments::set_status),
        )
        // Cases
        .route("/cases/:id", get(handlers::cases::get_case))
        .route(
            "/cases/:id/stages/:stage/advance",
            post(handlers::cases::advance),
        )
        .route(
            "/cases/:id/stages/:stage/draft",
            put(handlers::cases::save_draft),
        )
        .route(
            "/cases/:id/xray/upload",
            post(handlers::cases::record_xray_upload),
        )
        .route("/cases/:id/doctor", post(handlers::cases::assign_doctor))
        // Queues
        .route("/queues/:role", get(handlers::queues::get_queue))
        .route(
            "/queues/:role/stream",
            get(handlers::queues::stream_queue),
        )
        .route(
            "/queues/:role/stream/:stream/open/:case",
            post(handlers::queues::open_case),
        )
        .route(
            "/queues/:role/stream/:stream/close",
            post(handlers::queues::close_case),
        )
        .route(
            "/queues/:role/stream/:stream/advance",
            post(handlers::queues::advance),
        );

    Router::new()
        .route("/health", get(handlers::health::health))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
