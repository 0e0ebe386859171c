use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{routes, state::AppState};

/// Construct the Axum [`Router`] with all routes and middleware attached.
///
/// Middleware is applied in outer-to-inner order (outermost runs first on
/// request, last on response):
///
/// 1. `TraceLayer` — structured request/response logging via `tracing`.
/// 2. `CorsLayer` — `Access-Control-Allow-Origin: *` with GET/POST and
///    Content-Type, preflight cached for a day. The pixel runs on
///    third-party origins, so every `/t/*` response needs these headers;
///    the layer also answers `OPTIONS` preflights for the whole router.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health::health))
        // Public tracking surface.
        .route("/t/pixel.js", get(routes::track::pixel_js))
        .route("/t/event", post(routes::track::collect_events))
        .route("/t/identify", post(routes::track::identify))
        .route("/t/ping.gif", get(routes::track::ping_gif))
        // Site + custom-domain management.
        .route("/api/sites", post(routes::sites::create_site))
        .route("/api/sites/{site_id}", get(routes::sites::get_site))
        .route(
            "/api/sites/{site_id}/domain",
            post(routes::domains::generate_challenge),
        )
        .route(
            "/api/sites/{site_id}/domain/verify",
            post(routes::domains::verify_domain),
        )
        // Tenant settings.
        .route(
            "/api/settings/{tenant_id}",
            get(routes::settings::get_settings).put(routes::settings::update_settings),
        )
        // Attribution engine + verification.
        .route(
            "/api/attribution/{tenant_id}/run",
            post(routes::attribution::run_attribution),
        )
        .route(
            "/api/verification/{tenant_id}/status",
            get(routes::attribution::verification_status),
        )
        // Reporting.
        .route(
            "/api/reports/{tenant_id}/attribution",
            get(routes::reports::attribution_report),
        )
        .route(
            "/api/reports/{tenant_id}/compare",
            get(routes::reports::compare_models),
        )
        .route(
            "/api/reports/{tenant_id}/journey",
            get(routes::reports::journey_analysis),
        )
        .route(
            "/api/reports/{tenant_id}/paths",
            get(routes::reports::conversion_paths),
        )
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE])
                .max_age(Duration::from_secs(86_400)),
        )
        .with_state(state)
}
