//! HTTP routes and the middleware stack around them.
//!
//! - `auth`: registration, login, token refresh, logout, CSRF bootstrap
//! - `health`: liveness, readiness, metrics and version

use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn_with_state;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::middleware;
use crate::state::AppState;

pub mod auth;
pub mod health;

/// Maximum accepted request body size.
const BODY_LIMIT_BYTES: usize = 10 * 1024 * 1024;

/// The application's own endpoints, without the security layers.
pub fn api_routes(state: &AppState) -> Router<AppState> {
    let authenticated = Router::new()
        .route("/auth/user", get(auth::current_user))
        .route("/auth/password", post(auth::change_password))
        .route_layer(from_fn_with_state(state.clone(), middleware::auth::require_access_token));

    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/metrics", get(health::metrics))
        .route("/metrics/prometheus", get(health::metrics_prometheus))
        .route("/version", get(health::version))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/token", post(auth::refresh_token))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/csrf", get(auth::csrf_token))
        .merge(authenticated)
}

/// Wraps `routes` in the security pipeline. Outermost first: trace,
/// security headers, query sanitizer, static asset guard, CSRF issue,
/// CSRF protection.
pub fn with_security_layers(routes: Router<AppState>, state: AppState) -> Router {
    routes
        .with_state(state.clone())
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .layer(from_fn_with_state(state.clone(), middleware::csrf::csrf_protection_middleware))
        .layer(from_fn_with_state(state.clone(), middleware::csrf::csrf_issue_middleware))
        .layer(from_fn_with_state(state.clone(), middleware::static_files::static_files_middleware))
        .layer(from_fn_with_state(state.clone(), middleware::query_sanitizer::query_sanitizer_middleware))
        .layer(from_fn_with_state(state.config.clone(), middleware::security_headers::security_headers_middleware))
        .layer(TraceLayer::new_for_http())
}

pub fn build_router(state: AppState) -> Router {
    with_security_layers(api_routes(&state), state)
}
