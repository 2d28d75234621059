//! Router-level and cross-module tests for Storegate.
//!
//! ## Test Modules
//!
//! - **api_tests**: health, metrics, version and security headers
//! - **sanitizer_api_tests**: query-string injection gate through the router
//! - **static_api_tests**: static asset guard through the router
//! - **csrf_api_tests**: token issuance and single-use validation
//! - **auth_api_tests**: registration, login, refresh rotation, logout
//! - **error_tests**: error envelope and validation helpers
//! - **config_tests**: defaults and validation of the configuration


use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    response::Response,
    routing, Extension, Json, Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;
use tower::ServiceExt;

use crate::middleware::SanitizedQuery;
use crate::routes;
use crate::state::AppState;

pub(crate) struct TestApp {
    pub app: Router,
    pub state: AppState,
    /// Holds the static root alive for the test's duration.
    pub site: TempDir,
}

// Stand-in for a catalogue endpoint: echoes the sanitized query on GET and
// accepts writes on POST.
async fn echo_query(Extension(query): Extension<SanitizedQuery>) -> Json<Value> {
    Json(query.0.into())
}

async fn create_product() -> (StatusCode, Json<Value>) {
    (StatusCode::CREATED, Json(json!({ "success": true })))
}

pub(crate) async fn setup_test_app() -> TestApp {
    let site = TempDir::new().unwrap();
    let root = site.path().join("public");
    std::fs::create_dir_all(root.join("css")).unwrap();
    std::fs::write(root.join("index.html"), "<h1>storegate</h1>").unwrap();
    std::fs::write(root.join("css").join("style.css"), "body{}").unwrap();
    std::fs::write(site.path().join("secret.txt"), "top secret").unwrap();

    let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await.unwrap();
    crate::db::init_db(&pool).await.unwrap();

    let mut config = crate::config::AppConfig::default();
    config.static_files.root = root;
    config.passwords.bcrypt_cost = 4;

    let state = AppState::new(pool, config);
    let api = routes::api_routes(&state).route("/product", routing::get(echo_query).post(create_product));
    let app = routes::with_security_layers(api, state.clone());

    TestApp { app, state, site }
}

pub(crate) async fn send(app: &Router, req: Request<Body>) -> Response {
    app.clone().oneshot(req).await.unwrap()
}

pub(crate) async fn get(app: &Router, uri: &str) -> Response {
    send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

pub(crate) fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub(crate) async fn body_bytes(res: Response) -> Vec<u8> {
    res.into_body().collect().await.unwrap().to_bytes().to_vec()
}

pub(crate) async fn body_json(res: Response) -> Value {
    serde_json::from_slice(&body_bytes(res).await).unwrap()
}

/// `name=value` pair of the first Set-Cookie header for `name`.
pub(crate) fn cookie_pair(res: &Response, name: &str) -> Option<String> {
    res.headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with(&format!("{name}=")))
        .map(|v| v.split(';').next().unwrap_or_default().to_string())
}

pub(crate) fn set_cookie_header(res: &Response, name: &str) -> Option<String> {
    res.headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with(&format!("{name}=")))
        .map(str::to_string)
}

/// Obtains a live CSRF token the way a browser would: from any GET response.
pub(crate) async fn fetch_csrf_token(app: &Router) -> String {
    let res = get(app, "/healthz").await;
    res.headers().get("x-csrf-token").unwrap().to_str().unwrap().to_string()
}
