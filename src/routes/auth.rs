//! Authentication endpoints.
//!
//! The access token travels in response bodies and `Authorization` headers.
//! The refresh token lives only in an HttpOnly cookie whose attributes come
//! from `[refresh_cookie]`.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde_json::json;

use crate::auth::tokens::AccessClaims;
use crate::auth::SessionTokens;
use crate::config::RefreshCookieConfig;
use crate::error::{AppError, AppResult};
use crate::middleware::csrf::attach_token;
use crate::state::AppState;
use crate::types::{
    AuthResponse, ChangePasswordRequest, CsrfTokenResponse, LoginRequest, RegisterRequest, User, UserDto,
};

fn same_site(cfg: &RefreshCookieConfig) -> SameSite {
    match cfg.same_site.to_ascii_lowercase().as_str() {
        "strict" => SameSite::Strict,
        "none" => SameSite::None,
        _ => SameSite::Lax,
    }
}

fn refresh_cookie(state: &AppState, token: String) -> Cookie<'static> {
    let cfg = &state.config.refresh_cookie;
    let max_age = state.sessions.tokens().refresh_ttl().num_seconds();
    Cookie::build((cfg.name.clone(), token))
        .http_only(cfg.http_only)
        .same_site(same_site(cfg))
        .secure(cfg.secure)
        .path(cfg.path.clone())
        .max_age(time::Duration::seconds(max_age))
        .build()
}

fn cleared_refresh_cookie(state: &AppState) -> Cookie<'static> {
    let cfg = &state.config.refresh_cookie;
    Cookie::build((cfg.name.clone(), "")).path(cfg.path.clone()).build()
}

fn session_response(
    state: &AppState,
    jar: CookieJar,
    user: &User,
    tokens: SessionTokens,
) -> (CookieJar, Json<AuthResponse>) {
    let jar = jar.add(refresh_cookie(state, tokens.refresh_token));
    let body = AuthResponse { success: true, user: UserDto::from(user), access_token: tokens.access_token };
    (jar, Json(body))
}

fn refresh_token_from(state: &AppState, jar: &CookieJar) -> Option<String> {
    jar.get(&state.config.refresh_cookie.name)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

pub async fn register(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<RegisterRequest>,
) -> AppResult<impl IntoResponse> {
    let user = state.sessions.register(req).await?;
    let tokens = state.sessions.issue_session(&user).await?;
    let (jar, body) = session_response(&state, jar, &user, tokens);
    Ok((StatusCode::CREATED, jar, body))
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> AppResult<impl IntoResponse> {
    let user = state.sessions.authenticate(&req.email, &req.password).await?;
    let tokens = state.sessions.issue_session(&user).await?;
    Ok(session_response(&state, jar, &user, tokens))
}

/// Exchanges the refresh cookie for a new token pair.
pub async fn refresh_token(State(state): State<AppState>, jar: CookieJar) -> AppResult<impl IntoResponse> {
    let presented = refresh_token_from(&state, &jar)
        .ok_or_else(|| AppError::Unauthorized("Refresh token missing".to_string()))?;
    let (user, tokens) = state.sessions.refresh(&presented).await?;
    Ok(session_response(&state, jar, &user, tokens))
}

/// Always succeeds and clears the refresh cookie.
pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> AppResult<impl IntoResponse> {
    let presented = refresh_token_from(&state, &jar);
    state.sessions.logout(presented.as_deref()).await?;
    let jar = jar.remove(cleared_refresh_cookie(&state));
    Ok((jar, Json(json!({ "success": true }))))
}

pub async fn current_user(
    State(state): State<AppState>,
    Extension(claims): Extension<AccessClaims>,
) -> AppResult<impl IntoResponse> {
    let user = state.sessions.current_user(&claims).await?;
    Ok(Json(json!({ "success": true, "user": UserDto::from(&user) })))
}

/// Changes the password and ends every session of the account, the
/// caller's included.
pub async fn change_password(
    State(state): State<AppState>,
    Extension(claims): Extension<AccessClaims>,
    jar: CookieJar,
    Json(req): Json<ChangePasswordRequest>,
) -> AppResult<impl IntoResponse> {
    state
        .sessions
        .change_password(claims.user_id, &req.current_password, &req.new_password)
        .await?;
    let jar = jar.remove(cleared_refresh_cookie(&state));
    Ok((jar, Json(json!({ "success": true }))))
}

/// Bootstrap for clients that cannot read response headers: issues a token
/// and returns it in the body as well as the usual cookie and header.
pub async fn csrf_token(State(state): State<AppState>) -> impl IntoResponse {
    let token = state.csrf.issue().await;
    state.metrics.inc_csrf_issued();
    let mut headers = HeaderMap::new();
    attach_token(&mut headers, &token, &state.config.csrf);
    (headers, Json(CsrfTokenResponse { csrf_token: token }))
}
