use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use crate::error::AppError;
use crate::state::AppState;

/// Requires a valid `Authorization: Bearer <access token>` header.
///
/// On success the verified [`AccessClaims`](crate::auth::tokens::AccessClaims)
/// are inserted into the request extensions for the handler.
pub async fn require_access_token(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Unauthorized("Authentication required".to_string()))?;

    let claims = state.sessions.verify_access(token)?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
