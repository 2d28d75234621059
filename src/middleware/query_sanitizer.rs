//! Query-string injection gate.
//!
//! Runs the raw-string operator check before anything parses the query,
//! then the deep check on the parsed tree. Handlers read the cleaned copy
//! through the [`SanitizedQuery`] extension instead of re-parsing the URI.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::error::{sanitize_for_logging, AppError};
use crate::sanitizer::{check_raw_query, sanitize_parsed_query, QueryValue};
use crate::state::AppState;

/// Operator-free copy of the request's query parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SanitizedQuery(pub QueryValue);

impl SanitizedQuery {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(QueryValue::as_str)
    }
}

pub async fn query_sanitizer_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let sanitized = match req.uri().query() {
        Some(raw) if !raw.is_empty() => {
            let checked = check_raw_query(raw)
                .and_then(|_| sanitize_parsed_query(&QueryValue::from_query_string(raw)));
            match checked {
                Ok(clean) => clean,
                Err(e) => {
                    state.metrics.inc_injections_blocked();
                    tracing::warn!(
                        path = %sanitize_for_logging(req.uri().path()),
                        query = %sanitize_for_logging(raw),
                        location = %e.location(),
                        "Blocked query string: {}",
                        e
                    );
                    return Err(e.into());
                }
            }
        }
        _ => QueryValue::default(),
    };

    req.extensions_mut().insert(SanitizedQuery(sanitized));
    Ok(next.run(req).await)
}
