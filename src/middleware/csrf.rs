//! Cross-Site Request Forgery (CSRF) protection middleware.
//!
//! Every GET response carries a fresh random token, both as a readable
//! cookie and as a response header. State-changing requests must echo a live
//! token in the `X-CSRF-Token` header; each token is accepted once and only
//! until it expires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::{Cookie, SameSite};
use rand::{rngs::OsRng, RngCore};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::CsrfConfig;
use crate::error::AppError;
use crate::state::AppState;

/// Path prefix whose state-changing requests skip the token check. The
/// authentication endpoints rely on credentials and the SameSite refresh
/// cookie instead.
pub const AUTH_PATH_PREFIX: &str = "/auth/";

/// Process-wide set of live anti-CSRF tokens, bounded to `max_tokens`.
#[derive(Clone)]
pub struct CsrfStore {
    tokens: Arc<RwLock<HashMap<String, Instant>>>,
    ttl: Duration,
    token_bytes: usize,
    max_tokens: usize,
}

impl CsrfStore {
    pub fn new(ttl: Duration, token_bytes: usize, max_tokens: usize) -> Self {
        Self { tokens: Arc::new(RwLock::new(HashMap::new())), ttl, token_bytes, max_tokens: max_tokens.max(1) }
    }

    pub fn from_config(cfg: &CsrfConfig) -> Self {
        Self::new(Duration::from_secs(cfg.max_age_secs), cfg.token_bytes, cfg.max_live_tokens)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Generates a token from the OS random source and records it as live.
    pub async fn issue(&self) -> String {
        let mut bytes = vec![0u8; self.token_bytes];
        OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        let now = Instant::now();
        let mut tokens = self.tokens.write().await;
        if tokens.len() >= self.max_tokens {
            tokens.retain(|_, expires_at| *expires_at > now);
        }
        while tokens.len() >= self.max_tokens {
            let Some(oldest) = tokens.iter().min_by_key(|(_, expires_at)| **expires_at).map(|(t, _)| t.clone())
            else {
                break;
            };
            tokens.remove(&oldest);
            tracing::debug!("CSRF token store full, evicted the oldest token");
        }
        tokens.insert(token.clone(), now + self.ttl);
        token
    }

    /// Removes the token and reports whether it was live. Check and removal
    /// happen under one write lock, so concurrent callers presenting the same
    /// token see exactly one success.
    pub async fn consume(&self, token: &str) -> bool {
        let mut tokens = self.tokens.write().await;
        match tokens.remove(token) {
            Some(expires_at) => expires_at > Instant::now(),
            None => false,
        }
    }

    pub async fn contains(&self, token: &str) -> bool {
        let tokens = self.tokens.read().await;
        matches!(tokens.get(token), Some(expires_at) if *expires_at > Instant::now())
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tokens.read().await.is_empty()
    }

    /// Drops expired tokens and returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, expires_at| *expires_at > now);
        before - tokens.len()
    }
}

/// Runs `sweep_expired` every `interval` until `cancel` fires.
pub fn spawn_sweeper(store: CsrfStore, interval: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("CSRF sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = store.sweep_expired().await;
                    if removed > 0 {
                        tracing::debug!(removed, "Swept expired CSRF tokens");
                    }
                }
            }
        }
    })
}

/// Sets the token as a script-readable SameSite=Strict cookie and as the
/// configured response header.
pub fn attach_token(headers: &mut HeaderMap, token: &str, cfg: &CsrfConfig) {
    let cookie = Cookie::build((cfg.cookie_name.clone(), token.to_owned()))
        .path("/")
        .http_only(false)
        .same_site(SameSite::Strict)
        .secure(cfg.secure_cookie)
        .max_age(time::Duration::seconds(cfg.max_age_secs as i64))
        .build();

    match HeaderValue::from_str(&cookie.to_string()) {
        Ok(value) => {
            headers.append(header::SET_COOKIE, value);
        }
        Err(e) => tracing::error!("Failed to encode CSRF cookie: {}", e),
    }
    match (HeaderName::try_from(cfg.header_name.as_str()), HeaderValue::from_str(token)) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => tracing::error!("Failed to encode CSRF response header"),
    }
}

/// Issues a fresh token on every GET response that does not already carry
/// one.
pub async fn csrf_issue_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let is_get = req.method() == Method::GET;
    let mut res = next.run(req).await;
    if !is_get || res.headers().contains_key(state.config.csrf.header_name.as_str()) {
        return res;
    }

    let token = state.csrf.issue().await;
    state.metrics.inc_csrf_issued();
    attach_token(res.headers_mut(), &token, &state.config.csrf);
    res
}

/// Rejects state-changing requests outside `/auth/` that do not present a
/// live token. The token is consumed before the handler runs.
pub async fn csrf_protection_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !requires_token(req.method(), req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let presented = req
        .headers()
        .get(state.config.csrf.header_name.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let accepted = match presented {
        Some(token) if !token.is_empty() => state.csrf.consume(&token).await,
        _ => false,
    };
    if !accepted {
        state.metrics.inc_csrf_rejected();
        tracing::warn!(method = %req.method(), path = %req.uri().path(), "Rejected request without a live CSRF token");
        return Err(AppError::CsrfRejected);
    }

    Ok(next.run(req).await)
}

fn requires_token(method: &Method, path: &str) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) && !path.starts_with(AUTH_PATH_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CsrfStore {
        CsrfStore::new(Duration::from_secs(3600), 32, 1000)
    }

    #[tokio::test]
    async fn test_issued_token_shape() {
        let store = store();
        let token = store.issue().await;
        assert_eq!(token.len(), 64);
        assert!(token.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(token, store.issue().await);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_token_is_single_use() {
        let store = store();
        let token = store.issue().await;
        assert!(store.contains(&token).await);
        assert!(store.consume(&token).await);
        assert!(!store.consume(&token).await);
        assert!(!store.contains(&token).await);
        assert!(!store.consume("never-issued").await);
    }

    #[tokio::test]
    async fn test_concurrent_consume_succeeds_once() {
        let store = store();
        let token = store.issue().await;
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move { store.consume(&token).await }));
        }
        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected_and_swept() {
        let store = CsrfStore::new(Duration::from_millis(20), 32, 1000);
        let expired = store.issue().await;
        let also_expired = store.issue().await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!store.contains(&expired).await);
        assert!(!store.consume(&expired).await);
        assert_eq!(store.sweep_expired().await, 1);
        assert!(store.is_empty().await);
        assert!(!store.consume(&also_expired).await);
    }

    #[tokio::test]
    async fn test_full_store_evicts_oldest_tokens() {
        let store = CsrfStore::new(Duration::from_secs(3600), 32, 3);
        let mut issued = Vec::new();
        for _ in 0..5 {
            issued.push(store.issue().await);
            // Distinct expiry instants
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(store.len().await, 3);
        assert!(!store.contains(&issued[0]).await);
        assert!(!store.contains(&issued[1]).await);
        for token in &issued[2..] {
            assert!(store.contains(token).await);
        }
    }

    #[tokio::test]
    async fn test_full_store_drops_expired_before_live() {
        let store = CsrfStore::new(Duration::from_millis(30), 32, 2);
        store.issue().await;
        store.issue().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fresh = store.issue().await;
        assert_eq!(store.len().await, 1);
        assert!(store.contains(&fresh).await);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(store(), Duration::from_millis(5), cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[test]
    fn test_requires_token() {
        assert!(requires_token(&Method::POST, "/product"));
        assert!(requires_token(&Method::DELETE, "/order/1"));
        assert!(!requires_token(&Method::POST, "/auth/login"));
        assert!(!requires_token(&Method::GET, "/product"));
        assert!(!requires_token(&Method::HEAD, "/"));
        assert!(!requires_token(&Method::OPTIONS, "/product"));
    }

    #[test]
    fn test_attach_token_sets_cookie_and_header() {
        let cfg = crate::config::AppConfig::default().csrf;
        let mut headers = HeaderMap::new();
        attach_token(&mut headers, "abc123", &cfg);

        let cookie = headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cookie.starts_with("XSRF-TOKEN=abc123"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(cookie.contains("Max-Age=3600"));
        assert!(!cookie.contains("HttpOnly"));
        assert_eq!(headers.get("x-csrf-token").unwrap(), "abc123");
    }
}
