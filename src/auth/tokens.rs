//! Signed access and refresh tokens.
//!
//! Access tokens are stateless and short-lived. Refresh tokens are long-lived
//! and only valid while their HMAC fingerprint is on the account's list; the
//! token itself is never persisted.

use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::TokenConfig;
use crate::error::{AppError, AppResult};
use crate::types::{Role, User};

type HmacSha256 = Hmac<Sha256>;

const INVALID_TOKEN_MESSAGE: &str = "Invalid or expired token";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    #[serde(rename = "_id")]
    pub user_id: i64,
    pub email: String,
    pub roles: Vec<Role>,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

impl AccessClaims {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: String,
    #[serde(rename = "_id")]
    pub user_id: i64,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    /// Keeps tokens issued within the same second distinct.
    pub jti: String,
}

#[derive(Clone)]
pub struct TokenIssuer {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    refresh_secret: Vec<u8>,
    issuer: String,
    access_ttl: chrono::Duration,
    refresh_ttl: chrono::Duration,
}

impl TokenIssuer {
    pub fn new(cfg: &TokenConfig) -> Self {
        Self {
            access_encoding: EncodingKey::from_secret(cfg.access_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(cfg.access_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(cfg.refresh_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(cfg.refresh_secret.as_bytes()),
            refresh_secret: cfg.refresh_secret.as_bytes().to_vec(),
            issuer: cfg.issuer.clone(),
            access_ttl: chrono::Duration::minutes(cfg.access_expiry_minutes),
            refresh_ttl: chrono::Duration::days(cfg.refresh_expiry_days),
        }
    }

    pub fn refresh_ttl(&self) -> chrono::Duration {
        self.refresh_ttl
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "sub", "iss"]);
        validation
    }

    pub fn issue_access(&self, user: &User) -> AppResult<String> {
        let now = chrono::Utc::now();
        let claims = AccessClaims {
            sub: user.id.to_string(),
            user_id: user.id,
            email: user.email.clone(),
            roles: user.roles.clone(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        encode(&Header::default(), &claims, &self.access_encoding)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("access token signing failed: {}", e)))
    }

    pub fn issue_refresh(&self, user_id: i64) -> AppResult<String> {
        let now = chrono::Utc::now();
        let claims = RefreshClaims {
            sub: user_id.to_string(),
            user_id,
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + self.refresh_ttl).timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        encode(&Header::default(), &claims, &self.refresh_encoding)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("refresh token signing failed: {}", e)))
    }

    pub fn verify_access(&self, token: &str) -> AppResult<AccessClaims> {
        decode::<AccessClaims>(token, &self.access_decoding, &self.validation())
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!("Access token rejected: {}", e);
                AppError::Unauthorized(INVALID_TOKEN_MESSAGE.to_string())
            })
    }

    /// Checks signature and expiry only. Revocation is decided by the
    /// fingerprint list, see `SessionManager::refresh`.
    pub fn verify_refresh(&self, token: &str) -> AppResult<RefreshClaims> {
        decode::<RefreshClaims>(token, &self.refresh_decoding, &self.validation())
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!("Refresh token rejected: {}", e);
                AppError::Unauthorized(INVALID_TOKEN_MESSAGE.to_string())
            })
    }

    /// Hex HMAC-SHA256 of the refresh token, keyed with the refresh secret.
    pub fn fingerprint(&self, token: &str) -> AppResult<String> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.refresh_secret)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("invalid HMAC key: {}", e)))?;
        mac.update(token.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}
