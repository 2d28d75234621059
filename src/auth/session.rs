//! Credential and session lifecycle used by the authentication routes.

use crate::auth::password::{PasswordHasher, Verification};
use crate::auth::store::{NewUser, UserStore};
use crate::auth::tokens::{AccessClaims, TokenIssuer};
use crate::config::AppConfig;
use crate::error::validation::{normalize_email, validate_name, validate_password};
use crate::error::{AppError, AppResult, OptionExt, BAD_CREDENTIALS_MESSAGE};
use crate::metrics::Metrics;
use crate::types::{RegisterRequest, Role, User};
use sqlx::SqlitePool;

/// Freshly issued token pair. The refresh token leaves the server only in
/// its HttpOnly cookie.
#[derive(Debug, Clone)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Clone)]
pub struct SessionManager {
    store: UserStore,
    hasher: PasswordHasher,
    tokens: TokenIssuer,
    metrics: Metrics,
    max_refresh_tokens: usize,
}

fn bad_credentials() -> AppError {
    AppError::Unauthorized(BAD_CREDENTIALS_MESSAGE.to_string())
}

impl SessionManager {
    pub fn new(pool: SqlitePool, cfg: &AppConfig, metrics: Metrics) -> Self {
        let hasher = PasswordHasher::from_config(&cfg.passwords);
        Self {
            store: UserStore::new(pool, hasher.clone()),
            hasher,
            tokens: TokenIssuer::new(&cfg.tokens),
            metrics,
            max_refresh_tokens: cfg.tokens.max_refresh_tokens,
        }
    }

    pub fn store(&self) -> &UserStore {
        &self.store
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub async fn register(&self, req: RegisterRequest) -> AppResult<User> {
        let email = normalize_email(&req.email)?;
        validate_password(&req.password)?;
        let name = match req.name.as_deref() {
            Some(name) => validate_name(name)?,
            None => default_name(&email),
        };
        // Client input is always plaintext, even when it looks like a hash
        let password_hash = self.hasher.hash(&req.password).await?;
        let user = self
            .store
            .create_user(NewUser { name, email, password_hash, roles: vec![Role::Customer] })
            .await?;
        tracing::info!(user_id = user.id, "Registered new account");
        Ok(user)
    }

    /// Checks credentials. Unknown accounts and wrong passwords fail with the
    /// same error after the same bcrypt work. A password still stored as legacy MD5 is re-hashed with
    /// bcrypt once it verifies.
    pub async fn authenticate(&self, email: &str, password: &str) -> AppResult<User> {
        let email = match normalize_email(email) {
            Ok(email) => email,
            Err(_) => return self.reject_unknown(password).await,
        };

        let Some(user) = self.store.find_by_email(&email).await? else {
            return self.reject_unknown(password).await;
        };

        match self.hasher.verify(password, &user.password_hash).await? {
            Verification::Mismatch => {
                self.metrics.inc_logins_failed();
                tracing::info!(user_id = user.id, "Rejected login: password mismatch");
                return Err(bad_credentials());
            }
            Verification::Legacy => {
                let upgraded = self.hasher.hash(password).await?;
                self.store.set_password_hash(user.id, &upgraded).await?;
                self.metrics.inc_legacy_migrations();
                tracing::info!(user_id = user.id, "Migrated legacy password hash to bcrypt");
            }
            Verification::Modern => {}
        }

        self.store.record_login(user.id).await?;
        self.metrics.inc_logins_succeeded();
        self.store.find_by_id(user.id).await?.ok_or_not_found("User")
    }

    async fn reject_unknown<T>(&self, password: &str) -> AppResult<T> {
        self.hasher.verify_dummy(password).await?;
        self.metrics.inc_logins_failed();
        Err(bad_credentials())
    }

    /// Issues an access token and a refresh token, and records the refresh
    /// fingerprint, evicting the oldest session past the cap.
    pub async fn issue_session(&self, user: &User) -> AppResult<SessionTokens> {
        let access_token = self.tokens.issue_access(user)?;
        let refresh_token = self.tokens.issue_refresh(user.id)?;
        let fingerprint = self.tokens.fingerprint(&refresh_token)?;
        self.store.push_fingerprint(user.id, &fingerprint, self.max_refresh_tokens).await?;
        Ok(SessionTokens { access_token, refresh_token })
    }

    /// Exchanges a refresh token for a new pair. The presented token stops
    /// working in the same transaction that records its replacement.
    pub async fn refresh(&self, refresh_token: &str) -> AppResult<(User, SessionTokens)> {
        let claims = self.tokens.verify_refresh(refresh_token)?;
        let user = self
            .store
            .find_by_id(claims.user_id)
            .await?
            .ok_or_else(|| AppError::Unauthorized("Invalid or expired token".to_string()))?;

        let old_fingerprint = self.tokens.fingerprint(refresh_token)?;
        let new_refresh = self.tokens.issue_refresh(user.id)?;
        let new_fingerprint = self.tokens.fingerprint(&new_refresh)?;
        self.store
            .rotate_fingerprint(user.id, &old_fingerprint, &new_fingerprint, self.max_refresh_tokens)
            .await
            .map_err(|e| {
                if matches!(e, AppError::Unauthorized(_)) {
                    tracing::warn!(user_id = user.id, "Refresh token not on the account's list");
                }
                e
            })?;
        self.metrics.inc_refresh_rotations();

        let access_token = self.tokens.issue_access(&user)?;
        Ok((user, SessionTokens { access_token, refresh_token: new_refresh }))
    }

    /// Revokes the session behind `refresh_token`. Missing, invalid or
    /// already revoked tokens are not an error.
    pub async fn logout(&self, refresh_token: Option<&str>) -> AppResult<()> {
        let Some(token) = refresh_token else {
            return Ok(());
        };
        let Ok(claims) = self.tokens.verify_refresh(token) else {
            return Ok(());
        };
        let fingerprint = self.tokens.fingerprint(token)?;
        if self.store.remove_fingerprint(claims.user_id, &fingerprint).await? {
            tracing::info!(user_id = claims.user_id, "Revoked refresh session");
        }
        Ok(())
    }

    /// Replaces the password after checking the current one and revokes every
    /// refresh session of the account.
    pub async fn change_password(&self, user_id: i64, current_password: &str, new_password: &str) -> AppResult<()> {
        validate_password(new_password)?;
        let user = self.store.find_by_id(user_id).await?.ok_or_not_found("User")?;
        if !self.hasher.verify(current_password, &user.password_hash).await?.is_match() {
            return Err(bad_credentials());
        }
        let hashed = self.hasher.hash(new_password).await?;
        self.store.set_password_hash(user_id, &hashed).await?;
        let revoked = self.store.remove_all_fingerprints(user_id).await?;
        tracing::info!(user_id, revoked, "Password changed");
        Ok(())
    }

    pub fn verify_access(&self, token: &str) -> AppResult<AccessClaims> {
        self.tokens.verify_access(token)
    }

    pub async fn current_user(&self, claims: &AccessClaims) -> AppResult<User> {
        self.store
            .find_by_id(claims.user_id)
            .await?
            .ok_or_else(|| AppError::Unauthorized("Invalid or expired token".to_string()))
    }
}

/// Name used when registration leaves it out: the mailbox part, bounded to
/// the accepted name length.
fn default_name(email: &str) -> String {
    let local = email.split('@').next().unwrap_or_default();
    let name: String = local.chars().take(30).collect();
    if name.chars().count() >= 2 {
        name
    } else {
        "Customer".to_string()
    }
}
