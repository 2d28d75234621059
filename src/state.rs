use std::sync::Arc;

use crate::auth::SessionManager;
use crate::config::AppConfig;
use crate::metrics::Metrics;
use crate::middleware::{CsrfStore, StaticAssetGuard};

/// The shared application state.
///
/// Cloned into every handler and middleware; all members are cheap handles
/// over shared data.
#[derive(Clone)]
pub struct AppState {
    /// The database connection pool holding credential records.
    pub db: sqlx::SqlitePool,
    pub config: Arc<AppConfig>,
    pub metrics: Metrics,
    /// Live anti-CSRF tokens.
    pub csrf: CsrfStore,
    /// Credential and session lifecycle.
    pub sessions: SessionManager,
    /// Path-safety gate for the public asset directory.
    pub assets: StaticAssetGuard,
}

impl AppState {
    pub fn new(db: sqlx::SqlitePool, config: AppConfig) -> Self {
        let metrics = Metrics::new();
        let sessions = SessionManager::new(db.clone(), &config, metrics.clone());
        Self {
            csrf: CsrfStore::from_config(&config.csrf),
            assets: StaticAssetGuard::from_config(&config.static_files),
            sessions,
            metrics,
            db,
            config: Arc::new(config),
        }
    }
}
