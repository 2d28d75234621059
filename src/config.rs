use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SecurityConfig {
    pub enable_hsts: Option<bool>,
    pub hsts_max_age: Option<u64>,
    pub hsts_include_subdomains: Option<bool>,
    pub csp: Option<String>,
}

/// Anti-CSRF token issuance settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CsrfConfig {
    /// Random bytes per token before hex encoding.
    pub token_bytes: usize,
    pub cookie_name: String,
    pub header_name: String,
    /// Cookie max-age and server-side token lifetime.
    pub max_age_secs: u64,
    pub secure_cookie: bool,
    pub sweep_interval_secs: u64,
    /// Live tokens kept at most; issuing past it evicts the soonest to expire.
    pub max_live_tokens: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub access_secret: String,
    pub access_expiry_minutes: i64,
    pub refresh_secret: String,
    pub refresh_expiry_days: i64,
    pub issuer: String,
    /// Upper bound on concurrently valid refresh sessions per account.
    pub max_refresh_tokens: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshCookieConfig {
    pub name: String,
    pub http_only: bool,
    pub same_site: String,
    pub secure: bool,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PasswordConfig {
    pub bcrypt_cost: u32,
    /// Accept unsalted MD5 hashes from the old user base. Turn off once
    /// no legacy hashes remain.
    pub allow_legacy_md5: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticFilesConfig {
    pub root: PathBuf,
    pub allowed_extensions: Vec<String>,
    pub api_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub security: Option<SecurityConfig>,
    pub csrf: CsrfConfig,
    pub tokens: TokenConfig,
    pub refresh_cookie: RefreshCookieConfig,
    pub passwords: PasswordConfig,
    pub static_files: StaticFilesConfig,
}

/// Access tokens cannot be revoked, so they live at most a day.
pub const MAX_ACCESS_EXPIRY_MINUTES: i64 = 24 * 60;
pub const MAX_REFRESH_EXPIRY_DAYS: i64 = 365;

const DEFAULTS: &str = include_str!("../config/default.toml");

impl Default for AppConfig {
    fn default() -> Self {
        // Fallback: parse the embedded default TOML
        match ::config::Config::builder()
            .add_source(::config::File::from_str(DEFAULTS, ::config::FileFormat::Toml))
            .build()
        {
            Ok(cfg) => match cfg.try_deserialize() {
                Ok(app_cfg) => app_cfg,
                Err(e) => {
                    eprintln!("FATAL: Failed to deserialize default config: {}", e);
                    panic!("Failed to deserialize default config: {}", e);
                }
            },
            Err(e) => {
                eprintln!("FATAL: Failed to parse default config: {}", e);
                panic!("Failed to parse default config: {}", e);
            }
        }
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    // Load .env first (optional)
    let _ = dotenvy::dotenv();

    let mut builder = ::config::Config::builder()
        .add_source(::config::File::from_str(DEFAULTS, ::config::FileFormat::Toml))
        // Optional local file: storegate.toml (in CWD)
        .add_source(::config::File::with_name("storegate").required(false));

    if let Ok(custom_path) = std::env::var("STOREGATE_CONFIG") {
        builder = builder.add_source(::config::File::with_name(&custom_path).required(false));
    }
    // Environment variables last to have highest precedence
    builder = builder.add_source(
        ::config::Environment::with_prefix("STOREGATE")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("static_files.allowed_extensions")
            .with_list_parse_key("static_files.api_prefixes")
            .try_parsing(true),
    );

    let cfg = builder.build()?;
    let app_cfg: AppConfig = cfg.try_deserialize()?;
    validate(&app_cfg)?;
    Ok(app_cfg)
}

pub(crate) fn validate(cfg: &AppConfig) -> anyhow::Result<()> {
    // Server
    if cfg.server.port == 0 {
        return Err(anyhow::anyhow!("invalid server.port: {}", cfg.server.port));
    }
    #[cfg(unix)]
    if cfg.server.port < 1024 {
        tracing::warn!("Using privileged port {} - may require elevated permissions", cfg.server.port);
    }

    // CSRF
    if cfg.csrf.token_bytes < 16 {
        return Err(anyhow::anyhow!("csrf.token_bytes must be >= 16"));
    }
    if cfg.csrf.max_age_secs == 0 {
        return Err(anyhow::anyhow!("csrf.max_age_secs must be > 0"));
    }
    if cfg.csrf.sweep_interval_secs == 0 {
        return Err(anyhow::anyhow!("csrf.sweep_interval_secs must be > 0"));
    }
    if cfg.csrf.max_live_tokens == 0 {
        return Err(anyhow::anyhow!("csrf.max_live_tokens must be > 0"));
    }
    if cfg.csrf.cookie_name.trim().is_empty() || cfg.csrf.header_name.trim().is_empty() {
        return Err(anyhow::anyhow!("csrf.cookie_name and csrf.header_name must not be empty"));
    }

    // Tokens
    if cfg.tokens.access_secret.is_empty() || cfg.tokens.refresh_secret.is_empty() {
        return Err(anyhow::anyhow!("tokens.access_secret and tokens.refresh_secret must be set"));
    }
    if !(1..=MAX_ACCESS_EXPIRY_MINUTES).contains(&cfg.tokens.access_expiry_minutes) {
        return Err(anyhow::anyhow!(
            "tokens.access_expiry_minutes must be in 1..={}",
            MAX_ACCESS_EXPIRY_MINUTES
        ));
    }
    if !(1..=MAX_REFRESH_EXPIRY_DAYS).contains(&cfg.tokens.refresh_expiry_days) {
        return Err(anyhow::anyhow!("tokens.refresh_expiry_days must be in 1..={}", MAX_REFRESH_EXPIRY_DAYS));
    }
    if cfg.tokens.max_refresh_tokens == 0 {
        return Err(anyhow::anyhow!("tokens.max_refresh_tokens must be > 0"));
    }
    if cfg.tokens.access_secret.starts_with("secret-dev") || cfg.tokens.refresh_secret.starts_with("secret-dev") {
        if cfg!(debug_assertions) {
            tracing::warn!("Using development token secrets - set STOREGATE__TOKENS__ACCESS_SECRET/REFRESH_SECRET");
        } else {
            return Err(anyhow::anyhow!("development token secrets are not allowed in release builds"));
        }
    }

    // Refresh cookie
    match cfg.refresh_cookie.same_site.to_ascii_lowercase().as_str() {
        "strict" | "lax" | "none" => {}
        other => return Err(anyhow::anyhow!("refresh_cookie.same_site must be strict|lax|none, got {}", other)),
    }

    // Passwords
    if !(4..=31).contains(&cfg.passwords.bcrypt_cost) {
        return Err(anyhow::anyhow!("passwords.bcrypt_cost must be in 4..=31"));
    }

    // Static files
    for ext in &cfg.static_files.allowed_extensions {
        if !ext.starts_with('.') || ext.len() < 2 {
            return Err(anyhow::anyhow!("static_files.allowed_extensions entries must look like '.ext', got {}", ext));
        }
    }

    Ok(())
}

pub fn ensure_sqlite_parent_dir(url: &str) -> anyhow::Result<()> {
    if let Some(path) = url.strip_prefix("sqlite://") {
        let p = Path::new(path);
        if let Some(parent) = p.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }
    Ok(())
}
