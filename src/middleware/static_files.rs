//! Path-safety gate in front of the public asset directory.
//!
//! A request is either handed on to the router (`Delegate`), answered with a
//! file from below the configured root (`Serve`), or refused with a
//! 403 "Access denied". Anything that looks like traversal is refused before
//! the filesystem is touched.

use std::path::{Path, PathBuf};

use axum::{
    body::Body,
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use percent_encoding::percent_decode_str;
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::config::StaticFilesConfig;
use crate::error::{sanitize_for_logging, AppError};
use crate::state::AppState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetDecision {
    /// Not a static asset request, or no such file: let the router decide.
    Delegate,
    /// Canonical path of a regular file under the root.
    Serve(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AssetRejection {
    #[error("traversal sequence in static path")]
    Traversal,
    #[error("dot-prefixed segment in static path")]
    DotSegment,
    #[error("static path resolves outside the asset root")]
    OutsideRoot,
}

#[derive(Debug, Clone)]
pub struct StaticAssetGuard {
    root: PathBuf,
    allowed_extensions: Vec<String>,
    api_prefixes: Vec<String>,
}

impl StaticAssetGuard {
    pub fn new(root: impl Into<PathBuf>, allowed_extensions: &[String], api_prefixes: &[String]) -> Self {
        Self {
            root: root.into(),
            allowed_extensions: allowed_extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
            api_prefixes: api_prefixes.to_vec(),
        }
    }

    pub fn from_config(cfg: &StaticFilesConfig) -> Self {
        Self::new(cfg.root.clone(), &cfg.allowed_extensions, &cfg.api_prefixes)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The checks that need no filesystem access. Returns the decoded path
    /// relative to the root when the request is a static asset candidate.
    pub fn precheck(&self, request_path: &str) -> Result<Option<String>, AssetRejection> {
        if self.api_prefixes.iter().any(|p| request_path.starts_with(p.as_str())) {
            return Ok(None);
        }

        let decoded = percent_decode_str(request_path).decode_utf8_lossy();
        for candidate in [request_path, &*decoded] {
            if candidate.contains("..") || candidate.contains("//") || candidate.contains('\\') || candidate.contains('\0')
            {
                return Err(AssetRejection::Traversal);
            }
            if candidate.starts_with('.') || candidate.split('/').any(|segment| segment.starts_with('.')) {
                return Err(AssetRejection::DotSegment);
            }
        }

        if decoded == "/" {
            return Ok(Some("index.html".to_string()));
        }

        let extension = match Path::new(&*decoded).extension().and_then(|e| e.to_str()) {
            Some(ext) => format!(".{}", ext.to_ascii_lowercase()),
            None => return Ok(None),
        };
        if !self.allowed_extensions.contains(&extension) {
            return Ok(None);
        }

        Ok(Some(decoded.trim_start_matches('/').to_string()))
    }

    /// Full decision for a request path, including containment of the
    /// canonical (symlink-resolved) target inside the canonical root.
    pub async fn resolve(&self, request_path: &str) -> Result<AssetDecision, AssetRejection> {
        let Some(relative) = self.precheck(request_path)? else {
            return Ok(AssetDecision::Delegate);
        };

        let root = match tokio::fs::canonicalize(&self.root).await {
            Ok(root) => root,
            Err(e) => {
                tracing::warn!("Static root {} is not accessible: {}", self.root.display(), e);
                return Ok(AssetDecision::Delegate);
            }
        };
        let candidate = match tokio::fs::canonicalize(root.join(&relative)).await {
            Ok(path) => path,
            Err(_) => return Ok(AssetDecision::Delegate),
        };
        if !candidate.starts_with(&root) {
            return Err(AssetRejection::OutsideRoot);
        }

        match tokio::fs::metadata(&candidate).await {
            Ok(meta) if meta.is_file() => Ok(AssetDecision::Serve(candidate)),
            _ => Ok(AssetDecision::Delegate),
        }
    }
}

/// Serves allowed static assets for GET and HEAD requests and refuses
/// unsafe paths. Everything else continues down the stack.
pub async fn static_files_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !matches!(*req.method(), Method::GET | Method::HEAD) {
        return Ok(next.run(req).await);
    }

    match state.assets.resolve(req.uri().path()).await {
        Ok(AssetDecision::Delegate) => Ok(next.run(req).await),
        Ok(AssetDecision::Serve(path)) => {
            state.metrics.inc_assets_served();
            let res = match ServeFile::new(&path).oneshot(req).await {
                Ok(res) => res,
                Err(never) => match never {},
            };
            Ok(res.map(Body::new))
        }
        Err(rejection) => {
            state.metrics.inc_traversals_blocked();
            tracing::warn!(
                path = %sanitize_for_logging(req.uri().path()),
                "Blocked static asset request: {}",
                rejection
            );
            Err(rejection.into())
        }
    }
}
