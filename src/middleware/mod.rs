//! Middleware components for HTTP request processing.
//!
//! Layered outermost first as: security headers, query sanitizer, static
//! asset guard, CSRF issue, CSRF protection. The access-token gate is applied
//! per route.

pub mod auth;
pub mod csrf;
pub mod query_sanitizer;
pub mod security_headers;
pub mod static_files;

pub use csrf::CsrfStore;
pub use query_sanitizer::SanitizedQuery;
pub use static_files::StaticAssetGuard;
