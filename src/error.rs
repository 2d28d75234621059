use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::error::Error;
use std::fmt;

use crate::middleware::static_files::AssetRejection;
use crate::sanitizer::InjectionDetected;

/// Message returned for every rejected injection attempt. The offending
/// value is never reflected back.
pub const INJECTION_MESSAGE: &str = "NoSQL injection attempt detected";
/// Shared by "no such account" and "wrong password".
pub const BAD_CREDENTIALS_MESSAGE: &str = "Incorrect email or password";
pub const FORBIDDEN_MESSAGE: &str = "Access denied";

/// The primary error type for the application.
///
/// Every check in the security layer either passes or ends the request with
/// one of these variants; the surrounding router turns it into a JSON error
/// envelope without internal detail.
#[derive(Debug)]
pub enum AppError {
    /// For internal server errors that are not expected to be handled by the client.
    Internal(anyhow::Error),
    /// For when a requested resource is not found.
    NotFound(String),
    /// For when a request conflicts with the current state of the server.
    Conflict(String),
    /// For errors related to database operations.
    Database(String),
    /// For when a query or payload contains document-query operators.
    Injection(InjectionDetected),
    /// For credential, access-token and refresh-fingerprint mismatches.
    Unauthorized(String),
    /// For state-changing requests without a live anti-CSRF token.
    CsrfRejected,
    /// For path-safety violations. Carries the internal reason for logging.
    Forbidden(String),
    /// For when a specific field in a request fails validation.
    ValidationError {
        /// The name of the field that failed validation.
        field: String,
        /// A message describing the validation error.
        message: String,
    },
    /// For errors related to I/O operations.
    IoError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(e) => write!(f, "Internal error: {}", e),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::Database(msg) => write!(f, "Database error: {}", msg),
            AppError::Injection(e) => write!(f, "Injection rejected: {}", e),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::CsrfRejected => write!(f, "CSRF token missing or invalid"),
            AppError::Forbidden(reason) => write!(f, "Forbidden: {}", reason),
            AppError::ValidationError { field, message } => {
                write!(f, "Validation error on field '{}': {}", field, message)
            }
            AppError::IoError(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl Error for AppError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AppError::Internal(e) => Some(e.as_ref()),
            AppError::Injection(e) => Some(e),
            _ => None,
        }
    }
}

/// Logs the hidden detail under a fresh error id and returns the id for the body.
fn log_with_error_id(kind: &str, detail: &dyn fmt::Display) -> serde_json::Value {
    let error_id = uuid::Uuid::new_v4();
    tracing::error!(%error_id, "{}: {}", kind, detail);
    json!({ "error_id": error_id.to_string() })
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, error_message, details) = match self {
            AppError::Internal(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal server error occurred".to_string(),
                Some(log_with_error_id("Internal error", &format!("{:?}", e))),
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg, None),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg, None),
            AppError::Database(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                Some(log_with_error_id("Database error", &msg)),
            ),
            // Logged where the request was rejected
            AppError::Injection(_) => {
                (StatusCode::BAD_REQUEST, "INJECTION_DETECTED", INJECTION_MESSAGE.to_string(), None)
            }
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg, None),
            AppError::CsrfRejected => (
                StatusCode::FORBIDDEN,
                "CSRF_TOKEN_INVALID",
                "Invalid CSRF token".to_string(),
                None,
            ),
            AppError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN", FORBIDDEN_MESSAGE.to_string(), None),
            AppError::ValidationError { field, message } => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                format!("Validation failed for field '{}'", field),
                Some(json!({ "field": field, "message": message })),
            ),
            AppError::IoError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "IO_ERROR",
                "An I/O error occurred".to_string(),
                Some(log_with_error_id("I/O error", &msg)),
            ),
        };

        let mut body = json!({
            "error": {
                "code": error_code,
                "message": error_message,
            },
            "status": status.as_u16(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        if let Some(details) = details {
            body["error"]["details"] = details;
        }

        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<InjectionDetected> for AppError {
    fn from(err: InjectionDetected) -> Self {
        AppError::Injection(err)
    }
}

impl From<AssetRejection> for AppError {
    fn from(err: AssetRejection) -> Self {
        AppError::Forbidden(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    AppError::Conflict("Record already exists".to_string())
                } else {
                    AppError::Database(format!("Database error: {}", db_err.message()))
                }
            }
            _ => AppError::Database(format!("Database error: {}", err)),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::IoError(format!("{}: {}", err.kind(), err))
    }
}

impl From<bcrypt::BcryptError> for AppError {
    fn from(err: bcrypt::BcryptError) -> Self {
        AppError::Internal(anyhow::anyhow!("password hashing failed: {}", err))
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::Internal(anyhow::anyhow!("blocking task failed: {}", err))
    }
}

/// A type alias for `Result<T, AppError>`, used throughout the application.
pub type AppResult<T> = Result<T, AppError>;

/// An extension trait for `Option` that provides a convenient way to convert
/// an `Option` to a `Result` with a `NotFound` error.
pub trait OptionExt<T> {
    /// Converts an `Option<T>` to a `Result<T, AppError>`.
    fn ok_or_not_found(self, entity: &str) -> AppResult<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, entity: &str) -> AppResult<T> {
        self.ok_or_else(|| AppError::NotFound(format!("{} not found", entity)))
    }
}

/// Request field validation helpers.
pub mod validation {
    use super::*;

    /// Trims, lowercases and minimally checks an email address.
    pub fn normalize_email(email: &str) -> AppResult<String> {
        let normalized = email.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(AppError::ValidationError {
                field: "email".to_string(),
                message: "Email cannot be empty".to_string(),
            });
        }
        let valid = match normalized.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && domain.contains('.')
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
                    && !normalized.chars().any(char::is_whitespace)
            }
            None => false,
        };
        if !valid {
            return Err(AppError::ValidationError {
                field: "email".to_string(),
                message: "Email must be a valid address".to_string(),
            });
        }
        Ok(normalized)
    }

    /// Validates a display name: 2 to 30 characters after trimming.
    pub fn validate_name(name: &str) -> AppResult<String> {
        let trimmed = name.trim();
        let len = trimmed.chars().count();
        if !(2..=30).contains(&len) {
            return Err(AppError::ValidationError {
                field: "name".to_string(),
                message: "Name must be between 2 and 30 characters".to_string(),
            });
        }
        Ok(trimmed.to_string())
    }

    /// Validates a plaintext password before hashing.
    pub fn validate_password(password: &str) -> AppResult<()> {
        if password.len() < 6 {
            return Err(AppError::ValidationError {
                field: "password".to_string(),
                message: "Password must be at least 6 characters".to_string(),
            });
        }
        // bcrypt ignores everything past 72 bytes
        if password.len() > 72 {
            return Err(AppError::ValidationError {
                field: "password".to_string(),
                message: "Password must be at most 72 bytes".to_string(),
            });
        }
        Ok(())
    }
}

/// Strips control characters and bounds the length of untrusted input
/// before it is written to the log.
pub fn sanitize_for_logging(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .take(200)
        .collect::<String>()
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\'', "\\\'")
}
