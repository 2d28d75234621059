//! # Storegate
//!
//! Security boundary for an online-store backend. Every request passes
//! through this layer before business handlers see it.
//!
//! ## Architecture
//!
//! The application is built using:
//! - **Axum**: HTTP server, routing and middleware
//! - **SQLx**: credential records in SQLite
//! - **Tokio**: async runtime; bcrypt runs on the blocking pool
//! - **Serde**: JSON bodies and the query value tree
//!
//! ## Core Components
//!
//! - [`sanitizer`]: NoSQL-operator injection defense (reject and strip modes)
//! - [`middleware`]: query sanitizer, static asset guard, CSRF tokens,
//!   access-token gate, security headers
//! - [`auth`]: password hashing with legacy migration, access/refresh tokens,
//!   refresh rotation and revocation
//! - [`routes`]: authentication and health endpoints, router assembly
//! - [`config`]: layered configuration
//! - [`db`]: schema initialization
//! - [`error`]: error type and JSON error envelope
//! - [`metrics`]: counters for blocked and accepted requests
//! - [`state`]: shared application state
//! - [`types`]: records and request/response bodies

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod sanitizer;
pub mod state;
pub mod types;

#[cfg(test)]
mod tests;
