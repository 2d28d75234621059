//! Credential and session management.
//!
//! - `password`: bcrypt hashing and the legacy MD5 verification branch
//! - `tokens`: signed access/refresh tokens and refresh fingerprints
//! - `store`: account records and the per-account fingerprint ring
//! - `session`: the facade the authentication routes talk to

pub mod password;
pub mod session;
pub mod store;
pub mod tokens;

pub use session::{SessionManager, SessionTokens};
