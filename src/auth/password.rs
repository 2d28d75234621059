//! Password hashing with bcrypt and verification of legacy MD5 hashes.
//!
//! Stored hashes are tagged by [`HashFormat`]. Legacy MD5 values verify
//! through a separate, switchable branch and are upgraded to bcrypt on the
//! next successful login.

use std::sync::Arc;

use md5::{Digest, Md5};
use subtle::ConstantTimeEq;
use tokio::sync::OnceCell;

use crate::config::PasswordConfig;
use crate::error::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashFormat {
    /// `$2a$`, `$2b$` or `$2y$` prefixed bcrypt hash.
    Bcrypt,
    /// Unsalted MD5, 32 lowercase hex characters.
    LegacyMd5,
    Unknown,
}

impl HashFormat {
    pub fn detect(stored: &str) -> Self {
        if stored.len() == 60 && ["$2a$", "$2b$", "$2y$"].iter().any(|p| stored.starts_with(p)) {
            HashFormat::Bcrypt
        } else if stored.len() == 32 && stored.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            HashFormat::LegacyMd5
        } else {
            HashFormat::Unknown
        }
    }
}

/// Outcome of checking a candidate password against a stored hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Modern,
    /// Matched through the MD5 branch; the caller should re-hash.
    Legacy,
    Mismatch,
}

impl Verification {
    pub fn is_match(self) -> bool {
        !matches!(self, Verification::Mismatch)
    }
}

pub fn legacy_md5_hex(plain: &str) -> String {
    hex::encode(Md5::digest(plain.as_bytes()))
}

// Input for the stand-in hash checked when an account does not exist
const DUMMY_PASSWORD: &str = "storegate-no-such-account";

#[derive(Debug, Clone)]
pub struct PasswordHasher {
    cost: u32,
    allow_legacy: bool,
    /// bcrypt hash at `cost`, built on first use.
    dummy_hash: Arc<OnceCell<String>>,
}

impl PasswordHasher {
    pub fn new(cost: u32, allow_legacy: bool) -> Self {
        Self { cost, allow_legacy, dummy_hash: Arc::new(OnceCell::new()) }
    }

    pub fn from_config(cfg: &PasswordConfig) -> Self {
        Self::new(cfg.bcrypt_cost, cfg.allow_legacy_md5)
    }

    /// Hashes on the blocking pool so slow bcrypt rounds never stall the
    /// async workers.
    pub async fn hash(&self, plain: &str) -> AppResult<String> {
        let plain = plain.to_owned();
        let cost = self.cost;
        let hashed = tokio::task::spawn_blocking(move || bcrypt::hash(plain, cost)).await??;
        Ok(hashed)
    }

    /// Hashes `value` unless it already is a bcrypt hash, so re-saving a
    /// record never double-hashes it.
    pub async fn ensure_hashed(&self, value: &str) -> AppResult<String> {
        if HashFormat::detect(value) == HashFormat::Bcrypt {
            return Ok(value.to_owned());
        }
        self.hash(value).await
    }

    /// Runs one bcrypt verification against a fixed hash at the configured
    /// cost. Login for an unknown account calls this so it takes as long as
    /// a wrong password.
    pub async fn verify_dummy(&self, plain: &str) -> AppResult<()> {
        let dummy = self.dummy_hash.get_or_try_init(|| self.hash(DUMMY_PASSWORD)).await?;
        self.verify(plain, dummy).await?;
        Ok(())
    }

    pub async fn verify(&self, plain: &str, stored: &str) -> AppResult<Verification> {
        match HashFormat::detect(stored) {
            HashFormat::Bcrypt => {
                let plain = plain.to_owned();
                let stored = stored.to_owned();
                let matched = tokio::task::spawn_blocking(move || bcrypt::verify(plain, &stored)).await?;
                match matched {
                    Ok(true) => Ok(Verification::Modern),
                    Ok(false) => Ok(Verification::Mismatch),
                    Err(e) => {
                        tracing::warn!("Unreadable bcrypt hash in credential record: {}", e);
                        Ok(Verification::Mismatch)
                    }
                }
            }
            HashFormat::LegacyMd5 if self.allow_legacy => {
                let candidate = legacy_md5_hex(plain);
                if bool::from(candidate.as_bytes().ct_eq(stored.as_bytes())) {
                    Ok(Verification::Legacy)
                } else {
                    Ok(Verification::Mismatch)
                }
            }
            HashFormat::LegacyMd5 | HashFormat::Unknown => Ok(Verification::Mismatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Lowest bcrypt cost keeps the tests fast
    fn hasher() -> PasswordHasher {
        PasswordHasher::new(4, true)
    }

    #[test]
    fn test_detect_formats() {
        let bcrypt_hash = bcrypt::hash("secret", 4).unwrap();
        assert_eq!(HashFormat::detect(&bcrypt_hash), HashFormat::Bcrypt);
        assert_eq!(HashFormat::detect("5ebe2294ecd0e0f08eab7690d2a6ee69"), HashFormat::LegacyMd5);
        assert_eq!(HashFormat::detect("5EBE2294ECD0E0F08EAB7690D2A6EE69"), HashFormat::Unknown);
        assert_eq!(HashFormat::detect("plaintext"), HashFormat::Unknown);
        assert_eq!(HashFormat::detect("$argon2id$v=19$m=19456"), HashFormat::Unknown);
        assert_eq!(HashFormat::detect(""), HashFormat::Unknown);
    }

    #[test]
    fn test_legacy_md5_hex() {
        assert_eq!(legacy_md5_hex("secret"), "5ebe2294ecd0e0f08eab7690d2a6ee69");
    }

    #[tokio::test]
    async fn test_hash_then_verify_roundtrip() {
        let h = hasher();
        let stored = h.hash("correct horse").await.unwrap();
        assert_eq!(HashFormat::detect(&stored), HashFormat::Bcrypt);
        assert_eq!(h.verify("correct horse", &stored).await.unwrap(), Verification::Modern);
        assert_eq!(h.verify("battery staple", &stored).await.unwrap(), Verification::Mismatch);
    }

    #[tokio::test]
    async fn test_legacy_hash_verifies_through_fallback() {
        let h = hasher();
        let stored = legacy_md5_hex("secret");
        assert_eq!(h.verify("secret", &stored).await.unwrap(), Verification::Legacy);
        assert_eq!(h.verify("secret", &stored.to_uppercase()).await.unwrap(), Verification::Mismatch);
        assert_eq!(h.verify("wrong", &stored).await.unwrap(), Verification::Mismatch);
    }

    #[tokio::test]
    async fn test_legacy_branch_can_be_disabled() {
        let h = PasswordHasher::new(4, false);
        let stored = legacy_md5_hex("secret");
        assert_eq!(h.verify("secret", &stored).await.unwrap(), Verification::Mismatch);
    }

    #[tokio::test]
    async fn test_ensure_hashed_is_idempotent() {
        let h = hasher();
        let first = h.ensure_hashed("hunter22").await.unwrap();
        assert_ne!(first, "hunter22");
        let second = h.ensure_hashed(&first).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.verify("hunter22", &second).await.unwrap(), Verification::Modern);
    }

    #[tokio::test]
    async fn test_verify_dummy_builds_hash_at_configured_cost() {
        let h = PasswordHasher::new(5, true);
        h.verify_dummy("anything").await.unwrap();
        let dummy = h.dummy_hash.get().unwrap().clone();
        assert_eq!(HashFormat::detect(&dummy), HashFormat::Bcrypt);
        assert!(dummy.starts_with("$2b$05$"));

        // Clones share the cached hash
        let clone = h.clone();
        clone.verify_dummy("other").await.unwrap();
        assert_eq!(clone.dummy_hash.get().unwrap(), &dummy);
    }

    #[tokio::test]
    async fn test_unknown_format_never_matches() {
        let h = hasher();
        assert_eq!(h.verify("plaintext", "plaintext").await.unwrap(), Verification::Mismatch);
        assert!(!Verification::Mismatch.is_match());
        assert!(Verification::Legacy.is_match());
    }
}
