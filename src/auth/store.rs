//! Persistence of credential records and refresh-token fingerprints.
//!
//! The fingerprint list of an account behaves as a fixed-capacity ring:
//! every mutation is a single transaction that appends and trims to the
//! newest `cap` entries, so concurrent issuances cannot lose an update or
//! push the list past its cap.

use sqlx::{FromRow, SqlitePool};

use crate::auth::password::PasswordHasher;
use crate::error::{AppError, AppResult};
use crate::types::{Role, User};

#[derive(FromRow)]
struct UserRow {
    id: i64,
    name: String,
    email: String,
    password_hash: String,
    roles: String,
    login_count: i64,
    last_login_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            name: row.name,
            email: row.email,
            password_hash: row.password_hash,
            roles: Role::parse_list(&row.roles),
            login_count: row.login_count,
            last_login_at: row.last_login_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const USER_COLUMNS: &str =
    "id, name, email, password_hash, roles, login_count, last_login_at, created_at, updated_at";

/// Values for a new account. A `password_hash` that is not bcrypt yet is
/// hashed on insert.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub roles: Vec<Role>,
}

#[derive(Clone)]
pub struct UserStore {
    pool: SqlitePool,
    hasher: PasswordHasher,
}

impl UserStore {
    pub fn new(pool: SqlitePool, hasher: PasswordHasher) -> Self {
        Self { pool, hasher }
    }

    pub async fn create_user(&self, mut new_user: NewUser) -> AppResult<User> {
        new_user.password_hash = self.hasher.ensure_hashed(&new_user.password_hash).await?;
        self.insert_user(&new_user).await
    }

    async fn insert_user(&self, new_user: &NewUser) -> AppResult<User> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "INSERT INTO users (name, email, password_hash, roles) VALUES (?1, ?2, ?3, ?4) RETURNING {USER_COLUMNS}"
        ))
        .bind(&new_user.name)
        .bind(&new_user.email)
        .bind(&new_user.password_hash)
        .bind(Role::join_list(&new_user.roles))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match AppError::from(e) {
            AppError::Conflict(_) => AppError::Conflict("An account with this email already exists".to_string()),
            other => other,
        })?;
        Ok(row.into())
    }

    /// `email` must already be normalized.
    pub async fn find_by_email(&self, email: &str) -> AppResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"))
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    pub async fn find_by_id(&self, id: i64) -> AppResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    /// Stores a new credential. Values that are not bcrypt yet are hashed
    /// first; bcrypt values are written as given.
    pub async fn set_password_hash(&self, user_id: i64, password_hash: &str) -> AppResult<()> {
        let password_hash = self.hasher.ensure_hashed(password_hash).await?;
        let result = sqlx::query(
            "UPDATE users SET password_hash = ?1, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?2",
        )
        .bind(&password_hash)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("User not found".to_string()));
        }
        Ok(())
    }

    pub async fn record_login(&self, user_id: i64) -> AppResult<()> {
        sqlx::query(
            "UPDATE users SET login_count = login_count + 1, last_login_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE id = ?1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Accounts still carrying an unsalted MD5 hash. Zero means the legacy
    /// verification branch can be switched off.
    pub async fn count_legacy_hashes(&self) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM users WHERE length(password_hash) = 32 AND password_hash NOT GLOB '*[^0-9a-f]*'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Inserts an account whose stored credential is an unsalted MD5 hash, as
    /// left behind by the old user base.
    #[cfg(test)]
    pub(crate) async fn insert_legacy_user(&self, new_user: NewUser) -> AppResult<User> {
        self.insert_user(&new_user).await
    }

    /// Appends a fingerprint and evicts all but the newest `cap`, atomically.
    pub async fn push_fingerprint(&self, user_id: i64, fingerprint: &str, cap: usize) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO refresh_tokens (user_id, fingerprint) VALUES (?1, ?2)")
            .bind(user_id)
            .bind(fingerprint)
            .execute(&mut *tx)
            .await?;
        trim_fingerprints(&mut tx, user_id, cap).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Replaces `old` with `new` in one transaction. Fails with
    /// `Unauthorized` when `old` is not on the list, which makes a refresh
    /// token usable for exactly one rotation.
    pub async fn rotate_fingerprint(&self, user_id: i64, old: &str, new: &str, cap: usize) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM refresh_tokens WHERE user_id = ?1 AND fingerprint = ?2")
            .bind(user_id)
            .bind(old)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed != 1 {
            tx.rollback().await?;
            return Err(AppError::Unauthorized("Invalid or expired token".to_string()));
        }
        sqlx::query("INSERT INTO refresh_tokens (user_id, fingerprint) VALUES (?1, ?2)")
            .bind(user_id)
            .bind(new)
            .execute(&mut *tx)
            .await?;
        trim_fingerprints(&mut tx, user_id, cap).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Returns whether a fingerprint was removed.
    pub async fn remove_fingerprint(&self, user_id: i64, fingerprint: &str) -> AppResult<bool> {
        let removed = sqlx::query("DELETE FROM refresh_tokens WHERE user_id = ?1 AND fingerprint = ?2")
            .bind(user_id)
            .bind(fingerprint)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    pub async fn remove_all_fingerprints(&self, user_id: i64) -> AppResult<u64> {
        let removed = sqlx::query("DELETE FROM refresh_tokens WHERE user_id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }

    pub async fn has_fingerprint(&self, user_id: i64, fingerprint: &str) -> AppResult<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT id FROM refresh_tokens WHERE user_id = ?1 AND fingerprint = ?2")
                .bind(user_id)
                .bind(fingerprint)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    /// Fingerprints of an account, oldest first.
    pub async fn fingerprints(&self, user_id: i64) -> AppResult<Vec<String>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT fingerprint FROM refresh_tokens WHERE user_id = ?1 ORDER BY id ASC")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }
}

async fn trim_fingerprints(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    user_id: i64,
    cap: usize,
) -> AppResult<()> {
    sqlx::query(
        r#"DELETE FROM refresh_tokens
           WHERE user_id = ?1
             AND id NOT IN (
                SELECT id FROM refresh_tokens WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2
             )"#,
    )
    .bind(user_id)
    .bind(cap as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::HashFormat;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_store() -> UserStore {
        let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await.unwrap();
        crate::db::init_db(&pool).await.unwrap();
        UserStore::new(pool, PasswordHasher::new(4, true))
    }

    async fn create(store: &UserStore, email: &str, hash: &str) -> User {
        store
            .create_user(NewUser {
                name: "Test User".to_string(),
                email: email.to_string(),
                password_hash: hash.to_string(),
                roles: vec![Role::Customer],
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_find_user() {
        let store = setup_store().await;
        let user = create(&store, "ann@example.com", "hash").await;
        assert_eq!(user.roles, vec![Role::Customer]);
        assert_eq!(user.login_count, 0);

        let found = store.find_by_email("ann@example.com").await.unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert!(store.find_by_email("bob@example.com").await.unwrap().is_none());
        assert!(store.find_by_id(user.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_email_is_conflict() {
        let store = setup_store().await;
        create(&store, "ann@example.com", "hash").await;
        let err = store
            .create_user(NewUser {
                name: "Again".to_string(),
                email: "ann@example.com".to_string(),
                password_hash: "hash".to_string(),
                roles: vec![Role::Customer],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_push_fingerprint_keeps_newest_five_in_order() {
        let store = setup_store().await;
        let user = create(&store, "ann@example.com", "hash").await;
        for i in 1..=6 {
            store.push_fingerprint(user.id, &format!("fp{i}"), 5).await.unwrap();
        }
        let fps = store.fingerprints(user.id).await.unwrap();
        assert_eq!(fps, vec!["fp2", "fp3", "fp4", "fp5", "fp6"]);
        assert!(!store.has_fingerprint(user.id, "fp1").await.unwrap());
    }

    #[tokio::test]
    async fn test_fingerprint_caps_are_per_account() {
        let store = setup_store().await;
        let ann = create(&store, "ann@example.com", "hash").await;
        let bob = create(&store, "bob@example.com", "hash").await;
        for i in 0..5 {
            store.push_fingerprint(ann.id, &format!("ann{i}"), 5).await.unwrap();
        }
        store.push_fingerprint(bob.id, "bob0", 5).await.unwrap();
        assert_eq!(store.fingerprints(ann.id).await.unwrap().len(), 5);
        assert_eq!(store.fingerprints(bob.id).await.unwrap(), vec!["bob0"]);
    }

    #[tokio::test]
    async fn test_concurrent_pushes_respect_cap() {
        let store = setup_store().await;
        let user = create(&store, "ann@example.com", "hash").await;
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.push_fingerprint(user.id, &format!("fp{i}"), 5).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.fingerprints(user.id).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_rotate_fingerprint_is_single_use() {
        let store = setup_store().await;
        let user = create(&store, "ann@example.com", "hash").await;
        store.push_fingerprint(user.id, "old", 5).await.unwrap();

        store.rotate_fingerprint(user.id, "old", "new", 5).await.unwrap();
        assert_eq!(store.fingerprints(user.id).await.unwrap(), vec!["new"]);

        let err = store.rotate_fingerprint(user.id, "old", "newer", 5).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
        assert_eq!(store.fingerprints(user.id).await.unwrap(), vec!["new"]);
    }

    #[tokio::test]
    async fn test_remove_fingerprint() {
        let store = setup_store().await;
        let user = create(&store, "ann@example.com", "hash").await;
        store.push_fingerprint(user.id, "a", 5).await.unwrap();
        store.push_fingerprint(user.id, "b", 5).await.unwrap();
        assert!(store.remove_fingerprint(user.id, "a").await.unwrap());
        assert!(!store.remove_fingerprint(user.id, "a").await.unwrap());
        assert_eq!(store.remove_all_fingerprints(user.id).await.unwrap(), 1);
    }

    fn legacy(email: &str, hash: &str) -> NewUser {
        NewUser {
            name: "Legacy".to_string(),
            email: email.to_string(),
            password_hash: hash.to_string(),
            roles: vec![Role::Customer],
        }
    }

    #[tokio::test]
    async fn test_writes_hash_plain_values_and_keep_bcrypt() {
        let store = setup_store().await;
        let user = create(&store, "ann@example.com", "hunter22").await;
        assert_eq!(HashFormat::detect(&user.password_hash), HashFormat::Bcrypt);
        assert!(bcrypt::verify("hunter22", &user.password_hash).unwrap());

        let existing = bcrypt::hash("other-pass", 4).unwrap();
        let kept = create(&store, "bob@example.com", &existing).await;
        assert_eq!(kept.password_hash, existing);

        // Re-saving the stored value leaves it untouched
        store.set_password_hash(user.id, &user.password_hash).await.unwrap();
        let resaved = store.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(resaved.password_hash, user.password_hash);

        store.set_password_hash(user.id, "replaced1").await.unwrap();
        let replaced = store.find_by_id(user.id).await.unwrap().unwrap();
        assert!(bcrypt::verify("replaced1", &replaced.password_hash).unwrap());
    }

    #[tokio::test]
    async fn test_password_hash_update_and_legacy_count() {
        let store = setup_store().await;
        let user = store.insert_legacy_user(legacy("ann@example.com", "5ebe2294ecd0e0f08eab7690d2a6ee69")).await.unwrap();
        // Uppercase hex is not a legacy MD5 hash
        store.insert_legacy_user(legacy("eve@example.com", "5EBE2294ECD0E0F08EAB7690D2A6EE69")).await.unwrap();
        create(&store, "bob@example.com", "hunter22").await;
        assert_eq!(store.count_legacy_hashes().await.unwrap(), 1);

        let upgraded = bcrypt::hash("secret", 4).unwrap();
        store.set_password_hash(user.id, &upgraded).await.unwrap();
        assert_eq!(store.count_legacy_hashes().await.unwrap(), 0);
        assert!(matches!(store.set_password_hash(9999, "x").await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_record_login_updates_stats() {
        let store = setup_store().await;
        let user = create(&store, "ann@example.com", "hash").await;
        store.record_login(user.id).await.unwrap();
        store.record_login(user.id).await.unwrap();
        let found = store.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(found.login_count, 2);
        assert!(found.last_login_at.is_some());
    }
}
