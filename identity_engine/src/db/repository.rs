//! Repository trait definitions for testability and dependency injection.
//!
//! The engine owns the business rules; these traits are the read/write
//! contracts it needs from durable storage. [`PgStore`] implements all of
//! them on PostgreSQL, and [`super::memory`] provides in-process fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use super::errors::{StoreError, StoreResult};
use crate::auth::{
    LoginFailureState, RefreshToken, TwoFactorMethod, TwoFactorVerification, User, UserId,
};

/// Trait for user credential repository operations
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Find user by username
    async fn get_user_by_username(&self, username: &str) -> StoreResult<Option<User>>;

    /// Find user by email
    async fn get_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    /// Find user by ID
    async fn get_user_by_id(&self, user_id: UserId) -> StoreResult<Option<User>>;

    /// Find user holding an email verification token
    async fn get_user_by_verification_token(&self, token: &str) -> StoreResult<Option<User>>;

    /// Whether the username or the email is already taken
    async fn exists_by_username_or_email(&self, username: &str, email: &str) -> StoreResult<bool>;

    /// Insert a new user
    ///
    /// Must fail with [`StoreError::Conflict`] when the username or email is
    /// taken, so the uniqueness check is atomic with the write.
    async fn insert_user(&self, user: &User) -> StoreResult<()>;

    /// Overwrite a user record
    ///
    /// Writes every column, lockout bookkeeping included. Lifecycle flows
    /// use the column-targeted writes below instead.
    async fn update_user(&self, user: &User) -> StoreResult<()>;

    /// Mark the email verified and clear the token, only while the user still holds `token`
    ///
    /// Returns `false` when the token was already consumed or replaced.
    async fn mark_email_verified(
        &self,
        user_id: UserId,
        token: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Replace the pending email verification token
    async fn set_verification_token(
        &self,
        user_id: UserId,
        token: &str,
        expires_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Store a TOTP secret and enable two-factor login
    ///
    /// Returns `false` when the user does not exist.
    async fn enroll_two_factor_secret(
        &self,
        user_id: UserId,
        secret: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Atomically count a failed login and lock once `max_attempts` is reached
    ///
    /// Returns `None` when the user does not exist.
    async fn record_failed_login(
        &self,
        user_id: UserId,
        max_attempts: i32,
        lockout_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<LoginFailureState>>;

    /// Reset failure bookkeeping and stamp the login time
    async fn record_successful_login(&self, user_id: UserId, at: DateTime<Utc>) -> StoreResult<()>;

    /// Clear a lockout whose window ended at or before `now`
    async fn clear_expired_lockout(&self, user_id: UserId, now: DateTime<Utc>) -> StoreResult<()>;
}

/// Trait for refresh token repository operations
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Persist a new refresh token
    async fn insert_refresh_token(&self, token: &RefreshToken) -> StoreResult<()>;

    /// Find a token by its opaque value, excluding revoked tokens
    async fn get_by_token_value(&self, token: &str) -> StoreResult<Option<RefreshToken>>;

    /// Unrevoked, unexpired tokens of a user
    async fn list_active_for_user(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<RefreshToken>>;

    /// Soft-revoke a token; `false` if it was unknown or already revoked
    async fn mark_revoked(&self, id: Uuid, at: DateTime<Utc>, reason: &str) -> StoreResult<bool>;

    /// Soft-revoke every live token of a user, returning how many changed
    async fn revoke_all_for_user(
        &self,
        user_id: UserId,
        at: DateTime<Utc>,
        reason: &str,
    ) -> StoreResult<u64>;
}

/// Trait for two-factor challenge repository operations
#[async_trait]
pub trait TwoFactorStore: Send + Sync {
    /// Persist a new challenge
    async fn insert_challenge(&self, challenge: &TwoFactorVerification) -> StoreResult<()>;

    /// Most recently created unverified, unexpired challenge
    async fn get_most_recent_pending(
        &self,
        user_id: UserId,
        method: TwoFactorMethod,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TwoFactorVerification>>;

    /// Mark verified only if still unverified; `false` if another call won
    async fn mark_verified(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<bool>;
}

/// Default deadline for a single store query
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a query, cancelling it once `deadline` passes
async fn with_timeout<F, T>(deadline: Duration, query: F) -> StoreResult<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    tokio::time::timeout(deadline, query)
        .await
        .map_err(|_| StoreError::Timeout(deadline))?
        .map_err(StoreError::from)
}

const USER_COLUMNS: &str = "id, username, email, password_hash, first_name, last_name, \
     is_email_verified, email_verification_token, email_verification_expires_at, \
     is_locked, failed_login_attempts, lockout_until, two_factor_enabled, two_factor_secret, \
     created_at, updated_at, last_login_at";

const REFRESH_COLUMNS: &str = "id, user_id, client_id, token, rotated_from, expires_at, \
     created_at, revoked_at, revoke_reason, ip_address, user_agent";

const CHALLENGE_COLUMNS: &str =
    "id, user_id, method, code, expires_at, is_verified, verified_at, created_at";

fn user_from_row(r: &PgRow) -> StoreResult<User> {
    Ok(User {
        id: r.try_get("id")?,
        username: r.try_get("username")?,
        email: r.try_get("email")?,
        password_hash: r.try_get("password_hash")?,
        first_name: r.try_get("first_name")?,
        last_name: r.try_get("last_name")?,
        is_email_verified: r.try_get("is_email_verified")?,
        email_verification_token: r.try_get("email_verification_token")?,
        email_verification_expires_at: r.try_get("email_verification_expires_at")?,
        is_locked: r.try_get("is_locked")?,
        failed_login_attempts: r.try_get("failed_login_attempts")?,
        lockout_until: r.try_get("lockout_until")?,
        two_factor_enabled: r.try_get("two_factor_enabled")?,
        two_factor_secret: r.try_get("two_factor_secret")?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
        last_login_at: r.try_get("last_login_at")?,
    })
}

fn refresh_token_from_row(r: &PgRow) -> StoreResult<RefreshToken> {
    Ok(RefreshToken {
        id: r.try_get("id")?,
        user_id: r.try_get("user_id")?,
        client_id: r.try_get("client_id")?,
        token: r.try_get("token")?,
        rotated_from: r.try_get("rotated_from")?,
        expires_at: r.try_get("expires_at")?,
        created_at: r.try_get("created_at")?,
        revoked_at: r.try_get("revoked_at")?,
        revoke_reason: r.try_get("revoke_reason")?,
        ip_address: r.try_get("ip_address")?,
        user_agent: r.try_get("user_agent")?,
    })
}

fn challenge_from_row(r: &PgRow) -> StoreResult<TwoFactorVerification> {
    let method: String = r.try_get("method")?;
    Ok(TwoFactorVerification {
        id: r.try_get("id")?,
        user_id: r.try_get("user_id")?,
        method: method.parse().map_err(StoreError::Corruption)?,
        code: r.try_get("code")?,
        expires_at: r.try_get("expires_at")?,
        is_verified: r.try_get("is_verified")?,
        verified_at: r.try_get("verified_at")?,
        created_at: r.try_get("created_at")?,
    })
}

/// PostgreSQL implementation of every store trait
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    query_timeout: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    /// Override the per-query deadline
    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    async fn fetch_user(&self, predicate: &str, value: &str) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE {predicate} = $1");
        let row = with_timeout(
            self.query_timeout,
            sqlx::query(&sql).bind(value).fetch_optional(&self.pool),
        )
        .await?;

        row.as_ref().map(user_from_row).transpose()
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn get_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        self.fetch_user("username", username).await
    }

    async fn get_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        self.fetch_user("email", email).await
    }

    async fn get_user_by_id(&self, user_id: UserId) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = with_timeout(
            self.query_timeout,
            sqlx::query(&sql).bind(user_id).fetch_optional(&self.pool),
        )
        .await?;

        row.as_ref().map(user_from_row).transpose()
    }

    async fn get_user_by_verification_token(&self, token: &str) -> StoreResult<Option<User>> {
        self.fetch_user("email_verification_token", token).await
    }

    async fn exists_by_username_or_email(&self, username: &str, email: &str) -> StoreResult<bool> {
        let row = with_timeout(
            self.query_timeout,
            sqlx::query(
                "SELECT EXISTS(SELECT 1 FROM users WHERE username = $1 OR email = $2) AS taken",
            )
            .bind(username)
            .bind(email)
            .fetch_one(&self.pool),
        )
        .await?;

        Ok(row.try_get("taken")?)
    }

    async fn insert_user(&self, user: &User) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO users ({USER_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        );
        with_timeout(
            self.query_timeout,
            sqlx::query(&sql)
                .bind(user.id)
                .bind(&user.username)
                .bind(&user.email)
                .bind(&user.password_hash)
                .bind(&user.first_name)
                .bind(&user.last_name)
                .bind(user.is_email_verified)
                .bind(&user.email_verification_token)
                .bind(user.email_verification_expires_at)
                .bind(user.is_locked)
                .bind(user.failed_login_attempts)
                .bind(user.lockout_until)
                .bind(user.two_factor_enabled)
                .bind(&user.two_factor_secret)
                .bind(user.created_at)
                .bind(user.updated_at)
                .bind(user.last_login_at)
                .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn update_user(&self, user: &User) -> StoreResult<()> {
        with_timeout(
            self.query_timeout,
            sqlx::query(
                r#"
                UPDATE users
                SET username = $2, email = $3, password_hash = $4, first_name = $5,
                    last_name = $6, is_email_verified = $7, email_verification_token = $8,
                    email_verification_expires_at = $9, is_locked = $10,
                    failed_login_attempts = $11, lockout_until = $12, two_factor_enabled = $13,
                    two_factor_secret = $14, updated_at = $15, last_login_at = $16
                WHERE id = $1
                "#,
            )
            .bind(user.id)
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(user.is_email_verified)
            .bind(&user.email_verification_token)
            .bind(user.email_verification_expires_at)
            .bind(user.is_locked)
            .bind(user.failed_login_attempts)
            .bind(user.lockout_until)
            .bind(user.two_factor_enabled)
            .bind(&user.two_factor_secret)
            .bind(user.updated_at)
            .bind(user.last_login_at)
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn mark_email_verified(
        &self,
        user_id: UserId,
        token: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = with_timeout(
            self.query_timeout,
            sqlx::query(
                r#"
                UPDATE users
                SET is_email_verified = TRUE, email_verification_token = NULL,
                    email_verification_expires_at = NULL, updated_at = $3
                WHERE id = $1 AND email_verification_token = $2
                "#,
            )
            .bind(user_id)
            .bind(token)
            .bind(at)
            .execute(&self.pool),
        )
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_verification_token(
        &self,
        user_id: UserId,
        token: &str,
        expires_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        with_timeout(
            self.query_timeout,
            sqlx::query(
                r#"
                UPDATE users
                SET email_verification_token = $2, email_verification_expires_at = $3,
                    updated_at = $4
                WHERE id = $1
                "#,
            )
            .bind(user_id)
            .bind(token)
            .bind(expires_at)
            .bind(at)
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn enroll_two_factor_secret(
        &self,
        user_id: UserId,
        secret: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = with_timeout(
            self.query_timeout,
            sqlx::query(
                r#"
                UPDATE users
                SET two_factor_secret = $2, two_factor_enabled = TRUE, updated_at = $3
                WHERE id = $1
                "#,
            )
            .bind(user_id)
            .bind(secret)
            .bind(at)
            .execute(&self.pool),
        )
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_failed_login(
        &self,
        user_id: UserId,
        max_attempts: i32,
        lockout_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<LoginFailureState>> {
        // SET expressions see the pre-update row, so the increment and the
        // lock decision happen in one statement
        let row = with_timeout(
            self.query_timeout,
            sqlx::query(
                r#"
                UPDATE users
                SET failed_login_attempts = failed_login_attempts + 1,
                    is_locked = is_locked OR failed_login_attempts + 1 >= $2,
                    lockout_until = CASE
                        WHEN failed_login_attempts + 1 >= $2 THEN $3
                        ELSE lockout_until
                    END,
                    updated_at = $4
                WHERE id = $1
                RETURNING failed_login_attempts, is_locked, lockout_until
                "#,
            )
            .bind(user_id)
            .bind(max_attempts)
            .bind(lockout_until)
            .bind(now)
            .fetch_optional(&self.pool),
        )
        .await?;

        row.map(|r| -> StoreResult<LoginFailureState> {
            Ok(LoginFailureState {
                failed_login_attempts: r.try_get("failed_login_attempts")?,
                is_locked: r.try_get("is_locked")?,
                lockout_until: r.try_get("lockout_until")?,
            })
        })
        .transpose()
    }

    async fn record_successful_login(&self, user_id: UserId, at: DateTime<Utc>) -> StoreResult<()> {
        with_timeout(
            self.query_timeout,
            sqlx::query(
                r#"
                UPDATE users
                SET failed_login_attempts = 0, is_locked = FALSE, lockout_until = NULL,
                    last_login_at = $2, updated_at = $2
                WHERE id = $1
                "#,
            )
            .bind(user_id)
            .bind(at)
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn clear_expired_lockout(&self, user_id: UserId, now: DateTime<Utc>) -> StoreResult<()> {
        with_timeout(
            self.query_timeout,
            sqlx::query(
                r#"
                UPDATE users
                SET failed_login_attempts = 0, is_locked = FALSE, lockout_until = NULL,
                    updated_at = $2
                WHERE id = $1 AND is_locked AND (lockout_until IS NULL OR lockout_until <= $2)
                "#,
            )
            .bind(user_id)
            .bind(now)
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }
}

#[async_trait]
impl RefreshTokenStore for PgStore {
    async fn insert_refresh_token(&self, token: &RefreshToken) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO refresh_tokens ({REFRESH_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        );
        with_timeout(
            self.query_timeout,
            sqlx::query(&sql)
                .bind(token.id)
                .bind(token.user_id)
                .bind(token.client_id)
                .bind(&token.token)
                .bind(token.rotated_from)
                .bind(token.expires_at)
                .bind(token.created_at)
                .bind(token.revoked_at)
                .bind(&token.revoke_reason)
                .bind(&token.ip_address)
                .bind(&token.user_agent)
                .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn get_by_token_value(&self, token: &str) -> StoreResult<Option<RefreshToken>> {
        let sql = format!(
            "SELECT {REFRESH_COLUMNS} FROM refresh_tokens WHERE token = $1 AND revoked_at IS NULL"
        );
        let row = with_timeout(
            self.query_timeout,
            sqlx::query(&sql).bind(token).fetch_optional(&self.pool),
        )
        .await?;

        row.as_ref().map(refresh_token_from_row).transpose()
    }

    async fn list_active_for_user(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<RefreshToken>> {
        let sql = format!(
            "SELECT {REFRESH_COLUMNS} FROM refresh_tokens \
             WHERE user_id = $1 AND revoked_at IS NULL AND expires_at > $2 \
             ORDER BY created_at DESC"
        );
        let rows = with_timeout(
            self.query_timeout,
            sqlx::query(&sql).bind(user_id).bind(now).fetch_all(&self.pool),
        )
        .await?;

        rows.iter().map(refresh_token_from_row).collect()
    }

    async fn mark_revoked(&self, id: Uuid, at: DateTime<Utc>, reason: &str) -> StoreResult<bool> {
        let result = with_timeout(
            self.query_timeout,
            sqlx::query(
                "UPDATE refresh_tokens SET revoked_at = $2, revoke_reason = $3 \
                 WHERE id = $1 AND revoked_at IS NULL",
            )
            .bind(id)
            .bind(at)
            .bind(reason)
            .execute(&self.pool),
        )
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn revoke_all_for_user(
        &self,
        user_id: UserId,
        at: DateTime<Utc>,
        reason: &str,
    ) -> StoreResult<u64> {
        let result = with_timeout(
            self.query_timeout,
            sqlx::query(
                "UPDATE refresh_tokens SET revoked_at = $2, revoke_reason = $3 \
                 WHERE user_id = $1 AND revoked_at IS NULL",
            )
            .bind(user_id)
            .bind(at)
            .bind(reason)
            .execute(&self.pool),
        )
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TwoFactorStore for PgStore {
    async fn insert_challenge(&self, challenge: &TwoFactorVerification) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO two_factor_verifications ({CHALLENGE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        );
        with_timeout(
            self.query_timeout,
            sqlx::query(&sql)
                .bind(challenge.id)
                .bind(challenge.user_id)
                .bind(challenge.method.as_str())
                .bind(&challenge.code)
                .bind(challenge.expires_at)
                .bind(challenge.is_verified)
                .bind(challenge.verified_at)
                .bind(challenge.created_at)
                .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn get_most_recent_pending(
        &self,
        user_id: UserId,
        method: TwoFactorMethod,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TwoFactorVerification>> {
        let sql = format!(
            "SELECT {CHALLENGE_COLUMNS} FROM two_factor_verifications \
             WHERE user_id = $1 AND method = $2 AND NOT is_verified AND expires_at > $3 \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = with_timeout(
            self.query_timeout,
            sqlx::query(&sql)
                .bind(user_id)
                .bind(method.as_str())
                .bind(now)
                .fetch_optional(&self.pool),
        )
        .await?;

        row.as_ref().map(challenge_from_row).transpose()
    }

    async fn mark_verified(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        let result = with_timeout(
            self.query_timeout,
            sqlx::query(
                "UPDATE two_factor_verifications SET is_verified = TRUE, verified_at = $2 \
                 WHERE id = $1 AND NOT is_verified",
            )
            .bind(id)
            .bind(at)
            .execute(&self.pool),
        )
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
