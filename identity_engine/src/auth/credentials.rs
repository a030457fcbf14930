//! Password registration and login with brute-force lockout.

use chrono::Duration;
use rand::RngCore;
use std::sync::Arc;
use uuid::Uuid;

use super::errors::{AuthError, AuthResult, CredentialFailure};
use super::models::{RegisterRequest, User, UserId};
use super::password::PasswordHasher;
use crate::clock::SharedClock;
use crate::config::LockoutPolicy;
use crate::db::{CredentialStore, StoreError};
use crate::email::Mailer;
use crate::logging::log_security_event;

const MIN_PASSWORD_LENGTH: usize = 8;

/// Checks passwords and owns the failure/lockout bookkeeping
#[derive(Clone)]
pub struct CredentialVerifier {
    store: Arc<dyn CredentialStore>,
    hasher: PasswordHasher,
    mailer: Mailer,
    clock: SharedClock,
    lockout: LockoutPolicy,
    verification_ttl: Duration,
}

impl CredentialVerifier {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        hasher: PasswordHasher,
        mailer: Mailer,
        clock: SharedClock,
        lockout: LockoutPolicy,
        verification_ttl: Duration,
    ) -> Self {
        Self {
            store,
            hasher,
            mailer,
            clock,
            lockout,
            verification_ttl,
        }
    }

    /// Register a new user
    ///
    /// Stores a salted hash and a single-use verification token, then hands
    /// the token to the mailer.
    ///
    /// # Errors
    ///
    /// * `AuthError::Validation` - Empty field or password shorter than 8 characters
    /// * `AuthError::Duplicate` - Username or email already exists
    pub async fn register(&self, request: RegisterRequest) -> AuthResult<User> {
        validate_registration(&request)?;

        if self
            .store
            .exists_by_username_or_email(&request.username, &request.email)
            .await?
        {
            return Err(AuthError::Duplicate);
        }

        let password_hash = self.hasher.hash_password_async(&request.password).await?;
        let now = self.clock.now();
        let verification_token = random_token();

        let user = User {
            id: Uuid::new_v4(),
            username: request.username,
            email: request.email,
            password_hash,
            first_name: request.profile.first_name,
            last_name: request.profile.last_name,
            is_email_verified: false,
            email_verification_token: Some(verification_token.clone()),
            email_verification_expires_at: Some(now + self.verification_ttl),
            is_locked: false,
            failed_login_attempts: 0,
            lockout_until: None,
            two_factor_enabled: false,
            two_factor_secret: None,
            created_at: now,
            updated_at: now,
            last_login_at: None,
        };

        // the unique constraints settle registrations racing past the exists check
        self.store.insert_user(&user).await.map_err(|e| match e {
            StoreError::Conflict(_) => AuthError::Duplicate,
            other => AuthError::Store(other),
        })?;

        tracing::info!(user_id = %user.id, username = %user.username, "User registered");

        self.mailer
            .verification(user.email.clone(), verification_token)
            .await;

        Ok(user)
    }

    /// Verify username and password
    ///
    /// # Errors
    ///
    /// * `AuthError::InvalidCredentials` - Unknown username or wrong password
    /// * `AuthError::Locked` - Lockout window still running
    pub async fn login(&self, username: &str, password: &str) -> AuthResult<User> {
        let now = self.clock.now();

        let Some(mut user) = self.store.get_user_by_username(username).await? else {
            self.hasher.verify_decoy_async(password).await?;
            tracing::debug!("Login failed: unknown username");
            return Err(AuthError::InvalidCredentials {
                user_id: None,
                reason: CredentialFailure::UnknownUser,
            });
        };

        if user.is_locked {
            if user.is_locked_at(now) {
                let until = user.lockout_until.unwrap_or(now);
                return Err(AuthError::Locked {
                    user_id: user.id,
                    until,
                    now,
                });
            }

            self.store.clear_expired_lockout(user.id, now).await?;
            user.is_locked = false;
            user.failed_login_attempts = 0;
            user.lockout_until = None;
        }

        let valid = self
            .hasher
            .validate_password_async(password, &user.password_hash)
            .await?;

        if !valid {
            return Err(self.register_failure(&user).await?);
        }

        self.store.record_successful_login(user.id, now).await?;
        user.failed_login_attempts = 0;
        user.is_locked = false;
        user.lockout_until = None;
        user.last_login_at = Some(now);
        user.updated_at = now;

        tracing::info!(user_id = %user.id, "Login succeeded");
        Ok(user)
    }

    /// Count one failed attempt; returns the error to report
    async fn register_failure(&self, user: &User) -> AuthResult<AuthError> {
        let now = self.clock.now();
        let state = self
            .store
            .record_failed_login(
                user.id,
                self.lockout.max_failed_attempts,
                now + self.lockout.lockout_duration,
                now,
            )
            .await?
            .ok_or(AuthError::UserNotFound)?;

        let reason = if state.is_locked {
            log_security_event(
                "account_locked",
                Some(&user.id.to_string()),
                &format!(
                    "Locked after {} failed login attempts",
                    state.failed_login_attempts
                ),
            );
            CredentialFailure::LockedOut
        } else {
            tracing::debug!(
                user_id = %user.id,
                attempts = state.failed_login_attempts,
                "Login failed: wrong password"
            );
            CredentialFailure::WrongPassword
        };

        Ok(AuthError::InvalidCredentials {
            user_id: Some(user.id),
            reason,
        })
    }

    /// Consume an email verification token
    ///
    /// # Errors
    ///
    /// * `AuthError::InvalidVerificationToken` - Unknown or expired token
    pub async fn verify_email(&self, token: &str) -> AuthResult<User> {
        let now = self.clock.now();
        let user = self
            .store
            .get_user_by_verification_token(token)
            .await?
            .ok_or(AuthError::InvalidVerificationToken)?;

        if user
            .email_verification_expires_at
            .is_none_or(|expires_at| expires_at <= now)
        {
            return Err(AuthError::InvalidVerificationToken);
        }

        // consumed by a concurrent call between the lookup and here
        if !self.store.mark_email_verified(user.id, token, now).await? {
            return Err(AuthError::InvalidVerificationToken);
        }

        tracing::info!(user_id = %user.id, "Email verified");
        self.get_user(user.id).await
    }

    /// Issue and send a fresh verification token
    ///
    /// Succeeds silently for unknown or already verified addresses.
    pub async fn resend_verification(&self, email: &str) -> AuthResult<()> {
        let Some(user) = self.store.get_user_by_email(email).await? else {
            return Ok(());
        };
        if user.is_email_verified {
            return Ok(());
        }

        let now = self.clock.now();
        let token = random_token();
        self.store
            .set_verification_token(user.id, &token, now + self.verification_ttl, now)
            .await?;

        self.mailer.verification(user.email, token).await;
        Ok(())
    }

    /// Fetch a user by id
    pub async fn get_user(&self, user_id: UserId) -> AuthResult<User> {
        self.store
            .get_user_by_id(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)
    }

    /// Hash a password with the configured cost and pepper
    pub fn hash_password(&self, password: &str) -> AuthResult<String> {
        self.hasher.hash_password(password)
    }

    /// Check a password against a stored hash
    pub fn validate_password(&self, password: &str, hash: &str) -> bool {
        self.hasher.validate_password(password, hash)
    }
}

fn validate_registration(request: &RegisterRequest) -> AuthResult<()> {
    if request.username.trim().is_empty()
        || request.email.trim().is_empty()
        || request.password.trim().is_empty()
    {
        return Err(AuthError::Validation(
            "Username, email and password are required".to_string(),
        ));
    }

    if request.password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AuthError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }

    Ok(())
}

/// 32 random bytes, hex encoded
fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::models::{LoginFailureState, ProfileFields};
    use crate::clock::{Clock, ManualClock};
    use crate::config::{DeliveryMode, PasswordHashingConfig};
    use crate::db::{MemoryCredentialStore, StoreResult};
    use crate::email::RecordingEmailDispatcher;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    struct Fixture {
        verifier: CredentialVerifier,
        store: MemoryCredentialStore,
        mail: RecordingEmailDispatcher,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let store = MemoryCredentialStore::new();
        fixture_over(store.clone(), Arc::new(store))
    }

    /// Fixture whose verifier reaches `store` through `backend`
    fn fixture_over(store: MemoryCredentialStore, backend: Arc<dyn CredentialStore>) -> Fixture {
        let mail = RecordingEmailDispatcher::new();
        let clock = ManualClock::starting_now();
        let verifier = CredentialVerifier::new(
            backend,
            PasswordHasher::new(&PasswordHashingConfig::fast_for_tests(), "pepper-pepper-pepper")
                .unwrap(),
            Mailer::new(Arc::new(mail.clone()), DeliveryMode::Inline),
            Arc::new(clock.clone()),
            LockoutPolicy::default(),
            Duration::hours(24),
        );
        Fixture {
            verifier,
            store,
            mail,
            clock,
        }
    }

    /// Memory store that holds verification-token lookups for a while after reading
    struct StallingStore {
        inner: MemoryCredentialStore,
        stall: std::time::Duration,
    }

    #[async_trait]
    impl CredentialStore for StallingStore {
        async fn get_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
            self.inner.get_user_by_username(username).await
        }

        async fn get_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
            self.inner.get_user_by_email(email).await
        }

        async fn get_user_by_id(&self, user_id: UserId) -> StoreResult<Option<User>> {
            self.inner.get_user_by_id(user_id).await
        }

        async fn get_user_by_verification_token(&self, token: &str) -> StoreResult<Option<User>> {
            let found = self.inner.get_user_by_verification_token(token).await;
            tokio::time::sleep(self.stall).await;
            found
        }

        async fn exists_by_username_or_email(&self, username: &str, email: &str) -> StoreResult<bool> {
            self.inner.exists_by_username_or_email(username, email).await
        }

        async fn insert_user(&self, user: &User) -> StoreResult<()> {
            self.inner.insert_user(user).await
        }

        async fn update_user(&self, user: &User) -> StoreResult<()> {
            self.inner.update_user(user).await
        }

        async fn mark_email_verified(
            &self,
            user_id: UserId,
            token: &str,
            at: DateTime<Utc>,
        ) -> StoreResult<bool> {
            self.inner.mark_email_verified(user_id, token, at).await
        }

        async fn set_verification_token(
            &self,
            user_id: UserId,
            token: &str,
            expires_at: DateTime<Utc>,
            at: DateTime<Utc>,
        ) -> StoreResult<()> {
            self.inner
                .set_verification_token(user_id, token, expires_at, at)
                .await
        }

        async fn enroll_two_factor_secret(
            &self,
            user_id: UserId,
            secret: &str,
            at: DateTime<Utc>,
        ) -> StoreResult<bool> {
            self.inner.enroll_two_factor_secret(user_id, secret, at).await
        }

        async fn record_failed_login(
            &self,
            user_id: UserId,
            max_attempts: i32,
            lockout_until: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> StoreResult<Option<LoginFailureState>> {
            self.inner
                .record_failed_login(user_id, max_attempts, lockout_until, now)
                .await
        }

        async fn record_successful_login(&self, user_id: UserId, at: DateTime<Utc>) -> StoreResult<()> {
            self.inner.record_successful_login(user_id, at).await
        }

        async fn clear_expired_lockout(&self, user_id: UserId, now: DateTime<Utc>) -> StoreResult<()> {
            self.inner.clear_expired_lockout(user_id, now).await
        }
    }

    fn request(username: &str, email: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
            profile: ProfileFields::default(),
        }
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_input() {
        let f = fixture();
        for req in [
            request("", "a@x.com", "Passw0rd!"),
            request("alice", "   ", "Passw0rd!"),
            request("alice", "a@x.com", ""),
            request("alice", "a@x.com", "        "),
            request("alice", "a@x.com", "short"),
        ] {
            assert!(matches!(
                f.verifier.register(req).await,
                Err(AuthError::Validation(_))
            ));
        }
        assert!(f.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let f = fixture();
        f.verifier
            .register(request("alice", "alice@x.com", "Passw0rd!"))
            .await
            .unwrap();

        let same_name = f
            .verifier
            .register(request("alice", "other@x.com", "Passw0rd!"))
            .await;
        let same_email = f
            .verifier
            .register(request("bob", "alice@x.com", "Passw0rd!"))
            .await;

        assert!(matches!(same_name, Err(AuthError::Duplicate)));
        assert!(matches!(same_email, Err(AuthError::Duplicate)));
        assert_eq!(f.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_register_sends_verification_token() {
        let f = fixture();
        let user = f
            .verifier
            .register(request("alice", "alice@x.com", "Passw0rd!"))
            .await
            .unwrap();

        let sent = f.mail.last_verification_token_for("alice@x.com").await;
        assert_eq!(sent, user.email_verification_token);
        assert_eq!(
            user.email_verification_expires_at,
            Some(f.clock.now() + Duration::hours(24))
        );
    }

    #[tokio::test]
    async fn test_unknown_user_and_wrong_password_look_alike() {
        let f = fixture();
        f.verifier
            .register(request("alice", "alice@x.com", "Passw0rd!"))
            .await
            .unwrap();

        let unknown = f.verifier.login("mallory", "Passw0rd!").await.unwrap_err();
        let wrong = f.verifier.login("alice", "wrong-password").await.unwrap_err();

        assert_eq!(unknown.to_string(), wrong.to_string());
        assert!(wrong.user_id().is_some());
        assert!(unknown.user_id().is_none());
    }

    #[tokio::test]
    async fn test_fifth_failure_locks_account() {
        let f = fixture();
        f.verifier
            .register(request("alice", "alice@x.com", "Passw0rd!"))
            .await
            .unwrap();

        for attempt in 1..=5 {
            let err = f.verifier.login("alice", "nope-nope").await.unwrap_err();
            let AuthError::InvalidCredentials { reason, .. } = err else {
                panic!("attempt {attempt}: unexpected {err:?}");
            };
            let expected = if attempt == 5 {
                CredentialFailure::LockedOut
            } else {
                CredentialFailure::WrongPassword
            };
            assert_eq!(reason, expected);
        }

        assert!(matches!(
            f.verifier.login("alice", "Passw0rd!").await,
            Err(AuthError::Locked { .. })
        ));

        f.clock.advance(Duration::minutes(15));
        let user = f.verifier.login("alice", "Passw0rd!").await.unwrap();
        assert_eq!(user.failed_login_attempts, 0);
        assert!(!user.is_locked);
    }

    #[tokio::test]
    async fn test_success_resets_failure_counter() {
        let f = fixture();
        let user = f
            .verifier
            .register(request("alice", "alice@x.com", "Passw0rd!"))
            .await
            .unwrap();

        for _ in 0..4 {
            let _ = f.verifier.login("alice", "nope-nope").await;
        }
        f.verifier.login("alice", "Passw0rd!").await.unwrap();

        let stored = f.verifier.get_user(user.id).await.unwrap();
        assert_eq!(stored.failed_login_attempts, 0);
        assert!(stored.last_login_at.is_some());

        // four more failures must not lock: the counter started over
        for _ in 0..4 {
            let _ = f.verifier.login("alice", "nope-nope").await;
        }
        assert!(f.verifier.login("alice", "Passw0rd!").await.is_ok());
    }

    #[tokio::test]
    async fn test_verify_email_is_single_use() {
        let f = fixture();
        let user = f
            .verifier
            .register(request("alice", "alice@x.com", "Passw0rd!"))
            .await
            .unwrap();
        let token = user.email_verification_token.unwrap();

        let verified = f.verifier.verify_email(&token).await.unwrap();
        assert!(verified.is_email_verified);

        assert!(matches!(
            f.verifier.verify_email(&token).await,
            Err(AuthError::InvalidVerificationToken)
        ));
    }

    #[tokio::test]
    async fn test_verify_email_rejects_expired_token() {
        let f = fixture();
        let user = f
            .verifier
            .register(request("alice", "alice@x.com", "Passw0rd!"))
            .await
            .unwrap();

        f.clock.advance(Duration::hours(24));
        assert!(matches!(
            f.verifier
                .verify_email(user.email_verification_token.as_deref().unwrap())
                .await,
            Err(AuthError::InvalidVerificationToken)
        ));

        f.verifier.resend_verification("alice@x.com").await.unwrap();
        let fresh = f
            .mail
            .last_verification_token_for("alice@x.com")
            .await
            .unwrap();
        assert_ne!(Some(fresh.clone()), user.email_verification_token);
        assert!(f.verifier.verify_email(&fresh).await.is_ok());
    }

    #[tokio::test]
    async fn test_verify_email_keeps_failures_counted_meanwhile() {
        let store = MemoryCredentialStore::new();
        let stalling = StallingStore {
            inner: store.clone(),
            stall: std::time::Duration::from_millis(300),
        };
        let f = fixture_over(store, Arc::new(stalling));
        let user = f
            .verifier
            .register(request("alice", "alice@x.com", "Passw0rd!"))
            .await
            .unwrap();
        let token = user.email_verification_token.clone().unwrap();

        let failures = async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            for _ in 0..5 {
                let _ = f.verifier.login("alice", "nope-nope").await;
            }
        };
        let (verified, ()) = tokio::join!(f.verifier.verify_email(&token), failures);

        let verified = verified.unwrap();
        assert!(verified.is_email_verified);
        let stored = f.store.get_user_by_id(user.id).await.unwrap().unwrap();
        assert!(stored.is_email_verified);
        assert_eq!(stored.failed_login_attempts, 5);
        assert!(stored.is_locked);
        assert!(matches!(
            f.verifier.login("alice", "Passw0rd!").await,
            Err(AuthError::Locked { .. })
        ));
    }

    #[tokio::test]
    async fn test_resend_keeps_lockout() {
        let f = fixture();
        f.verifier
            .register(request("alice", "alice@x.com", "Passw0rd!"))
            .await
            .unwrap();
        for _ in 0..5 {
            let _ = f.verifier.login("alice", "nope-nope").await;
        }

        f.verifier.resend_verification("alice@x.com").await.unwrap();

        assert!(matches!(
            f.verifier.login("alice", "Passw0rd!").await,
            Err(AuthError::Locked { .. })
        ));
    }

    #[tokio::test]
    async fn test_resend_for_unknown_address_is_silent() {
        let f = fixture();
        f.verifier.resend_verification("nobody@x.com").await.unwrap();
        assert!(f.mail.sent().await.is_empty());
    }
}
