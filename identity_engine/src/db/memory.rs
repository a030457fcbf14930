//! In-memory store implementations.
//!
//! Each store guards its map with a single async mutex, so every trait call
//! is atomic relative to the others, matching the single-statement
//! guarantees of [`super::PgStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::errors::{StoreError, StoreResult};
use super::repository::{CredentialStore, RefreshTokenStore, TwoFactorStore};
use crate::auth::{
    LoginFailureState, RefreshToken, TwoFactorMethod, TwoFactorVerification, User, UserId,
};

/// In-memory [`CredentialStore`]
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    users: Arc<Mutex<HashMap<UserId, User>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored users
    pub async fn len(&self) -> usize {
        self.users.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.lock().await.is_empty()
    }

    /// Remove a user, simulating deletion by another system
    pub async fn remove(&self, user_id: UserId) -> Option<User> {
        self.users.lock().await.remove(&user_id)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get_user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let users = self.users.lock().await;
        Ok(users.values().find(|u| u.username == username).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let users = self.users.lock().await;
        Ok(users.values().find(|u| u.email == email).cloned())
    }

    async fn get_user_by_id(&self, user_id: UserId) -> StoreResult<Option<User>> {
        Ok(self.users.lock().await.get(&user_id).cloned())
    }

    async fn get_user_by_verification_token(&self, token: &str) -> StoreResult<Option<User>> {
        let users = self.users.lock().await;
        Ok(users
            .values()
            .find(|u| u.email_verification_token.as_deref() == Some(token))
            .cloned())
    }

    async fn exists_by_username_or_email(&self, username: &str, email: &str) -> StoreResult<bool> {
        let users = self.users.lock().await;
        Ok(users
            .values()
            .any(|u| u.username == username || u.email == email))
    }

    async fn insert_user(&self, user: &User) -> StoreResult<()> {
        let mut users = self.users.lock().await;
        if users.values().any(|u| u.username == user.username) {
            return Err(StoreError::Conflict("users_username_key".to_string()));
        }
        if users.values().any(|u| u.email == user.email) {
            return Err(StoreError::Conflict("users_email_key".to_string()));
        }
        users.insert(user.id, user.clone());
        Ok(())
    }

    async fn update_user(&self, user: &User) -> StoreResult<()> {
        if let Some(existing) = self.users.lock().await.get_mut(&user.id) {
            *existing = user.clone();
        }
        Ok(())
    }

    async fn mark_email_verified(
        &self,
        user_id: UserId,
        token: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut users = self.users.lock().await;
        match users.get_mut(&user_id) {
            Some(user) if user.email_verification_token.as_deref() == Some(token) => {
                user.is_email_verified = true;
                user.email_verification_token = None;
                user.email_verification_expires_at = None;
                user.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_verification_token(
        &self,
        user_id: UserId,
        token: &str,
        expires_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if let Some(user) = self.users.lock().await.get_mut(&user_id) {
            user.email_verification_token = Some(token.to_string());
            user.email_verification_expires_at = Some(expires_at);
            user.updated_at = at;
        }
        Ok(())
    }

    async fn enroll_two_factor_secret(
        &self,
        user_id: UserId,
        secret: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut users = self.users.lock().await;
        let Some(user) = users.get_mut(&user_id) else {
            return Ok(false);
        };
        user.two_factor_secret = Some(secret.to_string());
        user.two_factor_enabled = true;
        user.updated_at = at;
        Ok(true)
    }

    async fn record_failed_login(
        &self,
        user_id: UserId,
        max_attempts: i32,
        lockout_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<LoginFailureState>> {
        let mut users = self.users.lock().await;
        let Some(user) = users.get_mut(&user_id) else {
            return Ok(None);
        };

        user.failed_login_attempts += 1;
        if user.failed_login_attempts >= max_attempts {
            user.is_locked = true;
            user.lockout_until = Some(lockout_until);
        }
        user.updated_at = now;

        Ok(Some(LoginFailureState {
            failed_login_attempts: user.failed_login_attempts,
            is_locked: user.is_locked,
            lockout_until: user.lockout_until,
        }))
    }

    async fn record_successful_login(&self, user_id: UserId, at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(user) = self.users.lock().await.get_mut(&user_id) {
            user.failed_login_attempts = 0;
            user.is_locked = false;
            user.lockout_until = None;
            user.last_login_at = Some(at);
            user.updated_at = at;
        }
        Ok(())
    }

    async fn clear_expired_lockout(&self, user_id: UserId, now: DateTime<Utc>) -> StoreResult<()> {
        if let Some(user) = self.users.lock().await.get_mut(&user_id)
            && user.is_locked
            && user.lockout_until.is_none_or(|until| until <= now)
        {
            user.failed_login_attempts = 0;
            user.is_locked = false;
            user.lockout_until = None;
            user.updated_at = now;
        }
        Ok(())
    }
}

/// In-memory [`RefreshTokenStore`]
#[derive(Clone, Default)]
pub struct MemoryRefreshTokenStore {
    tokens: Arc<Mutex<HashMap<Uuid, RefreshToken>>>,
}

impl MemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a token by id, including revoked ones
    pub async fn get(&self, id: Uuid) -> Option<RefreshToken> {
        self.tokens.lock().await.get(&id).cloned()
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryRefreshTokenStore {
    async fn insert_refresh_token(&self, token: &RefreshToken) -> StoreResult<()> {
        let mut tokens = self.tokens.lock().await;
        if tokens.values().any(|t| t.token == token.token) {
            return Err(StoreError::Conflict("refresh_tokens_token_key".to_string()));
        }
        tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn get_by_token_value(&self, token: &str) -> StoreResult<Option<RefreshToken>> {
        let tokens = self.tokens.lock().await;
        Ok(tokens
            .values()
            .find(|t| t.token == token && t.revoked_at.is_none())
            .cloned())
    }

    async fn list_active_for_user(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<RefreshToken>> {
        let tokens = self.tokens.lock().await;
        let mut active: Vec<RefreshToken> = tokens
            .values()
            .filter(|t| t.user_id == user_id && t.is_usable_at(now))
            .cloned()
            .collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(active)
    }

    async fn mark_revoked(&self, id: Uuid, at: DateTime<Utc>, reason: &str) -> StoreResult<bool> {
        let mut tokens = self.tokens.lock().await;
        match tokens.get_mut(&id) {
            Some(token) if token.revoked_at.is_none() => {
                token.revoked_at = Some(at);
                token.revoke_reason = Some(reason.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_all_for_user(
        &self,
        user_id: UserId,
        at: DateTime<Utc>,
        reason: &str,
    ) -> StoreResult<u64> {
        let mut tokens = self.tokens.lock().await;
        let mut revoked = 0;
        for token in tokens
            .values_mut()
            .filter(|t| t.user_id == user_id && t.revoked_at.is_none())
        {
            token.revoked_at = Some(at);
            token.revoke_reason = Some(reason.to_string());
            revoked += 1;
        }
        Ok(revoked)
    }
}

/// In-memory [`TwoFactorStore`]
#[derive(Clone, Default)]
pub struct MemoryTwoFactorStore {
    challenges: Arc<Mutex<HashMap<Uuid, TwoFactorVerification>>>,
}

impl MemoryTwoFactorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a challenge by id, whatever its state
    pub async fn get(&self, id: Uuid) -> Option<TwoFactorVerification> {
        self.challenges.lock().await.get(&id).cloned()
    }

    /// All challenges of a user, oldest first
    pub async fn for_user(&self, user_id: UserId) -> Vec<TwoFactorVerification> {
        let challenges = self.challenges.lock().await;
        let mut found: Vec<_> = challenges
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.created_at);
        found
    }
}

#[async_trait]
impl TwoFactorStore for MemoryTwoFactorStore {
    async fn insert_challenge(&self, challenge: &TwoFactorVerification) -> StoreResult<()> {
        self.challenges
            .lock()
            .await
            .insert(challenge.id, challenge.clone());
        Ok(())
    }

    async fn get_most_recent_pending(
        &self,
        user_id: UserId,
        method: TwoFactorMethod,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TwoFactorVerification>> {
        let challenges = self.challenges.lock().await;
        Ok(challenges
            .values()
            .filter(|c| c.user_id == user_id && c.method == method && c.is_pending_at(now))
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn mark_verified(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        let mut challenges = self.challenges.lock().await;
        match challenges.get_mut(&id) {
            Some(challenge) if !challenge.is_verified => {
                challenge.is_verified = true;
                challenge.verified_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user(username: &str, email: &str) -> User {
        let now = Utc::now();
        User {
            id: Uuid::new_v4(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: "hash".to_string(),
            first_name: None,
            last_name: None,
            is_email_verified: false,
            email_verification_token: None,
            email_verification_expires_at: None,
            is_locked: false,
            failed_login_attempts: 0,
            lockout_until: None,
            two_factor_enabled: false,
            two_factor_secret: None,
            created_at: now,
            updated_at: now,
            last_login_at: None,
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let store = MemoryCredentialStore::new();
        store.insert_user(&user("alice", "alice@x.com")).await.unwrap();

        let dup_name = store.insert_user(&user("alice", "other@x.com")).await;
        assert!(matches!(dup_name, Err(StoreError::Conflict(_))));

        let dup_email = store.insert_user(&user("bob", "alice@x.com")).await;
        assert!(matches!(dup_email, Err(StoreError::Conflict(_))));

        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_login_increments_atomically() {
        let store = MemoryCredentialStore::new();
        let u = user("alice", "alice@x.com");
        store.insert_user(&u).await.unwrap();
        let now = Utc::now();
        let until = now + Duration::minutes(15);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.record_failed_login(u.id, 5, until, now).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = store.get_user_by_id(u.id).await.unwrap().unwrap();
        assert_eq!(stored.failed_login_attempts, 10);
        assert!(stored.is_locked);
        assert_eq!(stored.lockout_until, Some(until));
    }

    #[tokio::test]
    async fn test_failed_login_unknown_user() {
        let store = MemoryCredentialStore::new();
        let now = Utc::now();
        let state = store
            .record_failed_login(Uuid::new_v4(), 5, now, now)
            .await
            .unwrap();
        assert!(state.is_none());
    }

    #[tokio::test]
    async fn test_clear_expired_lockout_respects_window() {
        let store = MemoryCredentialStore::new();
        let mut u = user("alice", "alice@x.com");
        let now = Utc::now();
        u.is_locked = true;
        u.failed_login_attempts = 5;
        u.lockout_until = Some(now + Duration::minutes(5));
        store.insert_user(&u).await.unwrap();

        store.clear_expired_lockout(u.id, now).await.unwrap();
        assert!(store.get_user_by_id(u.id).await.unwrap().unwrap().is_locked);

        store
            .clear_expired_lockout(u.id, now + Duration::minutes(5))
            .await
            .unwrap();
        let stored = store.get_user_by_id(u.id).await.unwrap().unwrap();
        assert!(!stored.is_locked);
        assert_eq!(stored.failed_login_attempts, 0);
    }

    #[tokio::test]
    async fn test_targeted_writes_leave_lockout_alone() {
        let store = MemoryCredentialStore::new();
        let mut u = user("alice", "alice@x.com");
        u.email_verification_token = Some("tok".to_string());
        store.insert_user(&u).await.unwrap();
        let now = Utc::now();
        let until = now + Duration::minutes(15);
        for _ in 0..5 {
            store.record_failed_login(u.id, 5, until, now).await.unwrap();
        }

        assert!(!store.mark_email_verified(u.id, "other", now).await.unwrap());
        assert!(store.mark_email_verified(u.id, "tok", now).await.unwrap());
        assert!(!store.mark_email_verified(u.id, "tok", now).await.unwrap());
        store
            .set_verification_token(u.id, "fresh", until, now)
            .await
            .unwrap();
        assert!(store.enroll_two_factor_secret(u.id, "SECRET", now).await.unwrap());
        assert!(
            !store
                .enroll_two_factor_secret(Uuid::new_v4(), "SECRET", now)
                .await
                .unwrap()
        );

        let stored = store.get_user_by_id(u.id).await.unwrap().unwrap();
        assert!(stored.is_email_verified);
        assert_eq!(stored.email_verification_token.as_deref(), Some("fresh"));
        assert!(stored.two_factor_enabled);
        assert_eq!(stored.failed_login_attempts, 5);
        assert!(stored.is_locked);
        assert_eq!(stored.lockout_until, Some(until));
    }

    #[tokio::test]
    async fn test_most_recent_pending_wins() {
        let store = MemoryTwoFactorStore::new();
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        let make = |code: &str, created_at| TwoFactorVerification {
            id: Uuid::new_v4(),
            user_id,
            method: TwoFactorMethod::Email,
            code: code.to_string(),
            expires_at: now + Duration::minutes(10),
            is_verified: false,
            verified_at: None,
            created_at,
        };

        let older = make("111111", now - Duration::minutes(2));
        let newer = make("222222", now - Duration::minutes(1));
        store.insert_challenge(&older).await.unwrap();
        store.insert_challenge(&newer).await.unwrap();

        let pending = store
            .get_most_recent_pending(user_id, TwoFactorMethod::Email, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.code, "222222");

        assert!(
            store
                .get_most_recent_pending(user_id, TwoFactorMethod::Totp, now)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_mark_verified_is_compare_and_set() {
        let store = MemoryTwoFactorStore::new();
        let now = Utc::now();
        let challenge = TwoFactorVerification {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            method: TwoFactorMethod::Totp,
            code: "123456".to_string(),
            expires_at: now + Duration::minutes(10),
            is_verified: false,
            verified_at: None,
            created_at: now,
        };
        store.insert_challenge(&challenge).await.unwrap();

        assert!(store.mark_verified(challenge.id, now).await.unwrap());
        assert!(!store.mark_verified(challenge.id, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_revoked_tokens_are_invisible_by_value() {
        let store = MemoryRefreshTokenStore::new();
        let now = Utc::now();
        let token = RefreshToken {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            token: "opaque".to_string(),
            rotated_from: None,
            expires_at: now + Duration::days(30),
            created_at: now,
            revoked_at: None,
            revoke_reason: None,
            ip_address: "127.0.0.1".to_string(),
            user_agent: "test".to_string(),
        };
        store.insert_refresh_token(&token).await.unwrap();

        assert!(store.mark_revoked(token.id, now, "test").await.unwrap());
        assert!(!store.mark_revoked(token.id, now, "again").await.unwrap());
        assert!(store.get_by_token_value("opaque").await.unwrap().is_none());
        assert_eq!(
            store.get(token.id).await.unwrap().revoke_reason.as_deref(),
            Some("test")
        );
    }
}
