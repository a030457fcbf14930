//! Opaque refresh tokens: issue, rotate near expiry, soft-revoke.

use rand::RngCore;
use std::sync::Arc;
use uuid::Uuid;

use super::errors::{AuthError, AuthResult};
use super::models::{ClientId, RefreshToken, RotationResult, User, UserId};
use super::tokens::TokenIssuer;
use crate::clock::SharedClock;
use crate::config::{RefreshPolicy, RotationMode};
use crate::db::{CredentialStore, RefreshTokenStore};

/// Random bytes behind each refresh token value
const TOKEN_BYTES: usize = 64;

/// Revocation reason stamped on a token replaced by rotation
pub const ROTATED_REASON: &str = "Rotated";

/// Issues, rotates and revokes refresh tokens
#[derive(Clone)]
pub struct RefreshTokenManager {
    store: Arc<dyn RefreshTokenStore>,
    users: Arc<dyn CredentialStore>,
    tokens: TokenIssuer,
    clock: SharedClock,
    policy: RefreshPolicy,
}

impl RefreshTokenManager {
    pub fn new(
        store: Arc<dyn RefreshTokenStore>,
        users: Arc<dyn CredentialStore>,
        tokens: TokenIssuer,
        clock: SharedClock,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            store,
            users,
            tokens,
            clock,
            policy,
        }
    }

    /// Mint and persist a refresh token for `user`
    pub async fn issue(
        &self,
        user: &User,
        client_id: ClientId,
        ip_address: &str,
        user_agent: &str,
    ) -> AuthResult<RefreshToken> {
        self.mint(user.id, client_id, ip_address, user_agent, None)
            .await
    }

    async fn mint(
        &self,
        user_id: UserId,
        client_id: ClientId,
        ip_address: &str,
        user_agent: &str,
        rotated_from: Option<Uuid>,
    ) -> AuthResult<RefreshToken> {
        let now = self.clock.now();
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::rng().fill_bytes(&mut bytes);

        let token = RefreshToken {
            id: Uuid::new_v4(),
            user_id,
            client_id,
            token: hex::encode(bytes),
            rotated_from,
            expires_at: now + self.policy.ttl,
            created_at: now,
            revoked_at: None,
            revoke_reason: None,
            ip_address: ip_address.to_string(),
            user_agent: user_agent.to_string(),
        };

        self.store.insert_refresh_token(&token).await?;
        tracing::debug!(token_id = %token.id, user_id = %user_id, "Refresh token issued");
        Ok(token)
    }

    /// Usable iff not revoked and not yet expired
    pub fn is_usable(&self, token: &RefreshToken) -> bool {
        token.is_usable_at(self.clock.now())
    }

    /// Look up a presented token value and require it to be usable
    ///
    /// # Errors
    ///
    /// * `AuthError::InvalidOrExpiredToken` - Unknown, revoked or expired
    pub async fn resolve(&self, token: &str) -> AuthResult<RefreshToken> {
        self.store
            .get_by_token_value(token)
            .await?
            .filter(|t| self.is_usable(t))
            .ok_or(AuthError::InvalidOrExpiredToken)
    }

    /// Exchange a refresh token for a new access token
    ///
    /// A replacement refresh token is minted only when the presented one has
    /// less than the rotation threshold left. Whether the presented token is
    /// then revoked depends on the configured [`RotationMode`].
    ///
    /// # Errors
    ///
    /// * `AuthError::InvalidOrExpiredToken` - Presented token not usable
    /// * `AuthError::UserNotFound` - Owning user no longer exists
    pub async fn rotate(&self, token: &str, ip_address: &str) -> AuthResult<RotationResult> {
        let current = self.resolve(token).await?;
        let user = self
            .users
            .get_user_by_id(current.user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;

        let access_token =
            self.tokens
                .issue_access_token(&user, Vec::<String>::new(), current.client_id)?;

        let now = self.clock.now();
        let refresh_token = if current.expires_at - now < self.policy.rotation_threshold {
            let next = self
                .mint(user.id, current.client_id, ip_address, "", Some(current.id))
                .await?;

            if self.policy.rotation_mode == RotationMode::RevokeOriginal {
                self.store
                    .mark_revoked(current.id, now, ROTATED_REASON)
                    .await?;
            }

            tracing::info!(
                user_id = %user.id,
                from = %current.id,
                to = %next.id,
                "Refresh token rotated"
            );
            Some(next)
        } else {
            None
        };

        Ok(RotationResult {
            access_token,
            refresh_token,
        })
    }

    /// Soft-revoke a token by value, expired or not
    ///
    /// Returns the token this call revoked; unknown or already revoked
    /// tokens are a no-op and yield `None`.
    pub async fn revoke(&self, token: &str, reason: &str) -> AuthResult<Option<RefreshToken>> {
        let Some(mut found) = self.store.get_by_token_value(token).await? else {
            return Ok(None);
        };

        let now = self.clock.now();
        if !self.store.mark_revoked(found.id, now, reason).await? {
            return Ok(None);
        }

        tracing::info!(token_id = %found.id, user_id = %found.user_id, reason, "Refresh token revoked");
        found.revoked_at = Some(now);
        found.revoke_reason = Some(reason.to_string());
        Ok(Some(found))
    }

    /// Revoke every live token of a user
    pub async fn revoke_all_for_user(&self, user_id: UserId, reason: &str) -> AuthResult<u64> {
        let count = self
            .store
            .revoke_all_for_user(user_id, self.clock.now(), reason)
            .await?;
        tracing::info!(user_id = %user_id, count, reason, "Refresh tokens revoked");
        Ok(count)
    }

    /// Usable tokens of a user, newest first
    pub async fn list_active(&self, user_id: UserId) -> AuthResult<Vec<RefreshToken>> {
        Ok(self
            .store
            .list_active_for_user(user_id, self.clock.now())
            .await?)
    }
}
