//! HS256 access tokens and two-factor challenge handles.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::errors::{AuthError, AuthResult};
use super::models::{
    AccessTokenClaims, ChallengeClaims, ChallengeHandle, ClientId, TwoFactorMethod, User, UserId,
    ValidatedAccessToken,
};
use crate::clock::SharedClock;
use crate::config::TokenConfig;

/// Process-wide symmetric signing key
///
/// Built once at startup and shared read-only by every issuer clone.
#[derive(Clone)]
pub struct SigningKey {
    encoding: Arc<EncodingKey>,
    decoding: Arc<DecodingKey>,
}

impl SigningKey {
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding: Arc::new(EncodingKey::from_secret(secret)),
            decoding: Arc::new(DecodingKey::from_secret(secret)),
        }
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

/// Mints and validates signed, stateless tokens
#[derive(Clone)]
pub struct TokenIssuer {
    key: SigningKey,
    issuer: String,
    audience: String,
    challenge_audience: String,
    access_ttl: Duration,
    clock: SharedClock,
}

impl TokenIssuer {
    pub fn new(config: &TokenConfig, key: SigningKey, clock: SharedClock) -> Self {
        Self {
            key,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            challenge_audience: format!("{}/two-factor", config.audience),
            access_ttl: config.access_token_ttl,
            clock,
        }
    }

    /// Access token lifetime
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    /// Mint an access token for `user` acting through `client_id`
    ///
    /// # Errors
    ///
    /// * `AuthError::Signing` - Claims could not be signed
    pub fn issue_access_token<I, S>(
        &self,
        user: &User,
        scopes: I,
        client_id: ClientId,
    ) -> AuthResult<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = self.clock.now();
        let claims = AccessTokenClaims {
            sub: user.id.to_string(),
            username: user.username.clone(),
            email: user.email.clone(),
            client_id: client_id.to_string(),
            scope: scopes.into_iter().map(Into::into).collect(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
        };

        Ok(encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.key.encoding,
        )?)
    }

    /// Verify signature, issuer, audience and expiry of an access token
    ///
    /// Every failure collapses into `AuthError::InvalidToken`; the reason is
    /// only logged.
    pub fn validate_access_token(&self, token: &str) -> AuthResult<ValidatedAccessToken> {
        let claims: AccessTokenClaims = self.decode_claims(token, &self.audience)?;

        if !self.unexpired(claims.exp) {
            tracing::debug!("Access token rejected: expired");
            return Err(AuthError::InvalidToken);
        }

        let user_id = parse_uuid(&claims.sub, "sub")?;
        let client_id = parse_uuid(&claims.client_id, "client_id")?;

        Ok(ValidatedAccessToken {
            user_id,
            scopes: claims.scope,
            client_id,
        })
    }

    /// Handle correlating a later verify call with a pending challenge
    pub fn issue_challenge_handle(
        &self,
        user_id: UserId,
        method: TwoFactorMethod,
        expires_at: DateTime<Utc>,
    ) -> AuthResult<ChallengeHandle> {
        let claims = ChallengeClaims {
            sub: user_id.to_string(),
            method,
            iss: self.issuer.clone(),
            aud: self.challenge_audience.clone(),
            iat: self.clock.now().timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.key.encoding)?;
        Ok(ChallengeHandle(token))
    }

    /// Recover the user and method a handle was issued for
    ///
    /// # Errors
    ///
    /// * `AuthError::InvalidToken` - Tampered, foreign or malformed handle
    /// * `AuthError::NoPendingChallenge` - Handle outlived its challenge
    pub fn resolve_challenge_handle(
        &self,
        handle: &ChallengeHandle,
    ) -> AuthResult<(UserId, TwoFactorMethod)> {
        let claims: ChallengeClaims = self.decode_claims(handle.as_str(), &self.challenge_audience)?;

        if !self.unexpired(claims.exp) {
            return Err(AuthError::NoPendingChallenge);
        }

        Ok((parse_uuid(&claims.sub, "sub")?, claims.method))
    }

    fn decode_claims<T: DeserializeOwned>(&self, token: &str, audience: &str) -> AuthResult<T> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        // expiry is checked against the injected clock
        validation.validate_exp = false;
        validation.leeway = 0;

        decode::<T>(token, &self.key.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(reason = %e, "Token rejected");
                AuthError::InvalidToken
            })
    }

    fn unexpired(&self, exp: i64) -> bool {
        self.clock.now().timestamp() < exp
    }
}

fn parse_uuid(value: &str, claim: &'static str) -> AuthResult<Uuid> {
    Uuid::parse_str(value).map_err(|_| {
        tracing::debug!(claim, "Token rejected: malformed id claim");
        AuthError::InvalidToken
    })
}
