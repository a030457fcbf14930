//! Time-boxed second-factor challenges and TOTP enrollment.

use rand::{Rng, RngCore};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use super::errors::{AuthError, AuthResult};
use super::models::{ChallengeHandle, TwoFactorMethod, TwoFactorSetup, TwoFactorVerification, User};
use super::tokens::TokenIssuer;
use crate::clock::SharedClock;
use crate::config::TwoFactorConfig;
use crate::db::{CredentialStore, TwoFactorStore};
use crate::email::Mailer;

const TOTP_DIGITS: usize = 6;
const TOTP_STEP_SECS: u64 = 30;
const TOTP_SKEW_STEPS: u8 = 1;
const SECRET_BYTES: usize = 20;

/// Issues and checks short-lived numeric codes bound to a user and method
#[derive(Clone)]
pub struct TwoFactorManager {
    challenges: Arc<dyn TwoFactorStore>,
    users: Arc<dyn CredentialStore>,
    tokens: TokenIssuer,
    mailer: Mailer,
    clock: SharedClock,
    config: TwoFactorConfig,
}

impl TwoFactorManager {
    pub fn new(
        challenges: Arc<dyn TwoFactorStore>,
        users: Arc<dyn CredentialStore>,
        tokens: TokenIssuer,
        mailer: Mailer,
        clock: SharedClock,
        config: TwoFactorConfig,
    ) -> Self {
        Self {
            challenges,
            users,
            tokens,
            mailer,
            clock,
            config,
        }
    }

    /// Start a challenge for `user`
    ///
    /// Persists a fresh 6-digit code; email challenges also dispatch it.
    /// Earlier pending challenges are left alone and simply lose to the
    /// newest one.
    pub async fn initiate(&self, user: &User, method: TwoFactorMethod) -> AuthResult<ChallengeHandle> {
        let now = self.clock.now();
        let code = rand::rng().random_range(100_000..=999_999).to_string();

        let challenge = TwoFactorVerification {
            id: Uuid::new_v4(),
            user_id: user.id,
            method,
            code: code.clone(),
            expires_at: now + self.config.code_ttl,
            is_verified: false,
            verified_at: None,
            created_at: now,
        };
        self.challenges.insert_challenge(&challenge).await?;

        if method == TwoFactorMethod::Email {
            self.mailer.two_factor_code(user.email.clone(), code).await;
        }

        tracing::info!(user_id = %user.id, method = %method, "Two-factor challenge issued");

        self.tokens
            .issue_challenge_handle(user.id, method, challenge.expires_at)
    }

    /// Check `code` against the newest pending challenge for (user, method)
    ///
    /// A `totp` challenge also accepts the current code of the user's
    /// enrolled authenticator.
    ///
    /// # Errors
    ///
    /// * `AuthError::NoPendingChallenge` - Nothing pending, or it was consumed concurrently
    /// * `AuthError::InvalidCode` - Code did not match
    pub async fn verify(&self, user: &User, code: &str, method: TwoFactorMethod) -> AuthResult<()> {
        let now = self.clock.now();
        let pending = self
            .challenges
            .get_most_recent_pending(user.id, method, now)
            .await?
            .ok_or(AuthError::NoPendingChallenge)?;

        let code = code.trim();
        let matches = codes_match(&pending.code, code)
            || (method == TwoFactorMethod::Totp
                && user
                    .two_factor_secret
                    .as_deref()
                    .is_some_and(|secret| totp_matches(secret, code, now.timestamp())));

        if !matches {
            tracing::debug!(user_id = %user.id, method = %method, "Two-factor code mismatch");
            return Err(AuthError::InvalidCode);
        }

        if !self.challenges.mark_verified(pending.id, now).await? {
            return Err(AuthError::NoPendingChallenge);
        }

        tracing::info!(user_id = %user.id, method = %method, "Two-factor challenge verified");
        Ok(())
    }

    /// Resolve a handle from [`initiate`](Self::initiate) and verify `code`
    ///
    /// Returns the user the challenge belonged to.
    pub async fn verify_with_handle(&self, handle: &ChallengeHandle, code: &str) -> AuthResult<User> {
        let (user_id, method) = self.tokens.resolve_challenge_handle(handle)?;
        let user = self
            .users
            .get_user_by_id(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;

        self.verify(&user, code, method).await?;
        Ok(user)
    }

    /// Enroll a persistent TOTP secret and enable two-factor login
    ///
    /// Writes only the two-factor columns of the user record.
    pub async fn setup_persistent_secret(&self, user: &User) -> AuthResult<TwoFactorSetup> {
        let mut bytes = [0u8; SECRET_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        let secret = Secret::Raw(bytes.to_vec()).to_encoded().to_string();

        if !self
            .users
            .enroll_two_factor_secret(user.id, &secret, self.clock.now())
            .await?
        {
            return Err(AuthError::UserNotFound);
        }

        tracing::info!(user_id = %user.id, "TOTP secret enrolled");

        Ok(TwoFactorSetup {
            provisioning_uri: provisioning_uri(&self.config.totp_issuer, &user.email, &secret),
            secret,
        })
    }
}

fn codes_match(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

fn totp_matches(secret: &str, code: &str, unix_secs: i64) -> bool {
    let Ok(bytes) = Secret::Encoded(secret.to_string()).to_bytes() else {
        return false;
    };
    let Ok(totp) = TOTP::new(Algorithm::SHA1, TOTP_DIGITS, TOTP_SKEW_STEPS, TOTP_STEP_SECS, bytes)
    else {
        return false;
    };
    let Ok(time) = u64::try_from(unix_secs) else {
        return false;
    };
    totp.check(code, time)
}

/// `otpauth://totp/{issuer}:{account}?...` enrollment URI
fn provisioning_uri(issuer: &str, account: &str, secret: &str) -> String {
    format!(
        "otpauth://totp/{}:{}?secret={}&issuer={}&algorithm=SHA1&digits={}&period={}",
        urlencoding::encode(issuer),
        urlencoding::encode(account),
        secret,
        urlencoding::encode(issuer),
        TOTP_DIGITS,
        TOTP_STEP_SECS
    )
}
