//! Authentication error types.

use crate::db::StoreError;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::models::UserId;

/// Why a credential check was rejected
///
/// Carried inside [`AuthError::InvalidCredentials`] for auditing. It is never
/// part of the rendered message, so callers cannot tell an unknown username
/// from a wrong password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialFailure {
    /// No account with that username
    UnknownUser,
    /// Password did not match
    WrongPassword,
    /// Password did not match and this failure locked the account
    LockedOut,
}

impl CredentialFailure {
    /// Stable label used in audit descriptions
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialFailure::UnknownUser => "unknown_user",
            CredentialFailure::WrongPassword => "wrong_password",
            CredentialFailure::LockedOut => "locked_out",
        }
    }
}

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    /// Malformed input the caller can correct
    #[error("{0}")]
    Validation(String),

    /// Username or email already registered
    #[error("Username or email already exists")]
    Duplicate,

    /// Unknown user or wrong password
    #[error("Invalid username or password")]
    InvalidCredentials {
        user_id: Option<UserId>,
        reason: CredentialFailure,
    },

    /// Account temporarily locked after repeated failures
    #[error("Account is locked. Please try again in {} minute(s).", retry_after_minutes(.until, .now))]
    Locked {
        user_id: UserId,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    /// Refresh token unknown, revoked or expired
    #[error("Invalid or expired refresh token")]
    InvalidOrExpiredToken,

    /// Access token failed validation
    #[error("Invalid token")]
    InvalidToken,

    /// No unverified, unexpired challenge for this user and method
    #[error("No pending verification found")]
    NoPendingChallenge,

    /// Challenge code did not match
    #[error("Invalid code")]
    InvalidCode,

    /// Email verification token unknown or expired
    #[error("Invalid or expired verification token")]
    InvalidVerificationToken,

    /// A referenced user no longer exists
    #[error("User not found")]
    UserNotFound,

    /// Password hashing failed
    #[error("Password hashing failed")]
    HashingFailed,

    /// Token signing failed
    #[error("Token signing failed: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    /// Credential or token store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

fn retry_after_minutes(until: &DateTime<Utc>, now: &DateTime<Utc>) -> i64 {
    let secs = (*until - *now).num_seconds().max(0);
    // round up so "0 minutes" is never shown while still locked
    ((secs + 59) / 60).max(1)
}

impl AuthError {
    /// Get a client-safe error message that doesn't leak sensitive information
    ///
    /// Store, hashing and signing errors are sanitized to prevent information
    /// disclosure about the internal system structure.
    pub fn client_message(&self) -> String {
        match self {
            AuthError::Store(_) | AuthError::HashingFailed | AuthError::Signing(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// User the failure is attributable to, when known
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            AuthError::InvalidCredentials { user_id, .. } => *user_id,
            AuthError::Locked { user_id, .. } => Some(*user_id),
            _ => None,
        }
    }
}

/// Result type for authentication operations
pub type AuthResult<T> = Result<T, AuthError>;
