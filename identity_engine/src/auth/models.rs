//! Authentication data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// User ID type
pub type UserId = Uuid;

/// OAuth-style client ID type
pub type ClientId = Uuid;

/// Granted scopes, ordered and deduplicated
pub type ScopeSet = BTreeSet<String>;

/// User model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_email_verified: bool,
    #[serde(skip_serializing)]
    pub email_verification_token: Option<String>,
    pub email_verification_expires_at: Option<DateTime<Utc>>,
    pub is_locked: bool,
    pub failed_login_attempts: i32,
    pub lockout_until: Option<DateTime<Utc>>,
    pub two_factor_enabled: bool,
    #[serde(skip_serializing)]
    pub two_factor_secret: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl User {
    /// Whether a lockout is in force at `now`
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.is_locked && self.lockout_until.is_some_and(|until| until > now)
    }
}

/// Optional profile data supplied at registration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileFields {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// User registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub profile: ProfileFields,
}

/// Password login request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    /// Client the session is issued to
    pub client_id: ClientId,
    /// Scopes to embed in the access token
    #[serde(default)]
    pub scopes: ScopeSet,
}

/// Lockout bookkeeping returned by an atomic failure increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginFailureState {
    pub failed_login_attempts: i32,
    pub is_locked: bool,
    pub lockout_until: Option<DateTime<Utc>>,
}

/// Refresh token model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: UserId,
    pub client_id: ClientId,
    pub token: String,
    /// Token this one was minted from during rotation
    pub rotated_from: Option<Uuid>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoke_reason: Option<String>,
    pub ip_address: String,
    pub user_agent: String,
}

impl RefreshToken {
    /// Usable iff not revoked and not yet expired
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}

/// Second-factor delivery method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TwoFactorMethod {
    Totp,
    Email,
}

impl TwoFactorMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TwoFactorMethod::Totp => "totp",
            TwoFactorMethod::Email => "email",
        }
    }
}

impl fmt::Display for TwoFactorMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TwoFactorMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "totp" => Ok(TwoFactorMethod::Totp),
            "email" => Ok(TwoFactorMethod::Email),
            other => Err(format!("unknown two-factor method: {other}")),
        }
    }
}

/// Pending or resolved second-factor challenge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoFactorVerification {
    pub id: Uuid,
    pub user_id: UserId,
    pub method: TwoFactorMethod,
    #[serde(skip_serializing)]
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub is_verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TwoFactorVerification {
    /// Unverified and unexpired
    pub fn is_pending_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_verified && self.expires_at > now
    }
}

/// Opaque handle correlating a two-factor verify call with its challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChallengeHandle(pub String);

impl ChallengeHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Persistent TOTP enrollment result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoFactorSetup {
    /// Base32-encoded shared secret
    pub secret: String,
    /// `otpauth://totp/...` URI for authenticator apps
    pub provisioning_uri: String,
}

/// JWT claims for access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub sub: String,
    pub username: String,
    pub email: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub scope: ScopeSet,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// JWT claims for a two-factor challenge handle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeClaims {
    pub sub: String,
    pub method: TwoFactorMethod,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// Identity recovered from a valid access token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedAccessToken {
    pub user_id: UserId,
    pub scopes: ScopeSet,
    pub client_id: ClientId,
}

/// Session tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

/// Result of exchanging a refresh token
#[derive(Debug, Clone)]
pub struct RotationResult {
    pub access_token: String,
    /// Present only when the presented token was close to expiry
    pub refresh_token: Option<RefreshToken>,
}
