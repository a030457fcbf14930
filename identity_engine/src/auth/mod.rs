//! Credential and session lifecycle primitives.
//!
//! This module implements:
//! - Argon2id password hashing with server-side pepper
//! - Password login with brute-force lockout (5 failures, 15 minutes)
//! - HS256 access tokens (1-hour expiry)
//! - Opaque refresh tokens (30-day expiry, rotated inside the last 7 days)
//! - Two-factor challenges (email or TOTP, 10-minute codes)
//!
//! Each component can be used on its own; [`crate::IdentityService`] wires
//! them together and reports outcomes to the audit hook.
//!
//! ## Example
//!
//! ```no_run
//! use identity_engine::auth::{SigningKey, TokenIssuer};
//! use identity_engine::clock::SystemClock;
//! use identity_engine::config::EngineConfig;
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! # fn run(user: &identity_engine::auth::User) -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_env()?;
//! let key = SigningKey::from_secret(config.tokens.jwt_secret.as_bytes());
//! let issuer = TokenIssuer::new(&config.tokens, key, Arc::new(SystemClock));
//!
//! let token = issuer.issue_access_token(user, ["profile:read"], Uuid::new_v4())?;
//! let validated = issuer.validate_access_token(&token)?;
//! assert_eq!(validated.user_id, user.id);
//! # Ok(())
//! # }
//! ```

pub mod credentials;
pub mod errors;
pub mod models;
pub mod password;
pub mod refresh;
pub mod tokens;
pub mod two_factor;

pub use credentials::CredentialVerifier;
pub use errors::{AuthError, AuthResult, CredentialFailure};
pub use models::{
    AccessTokenClaims, ChallengeClaims, ChallengeHandle, ClientId, LoginFailureState, LoginRequest,
    ProfileFields, RefreshToken, RegisterRequest, RotationResult, ScopeSet, SessionTokens,
    TwoFactorMethod, TwoFactorSetup, TwoFactorVerification, User, UserId, ValidatedAccessToken,
};
pub use password::PasswordHasher;
pub use refresh::RefreshTokenManager;
pub use tokens::{SigningKey, TokenIssuer};
pub use two_factor::TwoFactorManager;
