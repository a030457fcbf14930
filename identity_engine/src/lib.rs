//! # Identity Engine
//!
//! Credential and session lifecycle engine: issues, validates and revokes
//! proof-of-identity artifacts for end users and the clients acting on their
//! behalf.
//!
//! ## Architecture
//!
//! A login flows through the components in order:
//!
//! - **Credential verifier**: username/password check with brute-force lockout
//! - **Two-factor manager**: short-lived numeric challenges (email or TOTP)
//! - **Token issuer**: stateless HS256 access tokens carrying client and scopes
//! - **Refresh token manager**: opaque long-lived tokens, rotation and revocation
//!
//! Storage, email delivery and audit persistence are external collaborators
//! reached through the traits in [`db`], [`email`] and [`audit`].
//!
//! ## Core Modules
//!
//! - [`auth`]: Lifecycle components, models and errors
//! - [`service`]: [`IdentityService`] facade with audit reporting
//! - [`db`]: Store contracts with PostgreSQL and in-memory implementations
//! - [`config`]: Environment-driven configuration
//!
//! ## Example
//!
//! ```no_run
//! use identity_engine::audit::TracingAuditSink;
//! use identity_engine::clock::SystemClock;
//! use identity_engine::db::{Database, DatabaseConfig};
//! use identity_engine::email::LogOnlyDispatcher;
//! use identity_engine::{EngineConfig, IdentityService, Stores};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     identity_engine::logging::init();
//!
//!     let config = EngineConfig::from_env()?;
//!     let db = Database::new(&DatabaseConfig::from_env()?).await?;
//!
//!     let service = IdentityService::from_config(
//!         &config,
//!         Stores::postgres(db.store()),
//!         Arc::new(LogOnlyDispatcher),
//!         Arc::new(TracingAuditSink),
//!         Arc::new(SystemClock),
//!     )?;
//!     # let _ = service;
//!     Ok(())
//! }
//! ```

/// Audit outcomes and sinks.
pub mod audit;

/// Lifecycle components, models and errors.
pub mod auth;

/// Injected time source.
pub mod clock;

/// Engine configuration.
pub mod config;

/// Store contracts and implementations.
pub mod db;

/// Outbound email collaborator.
pub mod email;

/// Structured logging setup.
pub mod logging;

/// Session facade.
pub mod service;

pub use audit::{AuditAction, AuditEntry, AuditOutcome, AuditSink, RequestContext};
pub use auth::{AuthError, AuthResult};
pub use config::{ConfigError, EngineConfig};
pub use service::{IdentityService, LoginOutcome, Stores};
