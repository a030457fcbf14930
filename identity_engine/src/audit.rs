//! Audit hook: structured outcomes of security-relevant operations.
//!
//! The engine never persists audit records. [`crate::IdentityService`] turns
//! each operation's result into an [`AuditEntry`] and hands it to an
//! [`AuditSink`] owned by the embedding application.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::auth::{AuthError, ClientId, UserId};

/// Audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    UserRegistered,
    UserRegisterFailed,
    EmailVerified,
    EmailVerificationFailed,
    LoginSuccess,
    LoginFailed,
    TwoFactorRequired,
    TwoFactorVerified,
    TwoFactorFailed,
    TotpEnrolled,
    TokenRefreshed,
    TokenRefreshFailed,
    TokenRevoked,
}

impl AuditAction {
    /// Wire name stored by audit backends
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::UserRegistered => "USER_REGISTERED",
            AuditAction::UserRegisterFailed => "USER_REGISTER_FAILED",
            AuditAction::EmailVerified => "EMAIL_VERIFIED",
            AuditAction::EmailVerificationFailed => "EMAIL_VERIFICATION_FAILED",
            AuditAction::LoginSuccess => "LOGIN_SUCCESS",
            AuditAction::LoginFailed => "LOGIN_FAILED",
            AuditAction::TwoFactorRequired => "2FA_REQUIRED",
            AuditAction::TwoFactorVerified => "2FA_VERIFIED",
            AuditAction::TwoFactorFailed => "2FA_FAILED",
            AuditAction::TotpEnrolled => "TOTP_ENROLLED",
            AuditAction::TokenRefreshed => "TOKEN_REFRESHED",
            AuditAction::TokenRefreshFailed => "TOKEN_REFRESH_FAILED",
            AuditAction::TokenRevoked => "TOKEN_REVOKED",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of entity an action applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditResource {
    User,
    Token,
}

impl AuditResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResource::User => "User",
            AuditResource::Token => "Token",
        }
    }
}

/// Structured outcome of one engine operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditOutcome {
    pub user_id: Option<UserId>,
    pub client_id: Option<ClientId>,
    pub action: AuditAction,
    pub resource: AuditResource,
    pub success: bool,
    pub description: Option<String>,
    pub error_message: Option<String>,
}

impl AuditOutcome {
    /// Successful outcome
    pub fn success(action: AuditAction, resource: AuditResource) -> Self {
        Self {
            user_id: None,
            client_id: None,
            action,
            resource,
            success: true,
            description: None,
            error_message: None,
        }
    }

    /// Failed outcome carrying the error's client-safe message
    ///
    /// The user id is taken from the error when it carries one.
    pub fn failure(action: AuditAction, resource: AuditResource, error: &AuthError) -> Self {
        let description = match error {
            AuthError::InvalidCredentials { reason, .. } => Some(reason.as_str().to_string()),
            AuthError::Locked { .. } => Some("locked".to_string()),
            _ => None,
        };

        Self {
            user_id: error.user_id(),
            client_id: None,
            action,
            resource,
            success: false,
            description,
            error_message: Some(error.client_message()),
        }
    }

    pub fn user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn client(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Caller-side context attached to each audit record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn new(ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip_address: Some(ip_address.into()),
            user_agent: Some(user_agent.into()),
        }
    }

    /// IP address or `"unknown"`
    pub fn ip(&self) -> &str {
        self.ip_address.as_deref().unwrap_or("unknown")
    }

    /// User agent or `"unknown"`
    pub fn agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or("unknown")
    }
}

/// Record handed to an [`AuditSink`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(flatten)]
    pub outcome: AuditOutcome,
    pub ip_address: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(outcome: AuditOutcome, context: &RequestContext, created_at: DateTime<Utc>) -> Self {
        Self {
            outcome,
            ip_address: context.ip().to_string(),
            user_agent: context.agent().to_string(),
            created_at,
        }
    }
}

/// Write-only audit destination
///
/// Implementations own their failure handling; recording never fails the
/// audited operation.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry);
}

/// Sink that emits each entry as a structured `tracing` event
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, entry: AuditEntry) {
        let outcome = &entry.outcome;
        if outcome.success {
            tracing::info!(
                target: "audit",
                action = outcome.action.as_str(),
                resource = outcome.resource.as_str(),
                user_id = ?outcome.user_id,
                client_id = ?outcome.client_id,
                ip_address = %entry.ip_address,
                user_agent = %entry.user_agent,
                description = outcome.description.as_deref(),
                "AUDIT"
            );
        } else {
            tracing::warn!(
                target: "audit",
                action = outcome.action.as_str(),
                resource = outcome.resource.as_str(),
                user_id = ?outcome.user_id,
                client_id = ?outcome.client_id,
                ip_address = %entry.ip_address,
                user_agent = %entry.user_agent,
                description = outcome.description.as_deref(),
                error = outcome.error_message.as_deref(),
                "AUDIT"
            );
        }
    }
}

/// Sink that keeps entries in memory
#[derive(Clone, Default)]
pub struct MemoryAuditSink {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().await.clone()
    }

    /// Actions recorded so far, in order
    pub async fn actions(&self) -> Vec<AuditAction> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|e| e.outcome.action)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, entry: AuditEntry) {
        self.entries.lock().await.push(entry);
    }
}
