//! Outbound email collaborator.
//!
//! Delivery itself belongs to another system; the engine only needs to hand
//! over a verification token or a two-factor code. Sends are best effort: a
//! failure is logged and never fails the operation that triggered it.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::DeliveryMode;

/// Email delivery errors
#[derive(Debug, Error)]
pub enum EmailError {
    /// Provider rejected or failed the send
    #[error("Email delivery failed: {0}")]
    Delivery(String),
}

/// Trait for outbound email delivery
#[async_trait]
pub trait EmailDispatcher: Send + Sync {
    /// Deliver a registration verification token
    async fn send_verification_email(&self, address: &str, token: &str) -> Result<(), EmailError>;

    /// Deliver a two-factor code
    async fn send_two_factor_code(&self, address: &str, code: &str) -> Result<(), EmailError>;
}

/// Dispatcher that only logs, for development setups without a provider
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnlyDispatcher;

#[async_trait]
impl EmailDispatcher for LogOnlyDispatcher {
    async fn send_verification_email(&self, address: &str, _token: &str) -> Result<(), EmailError> {
        tracing::info!(to = address, "Verification email (not delivered: log-only dispatcher)");
        Ok(())
    }

    async fn send_two_factor_code(&self, address: &str, _code: &str) -> Result<(), EmailError> {
        tracing::info!(to = address, "Two-factor code (not delivered: log-only dispatcher)");
        Ok(())
    }
}

/// Kind of message handed to a dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentEmail {
    Verification { address: String, token: String },
    TwoFactorCode { address: String, code: String },
}

/// Dispatcher that records every message, optionally failing each send
#[derive(Clone, Default)]
pub struct RecordingEmailDispatcher {
    sent: Arc<Mutex<Vec<SentEmail>>>,
    fail: bool,
}

impl RecordingEmailDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher whose sends are recorded and then reported as failed
    pub fn failing() -> Self {
        Self {
            sent: Arc::default(),
            fail: true,
        }
    }

    /// Messages handed over so far
    pub async fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().await.clone()
    }

    /// Most recent two-factor code sent to `address`
    pub async fn last_code_for(&self, address: &str) -> Option<String> {
        self.sent.lock().await.iter().rev().find_map(|m| match m {
            SentEmail::TwoFactorCode { address: a, code } if a == address => Some(code.clone()),
            _ => None,
        })
    }

    /// Most recent verification token sent to `address`
    pub async fn last_verification_token_for(&self, address: &str) -> Option<String> {
        self.sent.lock().await.iter().rev().find_map(|m| match m {
            SentEmail::Verification { address: a, token } if a == address => Some(token.clone()),
            _ => None,
        })
    }

    async fn push(&self, message: SentEmail) -> Result<(), EmailError> {
        self.sent.lock().await.push(message);
        if self.fail {
            return Err(EmailError::Delivery("provider unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EmailDispatcher for RecordingEmailDispatcher {
    async fn send_verification_email(&self, address: &str, token: &str) -> Result<(), EmailError> {
        self.push(SentEmail::Verification {
            address: address.to_string(),
            token: token.to_string(),
        })
        .await
    }

    async fn send_two_factor_code(&self, address: &str, code: &str) -> Result<(), EmailError> {
        self.push(SentEmail::TwoFactorCode {
            address: address.to_string(),
            code: code.to_string(),
        })
        .await
    }
}

/// Best-effort sender wrapping a dispatcher and a delivery mode
#[derive(Clone)]
pub struct Mailer {
    dispatcher: Arc<dyn EmailDispatcher>,
    mode: DeliveryMode,
}

impl Mailer {
    pub fn new(dispatcher: Arc<dyn EmailDispatcher>, mode: DeliveryMode) -> Self {
        Self { dispatcher, mode }
    }

    /// Send a verification token; never fails
    pub async fn verification(&self, address: String, token: String) {
        let dispatcher = self.dispatcher.clone();
        self.deliver("verification", async move {
            dispatcher.send_verification_email(&address, &token).await
        })
        .await;
    }

    /// Send a two-factor code; never fails
    pub async fn two_factor_code(&self, address: String, code: String) {
        let dispatcher = self.dispatcher.clone();
        self.deliver("two_factor_code", async move {
            dispatcher.send_two_factor_code(&address, &code).await
        })
        .await;
    }

    async fn deliver<F>(&self, kind: &'static str, send: F)
    where
        F: std::future::Future<Output = Result<(), EmailError>> + Send + 'static,
    {
        let logged = async move {
            if let Err(e) = send.await {
                tracing::warn!(kind, error = %e, "Email dispatch failed");
            }
        };

        match self.mode {
            DeliveryMode::Background => {
                tokio::spawn(logged);
            }
            DeliveryMode::Inline => logged.await,
        }
    }
}
