//! Session facade composing the lifecycle components.
//!
//! [`IdentityService`] is what a routing layer calls: each operation runs the
//! relevant component, turns the result into an [`AuditOutcome`] and hands it
//! to the configured [`AuditSink`] before returning.

use std::sync::Arc;

use crate::audit::{AuditAction, AuditEntry, AuditOutcome, AuditResource, AuditSink, RequestContext};
use crate::auth::{
    AuthError, AuthResult, ChallengeHandle, ClientId, CredentialVerifier, LoginRequest,
    PasswordHasher, RefreshToken, RefreshTokenManager, RegisterRequest, RotationResult, ScopeSet,
    SessionTokens, SigningKey, TokenIssuer, TwoFactorManager, TwoFactorMethod, TwoFactorSetup,
    User, UserId, ValidatedAccessToken,
};
use crate::clock::SharedClock;
use crate::config::EngineConfig;
use crate::db::{CredentialStore, PgStore, RefreshTokenStore, TwoFactorStore};
use crate::email::{EmailDispatcher, Mailer};

/// Revocation reason recorded by [`IdentityService::logout`]
pub const LOGOUT_REASON: &str = "User logout";

/// The three stores the engine reads and writes
#[derive(Clone)]
pub struct Stores {
    pub credentials: Arc<dyn CredentialStore>,
    pub refresh_tokens: Arc<dyn RefreshTokenStore>,
    pub two_factor: Arc<dyn TwoFactorStore>,
}

impl Stores {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
        two_factor: Arc<dyn TwoFactorStore>,
    ) -> Self {
        Self {
            credentials,
            refresh_tokens,
            two_factor,
        }
    }

    /// All three stores backed by one PostgreSQL pool
    pub fn postgres(store: PgStore) -> Self {
        let store = Arc::new(store);
        Self {
            credentials: store.clone(),
            refresh_tokens: store.clone(),
            two_factor: store,
        }
    }
}

/// Result of a password login
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    /// Credentials accepted and tokens minted
    Authenticated { user: User, tokens: SessionTokens },
    /// A second factor must be verified with the handle before tokens are minted
    TwoFactorRequired {
        user_id: UserId,
        method: TwoFactorMethod,
        handle: ChallengeHandle,
    },
}

/// Credential and session lifecycle engine
#[derive(Clone)]
pub struct IdentityService {
    credentials: CredentialVerifier,
    two_factor: TwoFactorManager,
    tokens: TokenIssuer,
    refresh: RefreshTokenManager,
    users: Arc<dyn CredentialStore>,
    audit: Arc<dyn AuditSink>,
    clock: SharedClock,
}

impl IdentityService {
    /// Wire every component from configuration
    ///
    /// # Errors
    ///
    /// * `AuthError::Validation` - Argon2 cost parameters rejected
    pub fn from_config(
        config: &EngineConfig,
        stores: Stores,
        email: Arc<dyn EmailDispatcher>,
        audit: Arc<dyn AuditSink>,
        clock: SharedClock,
    ) -> AuthResult<Self> {
        let hasher = PasswordHasher::new(&config.password, config.password_pepper.clone())?;
        let key = SigningKey::from_secret(config.tokens.jwt_secret.as_bytes());
        let tokens = TokenIssuer::new(&config.tokens, key, clock.clone());
        let mailer = Mailer::new(email, config.email_delivery);

        let credentials = CredentialVerifier::new(
            stores.credentials.clone(),
            hasher,
            mailer.clone(),
            clock.clone(),
            config.lockout,
            config.email_verification_ttl,
        );
        let two_factor = TwoFactorManager::new(
            stores.two_factor,
            stores.credentials.clone(),
            tokens.clone(),
            mailer,
            clock.clone(),
            config.two_factor.clone(),
        );
        let refresh = RefreshTokenManager::new(
            stores.refresh_tokens,
            stores.credentials.clone(),
            tokens.clone(),
            clock.clone(),
            config.refresh,
        );

        tracing::info!(
            issuer = %config.tokens.issuer,
            rotation_mode = ?config.refresh.rotation_mode,
            "Identity service initialized"
        );

        Ok(Self {
            credentials,
            two_factor,
            tokens,
            refresh,
            users: stores.credentials,
            audit,
            clock,
        })
    }

    pub fn credentials(&self) -> &CredentialVerifier {
        &self.credentials
    }

    pub fn two_factor(&self) -> &TwoFactorManager {
        &self.two_factor
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    pub fn refresh_tokens(&self) -> &RefreshTokenManager {
        &self.refresh
    }

    async fn record(&self, outcome: AuditOutcome, ctx: &RequestContext) {
        self.audit
            .record(AuditEntry::new(outcome, ctx, self.clock.now()))
            .await;
    }

    async fn record_failure(
        &self,
        action: AuditAction,
        resource: AuditResource,
        error: &AuthError,
        ctx: &RequestContext,
        user_id: Option<UserId>,
    ) {
        let mut outcome = AuditOutcome::failure(action, resource, error);
        if outcome.user_id.is_none() {
            outcome.user_id = user_id;
        }
        self.record(outcome, ctx).await;
    }

    /// Record an error result as a failed `action`, then hand the result back
    async fn audit_failure<T>(
        &self,
        result: AuthResult<T>,
        action: AuditAction,
        resource: AuditResource,
        ctx: &RequestContext,
        user_id: Option<UserId>,
    ) -> AuthResult<T> {
        if let Err(e) = &result {
            self.record_failure(action, resource, e, ctx, user_id).await;
        }
        result
    }

    async fn load_user(&self, user_id: UserId) -> AuthResult<User> {
        self.users
            .get_user_by_id(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)
    }

    /// Register a new user
    pub async fn register(&self, request: RegisterRequest, ctx: &RequestContext) -> AuthResult<User> {
        let username = request.username.clone();
        match self.credentials.register(request).await {
            Ok(user) => {
                self.record(
                    AuditOutcome::success(AuditAction::UserRegistered, AuditResource::User)
                        .user(user.id)
                        .describe(format!("User registered: {}", user.username)),
                    ctx,
                )
                .await;
                Ok(user)
            }
            Err(e) => {
                let mut outcome =
                    AuditOutcome::failure(AuditAction::UserRegisterFailed, AuditResource::User, &e);
                outcome.description = Some(format!("Registration attempt: {username}"));
                self.record(outcome, ctx).await;
                Err(e)
            }
        }
    }

    /// Password login
    ///
    /// Users with two-factor enabled get a challenge handle instead of tokens;
    /// [`complete_two_factor`](Self::complete_two_factor) finishes the login.
    pub async fn login(&self, request: LoginRequest, ctx: &RequestContext) -> AuthResult<LoginOutcome> {
        let user = match self
            .credentials
            .login(&request.username, &request.password)
            .await
        {
            Ok(user) => user,
            Err(e) => {
                self.record_failure(AuditAction::LoginFailed, AuditResource::User, &e, ctx, None)
                    .await;
                return Err(e);
            }
        };

        if user.two_factor_enabled {
            let method = if user.two_factor_secret.is_some() {
                TwoFactorMethod::Totp
            } else {
                TwoFactorMethod::Email
            };
            let initiated = self.two_factor.initiate(&user, method).await;
            let handle = self
                .audit_failure(
                    initiated,
                    AuditAction::LoginFailed,
                    AuditResource::User,
                    ctx,
                    Some(user.id),
                )
                .await?;
            self.record(
                AuditOutcome::success(AuditAction::TwoFactorRequired, AuditResource::User)
                    .user(user.id)
                    .client(request.client_id)
                    .describe(format!("Two-factor challenge via {method}")),
                ctx,
            )
            .await;

            return Ok(LoginOutcome::TwoFactorRequired {
                user_id: user.id,
                method,
                handle,
            });
        }

        let opened = self
            .open_session(&user, request.client_id, &request.scopes, ctx)
            .await;
        let tokens = self
            .audit_failure(
                opened,
                AuditAction::LoginFailed,
                AuditResource::User,
                ctx,
                Some(user.id),
            )
            .await?;
        self.record(
            AuditOutcome::success(AuditAction::LoginSuccess, AuditResource::User)
                .user(user.id)
                .client(request.client_id),
            ctx,
        )
        .await;

        Ok(LoginOutcome::Authenticated { user, tokens })
    }

    /// Verify the second factor of a pending login and mint its tokens
    pub async fn complete_two_factor(
        &self,
        handle: &ChallengeHandle,
        code: &str,
        client_id: ClientId,
        scopes: &ScopeSet,
        ctx: &RequestContext,
    ) -> AuthResult<SessionTokens> {
        let user = match self.two_factor.verify_with_handle(handle, code).await {
            Ok(user) => user,
            Err(e) => {
                let user_id = self
                    .tokens
                    .resolve_challenge_handle(handle)
                    .ok()
                    .map(|(user_id, _)| user_id);
                self.record_failure(AuditAction::TwoFactorFailed, AuditResource::User, &e, ctx, user_id)
                    .await;
                return Err(e);
            }
        };

        let opened = self.open_session(&user, client_id, scopes, ctx).await;
        let tokens = self
            .audit_failure(
                opened,
                AuditAction::TwoFactorFailed,
                AuditResource::User,
                ctx,
                Some(user.id),
            )
            .await?;
        self.record(
            AuditOutcome::success(AuditAction::TwoFactorVerified, AuditResource::User)
                .user(user.id)
                .client(client_id),
            ctx,
        )
        .await;
        Ok(tokens)
    }

    async fn open_session(
        &self,
        user: &User,
        client_id: ClientId,
        scopes: &ScopeSet,
        ctx: &RequestContext,
    ) -> AuthResult<SessionTokens> {
        let access_token = self.tokens.issue_access_token(user, scopes.iter().cloned(), client_id)?;
        let refresh_token = self
            .refresh
            .issue(user, client_id, ctx.ip(), ctx.agent())
            .await?;

        Ok(SessionTokens {
            access_token,
            refresh_token: refresh_token.token,
            token_type: "Bearer".to_string(),
            expires_in: self.tokens.access_ttl().num_seconds(),
        })
    }

    /// Start a two-factor challenge for a user
    pub async fn initiate_two_factor(
        &self,
        user_id: UserId,
        method: TwoFactorMethod,
        ctx: &RequestContext,
    ) -> AuthResult<ChallengeHandle> {
        let initiated = match self.load_user(user_id).await {
            Ok(user) => self.two_factor.initiate(&user, method).await,
            Err(e) => Err(e),
        };
        let handle = self
            .audit_failure(
                initiated,
                AuditAction::TwoFactorFailed,
                AuditResource::User,
                ctx,
                Some(user_id),
            )
            .await?;
        self.record(
            AuditOutcome::success(AuditAction::TwoFactorRequired, AuditResource::User)
                .user(user_id)
                .describe(format!("Two-factor challenge via {method}")),
            ctx,
        )
        .await;
        Ok(handle)
    }

    /// Verify a code against the user's newest pending challenge
    pub async fn verify_two_factor(
        &self,
        user_id: UserId,
        code: &str,
        method: TwoFactorMethod,
        ctx: &RequestContext,
    ) -> AuthResult<()> {
        let result = match self.load_user(user_id).await {
            Ok(user) => self.two_factor.verify(&user, code, method).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => {
                self.record(
                    AuditOutcome::success(AuditAction::TwoFactorVerified, AuditResource::User)
                        .user(user_id),
                    ctx,
                )
                .await;
            }
            Err(e) => {
                self.record_failure(
                    AuditAction::TwoFactorFailed,
                    AuditResource::User,
                    e,
                    ctx,
                    Some(user_id),
                )
                .await;
            }
        }
        result
    }

    /// Enroll a TOTP authenticator for a user
    pub async fn setup_persistent_secret(
        &self,
        user_id: UserId,
        ctx: &RequestContext,
    ) -> AuthResult<TwoFactorSetup> {
        let enrolled = match self.load_user(user_id).await {
            Ok(user) => self.two_factor.setup_persistent_secret(&user).await,
            Err(e) => Err(e),
        };
        let setup = self
            .audit_failure(
                enrolled,
                AuditAction::TotpEnrolled,
                AuditResource::User,
                ctx,
                Some(user_id),
            )
            .await?;
        self.record(
            AuditOutcome::success(AuditAction::TotpEnrolled, AuditResource::User).user(user_id),
            ctx,
        )
        .await;
        Ok(setup)
    }

    /// Mint an access token for a stored user
    pub async fn issue_access_token(
        &self,
        user_id: UserId,
        scopes: &ScopeSet,
        client_id: ClientId,
    ) -> AuthResult<String> {
        let user = self.load_user(user_id).await?;
        self.tokens
            .issue_access_token(&user, scopes.iter().cloned(), client_id)
    }

    /// Validate an access token without touching any store
    pub fn validate_access_token(&self, token: &str) -> AuthResult<ValidatedAccessToken> {
        self.tokens.validate_access_token(token)
    }

    /// Mint a refresh token for a stored user
    pub async fn issue_refresh_token(
        &self,
        user_id: UserId,
        client_id: ClientId,
        ctx: &RequestContext,
    ) -> AuthResult<RefreshToken> {
        let user = self.load_user(user_id).await?;
        self.refresh
            .issue(&user, client_id, ctx.ip(), ctx.agent())
            .await
    }

    /// Exchange a refresh token for a new access token
    pub async fn refresh(&self, refresh_token: &str, ctx: &RequestContext) -> AuthResult<RotationResult> {
        let current = match self.refresh.resolve(refresh_token).await {
            Ok(current) => current,
            Err(e) => {
                self.record_failure(AuditAction::TokenRefreshFailed, AuditResource::Token, &e, ctx, None)
                    .await;
                return Err(e);
            }
        };

        match self.refresh.rotate(refresh_token, ctx.ip()).await {
            Ok(result) => {
                let description = if result.refresh_token.is_some() {
                    "Access token refreshed; refresh token rotated"
                } else {
                    "Access token refreshed"
                };
                self.record(
                    AuditOutcome::success(AuditAction::TokenRefreshed, AuditResource::Token)
                        .user(current.user_id)
                        .client(current.client_id)
                        .describe(description),
                    ctx,
                )
                .await;
                Ok(result)
            }
            Err(e) => {
                self.record_failure(
                    AuditAction::TokenRefreshFailed,
                    AuditResource::Token,
                    &e,
                    ctx,
                    Some(current.user_id),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Revoke the presented refresh token; a no-op if it is unknown or revoked
    pub async fn logout(&self, refresh_token: &str, ctx: &RequestContext) -> AuthResult<()> {
        self.revoke_refresh_token(refresh_token, LOGOUT_REASON, ctx)
            .await
    }

    /// Revoke a refresh token with an explicit reason
    pub async fn revoke_refresh_token(
        &self,
        refresh_token: &str,
        reason: &str,
        ctx: &RequestContext,
    ) -> AuthResult<()> {
        let revoked = self.refresh.revoke(refresh_token, reason).await;
        let revoked = self
            .audit_failure(
                revoked,
                AuditAction::TokenRevoked,
                AuditResource::Token,
                ctx,
                None,
            )
            .await?;

        if let Some(token) = revoked {
            self.record(
                AuditOutcome::success(AuditAction::TokenRevoked, AuditResource::Token)
                    .user(token.user_id)
                    .client(token.client_id)
                    .describe(reason),
                ctx,
            )
            .await;
        }
        Ok(())
    }

    /// Revoke every live refresh token of a user
    pub async fn revoke_all(&self, user_id: UserId, reason: &str, ctx: &RequestContext) -> AuthResult<u64> {
        let revoked = self.refresh.revoke_all_for_user(user_id, reason).await;
        let count = self
            .audit_failure(
                revoked,
                AuditAction::TokenRevoked,
                AuditResource::Token,
                ctx,
                Some(user_id),
            )
            .await?;
        self.record(
            AuditOutcome::success(AuditAction::TokenRevoked, AuditResource::Token)
                .user(user_id)
                .describe(format!("{reason} ({count} tokens)")),
            ctx,
        )
        .await;
        Ok(count)
    }

    /// Consume an email verification token
    pub async fn verify_email(&self, token: &str, ctx: &RequestContext) -> AuthResult<User> {
        match self.credentials.verify_email(token).await {
            Ok(user) => {
                self.record(
                    AuditOutcome::success(AuditAction::EmailVerified, AuditResource::User).user(user.id),
                    ctx,
                )
                .await;
                Ok(user)
            }
            Err(e) => {
                self.record_failure(
                    AuditAction::EmailVerificationFailed,
                    AuditResource::User,
                    &e,
                    ctx,
                    None,
                )
                .await;
                Err(e)
            }
        }
    }

    /// Send a fresh verification token; silent for unknown addresses
    pub async fn resend_verification(&self, email: &str) -> AuthResult<()> {
        self.credentials.resend_verification(email).await
    }
}
