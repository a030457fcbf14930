//! Property-based tests for registration/login and access token round trips.

use chrono::Duration;
use identity_engine::auth::{
    AuthError, CredentialVerifier, PasswordHasher, ProfileFields, RegisterRequest, ScopeSet,
    SigningKey, TokenIssuer, User,
};
use identity_engine::clock::{ManualClock, SharedClock};
use identity_engine::config::{DeliveryMode, LockoutPolicy, PasswordHashingConfig, TokenConfig};
use identity_engine::db::MemoryCredentialStore;
use identity_engine::email::{Mailer, RecordingEmailDispatcher};
use proptest::prelude::*;
use std::sync::Arc;
use uuid::Uuid;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn verifier() -> CredentialVerifier {
    let clock: SharedClock = Arc::new(ManualClock::starting_now());
    CredentialVerifier::new(
        Arc::new(MemoryCredentialStore::new()),
        PasswordHasher::new(&PasswordHashingConfig::fast_for_tests(), "proptest-pepper").unwrap(),
        Mailer::new(Arc::new(RecordingEmailDispatcher::new()), DeliveryMode::Inline),
        clock,
        LockoutPolicy::default(),
        Duration::hours(24),
    )
}

fn token_issuer(secret: &[u8], clock: &ManualClock) -> TokenIssuer {
    TokenIssuer::new(
        &TokenConfig {
            jwt_secret: String::new(),
            issuer: "identityservice".to_string(),
            audience: "identityservice-api".to_string(),
            access_token_ttl: Duration::hours(1),
        },
        SigningKey::from_secret(secret),
        Arc::new(clock.clone()),
    )
}

fn make_user(username: String, email: String) -> User {
    let now = chrono::Utc::now();
    User {
        id: Uuid::new_v4(),
        username,
        email,
        password_hash: String::new(),
        first_name: None,
        last_name: None,
        is_email_verified: false,
        email_verification_token: None,
        email_verification_expires_at: None,
        is_locked: false,
        failed_login_attempts: 0,
        lockout_until: None,
        two_factor_enabled: false,
        two_factor_secret: None,
        created_at: now,
        updated_at: now,
        last_login_at: None,
    }
}

/// Generate a username
fn username_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{2,15}"
}

/// Generate an email address
fn email_strategy() -> impl Strategy<Value = String> {
    ("[a-z][a-z0-9]{0,10}", "[a-z]{2,8}").prop_map(|(local, domain)| format!("{local}@{domain}.com"))
}

/// Generate a password of at least 8 characters
fn password_strategy() -> impl Strategy<Value = String> {
    "[ -~]{8,32}"
}

fn scope_strategy() -> impl Strategy<Value = ScopeSet> {
    prop::collection::btree_set("[a-z]{1,8}(:[a-z]{1,8})?", 0..6)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Registering with unused credentials always allows logging in with them
    #[test]
    fn test_register_then_login(
        username in username_strategy(),
        email in email_strategy(),
        password in password_strategy(),
    ) {
        let rt = runtime();
        let verifier = verifier();

        let registered = rt.block_on(verifier.register(RegisterRequest {
            username: username.clone(),
            email,
            password: password.clone(),
            profile: ProfileFields::default(),
        }));
        prop_assert!(registered.is_ok(), "registration failed: {:?}", registered.as_ref().err());
        let registered = registered.unwrap();

        let logged_in = rt.block_on(verifier.login(&username, &password));
        prop_assert!(logged_in.is_ok(), "login failed: {:?}", logged_in.as_ref().err());
        prop_assert_eq!(logged_in.unwrap().id, registered.id);
    }

    /// Passwords shorter than 8 characters are always rejected
    #[test]
    fn test_short_password_rejected(password in "[ -~]{1,7}") {
        let rt = runtime();
        let result = rt.block_on(verifier().register(RegisterRequest {
            username: "alice".to_string(),
            email: "alice@x.com".to_string(),
            password,
            profile: ProfileFields::default(),
        }));
        prop_assert!(matches!(result, Err(AuthError::Validation(_))));
    }

    /// Issued tokens validate back to the same subject, client and scopes
    #[test]
    fn test_access_token_round_trip(
        username in username_strategy(),
        email in email_strategy(),
        scopes in scope_strategy(),
    ) {
        let clock = ManualClock::starting_now();
        let issuer = token_issuer(b"proptest-signing-secret-0123456789abcdef", &clock);
        let user = make_user(username, email);
        let client_id = Uuid::new_v4();

        let token = issuer.issue_access_token(&user, scopes.clone(), client_id).unwrap();
        let validated = issuer.validate_access_token(&token).unwrap();

        prop_assert_eq!(validated.user_id, user.id);
        prop_assert_eq!(validated.client_id, client_id);
        prop_assert_eq!(validated.scopes, scopes);
    }

    /// Tokens are rejected once their lifetime has passed, and under any other key
    #[test]
    fn test_access_token_rejections(
        elapsed_secs in 3600i64..100_000,
        other_key in prop::collection::vec(any::<u8>(), 32..64),
    ) {
        let clock = ManualClock::starting_now();
        let ours = b"proptest-signing-secret-0123456789abcdef";
        prop_assume!(other_key.as_slice() != ours.as_slice());

        let issuer = token_issuer(ours, &clock);
        let foreign = token_issuer(&other_key, &clock);
        let user = make_user("alice".to_string(), "alice@x.com".to_string());

        let token = foreign.issue_access_token(&user, ["read"], Uuid::new_v4()).unwrap();
        prop_assert!(matches!(issuer.validate_access_token(&token), Err(AuthError::InvalidToken)));

        let token = issuer.issue_access_token(&user, ["read"], Uuid::new_v4()).unwrap();
        clock.advance(Duration::seconds(elapsed_secs));
        prop_assert!(matches!(issuer.validate_access_token(&token), Err(AuthError::InvalidToken)));
    }
}
