//! Engine configuration management.
//!
//! Consolidates all environment variable reads and provides validated configuration.

use chrono::Duration;

/// Complete engine configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Token signing and claims configuration
    pub tokens: TokenConfig,
    /// Password hashing configuration
    pub password: PasswordHashingConfig,
    /// Server-side pepper appended to passwords before hashing
    pub password_pepper: String,
    /// Brute-force lockout policy
    pub lockout: LockoutPolicy,
    /// Two-factor challenge configuration
    pub two_factor: TwoFactorConfig,
    /// Refresh token lifetime and rotation policy
    pub refresh: RefreshPolicy,
    /// Email verification token lifetime
    pub email_verification_ttl: Duration,
    /// How verification emails and codes are dispatched
    pub email_delivery: DeliveryMode,
}

/// Access token configuration
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// HMAC-SHA-256 signing secret (required)
    pub jwt_secret: String,
    pub issuer: String,
    pub audience: String,
    pub access_token_ttl: Duration,
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordHashingConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl PasswordHashingConfig {
    /// Minimum legal cost, for tests only
    pub fn fast_for_tests() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            parallelism: 1,
        }
    }
}

impl Default for PasswordHashingConfig {
    fn default() -> Self {
        // OWASP Argon2id baseline (19 MiB, 2 passes, 1 lane)
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Brute-force lockout policy
#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    /// Consecutive failures that lock the account
    pub max_failed_attempts: i32,
    pub lockout_duration: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
            lockout_duration: Duration::minutes(15),
        }
    }
}

/// Two-factor challenge configuration
#[derive(Debug, Clone)]
pub struct TwoFactorConfig {
    pub code_ttl: Duration,
    /// Issuer label shown by authenticator apps
    pub totp_issuer: String,
}

impl Default for TwoFactorConfig {
    fn default() -> Self {
        Self {
            code_ttl: Duration::minutes(10),
            totp_issuer: "IdentityService".to_string(),
        }
    }
}

/// What happens to the presented refresh token when rotation mints a new one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationMode {
    /// Leave the presented token untouched; it stays usable until its own expiry
    KeepOriginal,
    /// Revoke the presented token once its successor is stored
    RevokeOriginal,
}

/// Refresh token lifetime and rotation policy
#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    pub ttl: Duration,
    /// Rotate when less than this much lifetime remains
    pub rotation_threshold: Duration,
    pub rotation_mode: RotationMode,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::days(30),
            rotation_threshold: Duration::days(7),
            rotation_mode: RotationMode::KeepOriginal,
        }
    }
}

/// Email dispatch mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Spawn the send and return immediately
    Background,
    /// Await the send before returning (failures are still only logged)
    Inline,
}

impl EngineConfig {
    /// Load configuration from environment variables
    ///
    /// Reads a `.env` file first when one exists.
    ///
    /// # Errors
    ///
    /// Returns error if required variables are missing or invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        // Security configuration (REQUIRED)
        let jwt_secret = std::env::var("JWT_SECRET").map_err(|_| ConfigError::MissingRequired {
            var: "JWT_SECRET".to_string(),
            hint: "Generate with: openssl rand -hex 32".to_string(),
        })?;

        let password_pepper =
            std::env::var("PASSWORD_PEPPER").map_err(|_| ConfigError::MissingRequired {
                var: "PASSWORD_PEPPER".to_string(),
                hint: "Generate with: openssl rand -hex 16".to_string(),
            })?;

        let tokens = TokenConfig {
            jwt_secret,
            issuer: env_or("JWT_ISSUER", "identityservice"),
            audience: env_or("JWT_AUDIENCE", "identityservice-api"),
            access_token_ttl: duration_env("ACCESS_TOKEN_TTL_SECS", 3600, Duration::try_seconds)?,
        };

        let hashing_defaults = PasswordHashingConfig::default();
        let password = PasswordHashingConfig {
            memory_kib: parse_env_or("ARGON2_MEMORY_KIB", hashing_defaults.memory_kib),
            iterations: parse_env_or("ARGON2_ITERATIONS", hashing_defaults.iterations),
            parallelism: parse_env_or("ARGON2_PARALLELISM", hashing_defaults.parallelism),
        };

        let lockout = LockoutPolicy {
            max_failed_attempts: parse_env_or("LOCKOUT_MAX_ATTEMPTS", 5),
            lockout_duration: duration_env("LOCKOUT_DURATION_MINS", 15, Duration::try_minutes)?,
        };

        let two_factor = TwoFactorConfig {
            code_ttl: duration_env("TWO_FACTOR_CODE_TTL_MINS", 10, Duration::try_minutes)?,
            totp_issuer: env_or("TOTP_ISSUER", "IdentityService"),
        };

        let rotation_mode = match std::env::var("REFRESH_ROTATION_MODE")
            .unwrap_or_else(|_| "keep".to_string())
            .to_lowercase()
            .as_str()
        {
            "keep" => RotationMode::KeepOriginal,
            "revoke" => RotationMode::RevokeOriginal,
            other => {
                return Err(ConfigError::Invalid {
                    var: "REFRESH_ROTATION_MODE".to_string(),
                    reason: format!("Expected 'keep' or 'revoke', got '{other}'"),
                });
            }
        };

        let refresh = RefreshPolicy {
            ttl: duration_env("REFRESH_TOKEN_TTL_DAYS", 30, Duration::try_days)?,
            rotation_threshold: duration_env(
                "REFRESH_ROTATION_THRESHOLD_DAYS",
                7,
                Duration::try_days,
            )?,
            rotation_mode,
        };

        let email_delivery = match std::env::var("EMAIL_DELIVERY")
            .unwrap_or_else(|_| "background".to_string())
            .to_lowercase()
            .as_str()
        {
            "background" => DeliveryMode::Background,
            "inline" => DeliveryMode::Inline,
            other => {
                return Err(ConfigError::Invalid {
                    var: "EMAIL_DELIVERY".to_string(),
                    reason: format!("Expected 'background' or 'inline', got '{other}'"),
                });
            }
        };

        let config = EngineConfig {
            tokens,
            password,
            password_pepper,
            lockout,
            two_factor,
            refresh,
            email_verification_ttl: duration_env(
                "EMAIL_VERIFICATION_TTL_HOURS",
                24,
                Duration::try_hours,
            )?,
            email_delivery,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// # Returns
    ///
    /// * `Result<(), ConfigError>` - Success or validation error
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tokens.jwt_secret.len() < 32 {
            return Err(ConfigError::Invalid {
                var: "JWT_SECRET".to_string(),
                reason: "Must be at least 32 characters (128-bit security)".to_string(),
            });
        }

        if self.password_pepper.len() < 16 {
            return Err(ConfigError::Invalid {
                var: "PASSWORD_PEPPER".to_string(),
                reason: "Must be at least 16 characters (64-bit security)".to_string(),
            });
        }

        if self.tokens.issuer.is_empty() || self.tokens.audience.is_empty() {
            return Err(ConfigError::Invalid {
                var: "JWT_ISSUER/JWT_AUDIENCE".to_string(),
                reason: "Must not be empty".to_string(),
            });
        }

        if self.tokens.access_token_ttl <= Duration::zero() {
            return Err(ConfigError::Invalid {
                var: "ACCESS_TOKEN_TTL_SECS".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if self.lockout.max_failed_attempts < 1 {
            return Err(ConfigError::Invalid {
                var: "LOCKOUT_MAX_ATTEMPTS".to_string(),
                reason: "Must be at least 1".to_string(),
            });
        }

        if self.lockout.lockout_duration <= Duration::zero() {
            return Err(ConfigError::Invalid {
                var: "LOCKOUT_DURATION_MINS".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if self.refresh.ttl <= Duration::zero() {
            return Err(ConfigError::Invalid {
                var: "REFRESH_TOKEN_TTL_DAYS".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if self.refresh.rotation_threshold < Duration::zero() {
            return Err(ConfigError::Invalid {
                var: "REFRESH_ROTATION_THRESHOLD_DAYS".to_string(),
                reason: "Must not be negative".to_string(),
            });
        }

        if self.refresh.rotation_threshold >= self.refresh.ttl {
            return Err(ConfigError::Invalid {
                var: "REFRESH_ROTATION_THRESHOLD_DAYS".to_string(),
                reason: format!(
                    "Must be less than the refresh token lifetime ({} days)",
                    self.refresh.ttl.num_days()
                ),
            });
        }

        if self.two_factor.code_ttl <= Duration::zero() {
            return Err(ConfigError::Invalid {
                var: "TWO_FACTOR_CODE_TTL_MINS".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        if self.email_verification_ttl <= Duration::zero() {
            return Err(ConfigError::Invalid {
                var: "EMAIL_VERIFICATION_TTL_HOURS".to_string(),
                reason: "Must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Configuration with the documented defaults and the given secrets
    pub fn with_secrets(jwt_secret: impl Into<String>, password_pepper: impl Into<String>) -> Self {
        Self {
            tokens: TokenConfig {
                jwt_secret: jwt_secret.into(),
                issuer: "identityservice".to_string(),
                audience: "identityservice-api".to_string(),
                access_token_ttl: Duration::hours(1),
            },
            password: PasswordHashingConfig::default(),
            password_pepper: password_pepper.into(),
            lockout: LockoutPolicy::default(),
            two_factor: TwoFactorConfig::default(),
            refresh: RefreshPolicy::default(),
            email_verification_ttl: Duration::hours(24),
            email_delivery: DeliveryMode::Background,
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {var}\nHint: {hint}")]
    MissingRequired { var: String, hint: String },

    #[error("Invalid configuration for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

/// Helper to parse environment variable with default fallback
pub(crate) fn parse_env_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read a whole number of `unit`s; out-of-range amounts are rejected instead of panicking
fn duration_env(
    key: &str,
    default: i64,
    unit: fn(i64) -> Option<Duration>,
) -> Result<Duration, ConfigError> {
    let amount = parse_env_or(key, default);
    unit(amount).ok_or_else(|| ConfigError::Invalid {
        var: key.to_string(),
        reason: format!("{amount} is out of range"),
    })
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "JWT_SECRET",
        "PASSWORD_PEPPER",
        "REFRESH_ROTATION_MODE",
        "EMAIL_DELIVERY",
        "LOCKOUT_MAX_ATTEMPTS",
        "LOCKOUT_DURATION_MINS",
        "REFRESH_TOKEN_TTL_DAYS",
    ];

    fn clear_env() {
        for var in VARS {
            // SAFETY: tests touching the environment are serialized
            unsafe { std::env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: tests touching the environment are serialized
        unsafe { std::env::set_var(key, value) };
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingRequired {
            var: "JWT_SECRET".to_string(),
            hint: "Use openssl".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("JWT_SECRET"));
        assert!(msg.contains("Use openssl"));
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::with_secrets("a".repeat(32), "b".repeat(16));
        config.validate().unwrap();
        assert_eq!(config.lockout.max_failed_attempts, 5);
        assert_eq!(config.lockout.lockout_duration, Duration::minutes(15));
        assert_eq!(config.refresh.ttl, Duration::days(30));
        assert_eq!(config.refresh.rotation_mode, RotationMode::KeepOriginal);
        assert_eq!(config.two_factor.code_ttl, Duration::minutes(10));
    }

    #[test]
    fn test_short_secret_rejected() {
        let config = EngineConfig::with_secrets("short", "b".repeat(16));
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "JWT_SECRET"));
    }

    #[test]
    fn test_rotation_threshold_must_be_below_ttl() {
        let mut config = EngineConfig::with_secrets("a".repeat(32), "b".repeat(16));
        config.refresh.rotation_threshold = Duration::days(30);
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_requires_secret() {
        clear_env();
        let err = EngineConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { ref var, .. } if var == "JWT_SECRET"));
    }

    #[test]
    #[serial]
    fn test_from_env_reads_overrides() {
        clear_env();
        set_env("JWT_SECRET", &"s".repeat(40));
        set_env("PASSWORD_PEPPER", &"p".repeat(20));
        set_env("REFRESH_ROTATION_MODE", "revoke");
        set_env("EMAIL_DELIVERY", "inline");
        set_env("LOCKOUT_MAX_ATTEMPTS", "3");

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.refresh.rotation_mode, RotationMode::RevokeOriginal);
        assert_eq!(config.email_delivery, DeliveryMode::Inline);
        assert_eq!(config.lockout.max_failed_attempts, 3);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_unknown_rotation_mode() {
        clear_env();
        set_env("JWT_SECRET", &"s".repeat(40));
        set_env("PASSWORD_PEPPER", &"p".repeat(20));
        set_env("REFRESH_ROTATION_MODE", "sometimes");

        let err = EngineConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_zero_lockout_duration() {
        clear_env();
        set_env("JWT_SECRET", &"s".repeat(40));
        set_env("PASSWORD_PEPPER", &"p".repeat(20));
        set_env("LOCKOUT_DURATION_MINS", "0");

        let err = EngineConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "LOCKOUT_DURATION_MINS"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_out_of_range_ttl() {
        clear_env();
        set_env("JWT_SECRET", &"s".repeat(40));
        set_env("PASSWORD_PEPPER", &"p".repeat(20));
        set_env("REFRESH_TOKEN_TTL_DAYS", &i64::MAX.to_string());

        let err = EngineConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "REFRESH_TOKEN_TTL_DAYS"));

        clear_env();
    }

    #[test]
    fn test_non_positive_lifetimes_rejected() {
        let mut config = EngineConfig::with_secrets("a".repeat(32), "b".repeat(16));
        config.email_verification_ttl = Duration::zero();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "EMAIL_VERIFICATION_TTL_HOURS"));

        let mut config = EngineConfig::with_secrets("a".repeat(32), "b".repeat(16));
        config.refresh.ttl = Duration::days(-1);
        config.refresh.rotation_threshold = Duration::days(-2);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "REFRESH_TOKEN_TTL_DAYS"));
    }
}
