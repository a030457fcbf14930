//! Argon2id password hashing with a server-side pepper.

use super::errors::{AuthError, AuthResult};
use crate::config::PasswordHashingConfig;
use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString, rand_core::OsRng},
};
use std::sync::Arc;

/// Salted, peppered Argon2id hasher with tunable cost
#[derive(Clone)]
pub struct PasswordHasher {
    pepper: String,
    params: Params,
    /// Hash at the configured cost, verified against when there is no stored hash
    decoy_hash: Arc<str>,
}

impl PasswordHasher {
    /// Create a hasher from cost parameters and the server pepper
    ///
    /// # Errors
    ///
    /// * `AuthError::Validation` - Cost parameters rejected by Argon2
    pub fn new(config: &PasswordHashingConfig, pepper: impl Into<String>) -> AuthResult<Self> {
        let params = Params::new(config.memory_kib, config.iterations, config.parallelism, None)
            .map_err(|e| AuthError::Validation(format!("Invalid Argon2 parameters: {e}")))?;

        let mut hasher = Self {
            pepper: pepper.into(),
            params,
            decoy_hash: Arc::from(""),
        };
        let decoy = hasher.hash_password(&hex::encode(rand::random::<[u8; 16]>()))?;
        hasher.decoy_hash = Arc::from(decoy);
        Ok(hasher)
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Hash password with Argon2id + pepper
    pub fn hash_password(&self, password: &str) -> AuthResult<String> {
        let peppered = format!("{}{}", password, self.pepper);
        let salt = SaltString::generate(&mut OsRng);

        Ok(self
            .argon2()
            .hash_password(peppered.as_bytes(), &salt)
            .map_err(|_| AuthError::HashingFailed)?
            .to_string())
    }

    /// Verify password against hash
    ///
    /// A malformed stored hash verifies as `false`; the cost parameters
    /// embedded in the hash are used, so hashes survive cost changes.
    pub fn validate_password(&self, password: &str, hash: &str) -> bool {
        let peppered = format!("{}{}", password, self.pepper);
        let Ok(parsed_hash) = PasswordHash::new(hash) else {
            return false;
        };

        self.argon2()
            .verify_password(peppered.as_bytes(), &parsed_hash)
            .is_ok()
    }

    /// [`hash_password`](Self::hash_password) on the blocking pool
    pub async fn hash_password_async(&self, password: &str) -> AuthResult<String> {
        let hasher = self.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.hash_password(&password))
            .await
            .map_err(|_| AuthError::HashingFailed)?
    }

    /// [`validate_password`](Self::validate_password) on the blocking pool
    pub async fn validate_password_async(&self, password: &str, hash: &str) -> AuthResult<bool> {
        let hasher = self.clone();
        let password = password.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || hasher.validate_password(&password, &hash))
            .await
            .map_err(|_| AuthError::HashingFailed)
    }

    /// Run one full verification against the decoy hash and discard the result
    ///
    /// Unknown-user logins call this so they cost as much as a wrong password.
    pub async fn verify_decoy_async(&self, password: &str) -> AuthResult<()> {
        let decoy = self.decoy_hash.clone();
        self.validate_password_async(password, &decoy).await?;
        Ok(())
    }
}
