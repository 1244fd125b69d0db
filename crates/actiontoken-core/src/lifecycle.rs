//! Token secret/expiration fill-in and liveness

use crate::model::Token;
use actiontoken_crypto::{generate_secret, SecretError};
use chrono::{DateTime, Duration, Utc};

/// Seven days
pub const DEFAULT_LIFETIME_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLifecycle {
    default_lifetime: Duration,
}

impl Default for TokenLifecycle {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_LIFETIME_SECS))
    }
}

impl TokenLifecycle {
    pub fn new(default_lifetime: Duration) -> Self {
        Self { default_lifetime }
    }

    pub fn default_lifetime(&self) -> Duration {
        self.default_lifetime
    }

    /// Fill in an empty secret and a missing expiration.
    ///
    /// Values already present are left alone. Returns whether anything changed.
    pub fn ensure_initialized(&self, token: &mut Token) -> Result<bool, SecretError> {
        self.ensure_initialized_at(token, Utc::now())
    }

    pub fn ensure_initialized_at(
        &self,
        token: &mut Token,
        now: DateTime<Utc>,
    ) -> Result<bool, SecretError> {
        let mut changed = false;

        if token.secret.is_empty() {
            token.secret = generate_secret()?;
            changed = true;
        }

        if token.expires.is_none() {
            let expires = now
                .checked_add_signed(self.default_lifetime)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            token.expires = Some(expires);
            changed = true;
        }

        if changed {
            tracing::debug!(token = %token.id, expires = ?token.expires, "initialized token credentials");
        }
        Ok(changed)
    }

    /// `now < expires`, no grace period. A token without an expiration is not live.
    pub fn is_live(&self, token: &Token, now: DateTime<Utc>) -> bool {
        token.expires.map_or(false, |expires| now < expires)
    }
}
