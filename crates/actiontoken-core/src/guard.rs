//! Request-level gate: expiry first, then the grant graph

use crate::engine::PermissionEngine;
use crate::lifecycle::TokenLifecycle;
use crate::model::{Token, Verb};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    #[error("Token expired")]
    TokenExpired { expired_at: Option<DateTime<Utc>> },
}

/// Checks liveness before ever consulting the [`PermissionEngine`]
#[derive(Clone)]
pub struct AccessGuard {
    lifecycle: TokenLifecycle,
    engine: PermissionEngine,
}

impl AccessGuard {
    pub fn new(lifecycle: TokenLifecycle, engine: PermissionEngine) -> Self {
        Self { lifecycle, engine }
    }

    pub fn engine(&self) -> &PermissionEngine {
        &self.engine
    }

    pub fn authorize(
        &self,
        token: &Token,
        verb: Verb,
        resource_type: &str,
        attribute: Option<&str>,
    ) -> Result<bool, GuardError> {
        self.authorize_at(token, verb, resource_type, attribute, Utc::now())
    }

    /// `Err(TokenExpired)` when the token is not live at `now`, otherwise the
    /// engine's verdict. A denial carries no reason.
    pub fn authorize_at(
        &self,
        token: &Token,
        verb: Verb,
        resource_type: &str,
        attribute: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, GuardError> {
        if !self.lifecycle.is_live(token, now) {
            tracing::info!(token = %token.id, expires = ?token.expires, "rejected expired token");
            return Err(GuardError::TokenExpired {
                expired_at: token.expires,
            });
        }
        Ok(self.engine.can(token, verb, resource_type, attribute))
    }
}
