// ============================
// crates/backend-lib/src/auth.rs
// ============================
//! Identity resolution seam.
//!
//! The core never issues or verifies credentials; it resolves an opaque
//! bearer token to an [`Identity`] through the [`IdentityProvider`] trait.
//! [`TokenRegistry`] is the built-in provider: a TTL'd token table suitable
//! for single-instance deployments and tests.

use crate::error::AppError;
use async_trait::async_trait;
use dashmap::DashMap;
use livecast_common::ParticipantRole;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Default token TTL (12 hours)
pub const TOKEN_TTL: Duration = Duration::from_secs(60 * 60 * 12);

/// The authenticated caller, as seen by the core.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: Uuid,
    pub display_name: String,
    pub role: ParticipantRole,
}

/// Resolves a request credential to an identity, or fails `Unauthorized`.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Identity, AppError>;
}

struct TokenEntry {
    identity: Identity,
    expires_at: SystemTime,
}

/// In-process token table with periodic expiry cleanup.
#[derive(Clone)]
pub struct TokenRegistry {
    tokens: Arc<DashMap<String, TokenEntry>>,
    ttl: Duration,
}

impl TokenRegistry {
    pub fn new(ttl: Duration) -> Self {
        let registry = TokenRegistry {
            tokens: Arc::new(DashMap::new()),
            ttl,
        };

        let cleanup = registry.clone();
        tokio::spawn(async move {
            cleanup.cleanup_task().await;
        });

        registry
    }

    /// Issue a token for an identity.
    pub fn issue(&self, identity: Identity) -> String {
        let token = Uuid::new_v4().to_string();
        self.tokens.insert(
            token.clone(),
            TokenEntry {
                identity,
                expires_at: SystemTime::now() + self.ttl,
            },
        );
        metrics::gauge!(crate::metrics::TOKENS_ACTIVE).set(self.tokens.len() as f64);
        token
    }

    /// Invalidate a token.
    pub fn revoke(&self, token: &str) {
        self.tokens.remove(token);
    }

    async fn cleanup_task(&self) {
        let cleanup_interval = Duration::from_secs(60 * 10);

        loop {
            tokio::time::sleep(cleanup_interval).await;

            let now = SystemTime::now();
            self.tokens.retain(|_, entry| now < entry.expires_at);
            metrics::gauge!(crate::metrics::TOKENS_ACTIVE).set(self.tokens.len() as f64);
        }
    }
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new(TOKEN_TTL)
    }
}

#[async_trait]
impl IdentityProvider for TokenRegistry {
    async fn authenticate(&self, token: &str) -> Result<Identity, AppError> {
        match self.tokens.get(token) {
            Some(entry) if SystemTime::now() < entry.expires_at => Ok(entry.identity.clone()),
            Some(_) => Err(AppError::Unauthorized("token expired".to_string())),
            None => Err(AppError::Unauthorized("unknown token".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(role: ParticipantRole) -> Identity {
        Identity {
            user_id: Uuid::new_v4(),
            display_name: "Ada".to_string(),
            role,
        }
    }

    #[tokio::test]
    async fn test_issue_and_authenticate() {
        let registry = TokenRegistry::default();
        let id = identity(ParticipantRole::Host);
        let token = registry.issue(id.clone());

        let resolved = registry.authenticate(&token).await.unwrap();
        assert_eq!(resolved.user_id, id.user_id);
        assert_eq!(resolved.role, ParticipantRole::Host);
    }

    #[tokio::test]
    async fn test_unknown_token_is_unauthorized() {
        let registry = TokenRegistry::default();
        let err = registry.authenticate("nope").await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_expired_token_is_unauthorized() {
        let registry = TokenRegistry::new(Duration::from_millis(1));
        let token = registry.issue(identity(ParticipantRole::Participant));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let err = registry.authenticate(&token).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_revoked_token_is_unauthorized() {
        let registry = TokenRegistry::default();
        let token = registry.issue(identity(ParticipantRole::Participant));
        registry.revoke(&token);
        assert!(registry.authenticate(&token).await.is_err());
    }
}
