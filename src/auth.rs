//! Identity gate.
//!
//! Verifies an opaque bearer credential once per connection handshake and
//! attaches a user identity to it. Issuing and refreshing credentials belongs
//! to the external account system; this side only reads.

use async_trait::async_trait;
use sqlx::prelude::FromRow;
use thiserror::Error;

use crate::mtch::UserId;
use crate::Db;

#[derive(Debug, Clone, FromRow)]
pub struct AuthUser {
    pub user_id: UserId,
    pub role: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// The token is unknown or revoked. The handshake is refused; no
    /// connection is created.
    #[error("invalid credential")]
    InvalidCredential,

    #[error("auth backend unavailable")]
    Unavailable,
}

#[async_trait]
pub trait Identity: Send + Sync {
    async fn verify_credential(&self, token: &str) -> Result<AuthUser, AuthError>;
}

pub struct SqliteIdentity {
    db: Db,
}

impl SqliteIdentity {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Identity for SqliteIdentity {
    async fn verify_credential(&self, token: &str) -> Result<AuthUser, AuthError> {
        let user = sqlx::query_as::<_, AuthUser>(
            "SELECT user_id, role FROM credentials WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.db)
        .await
        .map_err(|err| {
            tracing::warn!("credential lookup failed: {err}");
            AuthError::Unavailable
        })?;

        user.ok_or(AuthError::InvalidCredential)
    }
}

/// Table-driven identity for tests: token -> user.
pub struct StaticIdentity {
    users: Vec<(String, AuthUser)>,
}

impl StaticIdentity {
    pub fn new(users: Vec<(String, AuthUser)>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl Identity for StaticIdentity {
    async fn verify_credential(&self, token: &str) -> Result<AuthUser, AuthError> {
        self.users
            .iter()
            .find(|(t, _)| t == token)
            .map(|(_, user)| user.clone())
            .ok_or(AuthError::InvalidCredential)
    }
}
