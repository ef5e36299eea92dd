//! Identity and authorization seam.
//!
//! The gateway never interprets tokens itself; it asks an
//! [`IdentityService`]. `StaticIdentity` is the config-driven
//! implementation used by the server binary and the tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::operation::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Resolve a bearer token to a user.
    async fn authenticate(&self, token: &str) -> Result<UserId, AuthError>;

    /// Whether `user` may open `document` with `access`.
    async fn authorize(&self, user: &str, document: &str, access: Access) -> Result<bool, AuthError>;
}

/// One `[[users]]` table in the server config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub token: String,
    pub user: UserId,
    /// Documents the user may read; `"*"` matches all.
    #[serde(default)]
    pub read: Vec<String>,
    /// Documents the user may edit (implies read); `"*"` matches all.
    #[serde(default)]
    pub write: Vec<String>,
}

impl UserEntry {
    pub fn new(token: impl Into<String>, user: impl Into<UserId>) -> Self {
        Self {
            token: token.into(),
            user: user.into(),
            read: Vec::new(),
            write: Vec::new(),
        }
    }

    pub fn reads(mut self, document: impl Into<String>) -> Self {
        self.read.push(document.into());
        self
    }

    pub fn writes(mut self, document: impl Into<String>) -> Self {
        self.write.push(document.into());
        self
    }
}

fn matches(patterns: &[String], document: &str) -> bool {
    patterns.iter().any(|p| p == "*" || p == document)
}

/// Token table loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    by_token: HashMap<String, UserEntry>,
}

impl StaticIdentity {
    pub fn new(entries: impl IntoIterator<Item = UserEntry>) -> Self {
        Self {
            by_token: entries.into_iter().map(|e| (e.token.clone(), e)).collect(),
        }
    }

    fn entry_for_user(&self, user: &str) -> Option<&UserEntry> {
        self.by_token.values().find(|e| e.user == user)
    }
}

#[async_trait]
impl IdentityService for StaticIdentity {
    async fn authenticate(&self, token: &str) -> Result<UserId, AuthError> {
        self.by_token
            .get(token)
            .map(|e| e.user.clone())
            .ok_or(AuthError::InvalidToken)
    }

    async fn authorize(&self, user: &str, document: &str, access: Access) -> Result<bool, AuthError> {
        let Some(entry) = self.entry_for_user(user) else {
            return Ok(false);
        };
        let can_write = matches(&entry.write, document);
        Ok(match access {
            Access::Write => can_write,
            Access::Read => can_write || matches(&entry.read, document),
        })
    }
}
