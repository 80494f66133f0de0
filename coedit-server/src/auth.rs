//! Credential verification contract.
//!
//! Issuing and parsing bearer credentials is someone else's job; the
//! gateway only needs a collaborator that resolves an opaque token to a
//! verified principal. Two implementations ship with the server: a static
//! token file for deployments fronted by an external identity provider, and
//! an unsecured mode for development and tests where the token itself names
//! the user.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A verified identity, as consumed by the engine and gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Stable user id.
    pub user_id: String,
    /// Display name shown to co-editors.
    pub name: String,
}

/// Why a credential was rejected.
#[derive(Debug, thiserror::Error)]
#[error("credential rejected: {0}")]
pub struct AuthError(pub String);

/// Resolves bearer credentials to principals.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify `token`, returning the principal it belongs to.
    async fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Token registry loaded from a JSON file mapping bearer tokens to
/// principals.
#[derive(Debug)]
pub struct TokenFile {
    tokens: HashMap<String, Principal>,
}

impl TokenFile {
    /// Load the registry from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading auth tokens from {}", path.display()))?;
        let tokens = serde_json::from_str(&raw).context("parsing auth token file")?;
        Ok(Self { tokens })
    }
}

#[async_trait]
impl Authenticator for TokenFile {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError("unknown token".into()))
    }
}

/// Development-mode authenticator: any non-empty token is accepted and
/// doubles as the user id.
#[derive(Debug, Default)]
pub struct Unsecured;

#[async_trait]
impl Authenticator for Unsecured {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        if token.is_empty() {
            return Err(AuthError("missing credential".into()));
        }
        Ok(Principal {
            user_id: token.to_owned(),
            name: token.to_owned(),
        })
    }
}
