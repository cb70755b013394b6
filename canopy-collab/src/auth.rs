//! Authentication and authorization seams.
//!
//! The sync layer only asks two questions: who is behind this token, and
//! what may that user do with this document. Deployments plug in their own
//! answers; the implementations here cover development and tests.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::protocol::{Authz, UserInfo};

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolve a bearer token to a user, or `None` if the token is invalid.
    async fn authenticate(&self, token: &str) -> Option<UserInfo>;
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, doc_id: &str, user_id: &str) -> Authz;

    /// Whether `token` may perform administrative calls such as creating
    /// documents.
    fn check_admin(&self, token: &str) -> bool;
}

/// Accepts every token as the same user.
#[derive(Debug, Clone)]
pub struct AnyTokenAuthenticator {
    user: UserInfo,
}

impl AnyTokenAuthenticator {
    pub fn new(user: UserInfo) -> Self {
        Self { user }
    }
}

impl Default for AnyTokenAuthenticator {
    fn default() -> Self {
        Self::new(UserInfo::new("bob", "Bob"))
    }
}

#[async_trait]
impl Authenticator for AnyTokenAuthenticator {
    async fn authenticate(&self, _token: &str) -> Option<UserInfo> {
        Some(self.user.clone())
    }
}

/// Fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    tokens: HashMap<String, UserInfo>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user: UserInfo) -> Self {
        self.tokens.insert(token.into(), user);
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, token: &str) -> Option<UserInfo> {
        self.tokens.get(token).cloned()
    }
}

/// Grants write on every document and admin to every token.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _doc_id: &str, _user_id: &str) -> Authz {
        Authz::Write
    }

    fn check_admin(&self, _token: &str) -> bool {
        true
    }
}

/// Per-user grants with a fallback level and a set of admin tokens.
#[derive(Debug, Clone)]
pub struct StaticAuthorizer {
    fallback: Authz,
    users: HashMap<String, Authz>,
    admin_tokens: HashSet<String>,
}

impl StaticAuthorizer {
    pub fn new(fallback: Authz) -> Self {
        Self {
            fallback,
            users: HashMap::new(),
            admin_tokens: HashSet::new(),
        }
    }

    pub fn grant(mut self, user_id: impl Into<String>, authz: Authz) -> Self {
        self.users.insert(user_id.into(), authz);
        self
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_tokens.insert(token.into());
        self
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authorize(&self, _doc_id: &str, user_id: &str) -> Authz {
        self.users.get(user_id).copied().unwrap_or(self.fallback)
    }

    fn check_admin(&self, token: &str) -> bool {
        self.admin_tokens.contains(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_authenticator() {
        let authn = StaticAuthenticator::new().with_token("t1", UserInfo::new("alice", "Alice"));
        assert_eq!(authn.authenticate("t1").await.map(|u| u.id), Some("alice".to_string()));
        assert!(authn.authenticate("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_any_token_is_bob() {
        let user = AnyTokenAuthenticator::default().authenticate("whatever").await;
        assert_eq!(user.map(|u| u.name), Some("Bob".to_string()));
    }

    #[tokio::test]
    async fn test_static_authorizer_fallback_and_admin() {
        let authz = StaticAuthorizer::new(Authz::None)
            .grant("alice", Authz::Write)
            .grant("carol", Authz::Read)
            .with_admin_token("root-token");

        assert_eq!(authz.authorize("d", "alice").await, Authz::Write);
        assert_eq!(authz.authorize("d", "carol").await, Authz::Read);
        assert_eq!(authz.authorize("d", "mallory").await, Authz::None);
        assert!(authz.check_admin("root-token"));
        assert!(!authz.check_admin("other"));
        assert!(AllowAll.check_admin("anything"));
    }
}
