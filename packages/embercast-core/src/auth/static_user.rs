//! Fixed-credential authenticator, the classic single source password.

use std::sync::Arc;

use async_trait::async_trait;

use crate::acl::Acl;

use super::{AuthRequest, AuthResult, Authenticator};

/// Matches exactly one username/password pair.
pub struct StaticUserAuthenticator {
    role: String,
    acl: Arc<Acl>,
    username: String,
    password: String,
}

impl StaticUserAuthenticator {
    #[must_use]
    pub fn new(role: &str, acl: Arc<Acl>, username: &str, password: &str) -> Self {
        Self {
            role: role.to_string(),
            acl,
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

#[async_trait]
impl Authenticator for StaticUserAuthenticator {
    fn role(&self) -> &str {
        &self.role
    }

    fn acl(&self) -> Arc<Acl> {
        Arc::clone(&self.acl)
    }

    async fn authenticate(&self, request: &AuthRequest) -> AuthResult {
        let Some(username) = request.username.as_deref() else {
            return AuthResult::NoMatch;
        };
        if username != self.username {
            return AuthResult::NoMatch;
        }
        match request.password.as_deref() {
            Some(password) if password == self.password => AuthResult::Ok,
            _ => AuthResult::Fail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> StaticUserAuthenticator {
        StaticUserAuthenticator::new("source", Arc::new(Acl::new()), "source", "hackme")
    }

    fn request(user: Option<&str>, pass: Option<&str>) -> AuthRequest {
        AuthRequest {
            username: user.map(String::from),
            password: pass.map(String::from),
            ..AuthRequest::default()
        }
    }

    #[tokio::test]
    async fn correct_credentials_accepted() {
        assert_eq!(
            auth().authenticate(&request(Some("source"), Some("hackme"))).await,
            AuthResult::Ok
        );
    }

    #[tokio::test]
    async fn wrong_password_fails() {
        assert_eq!(
            auth().authenticate(&request(Some("source"), Some("wrong"))).await,
            AuthResult::Fail
        );
        assert_eq!(
            auth().authenticate(&request(Some("source"), None)).await,
            AuthResult::Fail
        );
    }

    #[tokio::test]
    async fn other_users_fall_through() {
        assert_eq!(
            auth().authenticate(&request(Some("bob"), Some("hackme"))).await,
            AuthResult::NoMatch
        );
        assert_eq!(
            auth().authenticate(&request(None, None)).await,
            AuthResult::NoMatch
        );
    }
}
