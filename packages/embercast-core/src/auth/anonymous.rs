//! The anonymous authenticator: accepts everyone, binds a role.

use std::sync::Arc;

use async_trait::async_trait;

use crate::acl::Acl;

use super::{AuthRequest, AuthResult, Authenticator};

/// Accepts every client without looking at credentials.
pub struct AnonymousAuthenticator {
    role: String,
    acl: Arc<Acl>,
}

impl AnonymousAuthenticator {
    #[must_use]
    pub fn new(role: &str, acl: Arc<Acl>) -> Self {
        Self {
            role: role.to_string(),
            acl,
        }
    }
}

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    fn role(&self) -> &str {
        &self.role
    }

    fn acl(&self) -> Arc<Acl> {
        Arc::clone(&self.acl)
    }

    async fn authenticate(&self, _request: &AuthRequest) -> AuthResult {
        AuthResult::Ok
    }
}
