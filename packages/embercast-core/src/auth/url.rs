//! URL-callback authenticator.
//!
//! Posts the request parameters to an external endpoint and reads the
//! decision from the response. A broken or unreachable endpoint yields
//! `NoMatch`, never a denial, so an outage cannot lock every client out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::acl::Acl;

use super::{AuthRequest, AuthResult, Authenticator};

/// Response header that grants access when set to `1`.
const AUTH_GRANT_HEADER: &str = "x-embercast-auth-user";

/// Delegates the auth decision to an HTTP endpoint.
pub struct UrlAuthenticator {
    role: String,
    acl: Arc<Acl>,
    url: String,
    client: reqwest::Client,
}

impl UrlAuthenticator {
    pub fn new(role: &str, acl: Arc<Acl>, url: &str, timeout_secs: u64) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| format!("auth client construction failed: {e}"))?;
        Ok(Self {
            role: role.to_string(),
            acl,
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl Authenticator for UrlAuthenticator {
    fn role(&self) -> &str {
        &self.role
    }

    fn acl(&self) -> Arc<Acl> {
        Arc::clone(&self.acl)
    }

    async fn authenticate(&self, request: &AuthRequest) -> AuthResult {
        let params = [
            ("action", "listener_add"),
            ("mount", request.uri.as_str()),
            ("user", request.username.as_deref().unwrap_or("")),
            ("pass", request.password.as_deref().unwrap_or("")),
            ("ip", request.ip.as_str()),
            ("agent", request.user_agent.as_deref().unwrap_or("")),
        ];

        let response = match self.client.post(&self.url).form(&params).send().await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("auth endpoint {} unreachable: {}", self.url, e);
                return AuthResult::NoMatch;
            }
        };

        if response.status() == reqwest::StatusCode::FORBIDDEN {
            return AuthResult::Forbidden;
        }
        if !response.status().is_success() {
            log::warn!(
                "auth endpoint {} answered {}; ignoring",
                self.url,
                response.status()
            );
            return AuthResult::NoMatch;
        }

        let granted = response
            .headers()
            .get(AUTH_GRANT_HEADER)
            .and_then(|v| v.to_str().ok())
            == Some("1");

        if granted {
            AuthResult::Ok
        } else {
            AuthResult::Fail
        }
    }
}
