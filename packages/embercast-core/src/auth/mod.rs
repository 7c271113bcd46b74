//! Composable authentication.
//!
//! An [`AuthStack`] is an ordered list of authenticators, each bound to a
//! role and an ACL. A request walks the stacks of every scope from
//! innermost to outermost (listener → mount → default mount → global);
//! the composition rules are in [`run_stacks`].

mod anonymous;
mod static_user;
mod url;
mod userfile;

pub use anonymous::AnonymousAuthenticator;
pub use static_user::StaticUserAuthenticator;
pub use url::UrlAuthenticator;
pub use userfile::UserFileAuthenticator;

use std::sync::Arc;

use async_trait::async_trait;

use crate::acl::{Acl, Policy};
use crate::admin::AdminCommand;
use crate::config::{AuthBackendConfig, RoleConfig};
use crate::protocol::Method;

/// Verdict of a single authenticator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    /// Credentials accepted; bind this authenticator's role and ACL.
    Ok,
    /// Credentials presented and wrong; stop the walk.
    Fail,
    /// This authenticator has no opinion; continue outward.
    NoMatch,
    /// The client is known and explicitly refused.
    Forbidden,
    /// Backend temporarily unable to answer.
    Busy,
}

/// What an authenticator sees of the request.
#[derive(Debug, Clone, Default)]
pub struct AuthRequest {
    pub username: Option<String>,
    pub password: Option<String>,
    pub ip: String,
    pub uri: String,
    pub method: Option<Method>,
    pub user_agent: Option<String>,
    /// Set before auth runs so ACLs can rule on the command.
    pub admin_command: Option<AdminCommand>,
}

/// One role's credential check.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Role name bound to clients this authenticator accepts.
    fn role(&self) -> &str;

    /// ACL bound to clients this authenticator accepts.
    fn acl(&self) -> Arc<Acl>;

    /// Decides on the request. Backend failures must map to
    /// [`AuthResult::NoMatch`], never to a denial.
    async fn authenticate(&self, request: &AuthRequest) -> AuthResult;
}

/// Ordered list of authenticators for one scope.
#[derive(Clone, Default)]
pub struct AuthStack {
    entries: Vec<Arc<dyn Authenticator>>,
}

impl AuthStack {
    /// Empty stack; contributes nothing to the walk.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a stack from role configuration.
    pub fn from_config(roles: &[RoleConfig]) -> Result<Self, String> {
        let mut entries: Vec<Arc<dyn Authenticator>> = Vec::with_capacity(roles.len());
        for role in roles {
            let acl = Arc::new(role.build_acl()?);
            let entry: Arc<dyn Authenticator> = match &role.backend {
                AuthBackendConfig::Anonymous => {
                    Arc::new(AnonymousAuthenticator::new(&role.name, acl))
                }
                AuthBackendConfig::StaticUser { username, password } => {
                    Arc::new(StaticUserAuthenticator::new(
                        &role.name,
                        acl,
                        username.as_deref().unwrap_or("source"),
                        password,
                    ))
                }
                AuthBackendConfig::UserFile { path } => {
                    Arc::new(UserFileAuthenticator::new(&role.name, acl, path))
                }
                AuthBackendConfig::Url { url, timeout_secs } => {
                    Arc::new(UrlAuthenticator::new(&role.name, acl, url, *timeout_secs)?)
                }
            };
            entries.push(entry);
        }
        Ok(Self { entries })
    }

    /// Appends an authenticator.
    pub fn push(&mut self, authenticator: Arc<dyn Authenticator>) {
        self.entries.push(authenticator);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[Arc<dyn Authenticator>] {
        &self.entries
    }
}

/// Role, username and ACL bound to a client after a successful walk.
#[derive(Clone)]
pub struct AuthBinding {
    pub role: String,
    pub username: Option<String>,
    pub acl: Arc<Acl>,
}

/// Final decision for a request after walking every scope.
#[derive(Clone)]
pub enum AuthDecision {
    /// Access granted with this binding.
    Granted(AuthBinding),
    /// Nothing matched (or credentials were wrong): 401.
    NeedsAuth,
    /// Explicitly refused: 403.
    Forbidden,
    /// A backend asked the client to retry later: 503.
    Busy,
}

/// Walks the scopes innermost-first and composes the per-authenticator
/// results:
///
/// - `Ok` stops the walk and grants, unless the request is an admin
///   command the accepting ACL denies: then the acceptance is not an
///   override and the walk continues outward (so a mount role never
///   unlocks a command the outer table must rule on, while an outer admin
///   role still bypasses inner mount stacks that had no opinion).
/// - `Fail`, `Forbidden` and `Busy` stop the walk with their denial.
/// - `NoMatch` moves to the next authenticator, then the next scope.
pub async fn run_stacks(scopes: &[&AuthStack], request: &AuthRequest) -> AuthDecision {
    let mut denied_by_acl = false;

    for scope in scopes {
        for authenticator in scope.entries() {
            match authenticator.authenticate(request).await {
                AuthResult::Ok => {
                    let acl = authenticator.acl();
                    if let Some(command) = request.admin_command {
                        if acl.test_admin(command) == Policy::Deny {
                            denied_by_acl = true;
                            continue;
                        }
                    }
                    return AuthDecision::Granted(AuthBinding {
                        role: authenticator.role().to_string(),
                        username: request.username.clone(),
                        acl,
                    });
                }
                AuthResult::Fail => return AuthDecision::NeedsAuth,
                AuthResult::NoMatch => continue,
                AuthResult::Forbidden => return AuthDecision::Forbidden,
                AuthResult::Busy => return AuthDecision::Busy,
            }
        }
    }

    if denied_by_acl {
        AuthDecision::Forbidden
    } else {
        AuthDecision::NeedsAuth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedAuthenticator {
        role: String,
        acl: Arc<Acl>,
        result: AuthResult,
    }

    impl FixedAuthenticator {
        fn arc(role: &str, result: AuthResult) -> Arc<dyn Authenticator> {
            Arc::new(Self {
                role: role.to_string(),
                acl: Arc::new(Acl::new()),
                result,
            })
        }

        fn arc_with_acl(role: &str, result: AuthResult, acl: Acl) -> Arc<dyn Authenticator> {
            Arc::new(Self {
                role: role.to_string(),
                acl: Arc::new(acl),
                result,
            })
        }
    }

    #[async_trait]
    impl Authenticator for FixedAuthenticator {
        fn role(&self) -> &str {
            &self.role
        }

        fn acl(&self) -> Arc<Acl> {
            Arc::clone(&self.acl)
        }

        async fn authenticate(&self, _request: &AuthRequest) -> AuthResult {
            self.result
        }
    }

    fn stack(results: &[(&str, AuthResult)]) -> AuthStack {
        let mut s = AuthStack::new();
        for (role, result) in results {
            s.push(FixedAuthenticator::arc(role, *result));
        }
        s
    }

    #[tokio::test]
    async fn inner_ok_stops_outer_scopes() {
        let inner = stack(&[("listener", AuthResult::Ok)]);
        let outer = stack(&[("global", AuthResult::Forbidden)]);
        match run_stacks(&[&inner, &outer], &AuthRequest::default()).await {
            AuthDecision::Granted(binding) => assert_eq!(binding.role, "listener"),
            _ => panic!("expected grant from inner scope"),
        }
    }

    #[tokio::test]
    async fn nomatch_falls_through_scopes() {
        let inner = stack(&[("listener", AuthResult::NoMatch)]);
        let outer = stack(&[("global", AuthResult::Ok)]);
        match run_stacks(&[&inner, &outer], &AuthRequest::default()).await {
            AuthDecision::Granted(binding) => assert_eq!(binding.role, "global"),
            _ => panic!("expected grant from outer scope"),
        }
    }

    #[tokio::test]
    async fn fail_stops_the_walk() {
        let inner = stack(&[("listener", AuthResult::Fail)]);
        let outer = stack(&[("global", AuthResult::Ok)]);
        assert!(matches!(
            run_stacks(&[&inner, &outer], &AuthRequest::default()).await,
            AuthDecision::NeedsAuth
        ));
    }

    #[tokio::test]
    async fn forbidden_and_busy_stop_the_walk() {
        let forbidden = stack(&[("x", AuthResult::Forbidden)]);
        assert!(matches!(
            run_stacks(&[&forbidden], &AuthRequest::default()).await,
            AuthDecision::Forbidden
        ));
        let busy = stack(&[("x", AuthResult::Busy)]);
        assert!(matches!(
            run_stacks(&[&busy], &AuthRequest::default()).await,
            AuthDecision::Busy
        ));
    }

    #[tokio::test]
    async fn exhausted_scopes_need_auth() {
        let a = stack(&[("a", AuthResult::NoMatch)]);
        let b = stack(&[("b", AuthResult::NoMatch)]);
        assert!(matches!(
            run_stacks(&[&a, &b], &AuthRequest::default()).await,
            AuthDecision::NeedsAuth
        ));
    }

    #[tokio::test]
    async fn admin_denied_acceptance_is_not_an_override() {
        // Mount role accepts but its ACL denies the admin command; the
        // global role's table decides instead.
        let mut mount_acl = Acl::new();
        mount_acl.set_admin_str(Policy::Deny, "killsource").unwrap();
        let mut global_acl = Acl::new();
        global_acl.set_admin_str(Policy::Allow, "killsource").unwrap();

        let mount = {
            let mut s = AuthStack::new();
            s.push(FixedAuthenticator::arc_with_acl(
                "mount-admin",
                AuthResult::Ok,
                mount_acl,
            ));
            s
        };
        let global = {
            let mut s = AuthStack::new();
            s.push(FixedAuthenticator::arc_with_acl(
                "global-admin",
                AuthResult::Ok,
                global_acl,
            ));
            s
        };

        let request = AuthRequest {
            admin_command: Some(AdminCommand::KillSource),
            ..AuthRequest::default()
        };
        match run_stacks(&[&mount, &global], &request).await {
            AuthDecision::Granted(binding) => assert_eq!(binding.role, "global-admin"),
            _ => panic!("expected outer table to rule"),
        }
    }

    #[tokio::test]
    async fn admin_denied_everywhere_is_forbidden() {
        let mut acl = Acl::new();
        acl.set_admin_str(Policy::Deny, "killsource").unwrap();
        let only = {
            let mut s = AuthStack::new();
            s.push(FixedAuthenticator::arc_with_acl("r", AuthResult::Ok, acl));
            s
        };
        let request = AuthRequest {
            admin_command: Some(AdminCommand::KillSource),
            ..AuthRequest::default()
        };
        assert!(matches!(
            run_stacks(&[&only], &request).await,
            AuthDecision::Forbidden
        ));
    }

    /// Exercise the composition table over a spread of generated stacks.
    #[tokio::test]
    async fn composition_table_holds_for_generated_stacks() {
        use AuthResult::*;
        let results = [Ok, Fail, NoMatch, Forbidden, Busy];

        // Two scopes, one authenticator each: 25 combinations.
        for inner in results {
            for outer in results {
                let inner_stack = stack(&[("inner", inner)]);
                let outer_stack = stack(&[("outer", outer)]);
                let decision =
                    run_stacks(&[&inner_stack, &outer_stack], &AuthRequest::default()).await;

                let expected_role = match (inner, outer) {
                    (Ok, _) => Some("inner"),
                    (NoMatch, Ok) => Some("outer"),
                    _ => None,
                };
                match (expected_role, &decision) {
                    (Some(role), AuthDecision::Granted(b)) => assert_eq!(b.role.as_str(), role),
                    (Some(role), _) => panic!("expected grant from {role}"),
                    (None, AuthDecision::Granted(b)) => {
                        panic!("unexpected grant from {}", b.role)
                    }
                    (None, _) => {
                        // The denial kind follows the first non-NoMatch result.
                        let first = if inner != NoMatch { inner } else { outer };
                        let ok = match first {
                            Fail | NoMatch => matches!(decision, AuthDecision::NeedsAuth),
                            Forbidden => matches!(decision, AuthDecision::Forbidden),
                            Busy => matches!(decision, AuthDecision::Busy),
                            Ok => unreachable!(),
                        };
                        assert!(ok, "wrong denial for ({inner:?}, {outer:?})");
                    }
                }
            }
        }
    }
}
