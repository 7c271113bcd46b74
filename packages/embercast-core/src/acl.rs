//! Access-control lists bound to authenticated roles.
//!
//! An ACL answers three questions about a client: may it use this HTTP
//! method, may it run this admin command, and may it touch the web surface
//! at all. It also carries the per-role connection limits and extra HTTP
//! headers.

use std::time::Duration;

use crate::admin::AdminCommand;
use crate::protocol::Method;
use crate::utils::str_to_bool;

/// Fixed capacity of the explicit admin command table.
const MAX_ADMIN_COMMANDS: usize = 32;

/// Allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Allow,
    Deny,
}

/// Per-user concurrent connection limit.
///
/// `NotSet` is distinct from `Unlimited`: callers that layer defaults need
/// to know whether the config said anything at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserLimit {
    #[default]
    NotSet,
    Unlimited,
    Max(usize),
}

impl UserLimit {
    /// Parses the attribute form: `*` or `unlimited` mean no limit.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value == "*" || value.eq_ignore_ascii_case("unlimited") {
            return Self::Unlimited;
        }
        match value.parse::<usize>() {
            Ok(0) => Self::Unlimited,
            Ok(n) => Self::Max(n),
            Err(_) => Self::NotSet,
        }
    }
}

/// Access policy set for one role.
#[derive(Debug, Clone)]
pub struct Acl {
    method: Vec<(Method, Policy)>,
    method_fallback: Policy,
    admin_commands: Vec<(AdminCommand, Policy)>,
    admin_fallback: Policy,
    web_policy: Policy,
    max_connection_duration: Option<Duration>,
    max_connections_per_user: UserLimit,
    http_headers: Vec<(String, String)>,
}

impl Acl {
    /// Creates an ACL with the conservative defaults: all methods denied
    /// except `GET` and `OPTIONS`, all admin commands denied except
    /// `buildm3u`, web access allowed, no connection limits.
    #[must_use]
    pub fn new() -> Self {
        let mut acl = Self {
            method: Vec::new(),
            method_fallback: Policy::Deny,
            admin_commands: Vec::new(),
            admin_fallback: Policy::Deny,
            web_policy: Policy::Allow,
            max_connection_duration: None,
            max_connections_per_user: UserLimit::NotSet,
            http_headers: Vec::new(),
        };
        let _ = acl.set_method_str(Policy::Allow, "get,options");
        let _ = acl.set_admin_str(Policy::Allow, "buildm3u");
        acl
    }

    /// Applies `policy` to a comma-separated method list; `*` resets the
    /// explicit entries and sets the fallback.
    pub fn set_method_str(&mut self, policy: Policy, list: &str) -> Result<(), String> {
        for item in comma_items(list) {
            if item == "*" {
                self.method.clear();
                self.method_fallback = policy;
                continue;
            }
            let method = Method::parse(item)
                .ok_or_else(|| format!("unknown HTTP method in ACL: {item:?}"))?;
            self.method.retain(|(m, _)| *m != method);
            self.method.push((method, policy));
        }
        Ok(())
    }

    /// Applies `policy` to a comma-separated admin command list; `*` sets
    /// the catch-all and compresses out entries it makes redundant, while
    /// explicit overrides with the opposite policy survive.
    ///
    /// Exceeding the table capacity returns an error without corrupting the
    /// entries already present.
    pub fn set_admin_str(&mut self, policy: Policy, list: &str) -> Result<(), String> {
        for item in comma_items(list) {
            if item == "*" {
                self.admin_fallback = policy;
                self.admin_commands.retain(|(_, p)| *p != policy);
                continue;
            }
            let command = AdminCommand::parse(item)
                .ok_or_else(|| format!("unknown admin command in ACL: {item:?}"))?;
            if let Some(entry) = self
                .admin_commands
                .iter_mut()
                .find(|(c, _)| *c == command)
            {
                entry.1 = policy;
                continue;
            }
            if self.admin_commands.len() >= MAX_ADMIN_COMMANDS {
                return Err("admin command table full".to_string());
            }
            self.admin_commands.push((command, policy));
        }
        Ok(())
    }

    /// Sets the web surface policy from the attribute form (`*` or a
    /// boolean spelling means allow).
    pub fn set_web_str(&mut self, policy: Policy, value: &str) {
        if value.contains('*') || str_to_bool(value) {
            self.web_policy = policy;
        } else {
            self.web_policy = match policy {
                Policy::Allow => Policy::Deny,
                Policy::Deny => Policy::Allow,
            };
        }
    }

    pub fn set_web_policy(&mut self, policy: Policy) {
        self.web_policy = policy;
    }

    pub fn set_max_connection_duration(&mut self, duration: Option<Duration>) {
        self.max_connection_duration = duration;
    }

    pub fn set_max_connections_per_user(&mut self, limit: UserLimit) {
        self.max_connections_per_user = limit;
    }

    pub fn add_http_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.http_headers.push((name.into(), value.into()));
    }

    /// Policy for an HTTP method.
    #[must_use]
    pub fn test_method(&self, method: Method) -> Policy {
        self.method
            .iter()
            .find(|(m, _)| *m == method)
            .map(|(_, p)| *p)
            .unwrap_or(self.method_fallback)
    }

    /// Policy for an admin command: explicit entry, else catch-all.
    #[must_use]
    pub fn test_admin(&self, command: AdminCommand) -> Policy {
        self.admin_commands
            .iter()
            .find(|(c, _)| *c == command)
            .map(|(_, p)| *p)
            .unwrap_or(self.admin_fallback)
    }

    /// Policy for the plain web surface.
    #[must_use]
    pub fn test_web(&self) -> Policy {
        self.web_policy
    }

    #[must_use]
    pub fn max_connection_duration(&self) -> Option<Duration> {
        self.max_connection_duration
    }

    #[must_use]
    pub fn max_connections_per_user(&self) -> UserLimit {
        self.max_connections_per_user
    }

    #[must_use]
    pub fn http_headers(&self) -> &[(String, String)] {
        &self.http_headers
    }
}

impl Default for Acl {
    fn default() -> Self {
        Self::new()
    }
}

fn comma_items(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}
