//! Configuration types consumed by the engine.
//!
//! Everything the core needs at runtime is reachable from [`Config`]:
//! listen sockets, resource rewrites, mount definitions, relays, limits,
//! authentication roles and event registrations. The server binary
//! deserializes its config file into these types; embedding hosts build
//! them directly.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::acl::{Acl, Policy, UserLimit};

/// TLS handling mode for a listen socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// No TLS at all.
    #[default]
    Disabled,
    /// Plain and TLS clients both accepted.
    Auto,
    /// TLS required; plain clients refused.
    AutoNoPlain,
    /// TLS via `Upgrade: TLS/1.0` (RFC 2817).
    Rfc2817,
    /// TLS as the transport from byte one (RFC 2818).
    Rfc2818,
}

impl TlsMode {
    /// Whether a plain (non-TLS) request may be served in this mode.
    ///
    /// RFC 2817 sockets accept plain connections only long enough to carry
    /// the upgrade; a plain request without one is refused.
    #[must_use]
    pub fn allows_plain(self) -> bool {
        matches!(self, Self::Disabled | Self::Auto)
    }

    /// Whether plain clients must be told to upgrade.
    #[must_use]
    pub fn requires_upgrade(self) -> bool {
        matches!(self, Self::AutoNoPlain | Self::Rfc2817 | Self::Rfc2818)
    }
}

/// One listen socket definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenSpec {
    /// Bind address; `None` binds the wildcard address.
    pub bind_address: Option<String>,
    pub port: u16,
    /// Stable identifier other listeners and resource rules can refer to.
    pub id: Option<String>,
    /// Another listener this one fronts for (proxy setups); connections
    /// accepted here resolve their effective listener through this id.
    pub on_behalf_of: Option<String>,
    pub tls_mode: TlsMode,
    /// Accept the legacy bare-password source handshake on this socket.
    pub shoutcast_compat: bool,
    /// Mount used for legacy source clients on this socket.
    pub shoutcast_mount: Option<String>,
    /// Advertised for policy decisions only; no OS socket is bound.
    pub virtual_only: bool,
    /// Listener-scope authentication, innermost scope of the auth walk.
    pub auth: Vec<RoleConfig>,
}

impl Default for ListenSpec {
    fn default() -> Self {
        Self {
            bind_address: None,
            port: 8000,
            id: None,
            on_behalf_of: None,
            tls_mode: TlsMode::Disabled,
            shoutcast_compat: false,
            shoutcast_mount: None,
            virtual_only: false,
            auth: Vec::new(),
        }
    }
}

impl ListenSpec {
    /// Identity for reconfigure-in-place matching.
    #[must_use]
    pub fn identity(&self) -> (Option<&str>, u16) {
        (self.bind_address.as_deref(), self.port)
    }
}

/// Operation mode a resource rewrite can force on a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    #[default]
    Default,
    Normal,
    Legacy,
    Strict,
}

/// One entry of the resource/alias rewrite list. First match wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRule {
    /// Source URI to match.
    pub source: String,
    /// Prefix match instead of exact; the matched prefix is replaced and
    /// the tail preserved.
    pub prefix_match: bool,
    /// Rewrite target; `None` keeps the URI and only applies side effects.
    pub destination: Option<String>,
    /// Restrict to connections on this server port.
    pub port: Option<u16>,
    /// Restrict to this bind address.
    pub bind_address: Option<String>,
    /// Restrict to the listener with this id.
    pub listen_socket_id: Option<String>,
    /// Restrict to this `Host` header value.
    pub vhost: Option<String>,
    pub omode: Option<OperationMode>,
    /// Module handling the rewritten resource.
    pub module: Option<String>,
    /// Handler function within that module.
    pub handler: Option<String>,
}

/// Authentication backend for one role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthBackendConfig {
    /// Matches every client without credentials.
    Anonymous,
    /// A single fixed credential pair; `username` defaults to `source`.
    StaticUser {
        username: Option<String>,
        password: String,
    },
    /// Credential file of `user:sha256-hex` lines, reloaded on change.
    UserFile { path: PathBuf },
    /// POST to an external endpoint that answers the auth decision.
    Url {
        url: String,
        #[serde(default = "default_url_auth_timeout")]
        timeout_secs: u64,
    },
}

fn default_url_auth_timeout() -> u64 {
    5
}

/// One role of an authentication stack, with its ACL attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleConfig {
    pub name: String,
    pub backend: AuthBackendConfig,
    pub allow_method: Option<String>,
    pub deny_method: Option<String>,
    pub allow_admin: Option<String>,
    pub deny_admin: Option<String>,
    pub allow_web: Option<String>,
    pub deny_web: Option<String>,
    /// Seconds; `None` means unlimited.
    pub max_connection_duration: Option<u64>,
    /// Attribute form; `*`/`unlimited`/`0` mean unlimited.
    pub connections_per_user: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            name: "anonymous".to_string(),
            backend: AuthBackendConfig::Anonymous,
            allow_method: None,
            deny_method: None,
            allow_admin: None,
            deny_admin: None,
            allow_web: None,
            deny_web: None,
            max_connection_duration: None,
            connections_per_user: None,
            headers: Vec::new(),
        }
    }
}

impl RoleConfig {
    /// Builds the ACL from the attribute form.
    pub fn build_acl(&self) -> Result<Acl, String> {
        let mut acl = Acl::new();
        if let Some(list) = &self.deny_method {
            acl.set_method_str(Policy::Deny, list)?;
        }
        if let Some(list) = &self.allow_method {
            acl.set_method_str(Policy::Allow, list)?;
        }
        if let Some(list) = &self.deny_admin {
            acl.set_admin_str(Policy::Deny, list)?;
        }
        if let Some(list) = &self.allow_admin {
            acl.set_admin_str(Policy::Allow, list)?;
        }
        if let Some(value) = &self.deny_web {
            acl.set_web_str(Policy::Deny, value);
        }
        if let Some(value) = &self.allow_web {
            acl.set_web_str(Policy::Allow, value);
        }
        acl.set_max_connection_duration(self.max_connection_duration.map(Duration::from_secs));
        if let Some(value) = &self.connections_per_user {
            acl.set_max_connections_per_user(UserLimit::parse(value));
        }
        for (name, value) in &self.headers {
            acl.add_http_header(name, value);
        }
        Ok(acl)
    }
}

/// Backend of an event registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBackendConfig {
    /// Write the event to the log at the given level.
    Log { level: Option<String> },
    /// Run an external program with the event in its environment.
    Exec { program: PathBuf },
    /// POST the event to an HTTP endpoint.
    Url { url: String },
    /// Shut the server down.
    Terminate,
}

/// Binds a trigger name to a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRegistration {
    /// Trigger this registration fires on; `*` fires on everything.
    pub trigger: String,
    pub backend: EventBackendConfig,
}

/// Mount definition kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountType {
    #[default]
    Normal,
    /// Template applied to every mount without a normal definition.
    Default,
}

/// What a full mount with a fallback does about listeners already parked on
/// the fallback when this mount (re)appears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackOverride {
    /// Never pull listeners back.
    #[default]
    None,
    /// Pull every listener currently on the fallback mount.
    All,
    /// Pull only listeners that originally requested this mount.
    Own,
}

/// Per-mount configuration, applied to a source when it attaches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub mount_name: String,
    pub mount_type: MountType,
    /// Mirror the broadcast queue into this file while the source runs.
    pub dumpfile: Option<PathBuf>,
    /// File streamed to a listener before it joins the burst.
    pub intro_filename: Option<PathBuf>,
    pub fallback_when_full: bool,
    /// `None` means unlimited.
    pub max_listeners: Option<usize>,
    pub fallback_mount: Option<String>,
    pub fallback_override: FallbackOverride,
    /// Reject direct source connections to this mount.
    pub no_mount: bool,
    /// Bytes of recent stream replayed to a newly attached listener.
    pub burst_size: Option<usize>,
    /// Upper bound in bytes on the broadcast queue.
    pub queue_size_limit: Option<usize>,
    pub hidden: bool,
    /// Seconds of upstream silence before the source is considered dead.
    pub source_timeout: Option<u64>,
    pub charset: Option<String>,
    /// Byte interval between in-band metadata blocks for MP3 listeners.
    pub mp3_meta_interval: Option<usize>,
    pub http_headers: Vec<(String, String)>,
    pub max_history: Option<usize>,
    pub cluster_password: Option<String>,
    pub auth: Vec<RoleConfig>,
    /// Seconds a listener may stay connected; `None` means unlimited.
    pub max_listener_duration: Option<u64>,
    pub on_demand: bool,
    pub stream_name: Option<String>,
    pub stream_description: Option<String>,
    pub stream_url: Option<String>,
    pub stream_genre: Option<String>,
    pub bitrate: Option<String>,
    pub stream_type: Option<String>,
    pub subtype: Option<String>,
    pub yp_public: bool,
    pub events: Vec<EventRegistration>,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mount_name: String::new(),
            mount_type: MountType::Normal,
            dumpfile: None,
            intro_filename: None,
            fallback_when_full: false,
            max_listeners: None,
            fallback_mount: None,
            fallback_override: FallbackOverride::None,
            no_mount: false,
            burst_size: None,
            queue_size_limit: None,
            hidden: false,
            source_timeout: None,
            charset: None,
            mp3_meta_interval: None,
            http_headers: Vec::new(),
            max_history: None,
            cluster_password: None,
            auth: Vec::new(),
            max_listener_duration: None,
            on_demand: false,
            stream_name: None,
            stream_description: None,
            stream_url: None,
            stream_genre: None,
            bitrate: None,
            stream_type: None,
            subtype: None,
            yp_public: false,
            events: Vec::new(),
        }
    }
}

/// One upstream relay pulled into a local mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Upstream URL, e.g. `http://radio.example:8000/live`.
    pub upstream: String,
    pub local_mount: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Connect upstream only while local listeners exist.
    pub on_demand: bool,
    /// Seconds between reconnect attempts (doubled up to a cap).
    pub retry_delay: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream: String::new(),
            local_mount: String::new(),
            username: None,
            password: None,
            on_demand: false,
            retry_delay: 5,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hostname: String,
    pub location: String,
    pub admin_contact: String,

    pub listen: Vec<ListenSpec>,
    pub resources: Vec<ResourceRule>,
    pub mounts: Vec<MountConfig>,
    pub relays: Vec<RelayConfig>,

    /// Global authentication stack, outermost scope.
    pub authentication: Vec<RoleConfig>,
    /// Global event registrations.
    pub events: Vec<EventRegistration>,

    // Limits
    pub client_limit: usize,
    pub source_limit: usize,
    /// Seconds a fresh connection may take to deliver its header.
    pub header_timeout: u64,
    /// Default seconds of upstream silence before a source dies.
    pub source_timeout: u64,
    /// Largest request body accepted on the plain web surface.
    pub body_size_limit: usize,
    pub burst_size: usize,
    pub queue_size_limit: usize,
    /// Workers draining the accept queue.
    pub handler_threads: usize,

    /// Mount used for legacy source clients when the listener has no
    /// override.
    pub shoutcast_mount: String,
    /// Path of the server-sent-events surface.
    pub event_stream_path: String,
    /// Root of the static file area; `None` disables file serving.
    pub webroot: Option<PathBuf>,
    /// File of client IPs allowed to connect; absent allows everyone.
    pub allow_ip: Option<PathBuf>,
    /// File of client IPs refused at accept time.
    pub deny_ip: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            location: "Earth".to_string(),
            admin_contact: "admin@localhost".to_string(),
            listen: vec![ListenSpec::default()],
            resources: Vec::new(),
            mounts: Vec::new(),
            relays: Vec::new(),
            // Listeners are anonymous unless a deployment says otherwise.
            authentication: vec![RoleConfig::default()],
            events: Vec::new(),
            client_limit: 256,
            source_limit: 16,
            header_timeout: 15,
            source_timeout: 10,
            body_size_limit: 64 * 1024,
            burst_size: 64 * 1024,
            queue_size_limit: 512 * 1024,
            handler_threads: 4,
            shoutcast_mount: "/stream".to_string(),
            event_stream_path: "/events".to_string(),
            webroot: None,
            allow_ip: None,
            deny_ip: None,
        }
    }
}

impl Config {
    /// Validates invariants a default-constructed config already satisfies.
    pub fn validate(&self) -> Result<(), String> {
        if self.listen.is_empty() {
            return Err("at least one listen socket is required".to_string());
        }
        if self.handler_threads == 0 {
            return Err("handler_threads must be >= 1".to_string());
        }
        if self.queue_size_limit == 0 {
            return Err("queue_size_limit must be >= 1".to_string());
        }
        if self.burst_size > self.queue_size_limit {
            return Err("burst_size must not exceed queue_size_limit".to_string());
        }
        for mount in &self.mounts {
            if mount.mount_type == MountType::Normal && !mount.mount_name.starts_with('/') {
                return Err(format!(
                    "mount name {:?} must start with '/'",
                    mount.mount_name
                ));
            }
        }
        for relay in &self.relays {
            if !relay.local_mount.starts_with('/') {
                return Err(format!(
                    "relay mount {:?} must start with '/'",
                    relay.local_mount
                ));
            }
        }
        Ok(())
    }

    /// The NORMAL mount definition for `mount`, if any.
    #[must_use]
    pub fn find_mount(&self, mount: &str) -> Option<&MountConfig> {
        self.mounts
            .iter()
            .find(|m| m.mount_type == MountType::Normal && m.mount_name == mount)
    }

    /// The DEFAULT mount template, if any.
    #[must_use]
    pub fn default_mount(&self) -> Option<&MountConfig> {
        self.mounts
            .iter()
            .find(|m| m.mount_type == MountType::Default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn mount_names_must_be_absolute() {
        let mut config = Config::default();
        config.mounts.push(MountConfig {
            mount_name: "relative".to_string(),
            ..MountConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_template_skips_name_check() {
        let mut config = Config::default();
        config.mounts.push(MountConfig {
            mount_type: MountType::Default,
            ..MountConfig::default()
        });
        assert!(config.validate().is_ok());
        assert!(config.default_mount().is_some());
    }

    #[test]
    fn find_mount_ignores_default_template() {
        let mut config = Config::default();
        config.mounts.push(MountConfig {
            mount_type: MountType::Default,
            ..MountConfig::default()
        });
        config.mounts.push(MountConfig {
            mount_name: "/live".to_string(),
            ..MountConfig::default()
        });
        assert!(config.find_mount("/live").is_some());
        assert!(config.find_mount("").is_none());
    }

    #[test]
    fn tls_mode_plain_policy() {
        assert!(TlsMode::Disabled.allows_plain());
        assert!(TlsMode::Auto.allows_plain());
        assert!(!TlsMode::Rfc2817.allows_plain());
        assert!(!TlsMode::AutoNoPlain.allows_plain());
        assert!(!TlsMode::Rfc2818.allows_plain());
    }

    #[test]
    fn burst_cannot_exceed_queue() {
        let config = Config {
            burst_size: 1024,
            queue_size_limit: 512,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
