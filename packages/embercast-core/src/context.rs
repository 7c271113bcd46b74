//! The server context: shared state threaded through every component.
//!
//! One instance per server. Holds the live configuration, the source
//! registry, counters, the event bus, and the shutdown signal. Components
//! receive an `Arc<ServerContext>` from bootstrap instead of reaching for
//! globals; the watch-based shutdown flag is the only process-wide signal.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{watch, Notify};
use uuid::Uuid;

use crate::auth::AuthStack;
use crate::config::{Config, MountType};
use crate::events::stream::EventStreamHub;
use crate::events::{Event, EventBus};
use crate::module::ModuleContainer;
use crate::net::listen::ListenContainer;
use crate::stats::Stats;
use crate::stream::SourceRegistry;
use crate::tls::TlsProvider;

/// Shared server state.
pub struct ServerContext {
    config: RwLock<Arc<Config>>,
    pub sources: SourceRegistry,
    pub stats: Arc<Stats>,
    pub events: Arc<EventBus>,
    pub event_hub: Arc<EventStreamHub>,
    pub modules: Arc<ModuleContainer>,
    pub listen: Arc<ListenContainer>,
    pub tls: Arc<dyn TlsProvider>,
    /// Wakeups for on-demand relays, keyed by local mount.
    pub relay_demand: DashMap<String, Arc<Notify>>,
    /// Stable id for this server run.
    pub instance_uuid: String,

    clients: Arc<AtomicUsize>,
    /// Active sources, bounded by `source_limit`.
    pub sources_active: AtomicUsize,
    per_user: Arc<DashMap<String, usize>>,
    next_connection_id: AtomicU64,

    global_auth: RwLock<Arc<AuthStack>>,
    mount_auth_cache: DashMap<String, Arc<AuthStack>>,

    geoip: RwLock<Option<Arc<dyn crate::net::GeoIp>>>,
    ip_filter: RwLock<IpFilter>,

    shutdown_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct IpFilter {
    allow: Option<crate::matchfile::Matchfile>,
    deny: Option<crate::matchfile::Matchfile>,
}

impl IpFilter {
    fn from_config(config: &Config) -> Self {
        Self {
            allow: config.allow_ip.as_ref().map(crate::matchfile::Matchfile::new),
            deny: config.deny_ip.as_ref().map(crate::matchfile::Matchfile::new),
        }
    }
}

impl ServerContext {
    /// Builds a context around a validated configuration.
    pub fn new(
        config: Config,
        tls: Arc<dyn TlsProvider>,
        events: Arc<EventBus>,
        event_hub: Arc<EventStreamHub>,
        stats: Arc<Stats>,
    ) -> Result<Arc<Self>, String> {
        config.validate()?;
        let global_auth = Arc::new(AuthStack::from_config(&config.authentication)?);
        let ip_filter = IpFilter::from_config(&config);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            sources: SourceRegistry::new(),
            stats,
            events,
            event_hub,
            modules: Arc::new(ModuleContainer::new()),
            listen: Arc::new(ListenContainer::new()),
            tls,
            relay_demand: DashMap::new(),
            instance_uuid: Uuid::new_v4().to_string(),
            clients: Arc::new(AtomicUsize::new(0)),
            sources_active: AtomicUsize::new(0),
            per_user: Arc::new(DashMap::new()),
            next_connection_id: AtomicU64::new(1),
            global_auth: RwLock::new(global_auth),
            mount_auth_cache: DashMap::new(),
            geoip: RwLock::new(None),
            ip_filter: RwLock::new(ip_filter),
            shutdown_tx,
        }))
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read())
    }

    /// Swaps in a new configuration. A failing config leaves the previous
    /// one in place.
    pub fn set_config(&self, config: Config) -> Result<(), String> {
        config.validate()?;
        let global_auth = Arc::new(AuthStack::from_config(&config.authentication)?);
        *self.ip_filter.write() = IpFilter::from_config(&config);
        *self.config.write() = Arc::new(config);
        *self.global_auth.write() = global_auth;
        self.mount_auth_cache.clear();
        self.reapply_config();
        Ok(())
    }

    /// Accept-time IP policy from the configured allow/deny lists.
    #[must_use]
    pub fn ip_allowed(&self, ip: &str) -> bool {
        let filter = self.ip_filter.read();
        crate::matchfile::match_allow_deny(filter.allow.as_ref(), filter.deny.as_ref(), Some(ip))
    }

    /// Re-applies listener configuration from the current config.
    pub fn reapply_config(&self) {
        let config = self.config();
        self.listen.configure(&config.listen);
    }

    // ── Counters ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn client_counter(&self) -> &Arc<AtomicUsize> {
        &self.clients
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Registers one more connection for a credential; the guard releases
    /// the slot on drop.
    #[must_use]
    pub fn acquire_user_slot(&self, username: &str) -> (usize, UserSlot) {
        let mut entry = self.per_user.entry(username.to_string()).or_insert(0);
        *entry += 1;
        let count = *entry;
        drop(entry);
        (
            count,
            UserSlot {
                map: Arc::clone(&self.per_user),
                username: username.to_string(),
            },
        )
    }

    // ── Authentication scopes ────────────────────────────────────────────

    #[must_use]
    pub fn global_auth(&self) -> Arc<AuthStack> {
        Arc::clone(&self.global_auth.read())
    }

    /// The auth stack configured on a listen socket, built lazily and
    /// cached by socket identity.
    #[must_use]
    pub fn listen_auth(&self, spec: &crate::config::ListenSpec) -> Option<Arc<AuthStack>> {
        if spec.auth.is_empty() {
            return None;
        }
        let key = format!(
            "listen:{}:{}",
            spec.bind_address.as_deref().unwrap_or("*"),
            spec.port
        );
        if let Some(cached) = self.mount_auth_cache.get(&key) {
            return Some(Arc::clone(cached.value()));
        }
        match AuthStack::from_config(&spec.auth) {
            Ok(stack) => {
                let stack = Arc::new(stack);
                self.mount_auth_cache.insert(key, Arc::clone(&stack));
                Some(stack)
            }
            Err(e) => {
                log::error!("listener auth stack unusable: {e}");
                None
            }
        }
    }

    /// The auth stack of a NORMAL mount definition, built lazily.
    #[must_use]
    pub fn mount_auth(&self, mount: &str) -> Option<Arc<AuthStack>> {
        self.mount_scope_auth(mount, MountType::Normal)
    }

    /// The auth stack of the DEFAULT mount template, built lazily.
    #[must_use]
    pub fn default_mount_auth(&self) -> Option<Arc<AuthStack>> {
        self.mount_scope_auth("", MountType::Default)
    }

    fn mount_scope_auth(&self, mount: &str, kind: MountType) -> Option<Arc<AuthStack>> {
        let key = match kind {
            MountType::Normal => format!("normal:{mount}"),
            MountType::Default => "default".to_string(),
        };
        if let Some(cached) = self.mount_auth_cache.get(&key) {
            return Some(Arc::clone(cached.value()));
        }
        let config = self.config();
        let roles = match kind {
            MountType::Normal => &config.find_mount(mount)?.auth,
            MountType::Default => &config.default_mount()?.auth,
        };
        if roles.is_empty() {
            return None;
        }
        match AuthStack::from_config(roles) {
            Ok(stack) => {
                let stack = Arc::new(stack);
                self.mount_auth_cache.insert(key, Arc::clone(&stack));
                Some(stack)
            }
            Err(e) => {
                log::error!("mount auth stack for {mount:?} unusable: {e}");
                None
            }
        }
    }

    // ── External collaborators ───────────────────────────────────────────

    /// Wires in an IP-to-location provider.
    pub fn set_geoip(&self, provider: Arc<dyn crate::net::GeoIp>) {
        *self.geoip.write() = Some(provider);
    }

    #[must_use]
    pub fn geoip(&self) -> Option<Arc<dyn crate::net::GeoIp>> {
        self.geoip.read().clone()
    }

    // ── Events ───────────────────────────────────────────────────────────

    /// Emits a slow event, capturing the matching registration lists
    /// (mount first, then global) at this instant.
    pub fn emit_event(&self, mut event: Event) {
        let config = self.config();
        let mut registrations = Vec::new();
        if let Some(mount) = &event.mount {
            if let Some(mount_config) = config.find_mount(mount) {
                registrations.extend(mount_config.events.iter().cloned());
            }
        }
        registrations.extend(config.events.iter().cloned());
        event.registrations = registrations;
        self.events.emit(event);
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Signals every loop to finish.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    #[must_use]
    pub fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow()
    }
}

/// Releases a per-credential connection slot on drop.
pub struct UserSlot {
    map: Arc<DashMap<String, usize>>,
    username: String,
}

impl Drop for UserSlot {
    fn drop(&mut self) {
        if let Some(mut entry) = self.map.get_mut(&self.username) {
            *entry = entry.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::NoTlsProvider;

    fn context() -> Arc<ServerContext> {
        let (bus, _rx) = EventBus::new();
        let stats = Arc::new(Stats::new(None));
        ServerContext::new(
            Config::default(),
            Arc::new(NoTlsProvider),
            bus,
            Arc::new(EventStreamHub::new()),
            stats,
        )
        .unwrap()
    }

    #[test]
    fn connection_ids_are_monotone() {
        let ctx = context();
        let a = ctx.next_connection_id();
        let b = ctx.next_connection_id();
        assert!(b > a);
    }

    #[test]
    fn user_slots_count_and_release() {
        let ctx = context();
        let (count, slot_a) = ctx.acquire_user_slot("alice");
        assert_eq!(count, 1);
        let (count, slot_b) = ctx.acquire_user_slot("alice");
        assert_eq!(count, 2);
        drop(slot_a);
        drop(slot_b);
        let (count, _slot) = ctx.acquire_user_slot("alice");
        assert_eq!(count, 1);
    }

    #[test]
    fn invalid_config_swap_keeps_previous() {
        let ctx = context();
        let before = ctx.config();
        let bad = Config {
            handler_threads: 0,
            ..Config::default()
        };
        assert!(ctx.set_config(bad).is_err());
        assert_eq!(ctx.config().handler_threads, before.handler_threads);
    }

    #[test]
    fn shutdown_flag_is_observable() {
        let ctx = context();
        assert!(ctx.is_running());
        let mut watch = ctx.shutdown_watch();
        ctx.shutdown();
        assert!(!ctx.is_running());
        assert!(watch.has_changed().unwrap());
    }
}
