//! The source runtime: per-mount state machine, ingest loop, listener
//! trees and the fan-out queue.
//!
//! A mount is reserved, completed against config, then driven by one task
//! that pulls chunks from upstream through the format handler and appends
//! refbufs to the broadcast queue. Listeners first land in the pending
//! tree and are merged into the client tree by the source task, so the
//! producer side never contends with per-listener sends.

pub mod format;
pub mod icy;
pub mod listener;
pub mod queue;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::{Config, FallbackOverride};
use crate::context::ServerContext;
use crate::error::ErrorId;
use crate::events::{Event, FastEvent};
use crate::stats::GLOBAL_SCOPE;
use crate::tls::NetStream;

use format::FormatKind;
use queue::BroadcastQueue;

/// Ingest read granularity.
const SOURCE_READ_CHUNK: usize = 4096;

/// Title metadata shown to listeners; `generation` bumps on every change
/// so per-listener injectors re-render lazily.
#[derive(Debug, Clone, Default)]
pub struct StreamMetadata {
    pub title: Option<String>,
    pub url: Option<String>,
    pub generation: u64,
}

/// Where a displaced listener goes.
#[derive(Debug, Clone)]
pub enum FallbackTarget {
    Mount(String),
    File(PathBuf),
    Close,
}

/// Shared state between a listener's task and the source that owns it.
#[derive(Debug)]
pub struct ListenerHandle {
    pub id: u64,
    /// The mount originally requested; `fallback_override = Own` keys off
    /// this.
    pub mount_requested: String,
    pub role: String,
    pub username: Option<String>,
    pub peer_ip: String,
    error: AtomicBool,
    moved_to: Mutex<Option<FallbackTarget>>,
    kick: Notify,
}

impl ListenerHandle {
    #[must_use]
    pub fn new(id: u64, mount_requested: &str, role: &str, username: Option<String>, peer_ip: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            mount_requested: mount_requested.to_string(),
            role: role.to_string(),
            username,
            peer_ip: peer_ip.to_string(),
            error: AtomicBool::new(false),
            moved_to: Mutex::new(None),
            kick: Notify::new(),
        })
    }

    /// Flags the listener for removal and wakes its task.
    pub fn set_error(&self) {
        self.error.store(true, Ordering::SeqCst);
        self.kick.notify_waiters();
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    /// Redirects the listener; its task picks the target up at the next
    /// wakeup.
    pub fn move_to(&self, target: FallbackTarget) {
        *self.moved_to.lock() = Some(target);
        self.kick.notify_waiters();
    }

    #[must_use]
    pub fn take_move(&self) -> Option<FallbackTarget> {
        self.moved_to.lock().take()
    }

    /// Future resolving at the next kick.
    pub fn kicked(&self) -> tokio::sync::futures::Notified<'_> {
        self.kick.notified()
    }
}

/// Per-source settings resolved from mount config over global defaults.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub burst_size: usize,
    pub queue_size_limit: usize,
    pub source_timeout: Duration,
    pub fallback_mount: Option<String>,
    pub fallback_when_full: bool,
    pub fallback_override: FallbackOverride,
    pub max_listeners: Option<usize>,
    pub hidden: bool,
    pub yp_public: bool,
    pub on_demand: bool,
    pub http_headers: Vec<(String, String)>,
    pub max_listener_duration: Option<Duration>,
    pub mp3_meta_interval: usize,
    pub dumpfile: Option<PathBuf>,
    pub intro_filename: Option<PathBuf>,
    pub stream_name: Option<String>,
}

impl SourceSettings {
    /// Merges the DEFAULT mount template, the mount's own definition and
    /// the global limits, most specific last.
    #[must_use]
    pub fn resolve(config: &Config, mount: &str) -> Self {
        let mut settings = Self {
            burst_size: config.burst_size,
            queue_size_limit: config.queue_size_limit,
            source_timeout: Duration::from_secs(config.source_timeout),
            fallback_mount: None,
            fallback_when_full: false,
            fallback_override: FallbackOverride::None,
            max_listeners: None,
            hidden: false,
            yp_public: false,
            on_demand: false,
            http_headers: Vec::new(),
            max_listener_duration: None,
            mp3_meta_interval: icy::DEFAULT_METAINT,
            dumpfile: None,
            intro_filename: None,
            stream_name: None,
        };
        if let Some(template) = config.default_mount() {
            settings.apply(template);
        }
        if let Some(mount_config) = config.find_mount(mount) {
            settings.apply(mount_config);
        }
        settings
    }

    fn apply(&mut self, mount: &crate::config::MountConfig) {
        if let Some(burst) = mount.burst_size {
            self.burst_size = burst;
        }
        if let Some(limit) = mount.queue_size_limit {
            self.queue_size_limit = limit;
        }
        if let Some(timeout) = mount.source_timeout {
            self.source_timeout = Duration::from_secs(timeout);
        }
        if mount.fallback_mount.is_some() {
            self.fallback_mount = mount.fallback_mount.clone();
        }
        self.fallback_when_full |= mount.fallback_when_full;
        if mount.fallback_override != FallbackOverride::None {
            self.fallback_override = mount.fallback_override;
        }
        if mount.max_listeners.is_some() {
            self.max_listeners = mount.max_listeners;
        }
        self.hidden |= mount.hidden;
        self.yp_public |= mount.yp_public;
        self.on_demand |= mount.on_demand;
        self.http_headers.extend(mount.http_headers.iter().cloned());
        if let Some(duration) = mount.max_listener_duration {
            self.max_listener_duration = Some(Duration::from_secs(duration));
        }
        if let Some(interval) = mount.mp3_meta_interval {
            self.mp3_meta_interval = interval;
        }
        if mount.dumpfile.is_some() {
            self.dumpfile = mount.dumpfile.clone();
        }
        if mount.intro_filename.is_some() {
            self.intro_filename = mount.intro_filename.clone();
        }
        if mount.stream_name.is_some() {
            self.stream_name = mount.stream_name.clone();
        }
    }
}

/// Source lifecycle after completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Running,
    Draining,
    Terminated,
}

/// One active mount.
#[derive(Debug)]
pub struct Source {
    pub mount: String,
    /// Regenerated on every reservation of the mount.
    pub instance_uuid: String,
    pub content_type: String,
    pub format: FormatKind,
    pub settings: SourceSettings,
    pub queue: BroadcastQueue,
    pub metadata: RwLock<StreamMetadata>,
    state: RwLock<SourceState>,
    client_tree: RwLock<BTreeMap<u64, Arc<ListenerHandle>>>,
    pending_tree: RwLock<BTreeMap<u64, Arc<ListenerHandle>>>,
    peak_listeners: AtomicUsize,
}

/// Why a listener could not attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachRefusal {
    /// Mount is at `max_listeners`.
    Full,
    /// Source is no longer accepting listeners.
    NotRunning,
}

impl Source {
    #[must_use]
    pub fn state(&self) -> SourceState {
        *self.state.read()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == SourceState::Running
    }

    /// Attached plus pending listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.client_tree.read().len() + self.pending_tree.read().len()
    }

    #[must_use]
    pub fn peak_listeners(&self) -> usize {
        self.peak_listeners.load(Ordering::SeqCst)
    }

    /// Adds a listener to the pending tree.
    ///
    /// Once the source stops running no new listeners are accepted; the
    /// count check treats `None` as unlimited.
    pub fn add_listener(&self, handle: Arc<ListenerHandle>) -> Result<(), AttachRefusal> {
        if !self.is_running() {
            return Err(AttachRefusal::NotRunning);
        }
        if let Some(max) = self.settings.max_listeners {
            if self.listener_count() >= max {
                return Err(AttachRefusal::Full);
            }
        }
        self.pending_tree.write().insert(handle.id, handle);
        let count = self.listener_count();
        self.peak_listeners.fetch_max(count, Ordering::SeqCst);
        Ok(())
    }

    /// Removes a listener from whichever tree holds it.
    pub fn remove_listener(&self, id: u64) {
        self.client_tree.write().remove(&id);
        self.pending_tree.write().remove(&id);
    }

    /// Drains pending listeners into the client tree. Source task only.
    pub fn merge_pending(&self) {
        let mut pending = self.pending_tree.write();
        if pending.is_empty() {
            return;
        }
        let mut clients = self.client_tree.write();
        while let Some((id, handle)) = pending.pop_first() {
            clients.insert(id, handle);
        }
    }

    /// Snapshot of every listener in both trees.
    #[must_use]
    pub fn listeners_snapshot(&self) -> Vec<Arc<ListenerHandle>> {
        let mut all: Vec<Arc<ListenerHandle>> =
            self.client_tree.read().values().cloned().collect();
        all.extend(self.pending_tree.read().values().cloned());
        all
    }

    /// Replaces the stream title, waking injectors via the generation.
    pub fn update_metadata(&self, title: Option<String>, url: Option<String>) {
        let mut metadata = self.metadata.write();
        metadata.title = title;
        if url.is_some() {
            metadata.url = url;
        }
        metadata.generation += 1;
    }

    /// Asks the source task to wind down; observed at its next tick.
    pub fn stop(&self) {
        self.set_state(SourceState::Draining);
    }

    fn set_state(&self, state: SourceState) {
        *self.state.write() = state;
    }
}

/// Byte supplier for a source: the ingest connection or a relay.
#[async_trait]
pub trait SourceReader: Send {
    /// Next chunk; `Ok(None)` is a clean end of stream.
    async fn read_chunk(&mut self) -> io::Result<Option<Bytes>>;

    /// Connection id of the ingest client, when one exists.
    fn connection_id(&self) -> Option<u64> {
        None
    }
}

/// Reads a source client's socket, replaying bytes that arrived with the
/// request head first.
pub struct NetReader {
    stream: Box<dyn NetStream>,
    leftover: Option<Vec<u8>>,
    connection_id: Option<u64>,
}

impl NetReader {
    #[must_use]
    pub fn new(stream: Box<dyn NetStream>, leftover: Vec<u8>) -> Self {
        Self {
            stream,
            leftover: if leftover.is_empty() {
                None
            } else {
                Some(leftover)
            },
            connection_id: None,
        }
    }

    /// Tags chunks with the ingest connection's id.
    #[must_use]
    pub fn with_connection_id(mut self, id: u64) -> Self {
        self.connection_id = Some(id);
        self
    }
}

#[async_trait]
impl SourceReader for NetReader {
    async fn read_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if let Some(leftover) = self.leftover.take() {
            return Ok(Some(Bytes::from(leftover)));
        }
        let mut buf = BytesMut::zeroed(SOURCE_READ_CHUNK);
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf.freeze()))
    }

    fn connection_id(&self) -> Option<u64> {
        self.connection_id
    }
}

enum Slot {
    Reserved { instance_uuid: String },
    Active(Arc<Source>),
}

/// A mount reservation awaiting completion.
#[derive(Debug)]
pub struct SourceReservation {
    pub mount: String,
    pub instance_uuid: String,
}

/// The mount-indexed source table.
#[derive(Default)]
pub struct SourceRegistry {
    slots: DashMap<String, Slot>,
}

impl SourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims a mount. At most one source per mount exists at any instant.
    pub fn reserve(&self, mount: &str) -> Result<SourceReservation, ErrorId> {
        if !mount.starts_with('/') {
            return Err(ErrorId::ConMountpointNotStartingWithSlash);
        }
        let instance_uuid = Uuid::new_v4().to_string();
        match self.slots.entry(mount.to_string()) {
            dashmap::Entry::Occupied(_) => Err(ErrorId::ConMountInUse),
            dashmap::Entry::Vacant(entry) => {
                entry.insert(Slot::Reserved {
                    instance_uuid: instance_uuid.clone(),
                });
                Ok(SourceReservation {
                    mount: mount.to_string(),
                    instance_uuid,
                })
            }
        }
    }

    /// Gives a reservation up without ever running.
    pub fn abort(&self, reservation: SourceReservation) {
        self.slots
            .remove_if(&reservation.mount, |_, slot| match slot {
                Slot::Reserved { instance_uuid } => *instance_uuid == reservation.instance_uuid,
                Slot::Active(_) => false,
            });
    }

    /// Turns a reservation into a running source: checks the global source
    /// limit, picks the format handler from the Content-Type, applies the
    /// mount configuration, and pulls listeners back from the fallback
    /// when the override policy says so.
    pub fn complete(
        &self,
        ctx: &Arc<ServerContext>,
        reservation: SourceReservation,
        content_type: Option<&str>,
    ) -> Result<Arc<Source>, ErrorId> {
        let config = ctx.config();
        if ctx.sources_active.load(Ordering::SeqCst) >= config.source_limit {
            self.abort(reservation);
            return Err(ErrorId::ConSourceClientLimit);
        }

        let format = match FormatKind::from_content_type(content_type) {
            Ok(format) => {
                if content_type.is_none() {
                    log::warn!(
                        "source for {} sent no Content-Type, assuming MP3",
                        reservation.mount
                    );
                }
                format
            }
            Err(e) => {
                self.abort(reservation);
                return Err(e);
            }
        };

        let settings = SourceSettings::resolve(&config, &reservation.mount);
        let content_type = content_type.unwrap_or("audio/mpeg").to_string();
        let source = Arc::new(Source {
            mount: reservation.mount.clone(),
            instance_uuid: reservation.instance_uuid.clone(),
            content_type: content_type.clone(),
            format,
            queue: BroadcastQueue::new(settings.burst_size, settings.queue_size_limit),
            settings,
            metadata: RwLock::new(StreamMetadata::default()),
            state: RwLock::new(SourceState::Running),
            client_tree: RwLock::new(BTreeMap::new()),
            pending_tree: RwLock::new(BTreeMap::new()),
            peak_listeners: AtomicUsize::new(0),
        });

        let replaced = match self.slots.entry(reservation.mount.clone()) {
            dashmap::Entry::Occupied(mut entry) => match entry.get() {
                Slot::Reserved { instance_uuid }
                    if *instance_uuid == reservation.instance_uuid =>
                {
                    entry.insert(Slot::Active(Arc::clone(&source)));
                    true
                }
                _ => false,
            },
            dashmap::Entry::Vacant(_) => false,
        };
        if !replaced {
            return Err(ErrorId::ConMountInUse);
        }

        ctx.sources_active.fetch_add(1, Ordering::SeqCst);
        ctx.stats.inc(GLOBAL_SCOPE, "sources");
        ctx.stats.set_int(&source.mount, "listeners", 0);
        ctx.stats
            .set(&source.mount, "server_type", source.content_type.as_str());
        ctx.stats
            .set(&source.mount, "source_instance", source.instance_uuid.as_str());
        if let Some(mount_config) = config.find_mount(&source.mount) {
            let mut describe = |name: &str, value: &Option<String>| {
                if let Some(value) = value {
                    ctx.stats.set(&source.mount, name, value.as_str());
                }
            };
            describe("server_name", &mount_config.stream_name);
            describe("server_description", &mount_config.stream_description);
            describe("server_url", &mount_config.stream_url);
            describe("genre", &mount_config.stream_genre);
            describe("bitrate", &mount_config.bitrate);
        }

        ctx.events.emit_fast(&FastEvent::SourceStarted {
            mount: source.mount.clone(),
        });
        let mut event = Event::new("source-connect").with_mount(&source.mount);
        event.source_media_type = Some(content_type);
        event.source_instance_uuid = Some(source.instance_uuid.clone());
        ctx.emit_event(event);

        self.apply_fallback_override(&source);

        Ok(source)
    }

    /// Pulls listeners parked on the fallback mount back onto a source
    /// that just (re)appeared.
    fn apply_fallback_override(&self, source: &Arc<Source>) {
        if source.settings.fallback_override == FallbackOverride::None {
            return;
        }
        let Some(fallback_mount) = &source.settings.fallback_mount else {
            return;
        };
        let Some(fallback) = self.get(fallback_mount) else {
            return;
        };
        for listener in fallback.listeners_snapshot() {
            let steal = match source.settings.fallback_override {
                FallbackOverride::All => true,
                FallbackOverride::Own => listener.mount_requested == source.mount,
                FallbackOverride::None => false,
            };
            if steal {
                fallback.remove_listener(listener.id);
                listener.move_to(FallbackTarget::Mount(source.mount.clone()));
            }
        }
    }

    /// The active source at a mount.
    #[must_use]
    pub fn get(&self, mount: &str) -> Option<Arc<Source>> {
        match self.slots.get(mount)?.value() {
            Slot::Active(source) => Some(Arc::clone(source)),
            Slot::Reserved { .. } => None,
        }
    }

    /// Drops the slot for a finished source instance. A newer reservation
    /// for the same mount is left alone.
    pub fn remove(&self, mount: &str, instance_uuid: &str) {
        self.slots.remove_if(mount, |_, slot| match slot {
            Slot::Active(source) => source.instance_uuid == instance_uuid,
            Slot::Reserved { instance_uuid: reserved } => reserved == instance_uuid,
        });
    }

    /// Every active source.
    #[must_use]
    pub fn list_active(&self) -> Vec<Arc<Source>> {
        self.slots
            .iter()
            .filter_map(|slot| match slot.value() {
                Slot::Active(source) => Some(Arc::clone(source)),
                Slot::Reserved { .. } => None,
            })
            .collect()
    }
}

/// Drives one source until end of stream, upstream timeout, kill, or (for
/// on-demand mounts) sustained listener silence.
pub async fn run_source(
    ctx: Arc<ServerContext>,
    source: Arc<Source>,
    mut reader: Box<dyn SourceReader>,
) {
    log::info!(
        "source {} running ({}, burst {} bytes, queue {} bytes)",
        source.mount,
        source.content_type,
        source.settings.burst_size,
        source.settings.queue_size_limit
    );

    let mut format = source.format.handler();
    let mut dumpfile = open_dumpfile(&source).await;
    let mut idle_since: Option<Instant> = None;
    let mut shutdown = ctx.shutdown_watch();

    loop {
        if !ctx.is_running() || !source.is_running() {
            break;
        }

        let read = tokio::time::timeout(source.settings.source_timeout, reader.read_chunk());
        let chunk = tokio::select! {
            chunk = read => chunk,
            _ = shutdown.changed() => continue,
        };

        match chunk {
            Err(_) => {
                // No bytes within the timeout. An on-demand source idling
                // without listeners winds down; a silent upstream is dead.
                if source.settings.on_demand && source.listener_count() == 0 {
                    log::info!("on-demand source {} idle, winding down", source.mount);
                } else {
                    log::warn!("source {} timed out", source.mount);
                }
                break;
            }
            Ok(Ok(None)) => {
                log::info!("source {} reached end of stream", source.mount);
                break;
            }
            Ok(Ok(Some(bytes))) => {
                ctx.events.emit_fast(&FastEvent::ConnectionRead {
                    connection_id: reader.connection_id(),
                    bytes: bytes.len(),
                });
                for refbuf in format.process(bytes) {
                    if let Some(file) = dumpfile.as_mut() {
                        use tokio::io::AsyncWriteExt;
                        if let Err(e) = file.write_all(&refbuf.data).await {
                            log::warn!(
                                "dumpfile for {} failed, disabling: {}",
                                source.mount,
                                e
                            );
                            dumpfile = None;
                        }
                    }
                    source.queue.append(refbuf);
                }
            }
            Ok(Err(e)) => {
                log::warn!("source {} read failed: {}", source.mount, e);
                break;
            }
        }

        source.merge_pending();
        prune_errored_listeners(&source);

        if source.settings.on_demand {
            if source.listener_count() == 0 {
                let since = idle_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= source.settings.source_timeout {
                    log::info!("on-demand source {} idle, winding down", source.mount);
                    break;
                }
            } else {
                idle_since = None;
            }
        }
    }

    teardown_source(&ctx, &source);
}

// Listener tasks police their own lag and remove themselves; this sweep
// only reaps handles whose tasks already flagged an error.
fn prune_errored_listeners(source: &Arc<Source>) {
    for listener in source.listeners_snapshot() {
        if listener.has_error() {
            source.remove_listener(listener.id);
        }
    }
}

async fn open_dumpfile(source: &Arc<Source>) -> Option<tokio::fs::File> {
    let path = source.settings.dumpfile.as_ref()?;
    match tokio::fs::File::create(path).await {
        Ok(file) => Some(file),
        Err(e) => {
            log::warn!(
                "cannot open dumpfile {} for {}: {}",
                path.display(),
                source.mount,
                e
            );
            None
        }
    }
}

/// DRAINING: move every listener to the fallback, tear down accounting,
/// release the mount.
///
/// The source task calls this when its loop ends; callers that completed a
/// source but could not start feeding it use it for the same cleanup.
pub fn teardown_source(ctx: &Arc<ServerContext>, source: &Arc<Source>) {
    source.set_state(SourceState::Draining);

    let target = match &source.settings.fallback_mount {
        Some(fallback) if fallback.starts_with('/') => FallbackTarget::Mount(fallback.clone()),
        Some(fallback) => FallbackTarget::File(PathBuf::from(fallback)),
        None => FallbackTarget::Close,
    };
    for listener in source.listeners_snapshot() {
        source.remove_listener(listener.id);
        listener.move_to(target.clone());
    }
    source.queue.close();

    ctx.sources_active.fetch_sub(1, Ordering::SeqCst);
    ctx.stats.dec(GLOBAL_SCOPE, "sources");
    ctx.stats.clear_scope(&source.mount);

    ctx.events.emit_fast(&FastEvent::SourceEnded {
        mount: source.mount.clone(),
    });
    let mut event = Event::new("source-disconnect").with_mount(&source.mount);
    event.source_instance_uuid = Some(source.instance_uuid.clone());
    if let Some(dumpfile) = &source.settings.dumpfile {
        event.dumpfile = Some(dumpfile.display().to_string());
    }
    ctx.emit_event(event);

    ctx.sources.remove(&source.mount, &source.instance_uuid);
    source.set_state(SourceState::Terminated);
    log::info!("source {} terminated", source.mount);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountConfig;
    use crate::events::EventBus;
    use crate::stats::Stats;
    use crate::tls::NoTlsProvider;

    fn context() -> Arc<ServerContext> {
        let (bus, _rx) = EventBus::new();
        ServerContext::new(
            Config::default(),
            Arc::new(NoTlsProvider),
            bus,
            Arc::new(crate::events::stream::EventStreamHub::new()),
            Arc::new(Stats::new(None)),
        )
        .unwrap()
    }

    #[test]
    fn reserve_is_exclusive_per_mount() {
        let registry = SourceRegistry::new();
        let first = registry.reserve("/live").unwrap();
        assert_eq!(
            registry.reserve("/live").unwrap_err(),
            ErrorId::ConMountInUse
        );
        registry.abort(first);
        assert!(registry.reserve("/live").is_ok());
    }

    #[test]
    fn reserve_requires_absolute_mount() {
        let registry = SourceRegistry::new();
        assert_eq!(
            registry.reserve("live").unwrap_err(),
            ErrorId::ConMountpointNotStartingWithSlash
        );
    }

    #[test]
    fn each_reservation_gets_a_fresh_instance_uuid() {
        let registry = SourceRegistry::new();
        let first = registry.reserve("/live").unwrap();
        let first_uuid = first.instance_uuid.clone();
        registry.abort(first);
        let second = registry.reserve("/live").unwrap();
        assert_ne!(first_uuid, second.instance_uuid);
    }

    #[tokio::test]
    async fn complete_activates_and_respects_source_limit() {
        let ctx = context();
        let reservation = ctx.sources.reserve("/a").unwrap();
        let source = ctx
            .sources
            .complete(&ctx, reservation, Some("audio/mpeg"))
            .unwrap();
        assert!(source.is_running());
        assert!(ctx.sources.get("/a").is_some());

        // Exhaust the limit.
        let limit = ctx.config().source_limit;
        ctx.sources_active
            .store(limit, std::sync::atomic::Ordering::SeqCst);
        let reservation = ctx.sources.reserve("/b").unwrap();
        assert_eq!(
            ctx.sources
                .complete(&ctx, reservation, Some("audio/mpeg"))
                .unwrap_err(),
            ErrorId::ConSourceClientLimit
        );
        // The failed completion released the reservation.
        assert!(ctx.sources.reserve("/b").is_ok());
    }

    #[tokio::test]
    async fn complete_rejects_unsupported_content_type() {
        let ctx = context();
        let reservation = ctx.sources.reserve("/a").unwrap();
        assert_eq!(
            ctx.sources
                .complete(&ctx, reservation, Some("text/html"))
                .unwrap_err(),
            ErrorId::ConContentTypeNosys
        );
    }

    #[tokio::test]
    async fn pending_merges_into_clients_disjointly() {
        let ctx = context();
        let reservation = ctx.sources.reserve("/a").unwrap();
        let source = ctx
            .sources
            .complete(&ctx, reservation, Some("audio/mpeg"))
            .unwrap();

        let handle = ListenerHandle::new(1, "/a", "listener", None, "10.0.0.1");
        source.add_listener(Arc::clone(&handle)).unwrap();
        assert_eq!(source.pending_tree.read().len(), 1);
        assert_eq!(source.client_tree.read().len(), 0);

        source.merge_pending();
        assert_eq!(source.pending_tree.read().len(), 0);
        assert_eq!(source.client_tree.read().len(), 1);
        assert_eq!(source.listener_count(), 1);
    }

    #[tokio::test]
    async fn max_listeners_refuses_attach() {
        let ctx = context();
        {
            let mut config = Config::default();
            config.mounts.push(MountConfig {
                mount_name: "/a".to_string(),
                max_listeners: Some(1),
                ..MountConfig::default()
            });
            ctx.set_config(config).unwrap();
        }
        let reservation = ctx.sources.reserve("/a").unwrap();
        let source = ctx
            .sources
            .complete(&ctx, reservation, Some("audio/mpeg"))
            .unwrap();

        source
            .add_listener(ListenerHandle::new(1, "/a", "listener", None, "1.1.1.1"))
            .unwrap();
        assert_eq!(
            source
                .add_listener(ListenerHandle::new(2, "/a", "listener", None, "2.2.2.2"))
                .unwrap_err(),
            AttachRefusal::Full
        );
    }

    #[tokio::test]
    async fn fallback_override_own_pulls_original_requesters() {
        let ctx = context();
        {
            let mut config = Config::default();
            config.mounts.push(MountConfig {
                mount_name: "/a".to_string(),
                fallback_mount: Some("/b".to_string()),
                fallback_override: FallbackOverride::Own,
                ..MountConfig::default()
            });
            ctx.set_config(config).unwrap();
        }

        // /b is live and holds two listeners; one originally wanted /a.
        let reservation = ctx.sources.reserve("/b").unwrap();
        let fallback = ctx
            .sources
            .complete(&ctx, reservation, Some("audio/mpeg"))
            .unwrap();
        let wants_a = ListenerHandle::new(1, "/a", "listener", None, "1.1.1.1");
        let wants_b = ListenerHandle::new(2, "/b", "listener", None, "2.2.2.2");
        fallback.add_listener(Arc::clone(&wants_a)).unwrap();
        fallback.add_listener(Arc::clone(&wants_b)).unwrap();

        // /a appears; it pulls back only its own listener.
        let reservation = ctx.sources.reserve("/a").unwrap();
        let _a = ctx
            .sources
            .complete(&ctx, reservation, Some("audio/mpeg"))
            .unwrap();

        assert!(matches!(
            wants_a.take_move(),
            Some(FallbackTarget::Mount(mount)) if mount == "/a"
        ));
        assert!(wants_b.take_move().is_none());
        assert_eq!(fallback.listener_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_moves_listeners_and_releases_mount() {
        let ctx = context();
        {
            let mut config = Config::default();
            config.mounts.push(MountConfig {
                mount_name: "/a".to_string(),
                fallback_mount: Some("/b".to_string()),
                ..MountConfig::default()
            });
            ctx.set_config(config).unwrap();
        }
        let reservation = ctx.sources.reserve("/a").unwrap();
        let source = ctx
            .sources
            .complete(&ctx, reservation, Some("audio/mpeg"))
            .unwrap();
        let listener = ListenerHandle::new(1, "/a", "listener", None, "1.1.1.1");
        source.add_listener(Arc::clone(&listener)).unwrap();

        teardown_source(&ctx, &source);

        assert_eq!(source.state(), SourceState::Terminated);
        assert!(source.queue.is_closed());
        assert!(matches!(
            listener.take_move(),
            Some(FallbackTarget::Mount(mount)) if mount == "/b"
        ));
        assert!(ctx.sources.get("/a").is_none());
        assert!(ctx.sources.reserve("/a").is_ok());
    }

    #[test]
    fn settings_resolution_layers_template_then_mount() {
        let mut config = Config::default();
        config.mounts.push(MountConfig {
            mount_type: crate::config::MountType::Default,
            burst_size: Some(1000),
            hidden: true,
            ..MountConfig::default()
        });
        config.mounts.push(MountConfig {
            mount_name: "/a".to_string(),
            burst_size: Some(2000),
            ..MountConfig::default()
        });
        let settings = SourceSettings::resolve(&config, "/a");
        assert_eq!(settings.burst_size, 2000);
        assert!(settings.hidden);
        let other = SourceSettings::resolve(&config, "/other");
        assert_eq!(other.burst_size, 1000);
        let no_template = SourceSettings::resolve(&Config::default(), "/x");
        assert_eq!(no_template.burst_size, Config::default().burst_size);
    }

    #[tokio::test]
    async fn net_reader_replays_leftover_first() {
        use tokio::io::AsyncWriteExt;
        let (client, server) = tokio::io::duplex(1024);
        let mut client: Box<dyn NetStream> = Box::new(client);
        let mut reader = NetReader::new(Box::new(server), b"HEAD".to_vec());
        assert_eq!(
            reader.read_chunk().await.unwrap().unwrap().as_ref(),
            b"HEAD"
        );
        client.write_all(b"NEXT").await.unwrap();
        drop(client);
        assert_eq!(
            reader.read_chunk().await.unwrap().unwrap().as_ref(),
            b"NEXT"
        );
        assert!(reader.read_chunk().await.unwrap().is_none());
    }
}
