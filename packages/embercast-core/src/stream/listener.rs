//! The listener side of the fan-out: attach resolution, the per-listener
//! send loop, and fallback traversal.
//!
//! Every listener runs its own task. The task owns the socket, holds a
//! cursor into the source's broadcast queue and polices its own lag; the
//! source never blocks on a listener's socket. Displacement (source death,
//! admin moves, full-mount fallback) arrives through the listener handle
//! and is resolved here against the navigation history so redirect chains
//! cannot loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use crate::context::ServerContext;
use crate::error::ErrorId;
use crate::events::Event;
use crate::navigation::{Direction, NavigationHistory};
use crate::stats::GLOBAL_SCOPE;
use crate::stream::icy::MetadataInjector;
use crate::stream::{FallbackTarget, ListenerHandle, Source, SourceSettings};
use crate::tls::NetStream;

/// Idle poll ceiling of the send loop.
const IDLE_TICK: Duration = Duration::from_millis(200);

/// Outcome of resolving an attach or a displacement.
pub enum MoveOutcome {
    /// Attached; the handle is in the source's pending tree.
    Attached(Arc<Source>),
    /// The chain ended at a file; stream it and close.
    ServeFile(PathBuf),
    /// Nothing to attach to.
    Refused(ErrorId),
}

/// Walks a fallback chain starting at `target` until a source accepts the
/// handle, a file ends the chain, or the chain is exhausted.
///
/// Every visited mount is pushed onto the history first; a mount already
/// present there stops the walk so fallback cycles cannot trap a client.
pub fn resolve_attach(
    ctx: &Arc<ServerContext>,
    target: FallbackTarget,
    history: &mut NavigationHistory,
    handle: &Arc<ListenerHandle>,
) -> MoveOutcome {
    let config = ctx.config();
    let mut target = target;
    loop {
        match target {
            FallbackTarget::Close => return MoveOutcome::Refused(ErrorId::SourceMountUnavailable),
            FallbackTarget::File(path) => return MoveOutcome::ServeFile(path),
            FallbackTarget::Mount(mount) => {
                if history.contains(&mount) || !history.push(&mount, Direction::Up) {
                    return MoveOutcome::Refused(ErrorId::SourceMountUnavailable);
                }
                if let Some(source) = ctx.sources.get(&mount) {
                    match source.add_listener(Arc::clone(handle)) {
                        Ok(()) => return MoveOutcome::Attached(source),
                        Err(crate::stream::AttachRefusal::Full) => {
                            if source.settings.fallback_when_full {
                                if let Some(next) = &source.settings.fallback_mount {
                                    target = to_target(next);
                                    continue;
                                }
                            }
                            return MoveOutcome::Refused(ErrorId::SourceMaxListeners);
                        }
                        Err(crate::stream::AttachRefusal::NotRunning) => {
                            return MoveOutcome::Refused(ErrorId::SourceMountUnavailable);
                        }
                    }
                }
                // No live source here; follow the mount's configured
                // fallback onward.
                let settings = SourceSettings::resolve(&config, &mount);
                match settings.fallback_mount {
                    Some(next) => target = to_target(&next),
                    None => return MoveOutcome::Refused(ErrorId::SourceMountUnavailable),
                }
            }
        }
    }
}

/// A fallback value names either a mount or a file for the file server.
#[must_use]
pub fn to_target(value: &str) -> FallbackTarget {
    if value.starts_with('/') {
        FallbackTarget::Mount(value.to_string())
    } else {
        FallbackTarget::File(PathBuf::from(value))
    }
}

/// Drives one listener until it closes, errors, times out, or every
/// fallback is exhausted. The response head must already be sent.
pub async fn run_listener(
    ctx: Arc<ServerContext>,
    mut source: Arc<Source>,
    mut stream: Box<dyn NetStream>,
    handle: Arc<ListenerHandle>,
    mut history: NavigationHistory,
    wants_icy: bool,
    discon_deadline: Option<Instant>,
) {
    ctx.stats.inc(GLOBAL_SCOPE, "listeners");
    ctx.stats.inc(&source.mount, "listeners");
    let mut counted_mount = source.mount.clone();

    let mut injector = wants_icy
        .then(|| MetadataInjector::new(source.settings.mp3_meta_interval));

    let mut shutdown = ctx.shutdown_watch();
    let mut closing_file: Option<PathBuf> = None;

    'attached: loop {
        let mut cursor = source.queue.attach();

        loop {
            if handle.has_error() || !ctx.is_running() {
                break 'attached;
            }
            if let Some(deadline) = discon_deadline {
                if Instant::now() >= deadline {
                    log::debug!("listener {} reached its connection limit", handle.id);
                    break 'attached;
                }
            }

            // Admin moves off a live source act immediately; a dead source
            // drains its remaining queue first, then the displacement
            // posted before the close is followed.
            let mut move_target = if source.queue.is_closed() {
                None
            } else {
                handle.take_move()
            };

            if move_target.is_none() {
                match send_step(&source, &mut cursor, &mut stream, &handle, injector.as_mut())
                    .await
                {
                    SendStep::Sent | SendStep::Kicked => continue,
                    SendStep::Closed => break 'attached,
                    SendStep::Drained => {
                        if source.queue.is_closed() {
                            move_target = handle.take_move();
                            if move_target.is_none() {
                                break 'attached;
                            }
                        } else {
                            tokio::select! {
                                _ = source.queue.wait() => {}
                                _ = handle.kicked() => {}
                                _ = tokio::time::sleep(IDLE_TICK) => {}
                                _ = shutdown.changed() => {}
                            }
                            continue;
                        }
                    }
                }
            }

            if let Some(target) = move_target {
                match resolve_attach(&ctx, target, &mut history, &handle) {
                    MoveOutcome::Attached(next) => {
                        ctx.stats.dec(&counted_mount, "listeners");
                        ctx.stats.inc(&next.mount, "listeners");
                        counted_mount = next.mount.clone();
                        source = next;
                        continue 'attached;
                    }
                    MoveOutcome::ServeFile(path) => {
                        closing_file = Some(path);
                        break 'attached;
                    }
                    MoveOutcome::Refused(_) => break 'attached,
                }
            }
        }
    }

    source.remove_listener(handle.id);
    ctx.stats.dec(&counted_mount, "listeners");
    ctx.stats.dec(GLOBAL_SCOPE, "listeners");

    if let Some(path) = closing_file {
        let resolved = crate::fserve::resolve_path(&ctx, &path);
        if let Err(e) = crate::fserve::stream_file(&mut stream, &resolved).await {
            log::debug!("fallback file {} not delivered: {}", resolved.display(), e);
        }
    }
    let _ = stream.flush().await;

    let mut event = Event::new("listener-remove").with_mount(&counted_mount);
    event.connection_id = Some(handle.id);
    event.client_role = Some(handle.role.clone());
    event.client_username = handle.username.clone();
    event.connection_ip = Some(handle.peer_ip.clone());
    ctx.emit_event(event);
}

/// One step of the send loop.
enum SendStep {
    /// A chunk went out.
    Sent,
    /// The session must end (write error or slow-consumer drop).
    Closed,
    /// A kick interrupted the write; the caller re-reads the flags.
    Kicked,
    /// The cursor caught up with the tail.
    Drained,
}

async fn send_step(
    source: &Arc<Source>,
    cursor: &mut crate::stream::queue::Cursor,
    stream: &mut Box<dyn NetStream>,
    handle: &Arc<ListenerHandle>,
    injector: Option<&mut MetadataInjector>,
) -> SendStep {
    // Slow-consumer policy: a cursor further behind than the queue bound
    // is dropped rather than allowed to pin history.
    if cursor.lag(&source.queue) as usize > source.settings.queue_size_limit {
        log::info!(
            "dropping listener {} on {}: {} bytes behind",
            handle.id,
            source.mount,
            cursor.lag(&source.queue)
        );
        handle.set_error();
        return SendStep::Closed;
    }

    let Some(refbuf) = cursor.pop(&source.queue) else {
        return SendStep::Drained;
    };

    let chunk: Bytes = match injector {
        Some(injector) => {
            let metadata = source.metadata.read();
            injector.inject(&refbuf.data, metadata.title.as_deref(), metadata.generation)
        }
        None => refbuf.data,
    };

    tokio::select! {
        // The write goes first so a pending kick never discards a chunk
        // the socket would have taken.
        biased;
        result = stream.write_all(&chunk) => {
            if result.is_err() {
                handle.set_error();
                SendStep::Closed
            } else {
                SendStep::Sent
            }
        }
        // A kick mid-write means removal or displacement; the caller
        // re-reads the handle flags to tell which.
        _ = handle.kicked() => SendStep::Kicked,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, MountConfig};
    use crate::events::EventBus;
    use crate::stats::Stats;
    use crate::stream::ListenerHandle;
    use crate::tls::NoTlsProvider;

    fn context(mounts: Vec<MountConfig>) -> Arc<ServerContext> {
        let (bus, _rx) = EventBus::new();
        let config = Config {
            mounts,
            ..Config::default()
        };
        ServerContext::new(
            config,
            Arc::new(NoTlsProvider),
            bus,
            Arc::new(crate::events::stream::EventStreamHub::new()),
            Arc::new(Stats::new(None)),
        )
        .unwrap()
    }

    fn activate(ctx: &Arc<ServerContext>, mount: &str) -> Arc<Source> {
        let reservation = ctx.sources.reserve(mount).unwrap();
        ctx.sources
            .complete(ctx, reservation, Some("audio/mpeg"))
            .unwrap()
    }

    #[tokio::test]
    async fn attach_records_navigation_history() {
        let ctx = context(vec![]);
        let _source = activate(&ctx, "/a");
        let handle = ListenerHandle::new(1, "/a", "listener", None, "1.1.1.1");
        let mut history = NavigationHistory::new();
        let outcome = resolve_attach(
            &ctx,
            FallbackTarget::Mount("/a".to_string()),
            &mut history,
            &handle,
        );
        assert!(matches!(outcome, MoveOutcome::Attached(_)));
        assert!(history.contains("/a"));
    }

    #[tokio::test]
    async fn full_mount_falls_back_when_configured() {
        let ctx = context(vec![MountConfig {
            mount_name: "/a".to_string(),
            max_listeners: Some(1),
            fallback_when_full: true,
            fallback_mount: Some("/b".to_string()),
            ..MountConfig::default()
        }]);
        let a = activate(&ctx, "/a");
        let _b = activate(&ctx, "/b");
        a.add_listener(ListenerHandle::new(1, "/a", "listener", None, "1.1.1.1"))
            .unwrap();

        let overflow = ListenerHandle::new(2, "/a", "listener", None, "2.2.2.2");
        let mut history = NavigationHistory::new();
        let outcome = resolve_attach(
            &ctx,
            FallbackTarget::Mount("/a".to_string()),
            &mut history,
            &overflow,
        );
        match outcome {
            MoveOutcome::Attached(source) => assert_eq!(source.mount, "/b"),
            _ => panic!("expected fallback attach"),
        }
        // The history records the whole path.
        assert!(history.contains("/a"));
        assert!(history.contains("/b"));
    }

    #[tokio::test]
    async fn full_mount_without_fallback_refuses() {
        let ctx = context(vec![MountConfig {
            mount_name: "/a".to_string(),
            max_listeners: Some(0),
            ..MountConfig::default()
        }]);
        let _a = activate(&ctx, "/a");
        let handle = ListenerHandle::new(1, "/a", "listener", None, "1.1.1.1");
        let mut history = NavigationHistory::new();
        let outcome = resolve_attach(
            &ctx,
            FallbackTarget::Mount("/a".to_string()),
            &mut history,
            &handle,
        );
        assert!(matches!(
            outcome,
            MoveOutcome::Refused(ErrorId::SourceMaxListeners)
        ));
    }

    #[tokio::test]
    async fn fallback_cycles_are_broken_by_history() {
        // /a and /b fall back to each other; neither is live.
        let ctx = context(vec![
            MountConfig {
                mount_name: "/a".to_string(),
                fallback_mount: Some("/b".to_string()),
                ..MountConfig::default()
            },
            MountConfig {
                mount_name: "/b".to_string(),
                fallback_mount: Some("/a".to_string()),
                ..MountConfig::default()
            },
        ]);
        let handle = ListenerHandle::new(1, "/a", "listener", None, "1.1.1.1");
        let mut history = NavigationHistory::new();
        let outcome = resolve_attach(
            &ctx,
            FallbackTarget::Mount("/a".to_string()),
            &mut history,
            &handle,
        );
        assert!(matches!(
            outcome,
            MoveOutcome::Refused(ErrorId::SourceMountUnavailable)
        ));
        assert_eq!(history.depth(), 2);
    }

    #[tokio::test]
    async fn dead_mount_with_file_fallback_serves_the_file() {
        let ctx = context(vec![MountConfig {
            mount_name: "/a".to_string(),
            fallback_mount: Some("offline.mp3".to_string()),
            ..MountConfig::default()
        }]);
        let handle = ListenerHandle::new(1, "/a", "listener", None, "1.1.1.1");
        let mut history = NavigationHistory::new();
        let outcome = resolve_attach(
            &ctx,
            FallbackTarget::Mount("/a".to_string()),
            &mut history,
            &handle,
        );
        match outcome {
            MoveOutcome::ServeFile(path) => assert_eq!(path, PathBuf::from("offline.mp3")),
            _ => panic!("expected file fallback"),
        }
    }

    #[tokio::test]
    async fn listener_receives_stream_bytes() {
        let ctx = context(vec![]);
        let source = activate(&ctx, "/a");
        source.queue.append(crate::buffer::Refbuf::sync(Bytes::from_static(b"FRAME-ONE")));

        let handle = ListenerHandle::new(7, "/a", "listener", None, "1.1.1.1");
        source.add_listener(Arc::clone(&handle)).unwrap();

        let (client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(run_listener(
            Arc::clone(&ctx),
            Arc::clone(&source),
            Box::new(server),
            Arc::clone(&handle),
            NavigationHistory::new(),
            false,
            None,
        ));

        // Give the send loop a moment, then tear the source down.
        tokio::time::sleep(Duration::from_millis(50)).await;
        source.queue.append(crate::buffer::Refbuf::new(Bytes::from_static(b"-TWO")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.set_error();
        task.await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut client = client;
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"FRAME-ONE-TWO");
    }
}
