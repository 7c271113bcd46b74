//! The internal event system.
//!
//! Two surfaces with different latency contracts:
//!
//! - **Slow events**: [`Event`] values queued to a background dispatch task
//!   that fans each one out to its registration backends (log, exec, url,
//!   terminate) and to the server-sent-events hub. The queue is bounded;
//!   overflow drops the event with a warning rather than stalling the
//!   emitter.
//! - **Fast events**: typed [`FastEvent`] payloads delivered synchronously
//!   to registered hooks under a read lock, for in-process subscribers
//!   that need the value on the spot.

pub mod sinks;
pub mod stream;

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::EventRegistration;
use crate::utils::now_millis;

/// Bound on the slow event queue; pushes beyond it are rejected.
const EVENT_QUEUE_LIMIT: usize = 128;

/// One slow event with its typed extras.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Event {
    pub trigger: String,
    pub uuid: String,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_useragent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_instance_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dumpfile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_command: Option<String>,
    /// Registration lists captured at emit time so config swaps cannot
    /// race the dispatch.
    #[serde(skip)]
    pub registrations: Vec<EventRegistration>,
}

impl Event {
    /// Starts an event for a trigger with a fresh UUID and timestamp.
    #[must_use]
    pub fn new(trigger: &str) -> Self {
        Self {
            trigger: trigger.to_string(),
            uuid: Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_mount(mut self, mount: &str) -> Self {
        self.mount = Some(mount.to_string());
        self
    }

    /// JSON rendering used by the SSE surface and the URL sink.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}

/// Kinds of synchronous fast events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FastEventKind {
    ClientAuthed,
    ConnectionRead,
    SourceStarted,
    SourceEnded,
    StatsChanged,
}

/// Typed payloads for fast hooks.
#[derive(Debug, Clone)]
pub enum FastEvent {
    ClientAuthed {
        ip: String,
        role: String,
        username: Option<String>,
    },
    ConnectionRead {
        /// Ingest connection id; relays have none.
        connection_id: Option<u64>,
        bytes: usize,
    },
    SourceStarted {
        mount: String,
    },
    SourceEnded {
        mount: String,
    },
    StatsChanged {
        scope: String,
        name: String,
        value: String,
    },
}

impl FastEvent {
    #[must_use]
    pub fn kind(&self) -> FastEventKind {
        match self {
            Self::ClientAuthed { .. } => FastEventKind::ClientAuthed,
            Self::ConnectionRead { .. } => FastEventKind::ConnectionRead,
            Self::SourceStarted { .. } => FastEventKind::SourceStarted,
            Self::SourceEnded { .. } => FastEventKind::SourceEnded,
            Self::StatsChanged { .. } => FastEventKind::StatsChanged,
        }
    }
}

/// A synchronous subscriber.
pub type FastHook = Arc<dyn Fn(&FastEvent) + Send + Sync>;

/// Entry point for both event surfaces.
pub struct EventBus {
    tx: mpsc::Sender<Event>,
    fast: RwLock<Vec<(u64, FastEventKind, FastHook)>>,
    next_hook_id: std::sync::atomic::AtomicU64,
}

impl EventBus {
    /// Creates the bus; the receiving half goes to the dispatch task.
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_LIMIT);
        (
            Arc::new(Self {
                tx,
                fast: RwLock::new(Vec::new()),
                next_hook_id: std::sync::atomic::AtomicU64::new(1),
            }),
            rx,
        )
    }

    /// Queues a slow event. A full queue drops the event with a warning;
    /// emitters never block.
    pub fn emit(&self, event: Event) {
        if let Err(e) = self.tx.try_send(event) {
            log::warn!("event queue full, dropping event: {e}");
        }
    }

    /// Registers a synchronous hook for one fast event kind. The returned
    /// id unregisters it via [`EventBus::unsubscribe_fast`].
    pub fn subscribe_fast(&self, kind: FastEventKind, hook: FastHook) -> u64 {
        let id = self
            .next_hook_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.fast.write().push((id, kind, hook));
        id
    }

    /// Removes a fast hook.
    pub fn unsubscribe_fast(&self, id: u64) {
        self.fast.write().retain(|(hook_id, _, _)| *hook_id != id);
    }

    /// Delivers a fast event inline to every matching hook.
    pub fn emit_fast(&self, event: &FastEvent) {
        tracing::trace!(?event, "fast_event");
        let hooks = self.fast.read();
        for (_, kind, hook) in hooks.iter() {
            if *kind == event.kind() {
                hook(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn event_json_skips_empty_extras() {
        let event = Event::new("source-connect").with_mount("/live");
        let json = event.to_json();
        assert_eq!(json["trigger"], "source-connect");
        assert_eq!(json["mount"], "/live");
        assert!(json.get("client_role").is_none());
        assert!(!json["uuid"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn emit_queues_until_the_bound() {
        let (bus, mut rx) = EventBus::new();
        for _ in 0..EVENT_QUEUE_LIMIT {
            bus.emit(Event::new("tick"));
        }
        // The queue is full now; the next emit drops instead of blocking.
        bus.emit(Event::new("overflow"));
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, EVENT_QUEUE_LIMIT);
    }

    #[tokio::test]
    async fn fast_hooks_fire_synchronously_by_kind() {
        let (bus, _rx) = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hook_hits = Arc::clone(&hits);
        bus.subscribe_fast(
            FastEventKind::SourceStarted,
            Arc::new(move |event| {
                assert!(matches!(event, FastEvent::SourceStarted { .. }));
                hook_hits.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bus.emit_fast(&FastEvent::SourceStarted {
            mount: "/live".to_string(),
        });
        bus.emit_fast(&FastEvent::SourceEnded {
            mount: "/live".to_string(),
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
