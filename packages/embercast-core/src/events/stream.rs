//! The server-sent-events surface over the event bus.
//!
//! The hub keeps a bounded ring of rendered events. Each subscribed client
//! holds a cursor into the ring; eviction marks an event `removed`, and a
//! client still pointing at a removed event has fallen out of the
//! retention window and is closed. `Last-Event-Id` resumes at the event
//! after the given UUID, or at the oldest retained event when the UUID is
//! unknown.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;

use super::Event;
use crate::tls::NetStream;

/// Events retained for late readers.
const MAX_RETAINED_EVENTS: usize = 32;

/// Poll ceiling for idle subscribers.
const IDLE_TICK: Duration = Duration::from_millis(200);

/// One event rendered to the wire format.
pub struct RenderedEvent {
    pub uuid: String,
    pub mount: Option<String>,
    pub rendered: Bytes,
    removed: AtomicBool,
}

impl RenderedEvent {
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

/// What a subscriber asked to see.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events for this mount.
    pub mount: Option<String>,
    /// Only global (mountless) events when `Some(true)`.
    pub global: Option<bool>,
}

impl EventFilter {
    #[must_use]
    pub fn matches(&self, event: &RenderedEvent) -> bool {
        match (&self.mount, self.global) {
            (None, None) => true,
            (Some(mount), global) => {
                event.mount.as_deref() == Some(mount.as_str())
                    || (global == Some(true) && event.mount.is_none())
            }
            (None, Some(true)) => event.mount.is_none(),
            (None, Some(false)) => event.mount.is_some(),
        }
    }
}

/// Bounded ring of rendered events plus subscriber wakeup.
pub struct EventStreamHub {
    ring: Mutex<VecDeque<Arc<RenderedEvent>>>,
    notify: Notify,
}

impl EventStreamHub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(MAX_RETAINED_EVENTS)),
            notify: Notify::new(),
        }
    }

    /// Renders and retains an event, evicting the oldest past capacity.
    pub fn publish(&self, event: &Event) {
        let body = event.to_json().to_string();
        let rendered = format!("id: {}\r\ndata: {}\r\n\r\n", event.uuid, body);
        let entry = Arc::new(RenderedEvent {
            uuid: event.uuid.clone(),
            mount: event.mount.clone(),
            rendered: Bytes::from(rendered),
            removed: AtomicBool::new(false),
        });

        let mut ring = self.ring.lock();
        while ring.len() >= MAX_RETAINED_EVENTS {
            if let Some(old) = ring.pop_front() {
                old.removed.store(true, Ordering::SeqCst);
            }
        }
        ring.push_back(entry);
        drop(ring);
        self.notify.notify_waiters();
    }

    /// Resolves a `Last-Event-Id` to a cursor. An unknown or evicted UUID
    /// yields `None`: delivery starts at the oldest retained event.
    #[must_use]
    pub fn resolve_cursor(&self, last_event_id: Option<&str>) -> Option<Arc<RenderedEvent>> {
        let id = last_event_id?;
        self.ring.lock().iter().find(|e| e.uuid == id).cloned()
    }

    /// Retained events strictly after `cursor` that pass `filter`.
    /// `None` starts at the oldest retained event.
    #[must_use]
    pub fn collect_after(
        &self,
        cursor: Option<&Arc<RenderedEvent>>,
        filter: &EventFilter,
    ) -> Vec<Arc<RenderedEvent>> {
        let ring = self.ring.lock();
        let skip = match cursor {
            Some(cursor) => ring
                .iter()
                .position(|e| Arc::ptr_eq(e, cursor))
                .map(|idx| idx + 1)
                // Cursor already evicted; the caller notices via the
                // removed flag and closes.
                .unwrap_or(0),
            None => 0,
        };
        ring.iter()
            .skip(skip)
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// Future resolving at the next publish.
    pub fn wait(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }
}

impl Default for EventStreamHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Serves one subscriber until it falls behind, errors out, or the server
/// shuts down. The response head must already be sent.
pub async fn run_subscriber(
    hub: Arc<EventStreamHub>,
    mut stream: Box<dyn NetStream>,
    filter: EventFilter,
    last_event_id: Option<String>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut cursor = hub.resolve_cursor(last_event_id.as_deref());

    loop {
        if let Some(current) = &cursor {
            if current.is_removed() {
                // Fell out of the retention window.
                break;
            }
        }

        let batch = hub.collect_after(cursor.as_ref(), &filter);
        for event in batch {
            if stream.write_all(&event.rendered).await.is_err() {
                return;
            }
            cursor = Some(event);
        }
        if stream.flush().await.is_err() {
            return;
        }

        tokio::select! {
            _ = hub.wait() => {}
            _ = tokio::time::sleep(IDLE_TICK) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(trigger: &str, mount: Option<&str>) -> Event {
        let mut e = Event::new(trigger);
        e.mount = mount.map(String::from);
        e
    }

    #[test]
    fn publish_renders_sse_frame() {
        let hub = EventStreamHub::new();
        let e = event("source-connect", Some("/live"));
        let uuid = e.uuid.clone();
        hub.publish(&e);
        let all = hub.collect_after(None, &EventFilter::default());
        assert_eq!(all.len(), 1);
        let text = String::from_utf8_lossy(&all[0].rendered).into_owned();
        assert!(text.starts_with(&format!("id: {uuid}\r\ndata: ")));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(text.contains("source-connect"));
    }

    #[test]
    fn ring_evicts_and_marks_removed() {
        let hub = EventStreamHub::new();
        let first = event("e", None);
        hub.publish(&first);
        let first_entry = hub.collect_after(None, &EventFilter::default())[0].clone();
        for _ in 0..MAX_RETAINED_EVENTS {
            hub.publish(&event("e", None));
        }
        assert!(first_entry.is_removed());
        let retained = hub.collect_after(None, &EventFilter::default());
        assert_eq!(retained.len(), MAX_RETAINED_EVENTS);
        assert!(retained.iter().all(|e| !Arc::ptr_eq(e, &first_entry)));
    }

    #[test]
    fn unknown_last_event_id_starts_at_oldest() {
        let hub = EventStreamHub::new();
        hub.publish(&event("a", None));
        hub.publish(&event("b", None));
        let cursor = hub.resolve_cursor(Some("not-a-known-uuid"));
        assert!(cursor.is_none());
        let batch = hub.collect_after(cursor.as_ref(), &EventFilter::default());
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn known_last_event_id_resumes_after_it() {
        let hub = EventStreamHub::new();
        let a = event("a", None);
        let a_uuid = a.uuid.clone();
        hub.publish(&a);
        let b = event("b", None);
        let b_uuid = b.uuid.clone();
        hub.publish(&b);

        let cursor = hub.resolve_cursor(Some(&a_uuid));
        assert!(cursor.is_some());
        let batch = hub.collect_after(cursor.as_ref(), &EventFilter::default());
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].uuid, b_uuid);
    }

    #[test]
    fn filter_selects_mount_and_global() {
        let hub = EventStreamHub::new();
        hub.publish(&event("g", None));
        hub.publish(&event("m", Some("/live")));
        hub.publish(&event("o", Some("/other")));

        let mount_only = EventFilter {
            mount: Some("/live".to_string()),
            global: None,
        };
        let batch = hub.collect_after(None, &mount_only);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].mount.as_deref(), Some("/live"));

        let mount_and_global = EventFilter {
            mount: Some("/live".to_string()),
            global: Some(true),
        };
        assert_eq!(hub.collect_after(None, &mount_and_global).len(), 2);

        let global_only = EventFilter {
            mount: None,
            global: Some(true),
        };
        assert_eq!(hub.collect_after(None, &global_only).len(), 1);
    }
}
