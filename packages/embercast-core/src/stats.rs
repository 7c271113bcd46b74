//! Thread-safe server statistics.
//!
//! A keyed store of `(scope, name) -> value` where scope is `global` or a
//! mount name. Mutations emit fast events so in-process subscribers see
//! changes as they happen; the HTTP stats surface renders snapshots as XML.

use std::io::Cursor;
use std::sync::Arc;

use dashmap::DashMap;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event as XmlEvent};
use quick_xml::Writer;

use crate::events::{EventBus, FastEvent};

/// Scope name for server-wide values.
pub const GLOBAL_SCOPE: &str = "global";

/// One stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsValue {
    Int(i64),
    Str(String),
}

impl StatsValue {
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Str(v) => v.clone(),
        }
    }
}

/// The statistics store.
pub struct Stats {
    scopes: DashMap<String, DashMap<String, StatsValue>>,
    bus: Option<Arc<EventBus>>,
}

impl Stats {
    /// A store that emits change events on `bus`.
    #[must_use]
    pub fn new(bus: Option<Arc<EventBus>>) -> Self {
        Self {
            scopes: DashMap::new(),
            bus,
        }
    }

    /// Sets a string value.
    pub fn set(&self, scope: &str, name: &str, value: impl Into<String>) {
        let value = StatsValue::Str(value.into());
        self.store(scope, name, value);
    }

    /// Sets an integer value.
    pub fn set_int(&self, scope: &str, name: &str, value: i64) {
        self.store(scope, name, StatsValue::Int(value));
    }

    /// Adds `delta` to a numeric value, treating absent or non-numeric
    /// values as zero.
    pub fn add(&self, scope: &str, name: &str, delta: i64) {
        let scope_map = self
            .scopes
            .entry(scope.to_string())
            .or_default();
        let mut entry = scope_map
            .entry(name.to_string())
            .or_insert(StatsValue::Int(0));
        let current = match entry.value() {
            StatsValue::Int(v) => *v,
            StatsValue::Str(s) => s.parse().unwrap_or(0),
        };
        *entry.value_mut() = StatsValue::Int(current + delta);
        let rendered = entry.value().render();
        drop(entry);
        drop(scope_map);
        self.changed(scope, name, rendered);
    }

    /// Increments a counter.
    pub fn inc(&self, scope: &str, name: &str) {
        self.add(scope, name, 1);
    }

    /// Decrements a counter.
    pub fn dec(&self, scope: &str, name: &str) {
        self.add(scope, name, -1);
    }

    /// Removes one value.
    pub fn unset(&self, scope: &str, name: &str) {
        if let Some(scope_map) = self.scopes.get(scope) {
            scope_map.remove(name);
        }
    }

    /// Removes a whole scope (a mount going away).
    pub fn clear_scope(&self, scope: &str) {
        self.scopes.remove(scope);
    }

    /// Reads one value.
    #[must_use]
    pub fn get(&self, scope: &str, name: &str) -> Option<StatsValue> {
        self.scopes
            .get(scope)?
            .get(name)
            .map(|v| v.value().clone())
    }

    fn store(&self, scope: &str, name: &str, value: StatsValue) {
        let rendered = value.render();
        self.scopes
            .entry(scope.to_string())
            .or_default()
            .insert(name.to_string(), value);
        self.changed(scope, name, rendered);
    }

    fn changed(&self, scope: &str, name: &str, value: String) {
        if let Some(bus) = &self.bus {
            bus.emit_fast(&FastEvent::StatsChanged {
                scope: scope.to_string(),
                name: name.to_string(),
                value,
            });
        }
    }

    /// Renders the whole store as an XML document.
    ///
    /// Global values become top-level elements; each mount scope becomes a
    /// `<source mount="...">` element. Keys are sorted for a stable
    /// rendering.
    #[must_use]
    pub fn snapshot_xml(&self) -> String {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        let _ = writer.write_event(XmlEvent::Start(BytesStart::new("embercast")));

        if let Some(global) = self.scopes.get(GLOBAL_SCOPE) {
            write_scope_values(&mut writer, &global);
        }

        let mut mounts: Vec<String> = self
            .scopes
            .iter()
            .map(|s| s.key().clone())
            .filter(|s| s != GLOBAL_SCOPE)
            .collect();
        mounts.sort();
        for mount in mounts {
            if let Some(values) = self.scopes.get(&mount) {
                let mut start = BytesStart::new("source");
                start.push_attribute(("mount", mount.as_str()));
                let _ = writer.write_event(XmlEvent::Start(start));
                write_scope_values(&mut writer, &values);
                let _ = writer.write_event(XmlEvent::End(BytesEnd::new("source")));
            }
        }

        let _ = writer.write_event(XmlEvent::End(BytesEnd::new("embercast")));
        String::from_utf8(writer.into_inner().into_inner()).unwrap_or_default()
    }
}

fn write_scope_values(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    values: &DashMap<String, StatsValue>,
) {
    let mut keys: Vec<String> = values.iter().map(|v| v.key().clone()).collect();
    keys.sort();
    for key in keys {
        if let Some(value) = values.get(&key) {
            let _ = writer.write_event(XmlEvent::Start(BytesStart::new(key.as_str())));
            let _ = writer.write_event(XmlEvent::Text(BytesText::new(&value.value().render())));
            let _ = writer.write_event(XmlEvent::End(BytesEnd::new(key.as_str())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FastEventKind;
    use parking_lot::Mutex;

    #[test]
    fn set_get_unset_round_trip() {
        let stats = Stats::new(None);
        stats.set(GLOBAL_SCOPE, "server_id", "embercast");
        stats.set_int("/live", "listeners", 3);
        assert_eq!(
            stats.get(GLOBAL_SCOPE, "server_id"),
            Some(StatsValue::Str("embercast".to_string()))
        );
        assert_eq!(stats.get("/live", "listeners"), Some(StatsValue::Int(3)));
        stats.unset("/live", "listeners");
        assert_eq!(stats.get("/live", "listeners"), None);
    }

    #[test]
    fn inc_dec_are_numeric() {
        let stats = Stats::new(None);
        stats.inc(GLOBAL_SCOPE, "clients");
        stats.inc(GLOBAL_SCOPE, "clients");
        stats.dec(GLOBAL_SCOPE, "clients");
        assert_eq!(stats.get(GLOBAL_SCOPE, "clients"), Some(StatsValue::Int(1)));
    }

    #[test]
    fn clear_scope_drops_mount_values() {
        let stats = Stats::new(None);
        stats.set_int("/live", "listeners", 5);
        stats.clear_scope("/live");
        assert_eq!(stats.get("/live", "listeners"), None);
    }

    #[test]
    fn snapshot_renders_global_and_mount_scopes() {
        let stats = Stats::new(None);
        stats.set(GLOBAL_SCOPE, "host", "localhost");
        stats.set_int("/live", "listeners", 2);
        let xml = stats.snapshot_xml();
        assert!(xml.contains("<embercast>"));
        assert!(xml.contains("<host>localhost</host>"));
        assert!(xml.contains("<source mount=\"/live\">"));
        assert!(xml.contains("<listeners>2</listeners>"));
    }

    #[test]
    fn changes_emit_fast_events() {
        let (bus, _rx) = EventBus::new();
        let seen: Arc<Mutex<Vec<(String, String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe_fast(
            FastEventKind::StatsChanged,
            Arc::new(move |event| {
                if let FastEvent::StatsChanged { scope, name, value } = event {
                    sink.lock().push((scope.clone(), name.clone(), value.clone()));
                }
            }),
        );
        let stats = Stats::new(Some(Arc::clone(&bus)));
        stats.set_int("/live", "listeners", 1);
        stats.inc("/live", "listeners");
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], ("/live".into(), "listeners".into(), "2".into()));
    }
}
