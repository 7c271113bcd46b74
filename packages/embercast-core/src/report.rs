//! Structured report documents.
//!
//! A report is a tree of incidents, each carrying a state identified by a
//! stable definition UUID plus optional human-readable texts. Definitions
//! live in a small database keyed by UUID so states and recommended fixes
//! can be shared across reports. Administration endpoints render these to
//! XML; the request hot path never builds them.

use std::collections::HashMap;
use std::io::Cursor;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event as XmlEvent};
use quick_xml::Writer;

use crate::error::{error_by_uuid, ErrorId};

/// A shared state or fix definition.
#[derive(Debug, Clone)]
pub struct Definition {
    pub uuid: String,
    pub kind: DefinitionKind,
    pub text: Option<String>,
}

/// What a definition describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionKind {
    State,
    Fix,
}

/// Definitions keyed by UUID.
#[derive(Debug, Default)]
pub struct DefinitionDatabase {
    entries: HashMap<String, Definition>,
}

impl DefinitionDatabase {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A database preloaded with the wire error table, so error reports
    /// resolve their state texts without extra configuration.
    #[must_use]
    pub fn with_error_table() -> Self {
        let mut db = Self::new();
        for id in [
            ErrorId::ConMountInUse,
            ErrorId::GenClientNeedsToAuthenticate,
            ErrorId::SourceMaxListeners,
            ErrorId::GenClientLimit,
            ErrorId::ConSourceClientLimit,
            ErrorId::AuthBusy,
        ] {
            let entry = id.entry();
            db.insert(Definition {
                uuid: entry.uuid.to_string(),
                kind: DefinitionKind::State,
                text: Some(entry.message.to_string()),
            });
        }
        db
    }

    pub fn insert(&mut self, definition: Definition) {
        self.entries.insert(definition.uuid.clone(), definition);
    }

    #[must_use]
    pub fn get(&self, uuid: &str) -> Option<&Definition> {
        self.entries.get(uuid)
    }

    /// Falls back to the wire error table for UUIDs not loaded here.
    #[must_use]
    pub fn resolve_text(&self, uuid: &str) -> Option<String> {
        if let Some(def) = self.get(uuid) {
            return def.text.clone();
        }
        error_by_uuid(uuid).map(|e| e.message.to_string())
    }
}

/// One incident inside a report.
#[derive(Debug, Clone)]
pub struct Incident {
    /// Definition UUID of the state.
    pub state: String,
    pub text: Option<String>,
    /// Definition UUIDs of recommended fixes.
    pub fixes: Vec<String>,
}

/// A report document.
#[derive(Debug, Clone, Default)]
pub struct Report {
    pub incidents: Vec<Incident>,
}

impl Report {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A single-incident report for a wire error row.
    #[must_use]
    pub fn from_error(id: ErrorId) -> Self {
        let entry = id.entry();
        Self {
            incidents: vec![Incident {
                state: entry.uuid.to_string(),
                text: Some(entry.message.to_string()),
                fixes: Vec::new(),
            }],
        }
    }

    pub fn push(&mut self, incident: Incident) {
        self.incidents.push(incident);
    }

    /// Renders the report, resolving state texts through `db`.
    #[must_use]
    pub fn render_xml(&self, db: &DefinitionDatabase) -> String {
        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        let _ = writer.write_event(XmlEvent::Start(BytesStart::new("report")));
        for incident in &self.incidents {
            let _ = writer.write_event(XmlEvent::Start(BytesStart::new("incident")));

            let mut state = BytesStart::new("state");
            state.push_attribute(("definition", incident.state.as_str()));
            let _ = writer.write_event(XmlEvent::Start(state));
            let text = incident
                .text
                .clone()
                .or_else(|| db.resolve_text(&incident.state));
            if let Some(text) = text {
                let _ = writer.write_event(XmlEvent::Start(BytesStart::new("text")));
                let _ = writer.write_event(XmlEvent::Text(BytesText::new(&text)));
                let _ = writer.write_event(XmlEvent::End(BytesEnd::new("text")));
            }
            let _ = writer.write_event(XmlEvent::End(BytesEnd::new("state")));

            for fix in &incident.fixes {
                let mut element = BytesStart::new("fix");
                element.push_attribute(("definition", fix.as_str()));
                let _ = writer.write_event(XmlEvent::Empty(element));
            }

            let _ = writer.write_event(XmlEvent::End(BytesEnd::new("incident")));
        }
        let _ = writer.write_event(XmlEvent::End(BytesEnd::new("report")));
        String::from_utf8(writer.into_inner().into_inner()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_report_renders_state_and_text() {
        let db = DefinitionDatabase::with_error_table();
        let report = Report::from_error(ErrorId::ConMountInUse);
        let xml = report.render_xml(&db);
        assert!(xml.contains("<report>"));
        assert!(xml.contains("definition=\"c5724467-5f85-48c7-b45a-915c3150c292\""));
        assert!(xml.contains("<text>Mountpoint in use</text>"));
    }

    #[test]
    fn definition_database_resolves_unloaded_uuids_from_table() {
        let db = DefinitionDatabase::new();
        assert_eq!(
            db.resolve_text("c5724467-5f85-48c7-b45a-915c3150c292"),
            Some("Mountpoint in use".to_string())
        );
        assert_eq!(db.resolve_text("00000000-0000-0000-0000-000000000000"), None);
    }

    #[test]
    fn fixes_render_as_empty_elements() {
        let db = DefinitionDatabase::new();
        let mut report = Report::new();
        report.push(Incident {
            state: "abc".to_string(),
            text: Some("broken".to_string()),
            fixes: vec!["fix-1".to_string()],
        });
        let xml = report.render_xml(&db);
        assert!(xml.contains("<fix definition=\"fix-1\"/>"));
    }
}
