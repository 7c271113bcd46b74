//! Wire protocol primitives: request parsing, URI normalization, and
//! response head rendering for the HTTP/ICE surface.

pub mod parser;
pub mod uri;

pub use parser::{parse_request, parse_status_line, Request, StatusLine};
pub use uri::normalize_uri;

use crate::error::ErrorEntry;

/// Server identification sent on every response.
pub const SERVER_ID: &str = concat!("Embercast/", env!("CARGO_PKG_VERSION"));

/// The accepted request method vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Method {
    Get,
    Post,
    Head,
    Source,
    Play,
    Stats,
    Put,
    Options,
    Delete,
}

impl Method {
    /// Parses a method token, case-insensitively.
    #[must_use]
    pub fn parse(token: &str) -> Option<Self> {
        Some(match token.to_ascii_uppercase().as_str() {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "HEAD" => Self::Head,
            "SOURCE" => Self::Source,
            "PLAY" => Self::Play,
            "STATS" => Self::Stats,
            "PUT" => Self::Put,
            "OPTIONS" => Self::Options,
            "DELETE" => Self::Delete,
            _ => return None,
        })
    }

    /// Canonical uppercase spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Head => "HEAD",
            Self::Source => "SOURCE",
            Self::Play => "PLAY",
            Self::Stats => "STATS",
            Self::Put => "PUT",
            Self::Options => "OPTIONS",
            Self::Delete => "DELETE",
        }
    }
}

/// Protocol family the client spoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Ice,
    /// Legacy SHOUTcast handshake; set after `/admin.cgi` promotion or a
    /// bare-password source handshake.
    Icy,
}

/// Reason phrase for the status codes the server emits.
#[must_use]
pub fn status_reason(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        206 => "Partial Content",
        303 => "See Other",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        415 => "Unsupported Media Type",
        416 => "Request Range Not Satisfiable",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// A response status line plus headers, rendered to the wire as HTTP/1.0.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub code: u16,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Starts a response with the standard `Server` header.
    #[must_use]
    pub fn new(code: u16) -> Self {
        Self {
            code,
            headers: vec![("Server".to_string(), SERVER_ID.to_string())],
        }
    }

    /// Appends a header. Duplicates are emitted in order.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Appends a list of preconfigured headers (mount or role extras).
    #[must_use]
    pub fn headers(mut self, extra: &[(String, String)]) -> Self {
        self.headers.extend(extra.iter().cloned());
        self
    }

    /// Renders the head including the blank line.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!("HTTP/1.0 {} {}\r\n", self.code, status_reason(self.code));
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }
}

/// Renders an error table row into a response head plus body.
///
/// The body always carries both the stable UUID and the human message;
/// clients asking for JSON get the structured form, everyone else a short
/// plaintext line.
#[must_use]
pub fn render_error(entry: &ErrorEntry, wants_json: bool) -> (ResponseHead, String) {
    if wants_json {
        let body = serde_json::json!({
            "error": entry.uuid,
            "message": entry.message,
            "status": entry.http_status,
        })
        .to_string();
        let head = ResponseHead::new(entry.http_status)
            .header("Content-Type", "application/json")
            .header("Content-Length", body.len().to_string())
            .header("Connection", "close");
        (head, body)
    } else {
        let body = format!("Error {}: {} ({})\r\n", entry.http_status, entry.message, entry.uuid);
        let head = ResponseHead::new(entry.http_status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .header("Content-Length", body.len().to_string())
            .header("Connection", "close");
        (head, body)
    }
}
