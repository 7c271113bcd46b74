//! HTTP/ICE request parsing.
//!
//! Parses a request line `METHOD URI PROTO/VER` plus headers terminated by
//! an empty line. Header names are lowercased for storage; values keep
//! their case; duplicate headers are last-wins. The parser also accepts the
//! pathological ICY status line used by legacy source servers when parsing
//! upstream responses.

use super::uri::percent_decode;
use super::{Method, Protocol};
use crate::error::CastError;

/// A parsed request head.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// The URI exactly as sent, including the query string.
    pub raw_uri: String,
    /// Path component, before normalization.
    pub path: String,
    /// Decoded query parameters in order of appearance.
    pub query: Vec<(String, String)>,
    pub protocol: Protocol,
    /// Protocol version token, e.g. `1.0`.
    pub version: String,
    headers: Vec<(String, String)>,
}

impl Request {
    /// Last value of a header, by case-insensitive name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// First query parameter with this name.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// All headers, lowercased names, in wire order.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Replaces or inserts a query parameter (used by the legacy
    /// `/admin.cgi` promotion).
    pub fn set_query_param(&mut self, name: &str, value: String) {
        if let Some(entry) = self.query.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
        } else {
            self.query.push((name.to_string(), value));
        }
    }
}

/// Parses a complete request head (everything before the blank line).
pub fn parse_request(head: &str) -> Result<Request, CastError> {
    let mut lines = head.split("\r\n").filter(|l| !l.is_empty());
    let request_line = lines
        .next()
        .ok_or_else(|| CastError::Request("empty request".to_string()))?;

    let mut parts = request_line.split_whitespace();
    let method_token = parts
        .next()
        .ok_or_else(|| CastError::Request("missing method".to_string()))?;
    let uri = parts
        .next()
        .ok_or_else(|| CastError::Request("missing URI".to_string()))?;
    let proto_token = parts
        .next()
        .ok_or_else(|| CastError::Request("missing protocol".to_string()))?;

    let method = Method::parse(method_token)
        .ok_or_else(|| CastError::Request(format!("unknown method {method_token:?}")))?;

    let (protocol, version) = parse_protocol_token(proto_token)?;

    let (path, query) = split_query(uri);

    let mut headers = Vec::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return Err(CastError::Request(format!("malformed header {line:?}")));
        };
        headers.push((
            name.trim().to_ascii_lowercase(),
            value.trim().to_string(),
        ));
    }

    Ok(Request {
        method,
        raw_uri: uri.to_string(),
        path,
        query,
        protocol,
        version,
        headers,
    })
}

fn parse_protocol_token(token: &str) -> Result<(Protocol, String), CastError> {
    let (name, version) = token
        .split_once('/')
        .ok_or_else(|| CastError::Request(format!("malformed protocol token {token:?}")))?;
    let protocol = match name.to_ascii_uppercase().as_str() {
        "HTTP" => Protocol::Http,
        "ICE" => Protocol::Ice,
        "ICY" => Protocol::Icy,
        _ => return Err(CastError::Request(format!("unknown protocol {name:?}"))),
    };
    Ok((protocol, version.to_string()))
}

fn split_query(uri: &str) -> (String, Vec<(String, String)>) {
    match uri.split_once('?') {
        None => (uri.to_string(), Vec::new()),
        Some((path, query)) => {
            let params = query
                .split('&')
                .filter(|p| !p.is_empty())
                .map(|pair| match pair.split_once('=') {
                    Some((k, v)) => (
                        percent_decode(k).unwrap_or_else(|| k.to_string()),
                        percent_decode(v).unwrap_or_else(|| v.to_string()),
                    ),
                    None => (
                        percent_decode(pair).unwrap_or_else(|| pair.to_string()),
                        String::new(),
                    ),
                })
                .collect();
            (path.to_string(), params)
        }
    }
}

/// A parsed response status line (for the relay's upstream side).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub protocol: Protocol,
    pub code: u16,
}

/// Parses `HTTP/1.x 200 OK`, `ICE/1.0 200 OK`, or the bare `ICY 200 OK`
/// form some legacy servers answer with.
pub fn parse_status_line(line: &str) -> Result<StatusLine, CastError> {
    let mut parts = line.split_whitespace();
    let proto_token = parts
        .next()
        .ok_or_else(|| CastError::Request("empty status line".to_string()))?;
    let code_token = parts
        .next()
        .ok_or_else(|| CastError::Request("missing status code".to_string()))?;

    let protocol = if proto_token.eq_ignore_ascii_case("ICY") {
        Protocol::Icy
    } else {
        parse_protocol_token(proto_token)?.0
    };
    let code = code_token
        .parse::<u16>()
        .map_err(|_| CastError::Request(format!("bad status code {code_token:?}")))?;

    Ok(StatusLine { protocol, code })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_get() {
        let req = parse_request("GET /stream HTTP/1.0\r\nHost: example\r\n").unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/stream");
        assert_eq!(req.protocol, Protocol::Http);
        assert_eq!(req.version, "1.0");
        assert_eq!(req.header("host"), Some("example"));
        assert_eq!(req.header("HOST"), Some("example"));
    }

    #[test]
    fn parses_legacy_source_handshake() {
        let req = parse_request("SOURCE /live ICE/1.0\r\nContent-Type: audio/mpeg\r\n").unwrap();
        assert_eq!(req.method, Method::Source);
        assert_eq!(req.protocol, Protocol::Ice);
        assert_eq!(req.header("content-type"), Some("audio/mpeg"));
    }

    #[test]
    fn header_names_lowercase_values_keep_case() {
        let req = parse_request("GET / HTTP/1.1\r\nX-Mixed-Case: KeepMe\r\n").unwrap();
        assert_eq!(req.headers()[0].0, "x-mixed-case");
        assert_eq!(req.header("x-mixed-case"), Some("KeepMe"));
    }

    #[test]
    fn duplicate_headers_last_wins() {
        let req = parse_request("GET / HTTP/1.0\r\nA: 1\r\nA: 2\r\n").unwrap();
        assert_eq!(req.header("a"), Some("2"));
    }

    #[test]
    fn query_parameters_are_decoded() {
        let req =
            parse_request("GET /admin.cgi?mode=updinfo&song=a+b%21 HTTP/1.0\r\n").unwrap();
        assert_eq!(req.path, "/admin.cgi");
        assert_eq!(req.query_param("mode"), Some("updinfo"));
        assert_eq!(req.query_param("song"), Some("a b!"));
    }

    #[test]
    fn unknown_method_or_protocol_rejected() {
        assert!(parse_request("BREW / HTTP/1.0\r\n").is_err());
        assert!(parse_request("GET / GOPHER/1.0\r\n").is_err());
        assert!(parse_request("GET /\r\n").is_err());
    }

    #[test]
    fn status_line_variants() {
        assert_eq!(
            parse_status_line("HTTP/1.1 200 OK").unwrap(),
            StatusLine {
                protocol: Protocol::Http,
                code: 200
            }
        );
        assert_eq!(
            parse_status_line("ICY 200 OK").unwrap(),
            StatusLine {
                protocol: Protocol::Icy,
                code: 200
            }
        );
        assert!(parse_status_line("HTTP/1.1 abc").is_err());
    }
}
