//! General utilities shared across the engine.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Returns the current Unix timestamp in whole seconds.
#[must_use]
pub fn now_secs() -> u64 {
    now_millis() / 1000
}

// ─────────────────────────────────────────────────────────────────────────────
// String Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Interprets a configuration string as a boolean.
///
/// Accepts the usual spellings: `1`, `yes`, `true`, `on` are true; everything
/// else is false. Matching is case-insensitive.
#[must_use]
pub fn str_to_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "yes" | "true" | "on"
    )
}

/// Decodes an HTTP `Authorization: Basic` header value into `(user, password)`.
///
/// Returns `None` when the scheme is not Basic, the base64 payload is invalid,
/// or the decoded credentials lack the `user:password` separator.
#[must_use]
pub fn decode_basic_auth(header_value: &str) -> Option<(String, String)> {
    let rest = header_value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(rest.trim())
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_to_bool_accepts_common_spellings() {
        assert!(str_to_bool("1"));
        assert!(str_to_bool("Yes"));
        assert!(str_to_bool("TRUE"));
        assert!(str_to_bool(" on "));
        assert!(!str_to_bool("0"));
        assert!(!str_to_bool("no"));
        assert!(!str_to_bool(""));
        assert!(!str_to_bool("maybe"));
    }

    #[test]
    fn decode_basic_auth_round_trips() {
        // base64("source:hackme")
        let header = "Basic c291cmNlOmhhY2ttZQ==";
        let (user, pass) = decode_basic_auth(header).unwrap();
        assert_eq!(user, "source");
        assert_eq!(pass, "hackme");
    }

    #[test]
    fn decode_basic_auth_rejects_other_schemes() {
        assert!(decode_basic_auth("Bearer abc").is_none());
        assert!(decode_basic_auth("Basic !!!not-base64!!!").is_none());
    }

    #[test]
    fn decode_basic_auth_requires_separator() {
        // base64("no-separator")
        let header = "Basic bm8tc2VwYXJhdG9y";
        assert!(decode_basic_auth(header).is_none());
    }
}
