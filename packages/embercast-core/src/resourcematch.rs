//! A tiny printf-inverse matcher for resource patterns.
//!
//! Patterns are literal text with embedded conversions: `%%` (literal
//! percent), `%i` (auto-base integer), `%d` (decimal), `%x` (hex), `%o`
//! (octal). Matching walks pattern and input in lockstep and captures each
//! converted integer.

/// Result of matching a pattern against an input string.
#[derive(Debug, PartialEq, Eq)]
pub enum ResourceMatch {
    /// Full match; captured groups in pattern order.
    Match(Vec<Capture>),
    /// Pattern and input diverge.
    NoMatch,
    /// The pattern itself is invalid (unknown conversion, trailing `%`).
    Error,
}

/// One captured conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    /// Conversion character (`i`, `d`, `x`, `o`).
    pub kind: char,
    /// Captured value.
    pub value: i64,
}

/// Matches `input` against `pattern`, capturing converted integers.
#[must_use]
pub fn resourcematch(pattern: &str, input: &str) -> ResourceMatch {
    let mut pattern = pattern;
    let mut input = input;
    let mut captures = Vec::new();

    loop {
        strip_common_prefix(&mut pattern, &mut input);

        if pattern.is_empty() && input.is_empty() {
            return ResourceMatch::Match(captures);
        }

        let Some(rest) = pattern.strip_prefix('%') else {
            return ResourceMatch::NoMatch;
        };
        let mut chars = rest.chars();
        let Some(conv) = chars.next() else {
            return ResourceMatch::Error;
        };
        pattern = chars.as_str();

        match conv {
            '%' => {
                if let Some(stripped) = input.strip_prefix('%') {
                    input = stripped;
                } else {
                    return ResourceMatch::NoMatch;
                }
            }
            'i' | 'd' | 'x' | 'o' => {
                let base = match conv {
                    'd' => 10,
                    'x' => 16,
                    'o' => 8,
                    _ => 0, // auto-detect
                };
                match parse_integer(input, base) {
                    Some((value, rest)) => {
                        captures.push(Capture { kind: conv, value });
                        input = rest;
                    }
                    None => return ResourceMatch::NoMatch,
                }
            }
            _ => return ResourceMatch::Error,
        }
    }
}

fn strip_common_prefix<'a>(pattern: &mut &str, input: &mut &'a str) {
    let mut p = pattern.char_indices();
    let mut s = input.char_indices();
    let mut plen = 0;
    let mut slen = 0;
    loop {
        match (p.next(), s.next()) {
            (Some((pi, pc)), Some((si, sc))) if pc != '%' && pc == sc => {
                plen = pi + pc.len_utf8();
                slen = si + sc.len_utf8();
            }
            _ => break,
        }
    }
    *pattern = &pattern[plen..];
    *input = &input[slen..];
}

/// Parses a signed integer at the front of `s`. `base == 0` auto-detects
/// `0x` hex and leading-zero octal, like `strtoll`.
fn parse_integer(s: &str, base: u32) -> Option<(i64, &str)> {
    let bytes = s.as_bytes();
    let mut pos = 0;
    let mut negative = false;

    if pos < bytes.len() && (bytes[pos] == b'-' || bytes[pos] == b'+') {
        negative = bytes[pos] == b'-';
        pos += 1;
    }

    let mut base = base;
    if base == 0 {
        if bytes[pos..].starts_with(b"0x") || bytes[pos..].starts_with(b"0X") {
            base = 16;
            pos += 2;
        } else if bytes.get(pos) == Some(&b'0') && bytes.len() > pos + 1 {
            base = 8;
            pos += 1;
        } else {
            base = 10;
        }
    } else if base == 16 && (bytes[pos..].starts_with(b"0x") || bytes[pos..].starts_with(b"0X")) {
        pos += 2;
    }

    let digits_start = pos;
    let mut value: i64 = 0;
    while pos < bytes.len() {
        let Some(digit) = (bytes[pos] as char).to_digit(base) else {
            break;
        };
        value = value
            .checked_mul(i64::from(base))?
            .checked_add(i64::from(digit))?;
        pos += 1;
    }
    if pos == digits_start && !(base == 8 && digits_start > 0 && bytes[digits_start - 1] == b'0') {
        // No digits consumed; bare "0" in auto-base mode is the one exception.
        return None;
    }

    if negative {
        value = -value;
    }
    Some((value, &s[pos..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn captured(result: ResourceMatch) -> Vec<i64> {
        match result {
            ResourceMatch::Match(caps) => caps.into_iter().map(|c| c.value).collect(),
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn literal_only_patterns() {
        assert_eq!(
            resourcematch("/stream.mp3", "/stream.mp3"),
            ResourceMatch::Match(vec![])
        );
        assert_eq!(resourcematch("/a", "/b"), ResourceMatch::NoMatch);
        assert_eq!(resourcematch("/a", "/a/b"), ResourceMatch::NoMatch);
    }

    #[test]
    fn decimal_capture() {
        assert_eq!(captured(resourcematch("/channel/%d", "/channel/42")), vec![42]);
        assert_eq!(
            captured(resourcematch("/c/%d/x/%d", "/c/1/x/2")),
            vec![1, 2]
        );
    }

    #[test]
    fn hex_and_octal_captures() {
        assert_eq!(captured(resourcematch("/h/%x", "/h/ff")), vec![255]);
        assert_eq!(captured(resourcematch("/h/%x", "/h/0xff")), vec![255]);
        assert_eq!(captured(resourcematch("/o/%o", "/o/17")), vec![15]);
    }

    #[test]
    fn auto_base_capture() {
        assert_eq!(captured(resourcematch("/%i", "/0x10")), vec![16]);
        assert_eq!(captured(resourcematch("/%i", "/010")), vec![8]);
        assert_eq!(captured(resourcematch("/%i", "/10")), vec![10]);
        assert_eq!(captured(resourcematch("/%i", "/-3")), vec![-3]);
    }

    #[test]
    fn percent_literal() {
        assert_eq!(resourcematch("/a%%b", "/a%b"), ResourceMatch::Match(vec![]));
        assert_eq!(resourcematch("/a%%b", "/ab"), ResourceMatch::NoMatch);
    }

    #[test]
    fn invalid_conversions_error() {
        assert_eq!(resourcematch("/a%s", "/aX"), ResourceMatch::Error);
        assert_eq!(resourcematch("/a%", "/a"), ResourceMatch::Error);
    }

    #[test]
    fn missing_digits_do_not_match() {
        assert_eq!(resourcematch("/c/%d", "/c/abc"), ResourceMatch::NoMatch);
        assert_eq!(resourcematch("/c/%d", "/c/"), ResourceMatch::NoMatch);
    }

    #[test]
    fn round_trip_reformats_input() {
        // Formatting captures back through the pattern reproduces the input
        // (modulo leading zeros on %d).
        let pattern = "/mount/%d/part/%x";
        let input = "/mount/123/part/2a";
        let caps = captured(resourcematch(pattern, input));
        let rebuilt = format!("/mount/{}/part/{:x}", caps[0], caps[1]);
        assert_eq!(rebuilt, input);
    }
}
