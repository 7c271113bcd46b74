//! IP allow/deny lists backed by plain text files.
//!
//! One token per line; lines beginning with `#` are comments. The file is
//! reloaded when its mtime changes, rechecked at most once every ten seconds
//! so a busy accept path doesn't hammer `stat`.

use std::collections::BTreeSet;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

const RECHECK_INTERVAL: Duration = Duration::from_secs(10);

/// A reloadable set of match keys read from a text file.
pub struct Matchfile {
    filename: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    recheck_after: Option<Instant>,
    mtime: Option<SystemTime>,
    contents: BTreeSet<String>,
}

impl Matchfile {
    /// Creates a matchfile and loads the initial contents.
    ///
    /// A missing or unreadable file logs a warning and behaves as empty;
    /// it is picked up once it appears.
    #[must_use]
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        let file = Self {
            filename: filename.into(),
            inner: Mutex::new(Inner {
                recheck_after: None,
                mtime: None,
                contents: BTreeSet::new(),
            }),
        };
        file.recheck(&mut file.inner.lock());
        file
    }

    /// Tests whether `key` is present, reloading the file first if due.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        self.recheck(&mut inner);
        inner.contents.contains(key)
    }

    fn recheck(&self, inner: &mut Inner) {
        let now = Instant::now();
        if let Some(after) = inner.recheck_after {
            if now < after {
                return;
            }
        }
        inner.recheck_after = Some(now + RECHECK_INTERVAL);

        let meta = match std::fs::metadata(&self.filename) {
            Ok(meta) => meta,
            Err(e) => {
                log::warn!(
                    "failed to check status of {}: {}",
                    self.filename.display(),
                    e
                );
                return;
            }
        };
        let mtime = meta.modified().ok();
        if mtime.is_some() && mtime == inner.mtime {
            // common case, no update to file
            return;
        }
        inner.mtime = mtime;

        let input = match std::fs::File::open(&self.filename) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("failed to open {}: {}", self.filename.display(), e);
                return;
            }
        };

        let mut new_contents = BTreeSet::new();
        for line in BufReader::new(input).lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            new_contents.insert(line.to_string());
        }
        inner.contents = new_contents;
    }
}

/// Composes an allow list and a deny list over a key.
///
/// A deny hit rejects. If an allow list is present, a miss there rejects.
/// Otherwise the key is accepted. Both lists absent accepts everything;
/// a `None` key is rejected unless both lists are absent.
#[must_use]
pub fn match_allow_deny(
    allow: Option<&Matchfile>,
    deny: Option<&Matchfile>,
    key: Option<&str>,
) -> bool {
    if allow.is_none() && deny.is_none() {
        return true;
    }
    let Some(key) = key else { return false };

    if let Some(deny) = deny {
        if deny.matches(key) {
            log::debug!("{key} is banned");
            return false;
        }
    }
    if let Some(allow) = allow {
        if !allow.matches(key) {
            log::debug!("{key} is not allowed");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_matchfile(lines: &str) -> (tempfile::TempDir, Matchfile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(lines.as_bytes()).unwrap();
        (dir, Matchfile::new(path))
    }

    #[test]
    fn matches_listed_keys() {
        let (_dir, file) = write_matchfile("10.0.0.1\n# comment\n10.0.0.2\n\n");
        assert!(file.matches("10.0.0.1"));
        assert!(file.matches("10.0.0.2"));
        assert!(!file.matches("10.0.0.3"));
        assert!(!file.matches("# comment"));
    }

    #[test]
    fn missing_file_behaves_as_empty() {
        let file = Matchfile::new("/nonexistent/path/list.txt");
        assert!(!file.matches("anything"));
    }

    #[test]
    fn allow_deny_composition() {
        let (_d1, allow) = write_matchfile("1.1.1.1\n2.2.2.2\n");
        let (_d2, deny) = write_matchfile("2.2.2.2\n");

        // deny hit rejects even when allowed
        assert!(!match_allow_deny(Some(&allow), Some(&deny), Some("2.2.2.2")));
        // allow present, key missing from allow
        assert!(!match_allow_deny(Some(&allow), Some(&deny), Some("3.3.3.3")));
        // allowed and not denied
        assert!(match_allow_deny(Some(&allow), Some(&deny), Some("1.1.1.1")));
        // no lists at all accepts
        assert!(match_allow_deny(None, None, Some("9.9.9.9")));
        assert!(match_allow_deny(None, None, None));
        // lists present but no key
        assert!(!match_allow_deny(Some(&allow), None, None));
    }

    #[test]
    fn repeated_queries_are_stable_between_reloads() {
        let (_dir, file) = write_matchfile("a\nb\n");
        for _ in 0..5 {
            assert!(file.matches("a"));
            assert!(!file.matches("z"));
        }
    }
}
