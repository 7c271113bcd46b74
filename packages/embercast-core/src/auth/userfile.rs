//! Credential-file authenticator.
//!
//! One `user:sha256-hex` entry per line, `#` comments allowed. The file is
//! reloaded when its mtime changes, rechecked at most every ten seconds.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::acl::Acl;

use super::{AuthRequest, AuthResult, Authenticator};

const RECHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Users and password digests loaded from a text file.
pub struct UserFileAuthenticator {
    role: String,
    acl: Arc<Acl>,
    path: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    recheck_after: Option<Instant>,
    mtime: Option<SystemTime>,
    users: HashMap<String, String>,
}

impl UserFileAuthenticator {
    #[must_use]
    pub fn new(role: &str, acl: Arc<Acl>, path: &Path) -> Self {
        let auth = Self {
            role: role.to_string(),
            acl,
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                recheck_after: None,
                mtime: None,
                users: HashMap::new(),
            }),
        };
        auth.recheck(&mut auth.inner.lock());
        auth
    }

    fn recheck(&self, inner: &mut Inner) {
        let now = Instant::now();
        if let Some(after) = inner.recheck_after {
            if now < after {
                return;
            }
        }
        inner.recheck_after = Some(now + RECHECK_INTERVAL);

        let Ok(meta) = std::fs::metadata(&self.path) else {
            log::warn!("credential file {} not readable", self.path.display());
            return;
        };
        let mtime = meta.modified().ok();
        if mtime.is_some() && mtime == inner.mtime {
            return;
        }
        inner.mtime = mtime;

        let Ok(file) = std::fs::File::open(&self.path) else {
            log::warn!("failed to open credential file {}", self.path.display());
            return;
        };
        let mut users = HashMap::new();
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((user, digest)) = line.split_once(':') {
                users.insert(user.to_string(), digest.to_ascii_lowercase());
            }
        }
        inner.users = users;
    }

    fn lookup(&self, username: &str) -> Option<String> {
        let mut inner = self.inner.lock();
        self.recheck(&mut inner);
        inner.users.get(username).cloned()
    }
}

/// Hex SHA-256 of a password, the digest format the file stores.
#[must_use]
pub fn password_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

#[async_trait]
impl Authenticator for UserFileAuthenticator {
    fn role(&self) -> &str {
        &self.role
    }

    fn acl(&self) -> Arc<Acl> {
        Arc::clone(&self.acl)
    }

    async fn authenticate(&self, request: &AuthRequest) -> AuthResult {
        let Some(username) = request.username.as_deref() else {
            return AuthResult::NoMatch;
        };
        let Some(expected) = self.lookup(username) else {
            return AuthResult::NoMatch;
        };
        match request.password.as_deref() {
            Some(password) if password_digest(password) == expected => AuthResult::Ok,
            _ => AuthResult::Fail,
        }
    }
}
