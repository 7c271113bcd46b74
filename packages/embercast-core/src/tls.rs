//! TLS mode enforcement and the provider contract.
//!
//! The engine decides *when* a connection must be secured; the actual
//! handshake lives behind [`TlsProvider`] so deployments choose their TLS
//! implementation (or none).

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::TlsMode;
use crate::protocol::Request;

/// Object-safe byte stream; plain TCP and TLS-wrapped streams both qualify.
pub trait NetStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> NetStream for T {}

/// Performs TLS handshakes on demand.
#[async_trait]
pub trait TlsProvider: Send + Sync {
    /// Whether a usable certificate/key is configured.
    fn available(&self) -> bool;

    /// Wraps `stream` in a server-side TLS session.
    async fn accept(&self, stream: Box<dyn NetStream>) -> io::Result<Box<dyn NetStream>>;
}

/// Provider used when no TLS backend is wired in.
pub struct NoTlsProvider;

#[async_trait]
impl TlsProvider for NoTlsProvider {
    fn available(&self) -> bool {
        false
    }

    async fn accept(&self, _stream: Box<dyn NetStream>) -> io::Result<Box<dyn NetStream>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no TLS provider configured",
        ))
    }
}

/// Outcome of evaluating a request against the socket's TLS mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeDecision {
    /// Nothing TLS-related; continue as-is.
    Proceed,
    /// Reply 101 and hand the connection to the provider.
    Switch,
    /// Plain client on a TLS-required socket: reply 426.
    Require,
    /// Malformed or impossible upgrade: reply with the upgrade error row.
    Reject,
}

/// Applies the §upgrade rules: an `Upgrade: TLS/1.0` with a matching
/// `Connection` header switches when the mode permits; plain clients are
/// refused when the mode demands TLS.
#[must_use]
pub fn evaluate_upgrade(request: &Request, mode: TlsMode, already_tls: bool) -> UpgradeDecision {
    let upgrade = request.header("upgrade");
    let connection = request.header("connection");

    let upgrade_requested = matches!(
        (upgrade, connection),
        (Some(_), Some(c)) if c.eq_ignore_ascii_case("upgrade")
    );

    if upgrade_requested {
        let wants_tls = upgrade.is_some_and(|u| u.contains("TLS/1.0"));
        if mode == TlsMode::Disabled || already_tls || !wants_tls {
            return UpgradeDecision::Reject;
        }
        return UpgradeDecision::Switch;
    }

    if !already_tls && !mode.allows_plain() {
        return UpgradeDecision::Require;
    }

    UpgradeDecision::Proceed
}
