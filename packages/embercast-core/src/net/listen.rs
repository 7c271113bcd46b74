//! The listen-socket container.
//!
//! Owns every bound server socket. Reconfiguration adopts sockets whose
//! `(bind address, port)` identity is unchanged (updating only their
//! configuration snapshot), binds the new ones, and releases whatever was
//! not adopted, so established listeners never drop on a config reload.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use parking_lot::RwLock;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};

use crate::config::ListenSpec;

/// Poll granularity of the accept loop; reconfigures are picked up within
/// one tick.
const ACCEPT_TICK: Duration = Duration::from_millis(200);

/// One configured listener, bound or virtual.
pub struct BoundSocket {
    spec: RwLock<ListenSpec>,
    /// `None` for virtual entries and for sockets whose setup failed.
    listener: Option<TcpListener>,
}

impl BoundSocket {
    /// Current configuration snapshot.
    #[must_use]
    pub fn spec(&self) -> ListenSpec {
        self.spec.read().clone()
    }

    /// Whether an OS socket is accepting here.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.listener.is_some()
    }

    /// The OS-level bound address, resolving an ephemeral port request.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref()?.local_addr().ok()
    }
}

/// A freshly accepted connection, tagged with its producers.
pub struct Accepted {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub listen: Arc<BoundSocket>,
    /// The listener this one fronts for, when `on_behalf_of` is set;
    /// otherwise the accepting listener itself.
    pub effective: Arc<BoundSocket>,
}

/// Owns the bound socket set.
#[derive(Default)]
pub struct ListenContainer {
    sockets: RwLock<Vec<Arc<BoundSocket>>>,
}

impl ListenContainer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a new ordered listener list.
    ///
    /// Bind failures log and leave the entry unusable rather than failing
    /// the whole reconfigure.
    pub fn configure(&self, specs: &[ListenSpec]) {
        let old: Vec<Arc<BoundSocket>> = self.sockets.read().clone();
        let mut adopted: Vec<bool> = vec![false; old.len()];
        let mut next: Vec<Arc<BoundSocket>> = Vec::with_capacity(specs.len());

        for spec in specs {
            if spec.virtual_only {
                next.push(Arc::new(BoundSocket {
                    spec: RwLock::new(spec.clone()),
                    listener: None,
                }));
                continue;
            }

            let existing = old.iter().enumerate().find(|(idx, socket)| {
                !adopted[*idx]
                    && socket.is_bound()
                    && socket.spec.read().identity() == spec.identity()
            });
            if let Some((idx, socket)) = existing {
                adopted[idx] = true;
                *socket.spec.write() = spec.clone();
                next.push(Arc::clone(socket));
                continue;
            }

            let listener = match bind_listener(spec) {
                Ok(listener) => {
                    log::info!(
                        "listening on {}:{}",
                        spec.bind_address.as_deref().unwrap_or("*"),
                        spec.port
                    );
                    Some(listener)
                }
                Err(e) => {
                    log::error!(
                        "failed to bind {}:{}: {}",
                        spec.bind_address.as_deref().unwrap_or("*"),
                        spec.port,
                        e
                    );
                    None
                }
            };
            next.push(Arc::new(BoundSocket {
                spec: RwLock::new(spec.clone()),
                listener,
            }));
        }

        // Swapping the list releases every socket that was not adopted.
        *self.sockets.write() = next;
    }

    /// Resolves a listener by its configured id.
    #[must_use]
    pub fn by_id(&self, id: &str) -> Option<Arc<BoundSocket>> {
        self.sockets
            .read()
            .iter()
            .find(|s| s.spec.read().id.as_deref() == Some(id))
            .cloned()
    }

    /// Addresses of every bound socket.
    #[must_use]
    pub fn bound_addrs(&self) -> Vec<SocketAddr> {
        self.sockets
            .read()
            .iter()
            .filter_map(|s| s.local_addr())
            .collect()
    }

    /// Number of entries, bound or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sockets.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sockets.read().is_empty()
    }

    /// Waits for the next connection on any bound socket.
    ///
    /// Returns within one tick even when idle so callers observe shutdown
    /// and reconfigures promptly; `None` means "nothing this tick".
    pub async fn accept(&self) -> Option<io::Result<Accepted>> {
        let bound: Vec<Arc<BoundSocket>> = self
            .sockets
            .read()
            .iter()
            .filter(|s| s.is_bound())
            .cloned()
            .collect();

        if bound.is_empty() {
            tokio::time::sleep(ACCEPT_TICK).await;
            return None;
        }

        let accepts = bound.iter().map(|socket| {
            let socket = Arc::clone(socket);
            Box::pin(async move {
                let result = socket
                    .listener
                    .as_ref()
                    .expect("filtered to bound sockets")
                    .accept()
                    .await;
                (socket, result)
            })
        });

        let race = select_all(accepts);
        let (socket, result) = match tokio::time::timeout(ACCEPT_TICK, race).await {
            Ok((out, _, _)) => out,
            Err(_) => return None,
        };

        match result {
            Ok((stream, peer)) => {
                let effective = socket
                    .spec
                    .read()
                    .on_behalf_of
                    .as_deref()
                    .and_then(|id| self.by_id(id))
                    .unwrap_or_else(|| Arc::clone(&socket));
                Some(Ok(Accepted {
                    stream,
                    peer,
                    listen: socket,
                    effective,
                }))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

fn bind_listener(spec: &ListenSpec) -> io::Result<TcpListener> {
    let bind_ip = spec.bind_address.as_deref().unwrap_or("0.0.0.0");
    let addr: SocketAddr = format!("{}:{}", bind_ip, spec.port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("{e}")))?;

    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(port: u16, id: Option<&str>) -> ListenSpec {
        ListenSpec {
            bind_address: Some("127.0.0.1".to_string()),
            port,
            id: id.map(String::from),
            ..ListenSpec::default()
        }
    }

    #[tokio::test]
    async fn binds_and_accepts() {
        let container = ListenContainer::new();
        container.configure(&[spec(0, None)]);
        assert_eq!(container.len(), 1);
        // Port 0 binds an ephemeral port; look it up for the client side.
        let addr = {
            let sockets = container.sockets.read();
            sockets[0].listener.as_ref().unwrap().local_addr().unwrap()
        };

        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let accepted = loop {
            if let Some(result) = container.accept().await {
                break result.unwrap();
            }
        };
        assert!(accepted.listen.is_bound());
        assert!(Arc::ptr_eq(&accepted.listen, &accepted.effective));
        client.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reconfigure_adopts_matching_identity() {
        let container = ListenContainer::new();
        container.configure(&[spec(0, Some("a"))]);
        let first = container.sockets.read()[0].clone();

        // Same (bind address, port) identity with a changed id: the bound
        // socket is adopted and only its snapshot is replaced.
        container.configure(&[spec(0, Some("b"))]);
        assert_eq!(container.len(), 1);
        let second = container.sockets.read()[0].clone();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.spec().id.as_deref(), Some("b"));
        assert!(container.by_id("a").is_none());
    }

    #[tokio::test]
    async fn reconfigure_releases_unmatched_sockets() {
        let container = ListenContainer::new();
        container.configure(&[spec(0, Some("a"))]);
        let first = container.sockets.read()[0].clone();
        container.configure(&[ListenSpec {
            bind_address: Some("127.0.0.1".to_string()),
            port: 0,
            id: Some("c".to_string()),
            tls_mode: crate::config::TlsMode::Auto,
            ..ListenSpec::default()
        }]);
        // Identity still matches (same address and configured port), so
        // adoption applies even with other fields changed.
        let second = container.sockets.read()[0].clone();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.spec().tls_mode, crate::config::TlsMode::Auto);
    }

    #[tokio::test]
    async fn virtual_entries_bind_nothing() {
        let container = ListenContainer::new();
        container.configure(&[ListenSpec {
            virtual_only: true,
            id: Some("policy-only".to_string()),
            ..ListenSpec::default()
        }]);
        assert_eq!(container.len(), 1);
        assert!(!container.sockets.read()[0].is_bound());
        assert!(container.accept().await.is_none());
    }

    #[tokio::test]
    async fn effective_listener_resolves_on_behalf_of() {
        let container = ListenContainer::new();
        container.configure(&[
            ListenSpec {
                virtual_only: true,
                id: Some("front".to_string()),
                ..ListenSpec::default()
            },
            ListenSpec {
                bind_address: Some("127.0.0.1".to_string()),
                port: 0,
                on_behalf_of: Some("front".to_string()),
                ..ListenSpec::default()
            },
        ]);
        let addr = {
            let sockets = container.sockets.read();
            sockets[1].listener.as_ref().unwrap().local_addr().unwrap()
        };
        let client = tokio::spawn(async move { TcpStream::connect(addr).await });
        let accepted = loop {
            if let Some(result) = container.accept().await {
                break result.unwrap();
            }
        };
        assert_eq!(accepted.effective.spec().id.as_deref(), Some("front"));
        client.await.unwrap().unwrap();
    }
}
