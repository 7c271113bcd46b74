//! Per-connection lifecycle: accept, header read, parse, hand-off.
//!
//! The accept loop tags each connection with its listen socket and queues
//! it; a small pool of workers drains the queue, reads the request head
//! under the header timeout, parses it and routes the client into the
//! dispatcher. The same queue carries meta work items such as config
//! reread requests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use crate::buffer::Buffer;
use crate::client::Client;
use crate::config::TlsMode;
use crate::context::ServerContext;
use crate::error::{CastError, CastResult, ErrorId};
use crate::navigation::NavigationHistory;
use crate::net::listen::{Accepted, BoundSocket};
use crate::protocol::{parse_request, render_error, Method, Protocol, Request};
use crate::tls::NetStream;

/// Cap on the request head; anything larger is malformed.
const MAX_HEADER_SIZE: usize = 16 * 1024;

/// Read granularity for the header loop.
const HEADER_READ_CHUNK: usize = 2048;

/// Decrements the live-client counter when the connection goes away.
pub struct ClientGuard {
    counter: Arc<AtomicUsize>,
}

impl ClientGuard {
    /// Registers one more live client.
    #[must_use]
    pub fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Server side of one accepted connection.
pub struct Connection {
    pub id: u64,
    pub created: Instant,
    /// Hard deadline after which the client is disconnected; `None` means
    /// unlimited.
    pub discon_deadline: Option<Instant>,
    pub sent_bytes: u64,
    pub stream: Box<dyn NetStream>,
    /// Bytes read past the end of the request head (start of a source
    /// stream or request body).
    pub leftover: Vec<u8>,
    pub listen: Arc<BoundSocket>,
    pub effective_listen: Arc<BoundSocket>,
    pub peer_ip: String,
    /// Location annotations when a GeoIP provider is configured.
    pub geo: Option<crate::net::GeoAnnotation>,
    pub tls_active: bool,
    pub error: bool,
    _guard: ClientGuard,
}

impl Connection {
    /// Splits the connection into the pieces a long-lived task needs:
    /// the transport, bytes read past the head, and the live-count guard
    /// (which must stay alive as long as the connection is served).
    #[must_use]
    pub fn into_parts(self) -> (Box<dyn NetStream>, Vec<u8>, ClientGuard) {
        (self.stream, self.leftover, self._guard)
    }
}

/// Reads until the blank line ending the request head.
///
/// Returns the head text and any bytes that followed it in the same reads.
pub async fn read_request_head(
    stream: &mut Box<dyn NetStream>,
    timeout: Duration,
) -> CastResult<(String, Vec<u8>)> {
    let deadline = Instant::now() + timeout;
    let mut buffer = Buffer::new();
    buffer.preallocate(HEADER_READ_CHUNK);

    loop {
        if let Some(pos) = find_head_end(buffer.as_bytes()) {
            let bytes = buffer.as_bytes();
            let head = String::from_utf8_lossy(&bytes[..pos]).into_owned();
            let leftover = bytes[pos + 4..].to_vec();
            return Ok((head, leftover));
        }
        if buffer.len() > MAX_HEADER_SIZE {
            return Err(CastError::Request("request head too large".to_string()));
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CastError::Request("header read timed out".to_string()));
        }

        let tail = buffer.zerocopy_push_request(HEADER_READ_CHUNK);
        let n = match tokio::time::timeout(remaining, stream.read(tail)).await {
            Ok(Ok(0)) => {
                return Err(CastError::Request(
                    "connection closed before header completed".to_string(),
                ))
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(CastError::Io(e)),
            Err(_) => return Err(CastError::Request("header read timed out".to_string())),
        };
        buffer.zerocopy_push_complete(n);
    }
}

fn find_head_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Reads one CRLF-terminated line (the legacy bare-password handshake).
async fn read_line(
    stream: &mut Box<dyn NetStream>,
    timeout: Duration,
) -> CastResult<String> {
    let deadline = Instant::now() + timeout;
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || line.len() > 512 {
            return Err(CastError::Request("handshake line overran".to_string()));
        }
        match tokio::time::timeout(remaining, stream.read(&mut byte)).await {
            Ok(Ok(0)) => return Err(CastError::Request("closed mid-handshake".to_string())),
            Ok(Ok(_)) => {
                if byte[0] == b'\n' {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return Ok(String::from_utf8_lossy(&line).into_owned());
                }
                line.push(byte[0]);
            }
            Ok(Err(e)) => return Err(CastError::Io(e)),
            Err(_) => return Err(CastError::Request("handshake timed out".to_string())),
        }
    }
}

/// Work carried by the pool queue.
pub enum WorkItem {
    Incoming(Accepted),
    /// Side-channel meta event asking for a config reload.
    ConfigReread,
}

/// Accept loop: tags and queues connections until shutdown.
pub async fn run_accept_loop(ctx: Arc<ServerContext>, tx: mpsc::Sender<WorkItem>) {
    let mut shutdown = ctx.shutdown_watch();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            accepted = ctx.listen.accept() => {
                match accepted {
                    Some(Ok(accepted)) => {
                        if tx.send(WorkItem::Incoming(accepted)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => log::warn!("accept failed: {e}"),
                    None => {}
                }
            }
        }
    }
    log::debug!("accept loop finished");
}

/// Spawns the worker pool draining the accept queue.
pub fn spawn_workers(
    ctx: &Arc<ServerContext>,
    rx: mpsc::Receiver<WorkItem>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    let count = ctx.config().handler_threads;
    (0..count)
        .map(|_| {
            let ctx = Arc::clone(ctx);
            let rx = Arc::clone(&rx);
            tokio::spawn(worker(ctx, rx))
        })
        .collect()
}

async fn worker(ctx: Arc<ServerContext>, rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>) {
    loop {
        let item = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        match item {
            Some(WorkItem::Incoming(accepted)) => {
                if let Err(e) = process_incoming(&ctx, accepted).await {
                    log::debug!("connection dropped: {e}");
                }
            }
            Some(WorkItem::ConfigReread) => {
                ctx.reapply_config();
            }
            None => break,
        }
    }
}

async fn process_incoming(ctx: &Arc<ServerContext>, accepted: Accepted) -> CastResult<()> {
    let Accepted {
        stream,
        peer,
        listen,
        effective,
    } = accepted;

    let _ = stream.set_nodelay(true);
    let peer_ip = crate::net::peer_ip_text(peer);
    if !ctx.ip_allowed(&peer_ip) {
        log::info!("refusing banned client {peer_ip}");
        return Ok(());
    }
    let spec = listen.spec();

    let guard = ClientGuard::acquire(ctx.client_counter());
    let config = ctx.config();
    let mut stream: Box<dyn NetStream> = Box::new(stream);

    if ctx.client_count() > config.client_limit {
        log::warn!("client limit reached, refusing {peer_ip}");
        let (head, body) = render_error(ErrorId::GenClientLimit.entry(), false);
        let _ = stream.write_all(head.render().as_bytes()).await;
        let _ = stream.write_all(body.as_bytes()).await;
        return Ok(());
    }

    // RFC 2818 sockets are TLS from the first byte.
    let mut tls_active = false;
    if spec.tls_mode == TlsMode::Rfc2818 {
        if !ctx.tls.available() {
            log::error!("listener requires TLS but no provider is configured");
            return Ok(());
        }
        stream = ctx.tls.accept(stream).await.map_err(CastError::Io)?;
        tls_active = true;
    }

    let header_timeout = Duration::from_secs(config.header_timeout);
    drop(config);

    let (request, leftover, password_override) = if spec.shoutcast_compat {
        let (request, leftover, password) =
            shoutcast_handshake(ctx, &mut stream, &spec, header_timeout).await?;
        (request, leftover, Some(password))
    } else {
        let (head, leftover) = read_request_head(&mut stream, header_timeout).await?;
        let request = parse_request(&head)?;
        (request, leftover, None)
    };

    let geo = ctx.geoip().and_then(|provider| provider.lookup(&peer_ip));
    let connection = Connection {
        id: ctx.next_connection_id(),
        created: Instant::now(),
        discon_deadline: None,
        sent_bytes: 0,
        stream,
        leftover,
        listen,
        effective_listen: effective,
        peer_ip,
        geo,
        tls_active,
        error: false,
        _guard: guard,
    };

    let client = Client {
        con: connection,
        uri: request.path.clone(),
        request,
        omode: Default::default(),
        admin_command: None,
        role: None,
        username: None,
        acl: None,
        password_override,
        history: NavigationHistory::new(),
        handler: None,
    };

    crate::dispatch::handle_client(ctx, client).await;
    Ok(())
}

/// The legacy source handshake: a bare password line, our `OK2` answer,
/// then ICY-style headers. Synthesized into a regular SOURCE request
/// against the configured legacy mount.
async fn shoutcast_handshake(
    ctx: &Arc<ServerContext>,
    stream: &mut Box<dyn NetStream>,
    spec: &crate::config::ListenSpec,
    timeout: Duration,
) -> CastResult<(Request, Vec<u8>, String)> {
    let password = read_line(stream, timeout).await?;
    stream
        .write_all(b"OK2\r\nicy-caps:11\r\n\r\n")
        .await
        .map_err(CastError::Io)?;

    let (head, leftover) = read_request_head(stream, timeout).await?;

    let mount = spec
        .shoutcast_mount
        .clone()
        .unwrap_or_else(|| ctx.config().shoutcast_mount.clone());

    // The head holds bare icy-* headers with no request line.
    let synthesized = format!("SOURCE {mount} ICE/1.0\r\n{head}\r\n");
    let mut request = parse_request(&synthesized)?;
    request.protocol = Protocol::Icy;
    if request.method != Method::Source {
        return Err(CastError::Request("unexpected legacy handshake".to_string()));
    }
    Ok((request, leftover, password))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn head_and_leftover_are_split() {
        let (client, server) = duplex(4096);
        let mut server: Box<dyn NetStream> = Box::new(server);
        let mut client: Box<dyn NetStream> = Box::new(client);
        client
            .write_all(b"GET / HTTP/1.0\r\nHost: x\r\n\r\nBODYBYTES")
            .await
            .unwrap();
        let (head, leftover) = read_request_head(&mut server, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(head.starts_with("GET / HTTP/1.0"));
        assert!(head.ends_with("Host: x"));
        assert_eq!(leftover, b"BODYBYTES");
    }

    #[tokio::test]
    async fn header_timeout_fires() {
        let (_client, server) = duplex(64);
        let mut server: Box<dyn NetStream> = Box::new(server);
        let result = read_request_head(&mut server, Duration::from_millis(50)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn oversized_heads_are_rejected() {
        let (client, server) = duplex(64 * 1024);
        let mut server: Box<dyn NetStream> = Box::new(server);
        let mut client: Box<dyn NetStream> = Box::new(client);
        let huge = vec![b'a'; MAX_HEADER_SIZE + HEADER_READ_CHUNK * 2];
        client.write_all(b"GET / HTTP/1.0\r\n").await.unwrap();
        client.write_all(&huge).await.unwrap();
        let result = read_request_head(&mut server, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn guard_tracks_client_count() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let _a = ClientGuard::acquire(&counter);
            let _b = ClientGuard::acquire(&counter);
            assert_eq!(counter.load(Ordering::SeqCst), 2);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
