//! The connection-handle dispatcher.
//!
//! Every parsed request passes through here exactly once: protocol check,
//! TLS upgrade handling, URI canonicalization, resource rewrite, the
//! legacy admin promotion, authentication, and finally the method-based
//! hand-off to source ingest, listener attach, file serving, the admin
//! surface, the stats push, or the event stream.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWriteExt;

use crate::acl::Policy;
use crate::admin::AdminCommand;
use crate::auth::{run_stacks, AuthDecision, AuthRequest, AuthStack};
use crate::client::Client;
use crate::context::ServerContext;
use crate::error::ErrorId;
use crate::events::stream::EventFilter;
use crate::events::{Event, FastEvent};
use crate::navigation::NavigationHistory;
use crate::protocol::{normalize_uri, Method, Protocol, ResponseHead};
use crate::stream::listener::{resolve_attach, run_listener, MoveOutcome};
use crate::stream::{FallbackTarget, ListenerHandle, NetReader};
use crate::tls::{evaluate_upgrade, UpgradeDecision};
use crate::utils::str_to_bool;

/// Methods advertised on OPTIONS responses.
const ALLOWED_METHODS: &str = "GET, POST, HEAD, PUT, SOURCE, OPTIONS, DELETE, STATS";

/// Routes one client to its handler. Consumes the client.
pub async fn handle_client(ctx: &Arc<ServerContext>, mut client: Client) {
    // Only HTTP and ICE reach this point directly; ICY arrives solely via
    // the legacy handshake, which carries the promoted password.
    match client.request.protocol {
        Protocol::Http | Protocol::Ice => {}
        Protocol::Icy => {
            if client.password_override.is_none() {
                log::debug!("client {} spoke an unknown protocol", client.con.id);
                return;
            }
        }
    }

    let listen_spec = client.con.effective_listen.spec();

    match evaluate_upgrade(&client.request, listen_spec.tls_mode, client.con.tls_active) {
        UpgradeDecision::Proceed => {}
        UpgradeDecision::Switch => {
            if !switch_to_tls(ctx, &mut client).await {
                return;
            }
        }
        UpgradeDecision::Require => {
            let head = ResponseHead::new(426)
                .header("Upgrade", "TLS/1.0")
                .header("Connection", "Upgrade")
                .header("Content-Length", "0");
            client.send_empty(&head).await;
            return;
        }
        UpgradeDecision::Reject => {
            client.send_error(ErrorId::ConUpgradeError).await;
            return;
        }
    }

    // OPTIONS * is the one URI exempt from normalization.
    if client.request.method == Method::Options && client.request.raw_uri == "*" {
        let head = ResponseHead::new(204)
            .header("Allow", ALLOWED_METHODS)
            .header("Content-Length", "0");
        client.send_empty(&head).await;
        return;
    }

    let Some(normalized) = normalize_uri(&client.request.path) else {
        client.send_error(ErrorId::ConUnknownRequest).await;
        return;
    };
    client.uri = normalized;

    apply_resource_rules(ctx, &mut client);

    // Legacy admin entry: promote the pass parameter and flip to ICY.
    if client.uri == "/admin.cgi" {
        if let Some(pass) = client.request.query_param("pass").map(str::to_string) {
            client.password_override = Some(pass);
            client.request.protocol = Protocol::Icy;
        } else {
            client.send_error(ErrorId::ConMissingPassParameter).await;
            return;
        }
    }

    let is_admin = client.uri == "/admin.cgi" || client.uri.starts_with("/admin/");
    if is_admin {
        client.admin_command = admin_command_of(&client);
    }

    // ── Authentication ───────────────────────────────────────────────────
    let (username, password) = client.credentials();
    let auth_request = AuthRequest {
        username,
        password,
        ip: client.con.peer_ip.clone(),
        uri: client.uri.clone(),
        method: Some(client.request.method),
        user_agent: client.request.header("user-agent").map(str::to_string),
        admin_command: client.admin_command,
    };

    // The mount scope follows the URI, except for admin commands which may
    // name their mount explicitly.
    let auth_mount = if is_admin {
        client.request.query_param("mount").map(str::to_string)
    } else {
        Some(client.uri.clone())
    };

    let listener_scope = ctx.listen_auth(&listen_spec);
    let mount_scope = auth_mount.as_deref().and_then(|m| ctx.mount_auth(m));
    let default_scope = ctx.default_mount_auth();
    let global_scope = ctx.global_auth();

    let mut scopes: Vec<&AuthStack> = Vec::with_capacity(4);
    if let Some(stack) = listener_scope.as_deref() {
        scopes.push(stack);
    }
    if let Some(stack) = mount_scope.as_deref() {
        scopes.push(stack);
    }
    if let Some(stack) = default_scope.as_deref() {
        scopes.push(stack);
    }
    scopes.push(&global_scope);

    let binding = match run_stacks(&scopes, &auth_request).await {
        AuthDecision::Granted(binding) => binding,
        AuthDecision::NeedsAuth => {
            let head = ResponseHead::new(401)
                .header("WWW-Authenticate", "Basic realm=\"Embercast\"")
                .header("Content-Length", "0");
            client.send_empty(&head).await;
            return;
        }
        AuthDecision::Forbidden => {
            let head = ResponseHead::new(403).header("Content-Length", "0");
            client.send_empty(&head).await;
            return;
        }
        AuthDecision::Busy => {
            client.send_error(ErrorId::AuthBusy).await;
            return;
        }
    };

    client.role = Some(binding.role.clone());
    client.username = binding.username.clone();
    client.acl = Some(Arc::clone(&binding.acl));
    ctx.events.emit_fast(&FastEvent::ClientAuthed {
        ip: client.con.peer_ip.clone(),
        role: binding.role.clone(),
        username: binding.username.clone(),
    });

    // Per-credential connection limit; the slot travels with the client's
    // task so it releases when the connection ends.
    let user_slot = match &client.username {
        Some(username) => {
            let (count, slot) = ctx.acquire_user_slot(username);
            match binding.acl.max_connections_per_user() {
                crate::acl::UserLimit::Max(max) if count > max => {
                    client.send_error(ErrorId::ConPerCredClientLimit).await;
                    return;
                }
                _ => {}
            }
            Some(slot)
        }
        None => None,
    };

    if let Some(duration) = binding.acl.max_connection_duration() {
        client.con.discon_deadline = Some(client.con.created + duration);
    }

    if binding.acl.test_method(client.request.method) != Policy::Allow {
        client.send_error(ErrorId::ConUnknownRequest).await;
        return;
    }

    // ── Routing ──────────────────────────────────────────────────────────
    if is_admin {
        crate::admin::handle(ctx, client).await;
        return;
    }

    if let Some((module, function)) = client.handler.clone() {
        match ctx.modules.resolve(&module, &function) {
            Some(handler) => {
                handler(Arc::clone(ctx), client).await;
            }
            None => {
                log::warn!("no handler {function:?} in module {module:?}");
                client.send_error(ErrorId::FservFileNotFound).await;
            }
        }
        return;
    }

    match client.request.method {
        Method::Source | Method::Put => {
            source_ingest(ctx, client).await;
        }
        Method::Get | Method::Post => {
            if client.uri == ctx.config().event_stream_path {
                event_stream_client(ctx, client).await;
            } else if binding.acl.test_web() == Policy::Allow {
                listener_or_file(ctx, client, user_slot).await;
            } else {
                let head = ResponseHead::new(403).header("Content-Length", "0");
                client.send_empty(&head).await;
            }
        }
        Method::Head => {
            head_request(ctx, client).await;
        }
        Method::Stats => {
            stats_client(ctx, client).await;
        }
        Method::Delete => {
            delete_source(ctx, client).await;
        }
        Method::Options => {
            let head = ResponseHead::new(204)
                .header("Allow", ALLOWED_METHODS)
                .header("Content-Length", "0");
            client.send_empty(&head).await;
        }
        Method::Play => {
            client.send_error(ErrorId::ConUnimplemented).await;
        }
    }
}

/// RFC 2817: answer 101 and restart the request over TLS.
async fn switch_to_tls(ctx: &Arc<ServerContext>, client: &mut Client) -> bool {
    if !ctx.tls.available() {
        client.send_error(ErrorId::ConUpgradeError).await;
        return false;
    }
    let head = ResponseHead::new(101)
        .header("Upgrade", "TLS/1.0")
        .header("Connection", "Upgrade");
    if client.send_head(&head).await.is_err() {
        return false;
    }
    let _ = client.con.stream.flush().await;

    // Swap the transport; a dummy stream stands in while the handshake
    // consumes the real one.
    let plain = std::mem::replace(
        &mut client.con.stream,
        Box::new(tokio::io::empty()) as Box<dyn crate::tls::NetStream>,
    );
    match ctx.tls.accept(plain).await {
        Ok(secured) => {
            client.con.stream = secured;
            client.con.tls_active = true;
        }
        Err(e) => {
            log::warn!("TLS handshake failed for {}: {}", client.con.peer_ip, e);
            return false;
        }
    }

    // The client repeats its request over the secured transport.
    let timeout = std::time::Duration::from_secs(ctx.config().header_timeout);
    match crate::net::connection::read_request_head(&mut client.con.stream, timeout).await {
        Ok((head, leftover)) => match crate::protocol::parse_request(&head) {
            Ok(request) => {
                client.uri = request.path.clone();
                client.request = request;
                client.con.leftover = leftover;
                true
            }
            Err(e) => {
                log::debug!("bad request after upgrade: {e}");
                false
            }
        },
        Err(e) => {
            log::debug!("no request after upgrade: {e}");
            false
        }
    }
}

/// Applies the first matching resource rewrite.
fn apply_resource_rules(ctx: &Arc<ServerContext>, client: &mut Client) {
    let config = ctx.config();
    let spec = client.con.effective_listen.spec();
    let host = client
        .request
        .header("host")
        .map(|h| h.split(':').next().unwrap_or(h).to_string());

    for rule in &config.resources {
        let uri_matches = if rule.prefix_match {
            client.uri.starts_with(&rule.source)
        } else {
            client.uri == rule.source
        };
        if !uri_matches {
            continue;
        }
        if let Some(port) = rule.port {
            if port != spec.port {
                continue;
            }
        }
        if let Some(bind) = &rule.bind_address {
            if spec.bind_address.as_deref() != Some(bind.as_str()) {
                continue;
            }
        }
        if let Some(id) = &rule.listen_socket_id {
            if spec.id.as_deref() != Some(id.as_str()) {
                continue;
            }
        }
        if let Some(vhost) = &rule.vhost {
            if host.as_deref() != Some(vhost.as_str()) {
                continue;
            }
        }

        if let Some(destination) = &rule.destination {
            client.uri = if rule.prefix_match {
                format!("{}{}", destination, &client.uri[rule.source.len()..])
            } else {
                destination.clone()
            };
        }
        if let Some(omode) = rule.omode {
            client.omode = omode;
        }
        if let (Some(module), Some(handler)) = (&rule.module, &rule.handler) {
            client.handler = Some((module.clone(), handler.clone()));
        }
        return;
    }
}

fn admin_command_of(client: &Client) -> Option<AdminCommand> {
    if client.uri == "/admin.cgi" {
        return client
            .request
            .query_param("mode")
            .and_then(AdminCommand::parse);
    }
    client
        .uri
        .strip_prefix("/admin/")
        .and_then(AdminCommand::parse)
}

/// SOURCE/PUT: reserve the mount, complete against config, acknowledge,
/// and run the ingest loop on its own task.
async fn source_ingest(ctx: &Arc<ServerContext>, mut client: Client) {
    let mount = client.uri.clone();

    if let Some(mount_config) = ctx.config().find_mount(&mount) {
        if mount_config.no_mount {
            client.send_error(ErrorId::ConMountNoForDirectAccess).await;
            return;
        }
    }

    let reservation = match ctx.sources.reserve(&mount) {
        Ok(reservation) => reservation,
        Err(id) => {
            client.send_error(id).await;
            return;
        }
    };

    let content_type = client.request.header("content-type").map(str::to_string);
    let source = match ctx
        .sources
        .complete(ctx, reservation, content_type.as_deref())
    {
        Ok(source) => source,
        Err(id) => {
            client.send_error(id).await;
            return;
        }
    };

    // The legacy handshake already acknowledged with OK2.
    if client.request.protocol != Protocol::Icy {
        if client.request.header("expect").is_some_and(|e| e.contains("100-continue")) {
            let head = ResponseHead::new(100);
            if client.send_head(&head).await.is_err() {
                crate::stream::teardown_source(ctx, &source);
                return;
            }
        }
        let head = ResponseHead::new(200).header("Content-Length", "0");
        if client.send_head(&head).await.is_err() || client.con.stream.flush().await.is_err() {
            crate::stream::teardown_source(ctx, &source);
            return;
        }
    }

    log::info!(
        "source client {} ({}) feeding {}",
        client.con.id,
        client.con.peer_ip,
        mount
    );
    let connection_id = client.con.id;
    let (stream, leftover, guard) = client.con.into_parts();
    let reader = NetReader::new(stream, leftover).with_connection_id(connection_id);
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let _guard = guard;
        crate::stream::run_source(ctx, source, Box::new(reader)).await;
    });
}

/// GET on a mount or a file.
async fn listener_or_file(
    ctx: &Arc<ServerContext>,
    mut client: Client,
    user_slot: Option<crate::context::UserSlot>,
) {
    let mount = client.uri.clone();
    let config = ctx.config();

    if let Some(mount_config) = config.find_mount(&mount) {
        if mount_config.no_mount {
            client.send_error(ErrorId::ConMountNoForDirectAccess).await;
            return;
        }
    }

    // A miss on an on-demand relay mount signals demand and waits briefly
    // for the relay to come up.
    if ctx.sources.get(&mount).is_none() {
        let relay_configured = config
            .relays
            .iter()
            .any(|relay| relay.local_mount == mount && relay.on_demand);
        if relay_configured {
            crate::relay::signal_demand(ctx, &mount);
            for _ in 0..25 {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                if ctx.sources.get(&mount).is_some() {
                    break;
                }
            }
        }
    }

    let has_source = ctx.sources.get(&mount).is_some();
    let has_mount_config = config.find_mount(&mount).is_some();
    if !has_source && !has_mount_config {
        // Plain web surface.
        crate::fserve::serve(ctx, client).await;
        return;
    }
    drop(config);

    let handle = ListenerHandle::new(
        client.con.id,
        &mount,
        client.role.as_deref().unwrap_or("listener"),
        client.username.clone(),
        &client.con.peer_ip,
    );
    let mut history = NavigationHistory::new();

    let source = match resolve_attach(
        ctx,
        FallbackTarget::Mount(mount.clone()),
        &mut history,
        &handle,
    ) {
        MoveOutcome::Attached(source) => source,
        MoveOutcome::ServeFile(path) => {
            let resolved = crate::fserve::resolve_path(ctx, &path);
            let head = ResponseHead::new(200)
                .header("Content-Type", crate::fserve::content_type_for(&resolved))
                .header("Connection", "close");
            if client.send_head(&head).await.is_ok() {
                let _ = crate::fserve::stream_file(&mut client.con.stream, &resolved).await;
            }
            return;
        }
        MoveOutcome::Refused(id) => {
            client.send_error(id).await;
            return;
        }
    };

    // Response head for the stream the chain landed on.
    let wants_icy = source.format.supports_inband_metadata()
        && client
            .request
            .header("icy-metadata")
            .is_some_and(|v| str_to_bool(v));

    let mut head = ResponseHead::new(200)
        .header("Content-Type", &source.content_type)
        .header("Cache-Control", "no-cache")
        .headers(&source.settings.http_headers);
    if let Some(acl) = &client.acl {
        head = head.headers(acl.http_headers());
    }
    if let Some(name) = &source.settings.stream_name {
        head = head.header("icy-name", name);
    }
    if wants_icy {
        head = head.header("icy-metaint", source.settings.mp3_meta_interval.to_string());
    }
    if client.send_head(&head).await.is_err() {
        source.remove_listener(handle.id);
        return;
    }

    // Intro file ahead of the live stream, best effort.
    if let Some(intro) = &source.settings.intro_filename {
        let resolved = crate::fserve::resolve_path(ctx, intro);
        if let Err(e) = crate::fserve::stream_file(&mut client.con.stream, &resolved).await {
            log::debug!("intro file {} skipped: {}", resolved.display(), e);
        }
    }

    let mut event = Event::new("listener-add").with_mount(&source.mount);
    event.connection_id = Some(client.con.id);
    event.connection_ip = Some(client.con.peer_ip.clone());
    event.client_role = client.role.clone();
    event.client_username = client.username.clone();
    event.client_useragent = client.request.header("user-agent").map(str::to_string);
    ctx.emit_event(event);

    let duration_deadline = listener_deadline(ctx, &source.mount, client.con.discon_deadline);

    let (stream, _leftover, guard) = client.con.into_parts();
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let _slot = user_slot;
        let _guard = guard;
        run_listener(
            ctx,
            source,
            stream,
            handle,
            history,
            wants_icy,
            duration_deadline,
        )
        .await;
    });
}

/// The tighter of the role's connection limit and the mount's listener
/// duration limit.
fn listener_deadline(
    ctx: &Arc<ServerContext>,
    mount: &str,
    acl_deadline: Option<Instant>,
) -> Option<Instant> {
    let settings = crate::stream::SourceSettings::resolve(&ctx.config(), mount);
    let mount_deadline = settings
        .max_listener_duration
        .map(|duration| Instant::now() + duration);
    match (acl_deadline, mount_deadline) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// HEAD answers with the stream or file head and no body.
async fn head_request(ctx: &Arc<ServerContext>, mut client: Client) {
    if let Some(source) = ctx.sources.get(&client.uri) {
        let head = ResponseHead::new(200)
            .header("Content-Type", &source.content_type)
            .header("Cache-Control", "no-cache")
            .headers(&source.settings.http_headers);
        client.send_empty(&head).await;
        return;
    }
    let Some(webroot) = ctx.config().webroot.clone() else {
        client.send_error(ErrorId::FservFileNotFound).await;
        return;
    };
    let path = webroot.join(client.uri.trim_start_matches('/'));
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {
            let head = ResponseHead::new(200)
                .header("Content-Type", crate::fserve::content_type_for(&path))
                .header("Content-Length", meta.len().to_string());
            client.send_empty(&head).await;
        }
        _ => client.send_error(ErrorId::FservFileNotFound).await,
    }
}

/// STATS: long-lived push of the current snapshot followed by change
/// lines as they happen.
async fn stats_client(ctx: &Arc<ServerContext>, mut client: Client) {
    let head = ResponseHead::new(200)
        .header("Content-Type", "text/plain")
        .header("Cache-Control", "no-cache");
    if client.send_head(&head).await.is_err() {
        return;
    }
    let snapshot = ctx.stats.snapshot_xml();
    if client.con.stream.write_all(snapshot.as_bytes()).await.is_err() {
        return;
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let hook_id = ctx.events.subscribe_fast(
        crate::events::FastEventKind::StatsChanged,
        Arc::new(move |event| {
            if let FastEvent::StatsChanged { scope, name, value } = event {
                let _ = tx.send(format!("EVENT {scope} {name} {value}\r\n"));
            }
        }),
    );

    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let mut shutdown = ctx.shutdown_watch();
        loop {
            tokio::select! {
                line = rx.recv() => {
                    let Some(line) = line else { break };
                    if client.con.stream.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = client.con.stream.flush().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        ctx.events.unsubscribe_fast(hook_id);
    });
}

/// DELETE stops the mount's source. Requires the kill privilege.
async fn delete_source(ctx: &Arc<ServerContext>, mut client: Client) {
    let allowed = client
        .acl
        .as_ref()
        .is_some_and(|acl| acl.test_admin(AdminCommand::KillSource) == Policy::Allow);
    if !allowed {
        let head = ResponseHead::new(403).header("Content-Length", "0");
        client.send_empty(&head).await;
        return;
    }
    let Some(source) = ctx.sources.get(&client.uri) else {
        client.send_error(ErrorId::AdminSourceDoesNotExist).await;
        return;
    };
    source.stop();
    let head = ResponseHead::new(204).header("Content-Length", "0");
    client.send_empty(&head).await;
}

/// Subscribes the client to the server-sent-events surface.
async fn event_stream_client(ctx: &Arc<ServerContext>, mut client: Client) {
    let filter = EventFilter {
        mount: client.request.query_param("mount").map(str::to_string),
        global: client.request.query_param("request-global").map(str_to_bool),
    };
    let last_event_id = client.request.header("last-event-id").map(str::to_string);

    let head = ResponseHead::new(200)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive");
    if client.send_head(&head).await.is_err() {
        return;
    }

    let hub = Arc::clone(&ctx.event_hub);
    let shutdown = ctx.shutdown_watch();
    let (stream, _leftover, guard) = client.con.into_parts();
    tokio::spawn(async move {
        let _guard = guard;
        crate::events::stream::run_subscriber(hub, stream, filter, last_event_id, shutdown).await;
    });
}
