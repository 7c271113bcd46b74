//! Slow-event dispatch and the registration backends.
//!
//! The dispatch task drains the bus queue; each event fans out to the
//! registration lists it captured at emit time, then lands in the SSE hub.
//! Backend failures are logged and never propagate.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::EventBackendConfig;
use crate::events::stream::EventStreamHub;
use crate::events::Event;
use crate::protocol::SERVER_ID;

/// Called by the terminate backend; wired to the server's shutdown.
pub type TerminateFn = Arc<dyn Fn() + Send + Sync>;

/// Context the dispatch task needs for the exec environment.
pub struct SinkContext {
    pub hostname: String,
    pub admin_contact: String,
    pub hub: Arc<EventStreamHub>,
    pub terminate: TerminateFn,
    pub http: reqwest::Client,
}

/// Runs the slow-event dispatch loop until the bus closes or shutdown is
/// signalled.
pub async fn run_dispatch(
    mut rx: mpsc::Receiver<Event>,
    ctx: SinkContext,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        let Some(event) = event else { break };
        for registration in &event.registrations {
            let matches =
                registration.trigger == "*" || registration.trigger == event.trigger;
            if !matches {
                continue;
            }
            match &registration.backend {
                EventBackendConfig::Log { level } => log_sink(&event, level.as_deref()),
                EventBackendConfig::Exec { program } => {
                    exec_sink(&event, program, &ctx).await;
                }
                EventBackendConfig::Url { url } => url_sink(&event, url, &ctx.http).await,
                EventBackendConfig::Terminate => {
                    log::info!("event {} requested termination", event.trigger);
                    (ctx.terminate)();
                }
            }
        }
        ctx.hub.publish(&event);
    }
    log::debug!("event dispatch loop finished");
}

fn log_sink(event: &Event, level: Option<&str>) {
    let line = format!(
        "event {} mount={} client={}",
        event.trigger,
        event.mount.as_deref().unwrap_or("-"),
        event.connection_ip.as_deref().unwrap_or("-"),
    );
    match level.unwrap_or("info") {
        "error" => log::error!("{line}"),
        "warn" => log::warn!("{line}"),
        "debug" => log::debug!("{line}"),
        _ => log::info!("{line}"),
    }
}

async fn exec_sink(event: &Event, program: &std::path::Path, ctx: &SinkContext) {
    let mut command = tokio::process::Command::new(program);
    command
        .env("EMBERCAST_VERSION", SERVER_ID)
        .env("EMBERCAST_HOSTNAME", &ctx.hostname)
        .env("EMBERCAST_ADMIN", &ctx.admin_contact)
        .env("EVENT_TRIGGER", &event.trigger);

    let mut set = |name: &str, value: &Option<String>| {
        if let Some(value) = value {
            command.env(name, value);
        }
    };
    set("EVENT_URI", &event.uri);
    set("MOUNT", &event.mount);
    set("SOURCE_MEDIA_TYPE", &event.source_media_type);
    set("SOURCE_INSTANCE_UUID", &event.source_instance_uuid);
    set("CLIENT_IP", &event.connection_ip);
    set("CLIENT_ROLE", &event.client_role);
    set("CLIENT_USERNAME", &event.client_username);
    set("CLIENT_USERAGENT", &event.client_useragent);
    set("CLIENT_ADMIN_COMMAND", &event.admin_command);
    set("DUMPFILE", &event.dumpfile);
    if let Some(id) = event.connection_id {
        command.env("CLIENT_ID", id.to_string());
    }
    if let Some(t) = event.connection_time {
        command.env("CLIENT_CONNECTION_TIME", t.to_string());
    }

    match command.spawn() {
        Ok(mut child) => {
            // Reap in the background; a hung hook must not stall dispatch.
            tokio::spawn(async move {
                if let Err(e) = child.wait().await {
                    log::warn!("event hook did not exit cleanly: {e}");
                }
            });
        }
        Err(e) => log::warn!("failed to run event hook {}: {}", program.display(), e),
    }
}

async fn url_sink(event: &Event, url: &str, http: &reqwest::Client) {
    let body = event.to_json();
    if let Err(e) = http.post(url).json(&body).send().await {
        log::warn!("event URL sink {url} failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventRegistration;
    use crate::events::EventBus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sink_ctx(terminations: Arc<AtomicUsize>) -> SinkContext {
        SinkContext {
            hostname: "test".to_string(),
            admin_contact: "admin@test".to_string(),
            hub: Arc::new(EventStreamHub::new()),
            terminate: Arc::new(move || {
                terminations.fetch_add(1, Ordering::SeqCst);
            }),
            http: reqwest::Client::new(),
        }
    }

    #[tokio::test]
    async fn terminate_backend_invokes_callback() {
        let (bus, rx) = EventBus::new();
        let terminations = Arc::new(AtomicUsize::new(0));
        let ctx = sink_ctx(Arc::clone(&terminations));
        let (_tx, shutdown) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(run_dispatch(rx, ctx, shutdown));

        let mut event = Event::new("server-stop-requested");
        event.registrations = vec![EventRegistration {
            trigger: "*".to_string(),
            backend: EventBackendConfig::Terminate,
        }];
        bus.emit(event);
        drop(bus);

        task.await.unwrap();
        assert_eq!(terminations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_matching_triggers_are_skipped() {
        let (bus, rx) = EventBus::new();
        let terminations = Arc::new(AtomicUsize::new(0));
        let ctx = sink_ctx(Arc::clone(&terminations));
        let (_tx, shutdown) = tokio::sync::watch::channel(false);
        let task = tokio::spawn(run_dispatch(rx, ctx, shutdown));

        let mut event = Event::new("listener-add");
        event.registrations = vec![EventRegistration {
            trigger: "source-connect".to_string(),
            backend: EventBackendConfig::Terminate,
        }];
        bus.emit(event);
        drop(bus);

        task.await.unwrap();
        assert_eq!(terminations.load(Ordering::SeqCst), 0);
    }
}
