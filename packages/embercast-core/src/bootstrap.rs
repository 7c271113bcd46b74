//! Service wiring: builds the context, connects the event machinery, and
//! starts the background task set.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::context::ServerContext;
use crate::events::sinks::{run_dispatch, SinkContext};
use crate::events::stream::EventStreamHub;
use crate::events::{Event, EventBus};
use crate::net::connection::{run_accept_loop, spawn_workers, WorkItem};
use crate::protocol::SERVER_ID;
use crate::stats::{Stats, GLOBAL_SCOPE};
use crate::tls::TlsProvider;
use crate::utils::now_secs;

/// Queue depth between the accept loop and the handler workers.
const ACCEPT_QUEUE_DEPTH: usize = 64;

/// A wired but not yet started server.
pub struct BootstrappedServer {
    pub ctx: Arc<ServerContext>,
    event_rx: Option<mpsc::Receiver<Event>>,
    handles: Vec<JoinHandle<()>>,
    /// Side channel into the worker pool (config reread requests).
    work_tx: Option<mpsc::Sender<WorkItem>>,
}

/// Builds every service around a validated configuration.
pub fn bootstrap(config: Config, tls: Arc<dyn TlsProvider>) -> Result<BootstrappedServer, String> {
    let (events, event_rx) = EventBus::new();
    let event_hub = Arc::new(EventStreamHub::new());
    let stats = Arc::new(Stats::new(Some(Arc::clone(&events))));

    let hostname = config.hostname.clone();
    let ctx = ServerContext::new(config, tls, events, event_hub, stats)?;

    ctx.stats.set(GLOBAL_SCOPE, "server_id", SERVER_ID);
    ctx.stats
        .set_int(GLOBAL_SCOPE, "server_start", now_secs() as i64);
    ctx.stats.set(GLOBAL_SCOPE, "host", hostname);
    ctx.stats.set_int(GLOBAL_SCOPE, "listeners", 0);
    ctx.stats.set_int(GLOBAL_SCOPE, "sources", 0);

    Ok(BootstrappedServer {
        ctx,
        event_rx: Some(event_rx),
        handles: Vec::new(),
        work_tx: None,
    })
}

impl BootstrappedServer {
    /// Binds the listeners and starts the background task set: event
    /// dispatch, the accept loop, the handler pool and the relays.
    pub fn start(&mut self) {
        self.ctx.reapply_config();

        let event_rx = self
            .event_rx
            .take()
            .expect("start called once per bootstrap");
        let config = self.ctx.config();
        let sink_ctx = SinkContext {
            hostname: config.hostname.clone(),
            admin_contact: config.admin_contact.clone(),
            hub: Arc::clone(&self.ctx.event_hub),
            terminate: {
                let ctx = Arc::clone(&self.ctx);
                Arc::new(move || ctx.shutdown())
            },
            http: reqwest::Client::new(),
        };
        self.handles.push(tokio::spawn(run_dispatch(
            event_rx,
            sink_ctx,
            self.ctx.shutdown_watch(),
        )));

        let (work_tx, work_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
        self.work_tx = Some(work_tx.clone());
        self.handles
            .push(tokio::spawn(run_accept_loop(Arc::clone(&self.ctx), work_tx)));
        self.handles.extend(spawn_workers(&self.ctx, work_rx));

        self.handles.extend(crate::relay::spawn_relays(&self.ctx));

        self.ctx.emit_event(Event::new("server-start"));
        log::info!("{SERVER_ID} started");
    }

    /// Asks the worker pool to reload configuration-derived state.
    pub async fn request_config_reread(&self) {
        if let Some(tx) = &self.work_tx {
            let _ = tx.send(WorkItem::ConfigReread).await;
        }
    }

    /// Signals shutdown and waits for the task set to drain.
    pub async fn shutdown(mut self) {
        self.ctx.emit_event(Event::new("server-stop"));
        self.ctx.shutdown();
        for source in self.ctx.sources.list_active() {
            source.stop();
        }
        // Dropping the side channel lets the workers drain and exit.
        self.work_tx = None;

        for handle in self.handles.drain(..) {
            if tokio::time::timeout(std::time::Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                log::warn!("task did not stop in time");
            }
        }
        log::info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenSpec;
    use crate::tls::NoTlsProvider;

    #[tokio::test]
    async fn bootstrap_seeds_global_stats() {
        let server = bootstrap(Config::default(), Arc::new(NoTlsProvider)).unwrap();
        assert!(server.ctx.stats.get(GLOBAL_SCOPE, "server_id").is_some());
        assert!(server.ctx.stats.get(GLOBAL_SCOPE, "server_start").is_some());
    }

    #[tokio::test]
    async fn start_and_shutdown_round_trip() {
        let config = Config {
            listen: vec![ListenSpec {
                bind_address: Some("127.0.0.1".to_string()),
                port: 0,
                ..ListenSpec::default()
            }],
            ..Config::default()
        };
        let mut server = bootstrap(config, Arc::new(NoTlsProvider)).unwrap();
        server.start();
        assert!(server.ctx.is_running());
        server.shutdown().await;
    }
}
