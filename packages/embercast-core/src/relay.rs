//! The relay engine: pulls a remote stream into a local mount.
//!
//! Each configured relay runs one task that connects upstream as an HTTP
//! client, reserves the local mount as if it were a source client, and
//! feeds the response body into the source loop. On-demand relays sleep
//! until a listener shows demand for the mount; every failure retries
//! with doubling delays.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::Notify;

use crate::config::RelayConfig;
use crate::context::ServerContext;
use crate::protocol::SERVER_ID;
use crate::stream::{run_source, SourceReader};

/// Retry delays double up to this ceiling.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(120);

/// Feeds a `reqwest` byte stream into the source loop.
struct HttpReader {
    body: futures::stream::BoxStream<'static, reqwest::Result<Bytes>>,
}

#[async_trait]
impl SourceReader for HttpReader {
    async fn read_chunk(&mut self) -> io::Result<Option<Bytes>> {
        match self.body.next().await {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(e)) => Err(io::Error::other(e)),
            None => Ok(None),
        }
    }
}

/// Spawns one task per configured relay.
pub fn spawn_relays(ctx: &Arc<ServerContext>) -> Vec<tokio::task::JoinHandle<()>> {
    let config = ctx.config();
    config
        .relays
        .iter()
        .cloned()
        .map(|relay| {
            let ctx = Arc::clone(ctx);
            tokio::spawn(run_relay(ctx, relay))
        })
        .collect()
}

/// Signals demand for a mount, waking its on-demand relay if one exists.
pub fn signal_demand(ctx: &Arc<ServerContext>, mount: &str) {
    if let Some(notify) = ctx.relay_demand.get(mount) {
        notify.notify_waiters();
    }
}

async fn run_relay(ctx: Arc<ServerContext>, relay: RelayConfig) {
    let demand = ctx
        .relay_demand
        .entry(relay.local_mount.clone())
        .or_insert_with(|| Arc::new(Notify::new()))
        .clone();

    let client = match reqwest::Client::builder()
        .user_agent(SERVER_ID)
        .connect_timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            log::error!("relay {}: http client unusable: {}", relay.local_mount, e);
            return;
        }
    };

    let mut shutdown = ctx.shutdown_watch();
    let mut delay = Duration::from_secs(relay.retry_delay.max(1));

    loop {
        if !ctx.is_running() {
            break;
        }

        if relay.on_demand {
            log::debug!("relay {} waiting for demand", relay.local_mount);
            tokio::select! {
                _ = demand.notified() => {}
                _ = shutdown.changed() => continue,
            }
        }

        match pull_once(&ctx, &relay, &client).await {
            Ok(()) => {
                // A finished session was a success; restart promptly.
                delay = Duration::from_secs(relay.retry_delay.max(1));
            }
            Err(e) => {
                log::warn!(
                    "relay {} failed: {}; retrying in {:?}",
                    relay.local_mount,
                    e,
                    delay
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => continue,
                }
                delay = (delay * 2).min(MAX_RETRY_DELAY);
            }
        }
    }
    log::debug!("relay {} finished", relay.local_mount);
}

/// One upstream session: connect, reserve, complete, stream until EOF.
async fn pull_once(
    ctx: &Arc<ServerContext>,
    relay: &RelayConfig,
    client: &reqwest::Client,
) -> Result<(), String> {
    let mut request = client.get(&relay.upstream);
    if let Some(username) = &relay.username {
        request = request.basic_auth(username, relay.password.as_deref());
    }

    let response = request.send().await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("upstream answered {}", response.status()));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let reservation = ctx
        .sources
        .reserve(&relay.local_mount)
        .map_err(|id| id.message().to_string())?;
    // Legacy relays frequently omit the header; the format layer falls
    // back to MP3 for them.
    let source = ctx
        .sources
        .complete(ctx, reservation, content_type.as_deref())
        .map_err(|id| id.message().to_string())?;

    let reader = HttpReader {
        body: response.bytes_stream().boxed(),
    };
    run_source(Arc::clone(ctx), source, Box::new(reader)).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::EventBus;
    use crate::stats::Stats;
    use crate::tls::NoTlsProvider;

    #[tokio::test]
    async fn demand_signal_wakes_registered_mounts_only() {
        let (bus, _rx) = EventBus::new();
        let ctx = ServerContext::new(
            Config::default(),
            Arc::new(NoTlsProvider),
            bus,
            Arc::new(crate::events::stream::EventStreamHub::new()),
            Arc::new(Stats::new(None)),
        )
        .unwrap();

        let notify = Arc::new(Notify::new());
        ctx.relay_demand
            .insert("/relay".to_string(), Arc::clone(&notify));

        let waiter = {
            let notify = Arc::clone(&notify);
            tokio::spawn(async move { notify.notified().await })
        };
        tokio::task::yield_now().await;

        // Unknown mount is a no-op.
        signal_demand(&ctx, "/unknown");
        signal_demand(&ctx, "/relay");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("demand wake")
            .unwrap();
    }
}
