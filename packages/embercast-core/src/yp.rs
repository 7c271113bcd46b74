//! The public-directory (YP) contract.
//!
//! The engine decides *which* mounts are advertised and *when* their
//! entries need touching; the actual directory HTTP client lives behind
//! [`Directory`]. The touch loop below drives any wired implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::ServerContext;

/// What a directory needs to know about an advertised stream.
#[derive(Debug, Clone, Default)]
pub struct DirectoryEntry {
    pub mount: String,
    pub listen_url: String,
    pub stream_name: Option<String>,
    pub description: Option<String>,
    pub genre: Option<String>,
    pub bitrate: Option<String>,
    pub media_type: String,
    pub current_title: Option<String>,
    pub listeners: usize,
}

/// A public stream directory.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Announces a new stream; errors are the implementation's to retry.
    async fn add(&self, entry: &DirectoryEntry);

    /// Refreshes a previously announced stream.
    async fn touch(&self, entry: &DirectoryEntry);

    /// Withdraws a stream.
    async fn remove(&self, mount: &str);
}

/// Builds the directory view of every advertised mount.
#[must_use]
pub fn advertised_entries(ctx: &Arc<ServerContext>) -> Vec<DirectoryEntry> {
    let config = ctx.config();
    let port = config.listen.first().map(|l| l.port).unwrap_or(8000);
    ctx.sources
        .list_active()
        .into_iter()
        .filter(|source| source.settings.yp_public && !source.settings.hidden)
        .map(|source| {
            let mount_config = config.find_mount(&source.mount);
            let metadata = source.metadata.read();
            DirectoryEntry {
                mount: source.mount.clone(),
                listen_url: format!("http://{}:{}{}", config.hostname, port, source.mount),
                stream_name: source.settings.stream_name.clone(),
                description: mount_config.and_then(|m| m.stream_description.clone()),
                genre: mount_config.and_then(|m| m.stream_genre.clone()),
                bitrate: mount_config.and_then(|m| m.bitrate.clone()),
                media_type: source.content_type.clone(),
                current_title: metadata.title.clone(),
                listeners: source.listener_count(),
            }
        })
        .collect()
}

/// Periodically refreshes the directory until shutdown.
pub async fn run_touch_loop(
    ctx: Arc<ServerContext>,
    directory: Arc<dyn Directory>,
    interval: Duration,
) {
    let mut shutdown = ctx.shutdown_watch();
    let mut known: Vec<String> = Vec::new();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }

        let entries = advertised_entries(&ctx);
        for entry in &entries {
            if known.contains(&entry.mount) {
                directory.touch(entry).await;
            } else {
                directory.add(entry).await;
                known.push(entry.mount.clone());
            }
        }

        let gone: Vec<String> = known
            .iter()
            .filter(|mount| !entries.iter().any(|e| e.mount == **mount))
            .cloned()
            .collect();
        for mount in &gone {
            directory.remove(mount).await;
        }
        known.retain(|mount| !gone.contains(mount));
    }
    for mount in known {
        directory.remove(&mount).await;
    }
}
