//! The administrative surface.
//!
//! Commands are a fixed enumeration reachable as `/admin/<command>` or via
//! the legacy `/admin.cgi?mode=<command>` form. The dispatcher fills the
//! command id before authentication so ACLs can rule on it; the handlers
//! here run only for granted clients.

use std::sync::Arc;

use serde_json::json;

use crate::client::Client;
use crate::context::ServerContext;
use crate::error::ErrorId;
use crate::events::Event;
use crate::protocol::ResponseHead;
use crate::stream::FallbackTarget;

/// The admin command vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum AdminCommand {
    Stats,
    ListClients,
    ListMounts,
    MoveClients,
    KillClient,
    KillSource,
    Metadata,
    UpdateMetadata,
    BuildM3u,
    ManageAuth,
    ShowLog,
    Dashboard,
    Version,
}

impl AdminCommand {
    /// Every command, for table construction and iteration.
    pub const ALL: &'static [AdminCommand] = &[
        Self::Stats,
        Self::ListClients,
        Self::ListMounts,
        Self::MoveClients,
        Self::KillClient,
        Self::KillSource,
        Self::Metadata,
        Self::UpdateMetadata,
        Self::BuildM3u,
        Self::ManageAuth,
        Self::ShowLog,
        Self::Dashboard,
        Self::Version,
    ];

    /// Parses a command name, accepting the legacy `updinfo` spelling for
    /// metadata updates.
    #[must_use]
    pub fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "stats" | "stats.xml" => Self::Stats,
            "listclients" => Self::ListClients,
            "listmounts" => Self::ListMounts,
            "moveclients" => Self::MoveClients,
            "killclient" => Self::KillClient,
            "killsource" => Self::KillSource,
            "metadata" | "updinfo" => Self::Metadata,
            "updatemetadata" => Self::UpdateMetadata,
            "buildm3u" => Self::BuildM3u,
            "manageauth" => Self::ManageAuth,
            "showlog" => Self::ShowLog,
            "dashboard" => Self::Dashboard,
            "version" => Self::Version,
            _ => return None,
        })
    }

    /// Canonical name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stats => "stats",
            Self::ListClients => "listclients",
            Self::ListMounts => "listmounts",
            Self::MoveClients => "moveclients",
            Self::KillClient => "killclient",
            Self::KillSource => "killsource",
            Self::Metadata => "metadata",
            Self::UpdateMetadata => "updatemetadata",
            Self::BuildM3u => "buildm3u",
            Self::ManageAuth => "manageauth",
            Self::ShowLog => "showlog",
            Self::Dashboard => "dashboard",
            Self::Version => "version",
        }
    }
}

/// Runs an authenticated admin request to completion.
pub async fn handle(ctx: &Arc<ServerContext>, mut client: Client) {
    let Some(command) = client.admin_command else {
        client.send_error(ErrorId::AdminUnrecognisedCommand).await;
        return;
    };

    match command {
        AdminCommand::Stats => send_stats(ctx, client).await,
        AdminCommand::ListMounts => list_mounts(ctx, client).await,
        AdminCommand::ListClients => list_clients(ctx, client).await,
        AdminCommand::MoveClients => move_clients(ctx, client).await,
        AdminCommand::KillClient => kill_client(ctx, client).await,
        AdminCommand::KillSource => kill_source(ctx, client).await,
        // The web form and the legacy query surface share the metadata
        // update semantics.
        AdminCommand::Metadata | AdminCommand::UpdateMetadata => {
            update_metadata(ctx, client).await;
        }
        AdminCommand::BuildM3u => build_m3u(ctx, client).await,
        AdminCommand::Version => send_version(client).await,
        AdminCommand::ManageAuth | AdminCommand::ShowLog | AdminCommand::Dashboard => {
            client.send_error(ErrorId::ConUnimplemented).await;
        }
    }
}

async fn send_body(mut client: Client, content_type: &str, body: String) {
    let head = ResponseHead::new(200)
        .header("Content-Type", content_type)
        .header("Content-Length", body.len().to_string())
        .header("Connection", "close");
    if client.send_head(&head).await.is_ok() {
        use tokio::io::AsyncWriteExt;
        let _ = client.con.stream.write_all(body.as_bytes()).await;
        let _ = client.con.stream.flush().await;
    }
}

async fn send_stats(ctx: &Arc<ServerContext>, client: Client) {
    let xml = ctx.stats.snapshot_xml();
    send_body(client, "text/xml", xml).await;
}

async fn list_mounts(ctx: &Arc<ServerContext>, client: Client) {
    let sources: Vec<_> = ctx
        .sources
        .list_active()
        .into_iter()
        .map(|source| {
            json!({
                "mount": source.mount,
                "listeners": source.listener_count(),
                "peak_listeners": source.peak_listeners(),
                "content_type": source.content_type,
                "hidden": source.settings.hidden,
                "instance": source.instance_uuid,
            })
        })
        .collect();
    let body = json!({ "mounts": sources }).to_string();
    send_body(client, "application/json", body).await;
}

async fn list_clients(ctx: &Arc<ServerContext>, mut client: Client) {
    let Some(mount) = client.request.query_param("mount").map(str::to_string) else {
        client.send_error(ErrorId::AdminMissingParameter).await;
        return;
    };
    let Some(source) = ctx.sources.get(&mount) else {
        client.send_error(ErrorId::AdminSourceDoesNotExist).await;
        return;
    };
    let listeners: Vec<_> = source
        .listeners_snapshot()
        .into_iter()
        .map(|listener| {
            json!({
                "id": listener.id,
                "ip": listener.peer_ip,
                "role": listener.role,
                "username": listener.username,
            })
        })
        .collect();
    let body = json!({ "mount": mount, "listeners": listeners }).to_string();
    send_body(client, "application/json", body).await;
}

async fn move_clients(ctx: &Arc<ServerContext>, mut client: Client) {
    let (Some(mount), Some(destination)) = (
        client.request.query_param("mount").map(str::to_string),
        client.request.query_param("destination").map(str::to_string),
    ) else {
        client.send_error(ErrorId::AdminMissingParameter).await;
        return;
    };
    if mount == destination {
        client
            .send_error(ErrorId::AdminSuppliedMountpointsAreIdentical)
            .await;
        return;
    }
    let Some(source) = ctx.sources.get(&mount) else {
        client.send_error(ErrorId::AdminSourceDoesNotExist).await;
        return;
    };
    let Some(target) = ctx.sources.get(&destination) else {
        client.send_error(ErrorId::AdminNoSuchDestination).await;
        return;
    };
    if !target.is_running() {
        client.send_error(ErrorId::AdminDestNotRunning).await;
        return;
    }

    let mut moved = 0usize;
    for listener in source.listeners_snapshot() {
        source.remove_listener(listener.id);
        listener.move_to(FallbackTarget::Mount(destination.clone()));
        moved += 1;
    }
    log::info!("moved {moved} listeners from {mount} to {destination}");
    let body = json!({ "moved": moved, "from": mount, "to": destination }).to_string();
    send_body(client, "application/json", body).await;
}

async fn kill_client(ctx: &Arc<ServerContext>, mut client: Client) {
    let (Some(mount), Some(id)) = (
        client.request.query_param("mount").map(str::to_string),
        client
            .request
            .query_param("id")
            .and_then(|id| id.parse::<u64>().ok()),
    ) else {
        client.send_error(ErrorId::AdminMissingParameter).await;
        return;
    };
    let Some(source) = ctx.sources.get(&mount) else {
        client.send_error(ErrorId::AdminSourceDoesNotExist).await;
        return;
    };
    let Some(listener) = source
        .listeners_snapshot()
        .into_iter()
        .find(|listener| listener.id == id)
    else {
        client.send_error(ErrorId::AdminNoSuchDestination).await;
        return;
    };
    listener.set_error();
    send_body(client, "application/json", json!({ "killed": id }).to_string()).await;
}

async fn kill_source(ctx: &Arc<ServerContext>, mut client: Client) {
    let Some(mount) = client.request.query_param("mount").map(str::to_string) else {
        client.send_error(ErrorId::AdminMissingParameter).await;
        return;
    };
    let Some(source) = ctx.sources.get(&mount) else {
        client.send_error(ErrorId::AdminSourceDoesNotExist).await;
        return;
    };
    source.stop();
    send_body(client, "application/json", json!({ "stopped": mount }).to_string()).await;
}

async fn update_metadata(ctx: &Arc<ServerContext>, mut client: Client) {
    let Some(mount) = client.request.query_param("mount").map(str::to_string) else {
        client.send_error(ErrorId::AdminMissingParameter).await;
        return;
    };
    // The legacy form carries mode=updinfo; any other mode is not a
    // metadata update.
    if let Some(mode) = client.request.query_param("mode") {
        if mode != "updinfo" {
            client.send_error(ErrorId::AdminMetadataBadCall).await;
            return;
        }
    }
    let Some(song) = client.request.query_param("song").map(str::to_string) else {
        client.send_error(ErrorId::AdminMissingArgument).await;
        return;
    };
    let Some(source) = ctx.sources.get(&mount) else {
        client.send_error(ErrorId::AdminSourceDoesNotExist).await;
        return;
    };
    if !source.format.supports_inband_metadata() {
        client
            .send_error(ErrorId::AdminMountNotAcceptUrlUpdates)
            .await;
        return;
    }

    let url = client.request.query_param("url").map(str::to_string);
    source.update_metadata(Some(song.clone()), url);
    ctx.stats.set(&mount, "title", song.as_str());
    let mut event = Event::new("metadata-update").with_mount(&mount);
    event.connection_ip = Some(client.con.peer_ip.clone());
    ctx.emit_event(event);

    send_body(client, "application/json", json!({ "mount": mount, "title": song }).to_string())
        .await;
}

async fn build_m3u(ctx: &Arc<ServerContext>, mut client: Client) {
    let Some(mount) = client.request.query_param("mount").map(str::to_string) else {
        client.send_error(ErrorId::AdminMissingParameter).await;
        return;
    };
    let config = ctx.config();
    let host = client
        .request
        .header("host")
        .map(str::to_string)
        .unwrap_or_else(|| {
            format!(
                "{}:{}",
                config.hostname,
                client.con.effective_listen.spec().port
            )
        });
    let body = format!("http://{host}{mount}\r\n");
    send_body(client, "audio/x-mpegurl", body).await;
}

async fn send_version(client: Client) {
    let body = json!({
        "server": crate::protocol::SERVER_ID,
    })
    .to_string();
    send_body(client, "application/json", body).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_names_round_trip() {
        for command in AdminCommand::ALL {
            assert_eq!(AdminCommand::parse(command.as_str()), Some(*command));
        }
    }

    #[test]
    fn legacy_spellings_resolve() {
        assert_eq!(AdminCommand::parse("updinfo"), Some(AdminCommand::Metadata));
        assert_eq!(AdminCommand::parse("stats.xml"), Some(AdminCommand::Stats));
        assert_eq!(AdminCommand::parse("teleport"), None);
    }

    #[test]
    fn metadata_forms_are_distinct_commands() {
        assert_eq!(
            AdminCommand::parse("updatemetadata"),
            Some(AdminCommand::UpdateMetadata)
        );
        assert_ne!(
            AdminCommand::parse("updatemetadata"),
            AdminCommand::parse("metadata")
        );
        assert_eq!(
            AdminCommand::parse("dashboard"),
            Some(AdminCommand::Dashboard)
        );
    }
}
