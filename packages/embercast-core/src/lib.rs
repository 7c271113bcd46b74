//! Embercast Core - the engine of the Embercast streaming media server.
//!
//! This crate implements the concurrent request-processing engine shared
//! by the headless server binary and embedding hosts: the listen-socket
//! set, the per-connection lifecycle (accept, header read, parse,
//! authenticate, dispatch), the mountpoint and source state machine, the
//! listener fan-out pipeline with its burst buffer and slow-consumer
//! policy, fallback chains, relays, the composable authentication stack,
//! the ACL model, the event bus with its sinks and server-sent-events
//! surface, statistics, and the administrative command set.
//!
//! # Architecture
//!
//! - [`bootstrap`]: service wiring and the background task set
//! - [`context`]: shared server state threaded through every component
//! - [`net`]: listen sockets, accept loop and the connection pool
//! - [`protocol`]: request parsing, URI normalization, response heads
//! - [`dispatch`]: per-request routing (rewrite, auth, hand-off)
//! - [`stream`]: sources, the broadcast queue and the listener engine
//! - [`auth`] / [`acl`]: who may do what
//! - [`events`]: slow/fast event surfaces, sinks, SSE
//! - [`stats`], [`admin`], [`fserve`], [`relay`]: the surrounding surfaces
//!
//! TLS handshakes, GeoIP and directory (YP) clients stay behind contract
//! traits; the engine decides *when* they apply, deployments decide *how*.

#![warn(clippy::all)]

pub mod acl;
pub mod admin;
pub mod auth;
pub mod bootstrap;
pub mod buffer;
pub mod client;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod fserve;
pub mod matchfile;
pub mod module;
pub mod navigation;
pub mod net;
pub mod protocol;
pub mod relay;
pub mod report;
pub mod resourcematch;
pub mod stats;
pub mod stream;
pub mod tls;
pub mod utils;
pub mod yp;

// Re-export commonly used types at the crate root
pub use acl::{Acl, Policy, UserLimit};
pub use admin::AdminCommand;
pub use auth::{AuthDecision, AuthResult, AuthStack, Authenticator};
pub use bootstrap::{bootstrap, BootstrappedServer};
pub use buffer::{Buffer, Refbuf};
pub use config::{
    Config, FallbackOverride, ListenSpec, MountConfig, MountType, RelayConfig, ResourceRule,
    RoleConfig, TlsMode,
};
pub use context::ServerContext;
pub use error::{error_by_id, error_by_uuid, CastError, CastResult, ErrorId};
pub use events::{Event, EventBus, FastEvent, FastEventKind};
pub use matchfile::{match_allow_deny, Matchfile};
pub use navigation::{Direction, NavigationHistory};
pub use protocol::{Method, Protocol, SERVER_ID};
pub use resourcematch::{resourcematch, ResourceMatch};
pub use stats::Stats;
pub use stream::{Source, SourceRegistry, SourceState};
pub use tls::{NoTlsProvider, TlsProvider};
pub use yp::{Directory, DirectoryEntry};
