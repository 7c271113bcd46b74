//! The client: one parsed request bound to its connection.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use crate::acl::Acl;
use crate::admin::AdminCommand;
use crate::config::OperationMode;
use crate::error::ErrorId;
use crate::navigation::NavigationHistory;
use crate::net::connection::Connection;
use crate::protocol::{render_error, Request, ResponseHead};
use crate::utils::decode_basic_auth;

/// A connection that has parsed into a request and travels through
/// rewrite, auth and dispatch.
pub struct Client {
    pub con: Connection,
    pub request: Request,
    /// Normalized, possibly rewritten URI.
    pub uri: String,
    pub omode: OperationMode,
    /// Filled before auth so ACLs can rule on the command.
    pub admin_command: Option<AdminCommand>,
    pub role: Option<String>,
    pub username: Option<String>,
    pub acl: Option<Arc<Acl>>,
    /// Password slot for protocols that carry it outside Basic auth.
    pub password_override: Option<String>,
    pub history: NavigationHistory,
    /// Module/handler pair bound by a resource rewrite.
    pub handler: Option<(String, String)>,
}

impl Client {
    /// Credentials from the `Authorization` header, with the override slot
    /// taking precedence for the password.
    #[must_use]
    pub fn credentials(&self) -> (Option<String>, Option<String>) {
        let basic = self
            .request
            .header("authorization")
            .and_then(decode_basic_auth);
        match (&self.password_override, basic) {
            (Some(pass), Some((user, _))) => (Some(user), Some(pass.clone())),
            (Some(pass), None) => (Some("source".to_string()), Some(pass.clone())),
            (None, Some((user, pass))) => (Some(user), Some(pass)),
            (None, None) => (None, None),
        }
    }

    /// Whether the client negotiated a JSON error body.
    #[must_use]
    pub fn wants_json(&self) -> bool {
        self.request
            .header("accept")
            .is_some_and(|accept| accept.contains("application/json"))
    }

    /// Writes a response head.
    pub async fn send_head(&mut self, head: &ResponseHead) -> std::io::Result<()> {
        let rendered = head.render();
        self.con.stream.write_all(rendered.as_bytes()).await?;
        self.con.sent_bytes += rendered.len() as u64;
        Ok(())
    }

    /// Sends an error-table row as the response and flushes.
    ///
    /// Failures here only flip the connection error flag; an error while
    /// reporting an error never cascades further.
    pub async fn send_error(&mut self, id: ErrorId) {
        let (head, body) = render_error(id.entry(), self.wants_json());
        let rendered = head.render();
        let write = async {
            self.con.stream.write_all(rendered.as_bytes()).await?;
            self.con.stream.write_all(body.as_bytes()).await?;
            self.con.stream.flush().await
        };
        match write.await {
            Ok(()) => {
                self.con.sent_bytes += (rendered.len() + body.len()) as u64;
            }
            Err(e) => {
                log::debug!("client {}: error response not delivered: {e}", self.con.id);
                self.con.error = true;
            }
        }
    }

    /// Sends a bare status head (204 and friends) and flushes.
    pub async fn send_empty(&mut self, head: &ResponseHead) {
        if self.send_head(head).await.is_err() {
            self.con.error = true;
            return;
        }
        if self.con.stream.flush().await.is_err() {
            self.con.error = true;
        }
    }
}
