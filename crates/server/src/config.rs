//! Server configuration and the transport-neutral request view that the
//! injected identity/CSRF/authorization hooks operate on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use chansock_protocol::{constants, JsonPacker, Packer};

use crate::registry::Transport;

/// The parts of an incoming HTTP request the injected hooks may inspect:
/// query/form params plus headers, names lowercased.
#[derive(Debug, Clone, Default)]
pub struct ConnRequest {
    pub params: HashMap<String, String>,
    pub headers: HashMap<String, String>,
}

impl ConnRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Origin allow-list for the handshake endpoints.
#[derive(Debug, Clone)]
pub enum AllowedOrigins {
    All,
    Only(HashSet<String>),
}

pub type UserIdFn = Arc<dyn Fn(&ConnRequest) -> Option<String> + Send + Sync>;
pub type CsrfTokenFn = Arc<dyn Fn(&ConnRequest) -> Option<String> + Send + Sync>;
pub type HandshakeDataFn = Arc<dyn Fn(&ConnRequest) -> Option<Value> + Send + Sync>;
pub type AuthorizedFn = Arc<dyn Fn(&ConnRequest) -> bool + Send + Sync>;
/// Returns `(http-status, body)` for a rejected request.
pub type UnauthorizedFn = Arc<dyn Fn(&ConnRequest) -> (u16, String) + Send + Sync>;

/// Server configuration. `Default` gives the protocol defaults with CSRF
/// checking disabled (the host is expected to wire `csrf_token_fn` in
/// anything internet-facing).
#[derive(Clone)]
pub struct ServerConfig {
    /// Receive channel capacity.
    pub recv_buf: usize,
    /// Inactivity window before the server pings a WebSocket connection.
    pub ws_kalive: Duration,
    /// How long an open long-poll (or an Ajax reply wait) may idle before
    /// the `chsk/timeout` sentinel answers it.
    pub lp_timeout: Duration,
    /// Coalescing window for WebSocket sends.
    pub send_buf_ws: Duration,
    /// Coalescing window for Ajax sends.
    pub send_buf_ajax: Duration,
    /// Grace window before a closed WebSocket entry is reaped.
    pub reconnect_grace_ws: Duration,
    /// Grace window before a closed Ajax entry is reaped.
    pub reconnect_grace_ajax: Duration,
    pub allowed_origins: AllowedOrigins,
    /// Maps a request to its uid; `None` (or an unset fn) yields the
    /// nil-uid sentinel.
    pub user_id_fn: Option<UserIdFn>,
    /// Reference CSRF token for a request. Unset disables the check.
    pub csrf_token_fn: Option<CsrfTokenFn>,
    /// Application data carried in the handshake frame.
    pub handshake_data_fn: Option<HandshakeDataFn>,
    pub authorized_fn: Option<AuthorizedFn>,
    pub unauthorized_fn: Option<UnauthorizedFn>,
    pub packer: Arc<dyn Packer>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            recv_buf: constants::SERVER_RECV_BUF,
            ws_kalive: constants::WS_KALIVE_SERVER,
            lp_timeout: constants::LP_TIMEOUT,
            send_buf_ws: constants::SEND_BUF_WS,
            send_buf_ajax: constants::SEND_BUF_AJAX,
            reconnect_grace_ws: constants::RECONNECT_GRACE_WS,
            reconnect_grace_ajax: constants::RECONNECT_GRACE_AJAX,
            allowed_origins: AllowedOrigins::All,
            user_id_fn: None,
            csrf_token_fn: None,
            handshake_data_fn: None,
            authorized_fn: None,
            unauthorized_fn: None,
            packer: Arc::new(JsonPacker),
        }
    }
}

impl ServerConfig {
    pub(crate) fn send_buf(&self, transport: Transport) -> Duration {
        match transport {
            Transport::Ws => self.send_buf_ws,
            Transport::Ajax => self.send_buf_ajax,
        }
    }

    pub(crate) fn reconnect_grace(&self, transport: Transport) -> Duration {
        match transport {
            Transport::Ws => self.reconnect_grace_ws,
            Transport::Ajax => self.reconnect_grace_ajax,
        }
    }
}
