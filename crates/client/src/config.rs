//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use chansock_protocol::{constants, JsonPacker, Packer};

/// Which transport to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChskKind {
    /// WebSocket first, permanent downgrade to Ajax if it never opens.
    Auto,
    Ws,
    Ajax,
}

/// Scheme of the server endpoint (`ws`/`wss` is derived for WebSocket).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub(crate) fn http_scheme(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    pub(crate) fn ws_scheme(self) -> &'static str {
        match self {
            Protocol::Http => "ws",
            Protocol::Https => "wss",
        }
    }
}

/// Exponential reconnect backoff with jitter.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Multiplier per attempt.
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(15),
            factor: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay for a 1-based attempt number, with ±25% jitter to avoid
    /// thundering herds. Jitter is seeded from the clock's sub-second
    /// nanos rather than a rand dependency.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25;
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / u32::MAX as f64)
            * 2.0
            - 1.0; // [-1.0, 1.0)
        Duration::from_secs_f64((capped + jitter * offset).max(0.05))
    }
}

/// Client configuration. `Default` targets `http://localhost/chsk` with a
/// fresh client id and the protocol defaults.
#[derive(Clone)]
pub struct ClientConfig {
    pub kind: ChskKind,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Extra query/form params sent with every request.
    pub params: Vec<(String, String)>,
    /// Extra headers for Ajax requests.
    pub headers: Vec<(String, String)>,
    /// Identifies this endpoint (one tab / one process) across
    /// reconnects.
    pub client_id: String,
    pub csrf_token: Option<String>,
    /// Receive channel capacity.
    pub recv_buf: usize,
    pub packer: Arc<dyn Packer>,
    /// Wrap server pushes as `[chsk/recv, ev]` before delivery.
    pub wrap_recv_evs: bool,
    pub backoff: BackoffConfig,
    /// Idle window before the client pings the WebSocket.
    pub ws_kalive: Duration,
    /// How long to wait for the ping's `"pong"` before cycling the
    /// socket.
    pub ws_kalive_ping_timeout: Duration,
    /// HTTP timeout for one long-poll request (must exceed the server's
    /// long-poll window).
    pub ajax_poll_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            kind: ChskKind::Auto,
            protocol: Protocol::Http,
            host: "localhost".to_owned(),
            port: 80,
            path: "/chsk".to_owned(),
            params: Vec::new(),
            headers: Vec::new(),
            client_id: uuid::Uuid::new_v4().to_string(),
            csrf_token: None,
            recv_buf: constants::CLIENT_RECV_BUF,
            packer: Arc::new(JsonPacker),
            wrap_recv_evs: true,
            backoff: BackoffConfig::default(),
            ws_kalive: constants::WS_KALIVE_CLIENT,
            ws_kalive_ping_timeout: constants::WS_KALIVE_PING_TIMEOUT,
            ajax_poll_timeout: constants::LP_CLIENT_POLL_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// The WebSocket connect URL. Query values are percent-encoded, so
    /// opaque host-supplied params and tokens survive the round trip.
    pub(crate) fn ws_url(&self) -> String {
        let base = format!(
            "{}://{}:{}{}",
            self.protocol.ws_scheme(),
            self.host,
            self.port,
            self.path,
        );
        let mut url = match reqwest::Url::parse(&base) {
            Ok(url) => url,
            Err(e) => {
                // The dial fails on the same input and surfaces it.
                tracing::warn!(error = %e, "invalid endpoint configuration");
                return base;
            }
        };
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("client-id", &self.client_id);
            if let Some(tok) = &self.csrf_token {
                pairs.append_pair("csrf-token", tok);
            }
            pairs.extend_pairs(self.params.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        url.to_string()
    }

    /// The HTTP URL for Ajax polls and sends.
    pub(crate) fn http_url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol.http_scheme(),
            self.host,
            self.port,
            self.path,
        )
    }
}
