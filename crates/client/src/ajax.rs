//! Ajax long-polling transport: a repoll-on-reply GET loop for receives,
//! POST for sends. The long-poll timeout/repoll cycle subsumes
//! keep-alive, so unlike the WebSocket machine there is no ping task.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use chansock_protocol::constants::epoch_ms;
use chansock_protocol::event::{cb_ids, ids, parse_handshake};
use chansock_protocol::packer::{pack_payload, unpack_payload, Cb, Unpacked};
use chansock_protocol::Event;

use crate::cb::{CbFn, CbReply};
use crate::config::ChskKind;
use crate::error::ClientError;
use crate::state::{CloseReason, Shared};

enum PollOutcome {
    /// Response handled; repoll immediately.
    Delivered,
    /// The HTTP request itself timed out; repoll without a state change.
    HttpTimeout,
    /// Transport failure; mark closed and back off.
    Failed(String),
    /// A newer poll loop owns the connection.
    Superseded,
}

/// The Ajax long-polling transport.
pub struct AjaxChsk {
    shared: Arc<Shared>,
    http: reqwest::Client,
    /// Current poll-loop token; 0 while disconnected.
    conn_id: AtomicU64,
    conn_seq: AtomicU64,
    retry_count: AtomicU32,
}

impl AjaxChsk {
    pub(crate) fn new(shared: Arc<Shared>) -> Arc<Self> {
        Arc::new(Self {
            shared,
            http: reqwest::Client::new(),
            conn_id: AtomicU64::new(0),
            conn_seq: AtomicU64::new(0),
            retry_count: AtomicU32::new(0),
        })
    }

    /// Starts the long-poll loop.
    pub fn connect(self: &Arc<Self>) {
        let token = self.conn_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.conn_id.store(token, Ordering::SeqCst);
        self.retry_count.store(0, Ordering::SeqCst);
        self.shared.update_state(|s| s.kind = ChskKind::Ajax);
        let chsk = Arc::clone(self);
        tokio::spawn(async move { chsk.poll_loop(token).await });
    }

    /// Stops polling; nothing reconnects until [`AjaxChsk::connect`].
    pub fn disconnect(&self) {
        self.conn_id.store(0, Ordering::SeqCst);
        self.shared.update_state(|s| s.udt_next_reconnect = None);
        self.shared.mark_closed(CloseReason::RequestedDisconnect);
    }

    /// Cycles the poll loop.
    pub fn reconnect(self: &Arc<Self>) {
        self.shared.mark_closed(CloseReason::RequestedReconnect);
        self.connect();
    }

    /// Drops the current poll loop as a network failure would, then
    /// recovers through the normal connect path.
    pub fn break_connection(self: &Arc<Self>) {
        self.shared.mark_closed(CloseReason::Unexpected);
        self.connect();
    }

    /// Sends an event over POST. With a callback, the response body is
    /// the reply (or resolves it with timeout/error).
    pub fn send(self: &Arc<Self>, event: Event, timeout: Option<Duration>, cb: Option<CbFn>) -> bool {
        if !self.shared.state().open {
            if let Some(cb) = cb {
                cb(CbReply::Closed);
            }
            return false;
        }

        let cb_slot = if cb.is_some() { Cb::Ajax } else { Cb::None };
        let packed = match pack_payload(self.shared.cfg.packer.as_ref(), &event.to_value(), &cb_slot)
        {
            Ok(packed) => packed,
            Err(e) => {
                warn!(error = %e, "failed to pack outgoing payload");
                if let Some(cb) = cb {
                    cb(CbReply::Error);
                }
                return false;
            }
        };

        let chsk = Arc::clone(self);
        tokio::spawn(async move {
            let result = chsk.post(&packed, timeout).await;
            match cb {
                Some(cb) => match result {
                    Ok(body) => {
                        let Unpacked { value, .. } =
                            unpack_payload(chsk.shared.cfg.packer.as_ref(), &body);
                        if value == json!(ids::TIMEOUT) {
                            cb(CbReply::Timeout);
                        } else {
                            cb(CbReply::Reply(value));
                        }
                    }
                    Err(ClientError::Timeout) => cb(CbReply::Timeout),
                    Err(e) => {
                        debug!(error = %e, "ajax send failed");
                        cb(CbReply::Error);
                    }
                },
                None => {
                    // Fire-and-forget still completes with the dummy
                    // sentinel; anything else is worth a log line.
                    if let Ok(body) = result {
                        let Unpacked { value, .. } =
                            unpack_payload(chsk.shared.cfg.packer.as_ref(), &body);
                        if value != json!(cb_ids::DUMMY_CB_200) {
                            debug!("unexpected body for cb-less send");
                        }
                    }
                }
            }
        });
        true
    }

    async fn post(&self, ppstr: &str, timeout: Option<Duration>) -> Result<String, ClientError> {
        let cfg = &self.shared.cfg;
        let mut form: Vec<(String, String)> = vec![
            ("udt".into(), epoch_ms().to_string()),
            ("client-id".into(), cfg.client_id.clone()),
            ("ppstr".into(), ppstr.to_owned()),
        ];
        let csrf = self.shared.state().csrf_token;
        if let Some(tok) = &csrf {
            form.push(("csrf-token".into(), tok.clone()));
        }
        form.extend(cfg.params.iter().cloned());

        let mut req = self.http.post(cfg.http_url()).form(&form);
        if let Some(tok) = &csrf {
            req = req.header("X-CSRF-Token", tok);
        }
        for (name, value) in &cfg.headers {
            req = req.header(name, value);
        }
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Timeout
            } else {
                ClientError::Http(e)
            }
        })?;
        let resp = resp.error_for_status()?;
        Ok(resp.text().await?)
    }

    async fn poll_loop(self: Arc<Self>, token: u64) {
        loop {
            if self.conn_id.load(Ordering::SeqCst) != token || crate::client_unloading() {
                return;
            }
            match self.poll_once(token).await {
                PollOutcome::Delivered => {
                    self.retry_count.store(0, Ordering::SeqCst);
                }
                PollOutcome::HttpTimeout => {
                    trace!("long-poll http timeout; repolling");
                }
                PollOutcome::Superseded => return,
                PollOutcome::Failed(err) => {
                    debug!(error = %err, "long-poll failed");
                    self.shared.mark_closed(CloseReason::Unexpected);
                    if self.conn_id.load(Ordering::SeqCst) != token {
                        return;
                    }
                    let attempt = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
                    let delay = self.shared.cfg.backoff.delay_for_attempt(attempt);
                    self.shared.update_state(|s| {
                        s.udt_next_reconnect = Some(epoch_ms() + delay.as_millis() as u64);
                    });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn poll_once(&self, token: u64) -> PollOutcome {
        let cfg = &self.shared.cfg;
        let state = self.shared.state();

        // udt is a cache-buster; handshake requested until we are open.
        // Encoding goes through reqwest, like the POST form.
        let mut query: Vec<(String, String)> = vec![
            ("client-id".into(), cfg.client_id.clone()),
            ("udt".into(), epoch_ms().to_string()),
        ];
        if !state.open {
            query.push(("handshake".into(), "true".into()));
        }
        query.extend(cfg.params.iter().cloned());

        let mut req = self
            .http
            .get(cfg.http_url())
            .query(&query)
            .timeout(cfg.ajax_poll_timeout);
        if let Some(tok) = &state.csrf_token {
            req = req.header("X-CSRF-Token", tok);
        }
        for (name, value) in &cfg.headers {
            req = req.header(name, value);
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => return PollOutcome::HttpTimeout,
            Err(e) => return PollOutcome::Failed(e.to_string()),
        };
        if !resp.status().is_success() {
            return PollOutcome::Failed(format!("http status {}", resp.status()));
        }
        let body = resp.text().await.unwrap_or_default();

        if self.conn_id.load(Ordering::SeqCst) != token {
            return PollOutcome::Superseded;
        }
        if !body.is_empty() {
            self.handle_poll_body(&body);
        }
        PollOutcome::Delivered
    }

    /// Dispatches one long-poll response body: handshake, the
    /// `chsk/timeout` sentinel (a no-op), or a batch of pushed events.
    fn handle_poll_body(&self, body: &str) {
        let Unpacked { value, .. } = unpack_payload(self.shared.cfg.packer.as_ref(), body);

        if let Ok(ev) = Event::from_value(&value) {
            if let Some((uid, data)) = parse_handshake(&ev) {
                self.retry_count.store(0, Ordering::SeqCst);
                self.shared.receive_handshake(uid, data);
                return;
            }
        }
        if value == json!(ids::TIMEOUT) {
            trace!("long-poll window elapsed; repolling");
            return;
        }

        match value {
            Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_array) => {
                self.shared.deliver_batch(items);
            }
            other => self.shared.push_internal(Event::bad_event(other)),
        }
    }
}
