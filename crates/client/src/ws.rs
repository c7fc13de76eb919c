//! WebSocket client state machine: connect, reconnect with exponential
//! backoff, send with callback correlation, and keep-alive pings.
//!
//! Cancellation is token-based: every `connect` mints a fresh conn-id,
//! and any loop still holding an older id exits at its next check, so a
//! user disconnect can never be overridden by a stale reconnect attempt.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use chansock_protocol::constants::epoch_ms;
use chansock_protocol::event::{ids, parse_handshake};
use chansock_protocol::packer::{pack_payload, unpack_payload, Cb, Unpacked};
use chansock_protocol::Event;

use crate::cb::{CbFn, CbReply};
use crate::config::ChskKind;
use crate::state::{CloseReason, Shared, WsCloseInfo, WsErrorInfo};

/// Control handle for one physical socket. Late callbacks from a
/// superseded socket see a cancelled token and drop out.
pub(crate) struct SocketCtl {
    out_tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
}

impl SocketCtl {
    /// Requests shutdown with a reason; the first reason wins.
    pub(crate) fn shut(&self, reason: CloseReason) {
        if let Ok(mut guard) = self.close_reason.lock() {
            guard.get_or_insert(reason);
        }
        self.cancel.cancel();
    }

    fn take_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().ok().and_then(|mut guard| guard.take())
    }
}

/// The WebSocket transport.
pub struct WsChsk {
    shared: Arc<Shared>,
    /// Current connection token; 0 while disconnected.
    conn_id: AtomicU64,
    conn_seq: AtomicU64,
    current: Mutex<Option<Arc<SocketCtl>>>,
    retry_count: AtomicU32,
    /// Epoch millis of the last send or receive, for keep-alive idleness.
    last_activity: AtomicU64,
}

impl WsChsk {
    pub(crate) fn new(shared: Arc<Shared>) -> Arc<Self> {
        Arc::new(Self {
            shared,
            conn_id: AtomicU64::new(0),
            conn_seq: AtomicU64::new(0),
            current: Mutex::new(None),
            retry_count: AtomicU32::new(0),
            last_activity: AtomicU64::new(0),
        })
    }

    /// Starts the connect loop. Returns immediately; progress is
    /// observable on the state channel.
    pub fn connect(self: &Arc<Self>) {
        let token = self.conn_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.conn_id.store(token, Ordering::SeqCst);
        self.retry_count.store(0, Ordering::SeqCst);
        self.shared.update_state(|s| s.kind = ChskKind::Ws);
        let chsk = Arc::clone(self);
        tokio::spawn(async move { chsk.conn_loop(token).await });
    }

    /// Stops the transport. No reconnect happens until [`WsChsk::connect`]
    /// or [`WsChsk::reconnect`].
    pub fn disconnect(&self) {
        self.disconnect_with_reason(CloseReason::RequestedDisconnect);
    }

    pub(crate) fn disconnect_with_reason(&self, reason: CloseReason) {
        self.conn_id.store(0, Ordering::SeqCst);
        self.shared.update_state(|s| s.udt_next_reconnect = None);
        match self.current_ctl() {
            Some(ctl) => ctl.shut(reason),
            // Mid-backoff: the sleeping loop exits at its next token
            // check; record the reason now.
            None => self.shared.mark_closed(reason),
        }
    }

    /// Cycles the connection.
    pub fn reconnect(self: &Arc<Self>) {
        if self.conn_id.load(Ordering::SeqCst) == 0 {
            self.connect();
            return;
        }
        if let Some(ctl) = self.current_ctl() {
            ctl.shut(CloseReason::RequestedReconnect);
        }
    }

    /// Severs the underlying socket without a clean close, as a network
    /// failure would. Diagnostic aid; the machine recovers via its normal
    /// reconnect path.
    pub fn break_connection(&self) {
        if let Some(ctl) = self.current_ctl() {
            ctl.shut(CloseReason::Unexpected);
        }
    }

    /// Sends an event, optionally registering a reply callback with a
    /// timeout. Returns `false` (after resolving the callback with
    /// `chsk/closed` or `chsk/error`) when nothing was written.
    pub fn send(&self, event: Event, timeout: Option<Duration>, cb: Option<CbFn>) -> bool {
        if !self.shared.state().open {
            if let Some(cb) = cb {
                cb(CbReply::Closed);
            }
            return false;
        }
        let cb_slot = match cb {
            Some(cb) => Cb::Uuid(self.shared.cbs.register(cb, timeout)),
            None => Cb::None,
        };
        self.write_value(&event.to_value(), cb_slot)
    }

    /// Packs and writes one payload. On failure the callback (if any)
    /// resolves with `chsk/error` and the socket cycles with reason
    /// `ws-error`.
    fn write_value(&self, value: &Value, cb_slot: Cb) -> bool {
        let packed = match pack_payload(self.shared.cfg.packer.as_ref(), value, &cb_slot) {
            Ok(packed) => packed,
            Err(e) => {
                warn!(error = %e, "failed to pack outgoing payload");
                if let Cb::Uuid(cb_uuid) = &cb_slot {
                    self.shared.cbs.resolve(cb_uuid, CbReply::Error);
                }
                return false;
            }
        };

        let ctl = self.current_ctl();
        let wrote = ctl
            .as_ref()
            .is_some_and(|ctl| ctl.out_tx.send(packed).is_ok());
        if wrote {
            self.touch();
            return true;
        }

        if let Cb::Uuid(cb_uuid) = &cb_slot {
            self.shared.cbs.resolve(cb_uuid, CbReply::Error);
        }
        if let Some(ctl) = ctl {
            ctl.shut(CloseReason::WsError);
        }
        false
    }

    async fn conn_loop(self: Arc<Self>, token: u64) {
        loop {
            if self.conn_id.load(Ordering::SeqCst) != token || crate::client_unloading() {
                return;
            }

            let Some(reason) = self.run_socket(token).await else {
                return; // superseded mid-connect
            };
            // A newer connect owns the state now; only the current loop
            // (or a plain disconnect, conn-id 0) may mark it closed.
            let current = self.conn_id.load(Ordering::SeqCst);
            if current == token || current == 0 {
                self.shared.mark_closed(reason);
            }
            if current != token || crate::client_unloading() {
                return;
            }

            match reason {
                // Locally initiated cycles redial at once.
                CloseReason::RequestedReconnect
                | CloseReason::WsPingTimeout
                | CloseReason::WsError => {}
                _ => {
                    let attempt = self.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
                    let delay = self.shared.cfg.backoff.delay_for_attempt(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
                    self.shared.update_state(|s| {
                        s.udt_next_reconnect = Some(epoch_ms() + delay.as_millis() as u64);
                    });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Dials and runs one socket to completion. `None` means this loop
    /// was superseded and should exit without touching shared state.
    async fn run_socket(self: &Arc<Self>, token: u64) -> Option<CloseReason> {
        let url = self.shared.cfg.ws_url();
        trace!(url = %url, "dialing");
        let result = tokio_tungstenite::connect_async(url.as_str()).await;

        if self.conn_id.load(Ordering::SeqCst) != token {
            return None;
        }
        let (ws, _resp) = match result {
            Ok(ok) => ok,
            Err(e) => {
                debug!(error = %e, "websocket connect failed");
                self.shared.update_state(|s| {
                    s.last_ws_error = Some(WsErrorInfo {
                        udt: epoch_ms(),
                        error: e.to_string(),
                    });
                });
                return Some(CloseReason::Unexpected);
            }
        };

        let (write, mut read) = ws.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let cancel = CancellationToken::new();
        let ctl = Arc::new(SocketCtl {
            out_tx,
            cancel: cancel.clone(),
            close_reason: Mutex::new(None),
        });
        self.set_current(Some(Arc::clone(&ctl)));
        if self.conn_id.load(Ordering::SeqCst) != token {
            // Disconnected between the dial and the store; dropping the
            // halves closes the socket.
            ctl.shut(CloseReason::RequestedDisconnect);
            self.clear_current_if(&ctl);
            return None;
        }

        tokio::spawn(write_pump(write, out_rx, Arc::clone(&ctl)));
        self.spawn_kalive(token, Arc::clone(&ctl));
        self.touch();

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break ctl.take_reason().unwrap_or(CloseReason::RequestedDisconnect);
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.on_frame(&text),
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => self.touch(),
                        Some(Ok(Message::Close(frame))) => {
                            self.shared.update_state(|s| {
                                s.last_ws_close = Some(WsCloseInfo {
                                    udt: epoch_ms(),
                                    code: frame.as_ref().map(|f| f.code.into()),
                                    clean: true,
                                });
                            });
                            break CloseReason::Clean;
                        }
                        Some(Err(e)) => {
                            debug!(error = %e, "websocket read error");
                            self.shared.update_state(|s| {
                                s.last_ws_error = Some(WsErrorInfo {
                                    udt: epoch_ms(),
                                    error: e.to_string(),
                                });
                                s.last_ws_close = Some(WsCloseInfo {
                                    udt: epoch_ms(),
                                    code: None,
                                    clean: false,
                                });
                            });
                            break CloseReason::Unexpected;
                        }
                        Some(Ok(Message::Binary(_) | Message::Frame(_))) => {}
                        None => {
                            self.shared.update_state(|s| {
                                s.last_ws_close = Some(WsCloseInfo {
                                    udt: epoch_ms(),
                                    code: None,
                                    clean: false,
                                });
                            });
                            break CloseReason::Unexpected;
                        }
                    }
                }
            }
        };

        cancel.cancel();
        self.clear_current_if(&ctl);
        Some(reason)
    }

    /// Dispatches one received frame: reply correlation first, then
    /// handshake, server pings, and finally batches of pushed events.
    fn on_frame(&self, text: &str) {
        self.touch();
        let Unpacked { value, cb } = unpack_payload(self.shared.cfg.packer.as_ref(), text);

        if let Cb::Uuid(cb_uuid) = cb {
            self.shared.cbs.resolve_reply(&cb_uuid, value);
            return;
        }

        if let Ok(ev) = Event::from_value(&value) {
            if let Some((uid, data)) = parse_handshake(&ev) {
                self.retry_count.store(0, Ordering::SeqCst);
                self.shared.receive_handshake(uid, data);
                return;
            }
            if ev.id == ids::WS_PING {
                trace!("server keep-alive ping");
                return;
            }
        }

        match value {
            Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_array) => {
                self.shared.deliver_batch(items);
            }
            other => self.shared.push_internal(Event::bad_event(other)),
        }
    }

    /// Keep-alive: after `ws_kalive` with no activity, sends
    /// `[chsk/ws-ping]` expecting `"pong"` within the ping timeout; a
    /// timeout cycles the socket with reason `ws-ping-timeout`.
    fn spawn_kalive(self: &Arc<Self>, token: u64, ctl: Arc<SocketCtl>) {
        let chsk = Arc::clone(self);
        tokio::spawn(async move {
            let kalive = chsk.shared.cfg.ws_kalive;
            loop {
                tokio::select! {
                    _ = ctl.cancel.cancelled() => return,
                    _ = tokio::time::sleep(kalive) => {}
                }
                if chsk.conn_id.load(Ordering::SeqCst) != token {
                    return;
                }
                let idle_ms = epoch_ms().saturating_sub(chsk.last_activity.load(Ordering::SeqCst));
                if Duration::from_millis(idle_ms) < kalive {
                    continue;
                }

                trace!("idle; sending keep-alive ping");
                let (tx, rx) = tokio::sync::oneshot::channel();
                let cb: CbFn = Box::new(move |reply| {
                    let _ = tx.send(reply);
                });
                let cb_uuid = chsk
                    .shared
                    .cbs
                    .register(cb, Some(chsk.shared.cfg.ws_kalive_ping_timeout));
                let ping = Event::control(ids::WS_PING, None);
                if !chsk.write_value(&ping.to_value(), Cb::Uuid(cb_uuid)) {
                    return;
                }
                match rx.await {
                    Ok(CbReply::Reply(v)) if v == json!("pong") => {}
                    Ok(_) | Err(_) => {
                        debug!("keep-alive pong missed; cycling socket");
                        ctl.shut(CloseReason::WsPingTimeout);
                        return;
                    }
                }
            }
        });
    }

    fn touch(&self) {
        self.last_activity.store(epoch_ms(), Ordering::SeqCst);
    }

    fn current_ctl(&self) -> Option<Arc<SocketCtl>> {
        self.current.lock().ok().and_then(|guard| guard.clone())
    }

    fn set_current(&self, ctl: Option<Arc<SocketCtl>>) {
        if let Ok(mut guard) = self.current.lock() {
            *guard = ctl;
        }
    }

    /// Clears `current` only while it still holds this socket, so a
    /// lagging exit path cannot unseat its successor.
    fn clear_current_if(&self, ctl: &Arc<SocketCtl>) {
        if let Ok(mut guard) = self.current.lock() {
            if guard.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, ctl)) {
                *guard = None;
            }
        }
    }
}

/// Forwards queued payloads to the socket sink; exits on cancellation or
/// the first write failure (which cycles the socket with `ws-error`).
async fn write_pump<S>(mut write: S, mut out_rx: mpsc::UnboundedReceiver<String>, ctl: Arc<SocketCtl>)
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = ctl.cancel.cancelled() => break,
            msg = out_rx.recv() => {
                match msg {
                    Some(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!(error = %e, "websocket write error");
                            ctl.shut(CloseReason::WsError);
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    let _ = write.send(Message::Close(None)).await;
}
