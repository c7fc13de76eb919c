//! Observable client state and the internals shared by all transports.
//!
//! State transitions are published twice: on a `watch` channel for
//! programmatic observers (the auto wrapper is one), and as
//! `[chsk/state, [old, new, open-changed]]` events on the receive channel
//! for application code.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::warn;

use chansock_protocol::constants::epoch_ms;
use chansock_protocol::event::{ids, id_reserved};
use chansock_protocol::Event;

use crate::cb::CbRegistry;
use crate::config::{ChskKind, ClientConfig};

/// Why the connection last closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloseReason {
    Clean,
    Unexpected,
    RequestedDisconnect,
    RequestedReconnect,
    DowngradingWsToAjax,
    WsPingTimeout,
    WsError,
}

/// Details of the most recent WebSocket error.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct WsErrorInfo {
    pub udt: u64,
    pub error: String,
}

/// Details of the most recent WebSocket close frame.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct WsCloseInfo {
    pub udt: u64,
    pub code: Option<u16>,
    pub clean: bool,
}

/// `(when, why)` of the most recent close.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LastClose {
    pub udt: u64,
    pub reason: CloseReason,
}

/// The published, observable client state.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ClientState {
    #[serde(rename = "type")]
    pub kind: ChskKind,
    pub open: bool,
    pub ever_opened: bool,
    pub uid: Option<String>,
    pub handshake_data: Option<Value>,
    #[serde(skip)]
    pub csrf_token: Option<String>,
    pub last_ws_error: Option<WsErrorInfo>,
    pub last_ws_close: Option<WsCloseInfo>,
    pub last_close: Option<LastClose>,
    pub udt_next_reconnect: Option<u64>,
}

impl ClientState {
    fn initial(cfg: &ClientConfig) -> Self {
        Self {
            kind: cfg.kind,
            open: false,
            ever_opened: false,
            uid: None,
            handshake_data: None,
            csrf_token: cfg.csrf_token.clone(),
            last_ws_error: None,
            last_ws_close: None,
            last_close: None,
            udt_next_reconnect: None,
        }
    }
}

/// One message on the client's receive channel.
#[derive(Debug, Clone)]
pub struct ClientEventMsg {
    pub event: Event,
}

/// State, channels, and callbacks shared by every transport of one
/// client. The auto wrapper hands the same `Shared` to its Ajax delegate
/// so the downgrade is invisible to application code.
pub(crate) struct Shared {
    pub(crate) cfg: ClientConfig,
    state: Mutex<ClientState>,
    state_tx: watch::Sender<ClientState>,
    recv_tx: mpsc::Sender<ClientEventMsg>,
    pub(crate) cbs: Arc<CbRegistry>,
}

impl Shared {
    pub(crate) fn new(
        cfg: ClientConfig,
    ) -> (Arc<Self>, mpsc::Receiver<ClientEventMsg>, watch::Receiver<ClientState>) {
        let initial = ClientState::initial(&cfg);
        let (state_tx, state_rx) = watch::channel(initial.clone());
        let (recv_tx, recv_rx) = mpsc::channel(cfg.recv_buf);
        let shared = Arc::new(Self {
            cfg,
            state: Mutex::new(initial),
            state_tx,
            recv_tx,
            cbs: Arc::new(CbRegistry::default()),
        });
        (shared, recv_rx, state_rx)
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn state(&self) -> ClientState {
        match self.state.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Applies a mutation; when it actually changes the state, publishes
    /// the watch value and emits the `[chsk/state, [old, new, changed?]]`
    /// event (`changed?` = the `open` flag flipped).
    pub(crate) fn update_state(&self, f: impl FnOnce(&mut ClientState)) {
        let (old, new) = {
            let mut guard = match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let old = guard.clone();
            f(&mut guard);
            (old, guard.clone())
        };
        if old == new {
            return;
        }
        let _ = self.state_tx.send(new.clone());
        let open_changed = old.open != new.open;
        let data = json!([old, new, open_changed]);
        self.push_internal(Event::control(ids::STATE, Some(data)));
    }

    /// Merges a received handshake into the state and emits
    /// `[chsk/handshake, [uid, nil, data, first?]]`. Returns whether this
    /// was the connection's first-ever handshake.
    pub(crate) fn receive_handshake(&self, uid: String, data: Option<Value>) -> bool {
        let mut first = false;
        self.update_state(|s| {
            first = !s.ever_opened;
            s.uid = Some(uid.clone());
            s.handshake_data = data.clone();
            s.open = true;
            s.ever_opened = true;
            s.udt_next_reconnect = None;
        });
        let payload = json!([uid, Value::Null, data, first]);
        self.push_internal(Event::control(ids::HANDSHAKE, Some(payload)));
        first
    }

    pub(crate) fn mark_closed(&self, reason: CloseReason) {
        self.update_state(|s| {
            s.open = false;
            s.last_close = Some(LastClose {
                udt: epoch_ms(),
                reason,
            });
        });
    }

    /// Delivers one server-pushed event, wrapping as `[chsk/recv, ev]`
    /// when configured.
    pub(crate) fn deliver_push(&self, ev: Event) {
        let ev = if self.cfg.wrap_recv_evs {
            Event::control(ids::RECV, Some(ev.to_value()))
        } else {
            ev
        };
        self.push_internal(ev);
    }

    /// Delivers a received batch: each element is validated, and anything
    /// malformed or claiming a reserved id is replaced with
    /// `[chsk/bad-event, original]`.
    pub(crate) fn deliver_batch(&self, items: Vec<Value>) {
        for item in items {
            match Event::from_value(&item) {
                Ok(ev) if !id_reserved(&ev.id) => self.deliver_push(ev),
                _ => self.push_internal(Event::bad_event(item)),
            }
        }
    }

    /// Puts a transport/control event straight on the receive channel.
    pub(crate) fn push_internal(&self, event: Event) {
        if let Err(e) = self.recv_tx.try_send(ClientEventMsg { event }) {
            warn!(error = %e, "client receive channel unavailable; dropping event");
        }
    }
}
