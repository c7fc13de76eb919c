//! Client side of chansock.
//!
//! Three transports behind one capability set: a WebSocket state machine
//! with automatic reconnect and keep-alive, an Ajax long-polling
//! fallback, and an auto wrapper that starts on WebSocket and permanently
//! downgrades to Ajax when the socket never manages to open.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

pub mod ajax;
pub mod auto;
pub mod cb;
pub mod config;
pub mod router;
pub mod state;
pub mod ws;

mod error;

pub use ajax::AjaxChsk;
pub use auto::AutoChsk;
pub use cb::{CbFn, CbReply};
pub use config::{BackoffConfig, ChskKind, ClientConfig, Protocol};
pub use error::ClientError;
pub use router::{start_router, RouterHandle, RouterOptions};
pub use state::{ClientEventMsg, ClientState, CloseReason, LastClose, WsCloseInfo, WsErrorInfo};
pub use ws::WsChsk;

use chansock_protocol::Event;
use state::Shared;

// Suppresses reconnect attempts during process/page teardown.
static CLIENT_UNLOADING: AtomicBool = AtomicBool::new(false);

/// Marks the process as unloading: in-flight reconnect loops exit instead
/// of dialing again.
pub fn set_client_unloading(unloading: bool) {
    CLIENT_UNLOADING.store(unloading, Ordering::Relaxed);
}

pub(crate) fn client_unloading() -> bool {
    CLIENT_UNLOADING.load(Ordering::Relaxed)
}

/// A channel socket: one of the three transport variants.
#[derive(Clone)]
pub enum Chsk {
    Ws(Arc<WsChsk>),
    Ajax(Arc<AjaxChsk>),
    Auto(Arc<AutoChsk>),
}

impl Chsk {
    /// Builds the transport selected by `cfg.kind` and returns it with
    /// the receive channel and the observable state.
    pub fn new(
        cfg: ClientConfig,
    ) -> (Self, mpsc::Receiver<ClientEventMsg>, watch::Receiver<ClientState>) {
        let kind = cfg.kind;
        let (shared, recv_rx, state_rx) = Shared::new(cfg);
        let chsk = match kind {
            ChskKind::Ws => Chsk::Ws(WsChsk::new(shared)),
            ChskKind::Ajax => Chsk::Ajax(AjaxChsk::new(shared)),
            ChskKind::Auto => Chsk::Auto(AutoChsk::new(shared)),
        };
        (chsk, recv_rx, state_rx)
    }

    /// Starts connecting. Non-blocking; progress is observable on the
    /// state channel.
    pub fn connect(&self) {
        match self {
            Chsk::Ws(c) => c.connect(),
            Chsk::Ajax(c) => c.connect(),
            Chsk::Auto(c) => c.connect(),
        }
    }

    /// Stops the transport; no further reconnect attempts are made until
    /// [`Chsk::connect`] or [`Chsk::reconnect`].
    pub fn disconnect(&self) {
        match self {
            Chsk::Ws(c) => c.disconnect(),
            Chsk::Ajax(c) => c.disconnect(),
            Chsk::Auto(c) => c.disconnect(),
        }
    }

    /// Cycles the connection.
    pub fn reconnect(&self) {
        match self {
            Chsk::Ws(c) => c.reconnect(),
            Chsk::Ajax(c) => c.reconnect(),
            Chsk::Auto(c) => c.reconnect(),
        }
    }

    /// Severs the underlying connection as a network failure would
    /// (diagnostic aid); recovery runs through the normal reconnect path.
    pub fn break_connection(&self) {
        match self {
            Chsk::Ws(c) => c.break_connection(),
            Chsk::Ajax(c) => c.break_connection(),
            Chsk::Auto(c) => c.break_connection(),
        }
    }

    /// Sends an event. With a callback, exactly one of a reply,
    /// `chsk/timeout`, `chsk/error`, or `chsk/closed` reaches it. Returns
    /// apparent success.
    pub fn send(&self, event: Event, timeout: Option<Duration>, cb: Option<CbFn>) -> bool {
        match self {
            Chsk::Ws(c) => c.send(event, timeout, cb),
            Chsk::Ajax(c) => c.send(event, timeout, cb),
            Chsk::Auto(c) => c.send(event, timeout, cb),
        }
    }
}
