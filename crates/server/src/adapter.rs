//! The server-channel abstraction over the underlying web server.
//!
//! The registry and fan-out engine route packed payloads through
//! [`ServerChannel`] handles and never touch transport types directly.
//! Two implementations bind the axum transport: one per WebSocket
//! connection, one per open long-poll request.

use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// One underlying connection as seen by the registry.
pub trait ServerChannel: Send + Sync {
    /// Writes a packed payload. Returns apparent success: `false` (never
    /// a panic) once the channel is closed. For long-polling channels a
    /// successful send also closes the channel, since the HTTP response
    /// body is now committed.
    fn send(&self, packed: &str) -> bool;

    /// Closes the channel. Idempotent.
    fn close(&self);
}

/// Channel handle for one WebSocket connection: text frames go to the
/// socket's write pump over an unbounded queue.
pub struct WsServerChannel {
    out_tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl WsServerChannel {
    pub fn new(out_tx: mpsc::UnboundedSender<String>, cancel: CancellationToken) -> Self {
        Self { out_tx, cancel }
    }
}

impl ServerChannel for WsServerChannel {
    fn send(&self, packed: &str) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.out_tx.send(packed.to_owned()).is_ok()
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Channel handle for one open long-poll request: the first send wins the
/// single response slot and implicitly closes the channel.
pub struct AjaxServerChannel {
    slot: Mutex<Option<oneshot::Sender<String>>>,
}

impl AjaxServerChannel {
    /// Returns the channel and the receiver the HTTP handler awaits for
    /// the response body.
    pub fn new() -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

impl ServerChannel for AjaxServerChannel {
    fn send(&self, packed: &str) -> bool {
        let tx = match self.slot.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        match tx {
            Some(tx) => tx.send(packed.to_owned()).is_ok(),
            None => false,
        }
    }

    fn close(&self) {
        if let Ok(mut guard) = self.slot.lock() {
            // Dropping the sender wakes the handler with a closed error;
            // it completes the response with an empty body.
            guard.take();
        }
    }
}
