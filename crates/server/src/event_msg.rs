//! Event messages delivered to server application code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

use chansock_protocol::packer::{pack_payload, Cb, Packer};

use crate::adapter::ServerChannel;

/// One incoming event as seen by the application handler.
#[derive(Clone)]
pub struct ServerEventMsg {
    /// The sending client's connection id.
    pub client_id: String,
    /// The sending user (possibly the nil-uid sentinel).
    pub uid: String,
    /// The event itself (possibly a `chsk/bad-event` replacement).
    pub event: chansock_protocol::Event,
    /// Present iff the client expects a reply.
    pub reply: Option<ReplyFn>,
}

impl std::fmt::Debug for ServerEventMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEventMsg")
            .field("client_id", &self.client_id)
            .field("uid", &self.uid)
            .field("event", &self.event)
            .field("reply", &self.reply.is_some())
            .finish()
    }
}

enum ReplySink {
    /// Reply goes back over the originating WebSocket, correlated by the
    /// client's cb id.
    Ws {
        sch: Arc<dyn ServerChannel>,
        cb_uuid: String,
    },
    /// Reply becomes the body of the originating Ajax POST.
    Ajax {
        slot: Mutex<Option<oneshot::Sender<Value>>>,
    },
}

/// Single-shot reply capability handed to the application alongside an
/// event that carried a callback id.
#[derive(Clone)]
pub struct ReplyFn {
    inner: Arc<ReplyInner>,
}

struct ReplyInner {
    used: AtomicBool,
    sink: ReplySink,
    packer: Arc<dyn Packer>,
}

impl ReplyFn {
    pub(crate) fn ws(sch: Arc<dyn ServerChannel>, cb_uuid: String, packer: Arc<dyn Packer>) -> Self {
        Self {
            inner: Arc::new(ReplyInner {
                used: AtomicBool::new(false),
                sink: ReplySink::Ws { sch, cb_uuid },
                packer,
            }),
        }
    }

    pub(crate) fn ajax(slot: oneshot::Sender<Value>, packer: Arc<dyn Packer>) -> Self {
        Self {
            inner: Arc::new(ReplyInner {
                used: AtomicBool::new(false),
                sink: ReplySink::Ajax {
                    slot: Mutex::new(Some(slot)),
                },
                packer,
            }),
        }
    }

    /// Sends the reply. Returns `false` when the reply was already
    /// consumed (a second call, or a timeout beat it) or the connection
    /// is gone. At most one call ever reaches the wire.
    pub fn reply(&self, value: Value) -> bool {
        if self.inner.used.swap(true, Ordering::AcqRel) {
            warn!("reply-fn invoked more than once; ignoring");
            return false;
        }
        match &self.inner.sink {
            ReplySink::Ws { sch, cb_uuid } => {
                let cb = Cb::Uuid(cb_uuid.clone());
                match pack_payload(self.inner.packer.as_ref(), &value, &cb) {
                    Ok(packed) => sch.send(&packed),
                    Err(e) => {
                        warn!(error = %e, "failed to pack reply");
                        false
                    }
                }
            }
            ReplySink::Ajax { slot } => {
                let tx = match slot.lock() {
                    Ok(mut guard) => guard.take(),
                    Err(_) => None,
                };
                match tx {
                    Some(tx) => tx.send(value).is_ok(),
                    None => false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::WsServerChannel;
    use chansock_protocol::packer::{unpack_payload, JsonPacker};
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn ws_reply_packs_cb_envelope() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sch: Arc<dyn ServerChannel> =
            Arc::new(WsServerChannel::new(tx, CancellationToken::new()));
        let reply = ReplyFn::ws(sch, "cb0042".into(), Arc::new(JsonPacker));

        assert!(reply.reply(json!(42)));
        let packed = rx.recv().await.unwrap();
        let out = unpack_payload(&JsonPacker, &packed);
        assert_eq!(out.value, json!(42));
        assert_eq!(out.cb, Cb::Uuid("cb0042".into()));
    }

    #[tokio::test]
    async fn reply_is_single_shot() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sch: Arc<dyn ServerChannel> =
            Arc::new(WsServerChannel::new(tx, CancellationToken::new()));
        let reply = ReplyFn::ws(sch, "cb0001".into(), Arc::new(JsonPacker));

        assert!(reply.reply(json!("first")));
        assert!(!reply.reply(json!("second")));
        // A clone shares the guard.
        assert!(!reply.clone().reply(json!("third")));

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ajax_reply_resolves_response_slot() {
        let (tx, rx) = oneshot::channel();
        let reply = ReplyFn::ajax(tx, Arc::new(JsonPacker));

        assert!(reply.reply(json!({"ok": true})));
        assert_eq!(rx.await.unwrap(), json!({"ok": true}));
    }
}
