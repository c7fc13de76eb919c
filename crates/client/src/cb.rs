//! Pending-callback registry: correlates replies with their sends and
//! guarantees each callback resolves exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use chansock_protocol::constants::CB_UUID_LEN;

/// What a send's callback resolves with.
#[derive(Debug, Clone, PartialEq)]
pub enum CbReply {
    /// The server's reply value.
    Reply(Value),
    /// Send attempted while the connection was closed (`chsk/closed`).
    Closed,
    /// No reply within the requested timeout (`chsk/timeout`).
    Timeout,
    /// The underlying write failed (`chsk/error`).
    Error,
}

/// A send callback. Invoked at most once.
pub type CbFn = Box<dyn FnOnce(CbReply) + Send>;

/// Generates a short opaque callback id.
pub fn new_cb_uuid() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(CB_UUID_LEN);
    id
}

/// Callbacks awaiting a reply, keyed by cb id. Removal-before-invoke
/// makes resolution single-shot: reply, timeout, and error paths race
/// for the same map entry and only one wins.
#[derive(Default)]
pub(crate) struct CbRegistry {
    waiting: Mutex<HashMap<String, CbFn>>,
}

impl CbRegistry {
    /// Registers `cb` under a fresh id. With a timeout, a resolver task
    /// fires [`CbReply::Timeout`] if the id is still waiting at the
    /// deadline.
    pub(crate) fn register(self: &Arc<Self>, cb: CbFn, timeout: Option<Duration>) -> String {
        let cb_uuid = new_cb_uuid();
        if let Ok(mut waiting) = self.waiting.lock() {
            waiting.insert(cb_uuid.clone(), cb);
        }
        if let Some(timeout) = timeout {
            let registry = Arc::clone(self);
            let cb_uuid = cb_uuid.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                registry.resolve(&cb_uuid, CbReply::Timeout);
            });
        }
        cb_uuid
    }

    /// Resolves a waiting callback. Returns `false` when the id is
    /// unknown (already resolved, or never ours).
    pub(crate) fn resolve(&self, cb_uuid: &str, reply: CbReply) -> bool {
        let cb = match self.waiting.lock() {
            Ok(mut waiting) => waiting.remove(cb_uuid),
            Err(_) => None,
        };
        match cb {
            Some(cb) => {
                cb(reply);
                true
            }
            None => false,
        }
    }

    /// Resolves a reply from the wire; logs when nothing was waiting.
    pub(crate) fn resolve_reply(&self, cb_uuid: &str, value: Value) {
        if !self.resolve(cb_uuid, CbReply::Reply(value)) {
            warn!(cb_uuid, "reply for unknown callback id");
        }
    }
}
