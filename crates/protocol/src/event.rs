//! The event model: ordered `[event-id, optional-data]` pairs.
//!
//! Event ids are namespaced (`"my-app/request"`). The `chsk/` namespace is
//! reserved for transport control events and `sente/` for internal
//! sentinels; user code cannot fabricate either.

use serde_json::{json, Value};

/// Reserved control event ids.
pub mod ids {
    /// First server→client event on a connection, carrying `[uid, nil,
    /// handshake-data]`.
    pub const HANDSHAKE: &str = "chsk/handshake";
    /// Liveness probe, sent by either side.
    pub const WS_PING: &str = "chsk/ws-ping";
    /// Client state transition `[old, new]`, emitted on the client's
    /// receive channel.
    pub const STATE: &str = "chsk/state";
    /// Wrapper id for server pushes delivered to client application code.
    pub const RECV: &str = "chsk/recv";
    /// Administrative close-all for a uid's connections (internal).
    pub const CLOSE: &str = "chsk/close";
    /// Long-poll "nothing to send" sentinel and callback timeout value.
    pub const TIMEOUT: &str = "chsk/timeout";
    /// Replacement event for payloads that failed to unpack.
    pub const BAD_PACKAGE: &str = "chsk/bad-package";
    /// Replacement event for values that are not valid events.
    pub const BAD_EVENT: &str = "chsk/bad-event";
    /// A uid gained its first live connection.
    pub const UIDPORT_OPEN: &str = "chsk/uidport-open";
    /// A uid lost its last connection (grace window included).
    pub const UIDPORT_CLOSE: &str = "chsk/uidport-close";
}

/// Reply values a callback may resolve with instead of a real reply.
pub mod cb_ids {
    /// Send attempted while the connection was closed.
    pub const CLOSED: &str = "chsk/closed";
    /// No reply arrived within the callback's timeout.
    pub const TIMEOUT: &str = "chsk/timeout";
    /// The underlying write failed.
    pub const ERROR: &str = "chsk/error";
    /// Completion sentinel for Ajax sends that expected no reply.
    pub const DUMMY_CB_200: &str = "chsk/dummy-cb-200";
}

/// Uid representing an authenticated-but-unidentified user.
pub const NIL_UID: &str = "sente/nil-uid";

/// Send-side alias for [`NIL_UID`]; rewritten before it reaches the
/// registry.
pub const ALL_USERS_WITHOUT_UID: &str = "sente/all-users-without-uid";

/// Errors from event construction and validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("event id {0:?} is not a namespaced identifier")]
    InvalidId(String),

    #[error("event id {0:?} uses a reserved namespace")]
    ReservedId(String),

    #[error("value is not an event-shaped pair")]
    InvalidShape,
}

/// An ordered `[event-id, optional-data]` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub data: Option<Value>,
}

impl Event {
    /// Creates a user event, rejecting malformed and reserved ids.
    pub fn new(id: impl Into<String>, data: Option<Value>) -> Result<Self, EventError> {
        let id = id.into();
        if !id_valid(&id) {
            return Err(EventError::InvalidId(id));
        }
        if id_reserved(&id) {
            return Err(EventError::ReservedId(id));
        }
        Ok(Self { id, data })
    }

    /// Creates a control event. Callers are the transport internals; the
    /// id is not checked against the reserved namespaces.
    pub fn control(id: impl Into<String>, data: Option<Value>) -> Self {
        Self { id: id.into(), data }
    }

    /// The `[chsk/bad-event, original]` replacement for a value that
    /// failed shape validation on the receive path.
    pub fn bad_event(original: Value) -> Self {
        Self::control(ids::BAD_EVENT, Some(original))
    }

    /// The `[chsk/bad-package, raw]` replacement for a payload that
    /// failed to unpack.
    pub fn bad_package(raw: impl Into<String>) -> Self {
        Self::control(ids::BAD_PACKAGE, Some(Value::String(raw.into())))
    }

    /// Wire form: `[id]` or `[id, data]`.
    pub fn to_value(&self) -> Value {
        match &self.data {
            Some(d) => json!([self.id, d]),
            None => json!([self.id]),
        }
    }

    /// Parses an event from its wire form, validating the shape and that
    /// the id is namespaced. Reserved ids are accepted here; receive-path
    /// policy for them lives with the caller.
    pub fn from_value(v: &Value) -> Result<Self, EventError> {
        let arr = v.as_array().ok_or(EventError::InvalidShape)?;
        if arr.is_empty() || arr.len() > 2 {
            return Err(EventError::InvalidShape);
        }
        let id = arr[0].as_str().ok_or(EventError::InvalidShape)?;
        if !id_valid(id) {
            return Err(EventError::InvalidId(id.to_owned()));
        }
        Ok(Self {
            id: id.to_owned(),
            data: arr.get(1).cloned(),
        })
    }

    /// Receive-path parse: anything that is not event-shaped becomes
    /// `[chsk/bad-event, original]`.
    pub fn from_value_or_bad(v: Value) -> Self {
        match Self::from_value(&v) {
            Ok(ev) => ev,
            Err(_) => Self::bad_event(v),
        }
    }

    /// True for `chsk/*` and `sente/*` ids.
    pub fn is_reserved(&self) -> bool {
        id_reserved(&self.id)
    }
}

/// An id is valid iff it has non-empty namespace and name segments
/// separated by `/`.
pub fn id_valid(id: &str) -> bool {
    match id.split_once('/') {
        Some((ns, name)) => !ns.is_empty() && !name.is_empty(),
        None => false,
    }
}

/// True for ids in the reserved `chsk/` and `sente/` namespaces.
pub fn id_reserved(id: &str) -> bool {
    id.starts_with("chsk/") || id.starts_with("sente/")
}

/// Builds the `[chsk/handshake, [uid, nil, handshake-data]]` event.
pub fn handshake_event(uid: &str, handshake_data: Option<&Value>) -> Event {
    let data = json!([uid, Value::Null, handshake_data.cloned().unwrap_or(Value::Null)]);
    Event::control(ids::HANDSHAKE, Some(data))
}

/// Extracts `(uid, handshake-data)` from a handshake event, or `None`
/// when the event is not a well-formed handshake.
pub fn parse_handshake(ev: &Event) -> Option<(String, Option<Value>)> {
    if ev.id != ids::HANDSHAKE {
        return None;
    }
    let arr = ev.data.as_ref()?.as_array()?;
    let uid = arr.first()?.as_str()?.to_owned();
    let data = match arr.get(2) {
        Some(Value::Null) | None => None,
        Some(d) => Some(d.clone()),
    };
    Some((uid, data))
}
