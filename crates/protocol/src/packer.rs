//! Payload packing: pluggable codec plus the wire envelope.
//!
//! The codec sees only the envelope — an ordered pair `[value]` or
//! `[value, cb-id]` — never the event semantics inside it. The integer
//! `0` in the cb slot is the Ajax-callback sentinel (Ajax correlates
//! replies by request, so no uuid is needed).

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{json, Value};
use tracing::warn;

use crate::event::Event;

/// Errors from a [`Packer`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("pack failed: {0}")]
    Pack(String),

    #[error("unpack failed: {0}")]
    Unpack(String),
}

/// Bidirectional payload codec.
pub trait Packer: Send + Sync {
    fn pack(&self, value: &Value) -> Result<String, PackError>;
    fn unpack(&self, packed: &str) -> Result<Value, PackError>;
}

/// The default codec: compact JSON via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPacker;

impl Packer for JsonPacker {
    fn pack(&self, value: &Value) -> Result<String, PackError> {
        serde_json::to_string(value).map_err(|e| PackError::Pack(e.to_string()))
    }

    fn unpack(&self, packed: &str) -> Result<Value, PackError> {
        serde_json::from_str(packed).map_err(|e| PackError::Unpack(e.to_string()))
    }
}

/// The callback slot of a wire envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cb {
    /// Fire-and-forget: envelope is `[value]`.
    None,
    /// Reply expected, correlated by this id: `[value, "abc123"]`.
    Uuid(String),
    /// Reply expected over the originating Ajax request: `[value, 0]`.
    Ajax,
}

impl Cb {
    pub fn is_some(&self) -> bool {
        !matches!(self, Cb::None)
    }
}

// Interop escape hatch: when set, writes carry the transitional `+`
// prefix understood by older peers. Reads accept all forms regardless.
static LEGACY_WRITES: AtomicBool = AtomicBool::new(false);

/// Force `+`-prefixed legacy writes process-wide.
pub fn set_legacy_pack_writes(enabled: bool) {
    LEGACY_WRITES.store(enabled, Ordering::Relaxed);
}

/// Whether legacy writes are currently forced.
pub fn legacy_pack_writes() -> bool {
    LEGACY_WRITES.load(Ordering::Relaxed)
}

/// Wraps `value` in the envelope and packs it.
pub fn pack_payload(packer: &dyn Packer, value: &Value, cb: &Cb) -> Result<String, PackError> {
    let envelope = match cb {
        Cb::None => json!([value]),
        Cb::Uuid(id) => json!([value, id]),
        Cb::Ajax => json!([value, 0]),
    };
    let packed = packer.pack(&envelope)?;
    if legacy_pack_writes() {
        Ok(format!("+{packed}"))
    } else {
        Ok(packed)
    }
}

/// An unpacked wire payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Unpacked {
    pub value: Value,
    pub cb: Cb,
}

/// Unpacks a wire string, accepting the three read forms: `+` (wrapped),
/// `-` (bare value, no cb slot), and unprefixed (wrapped, the current
/// format). Failures never cross the core boundary: they come back as a
/// `[chsk/bad-package, raw]` value with an empty cb slot.
pub fn unpack_payload(packer: &dyn Packer, ppstr: &str) -> Unpacked {
    let (wrapped, body) = match ppstr.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => match ppstr.strip_prefix('-') {
            Some(rest) => (false, rest),
            None => (true, ppstr),
        },
    };

    let value = match packer.unpack(body) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, len = ppstr.len(), "bad packed payload");
            return bad_package(ppstr);
        }
    };

    if !wrapped {
        return Unpacked { value, cb: Cb::None };
    }

    let Value::Array(mut arr) = value else {
        warn!("packed payload is not an envelope pair");
        return bad_package(ppstr);
    };
    let cb = match arr.len() {
        1 => Cb::None,
        2 => match arr.pop() {
            Some(Value::String(id)) => Cb::Uuid(id),
            Some(Value::Number(n)) if n.as_u64() == Some(0) => Cb::Ajax,
            _ => {
                warn!("unrecognized cb slot in envelope");
                return bad_package(ppstr);
            }
        },
        _ => {
            warn!(len = arr.len(), "envelope is not a size-1 or size-2 pair");
            return bad_package(ppstr);
        }
    };
    match arr.pop() {
        Some(value) => Unpacked { value, cb },
        None => bad_package(ppstr),
    }
}

fn bad_package(raw: &str) -> Unpacked {
    Unpacked {
        value: Event::bad_package(raw).to_value(),
        cb: Cb::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ids;

    #[test]
    fn envelope_round_trip_no_cb() {
        let p = JsonPacker;
        let value = json!(["my/echo", 42]);
        let packed = pack_payload(&p, &value, &Cb::None).unwrap();
        let out = unpack_payload(&p, &packed);
        assert_eq!(out.value, value);
        assert_eq!(out.cb, Cb::None);
    }

    #[test]
    fn envelope_round_trip_uuid_cb() {
        let p = JsonPacker;
        let value = json!(["my/echo", {"n": 1}]);
        let packed = pack_payload(&p, &value, &Cb::Uuid("abc123".into())).unwrap();
        let out = unpack_payload(&p, &packed);
        assert_eq!(out.value, value);
        assert_eq!(out.cb, Cb::Uuid("abc123".into()));
    }

    #[test]
    fn envelope_round_trip_ajax_sentinel() {
        let p = JsonPacker;
        let value = json!(["my/echo"]);
        let packed = pack_payload(&p, &value, &Cb::Ajax).unwrap();
        assert!(packed.contains(",0]"), "ajax sentinel is the integer 0: {packed}");
        let out = unpack_payload(&p, &packed);
        assert_eq!(out.cb, Cb::Ajax);
    }

    #[test]
    fn reads_accept_legacy_prefixes() {
        let p = JsonPacker;

        // '+' prefix: wrapped envelope.
        let out = unpack_payload(&p, "+[[\"my/ev\"],\"cb1234\"]");
        assert_eq!(out.value, json!(["my/ev"]));
        assert_eq!(out.cb, Cb::Uuid("cb1234".into()));

        // '-' prefix: bare payload, no cb slot.
        let out = unpack_payload(&p, "-[\"my/ev\",7]");
        assert_eq!(out.value, json!(["my/ev", 7]));
        assert_eq!(out.cb, Cb::None);
    }

    #[test]
    fn legacy_write_flag_prefixes_output() {
        let p = JsonPacker;
        let value = json!(["my/ev"]);
        set_legacy_pack_writes(true);
        let packed = pack_payload(&p, &value, &Cb::None).unwrap();
        set_legacy_pack_writes(false);
        assert!(packed.starts_with('+'));

        // And the prefixed form reads back identically.
        let out = unpack_payload(&p, &packed);
        assert_eq!(out.value, value);
    }

    #[test]
    fn garbage_becomes_bad_package() {
        let p = JsonPacker;
        let out = unpack_payload(&p, "not json at all {{{");
        let arr = out.value.as_array().unwrap();
        assert_eq!(arr[0], ids::BAD_PACKAGE);
        assert_eq!(arr[1], json!("not json at all {{{"));
        assert_eq!(out.cb, Cb::None);
    }

    #[test]
    fn non_envelope_shapes_become_bad_package() {
        let p = JsonPacker;
        for raw in ["{\"a\":1}", "[]", "[1,2,3]", "[\"v\",{\"cb\":true}]"] {
            let out = unpack_payload(&p, raw);
            assert_eq!(
                out.value.as_array().unwrap()[0],
                ids::BAD_PACKAGE,
                "raw: {raw}"
            );
        }
    }
}
