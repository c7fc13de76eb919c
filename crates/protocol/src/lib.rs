//! Shared wire protocol for chansock.
//!
//! Defines the event model (`[event-id, optional-data]` pairs with
//! namespaced ids), the pluggable payload packer with its one-or-two
//! element wire envelope, and the protocol timing constants used by both
//! the server and client crates.

pub mod constants;
pub mod event;
pub mod packer;

// Re-export primary types for convenience.
pub use event::{Event, EventError};
pub use packer::{Cb, JsonPacker, PackError, Packer, Unpacked};
