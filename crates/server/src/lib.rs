//! Server side of chansock.
//!
//! Tracks every live WebSocket and long-polling connection per user,
//! routes server→user pushes to all of a user's connections with
//! time-batched coalescing, and survives brief transport disconnections
//! via per-connection grace windows. HTTP entry points are provided as
//! axum handlers; the registry and fan-out engine only ever see the
//! [`adapter::ServerChannel`] trait.

pub mod adapter;
pub mod config;
pub mod engine;
pub mod event_msg;
pub mod http;
pub mod registry;
pub mod router;

mod error;

pub use config::{AllowedOrigins, ConnRequest, ServerConfig};
pub use engine::ChskServer;
pub use error::ServerError;
pub use event_msg::{ReplyFn, ServerEventMsg};
pub use registry::Transport;
pub use router::{start_router, RouterHandle, RouterOptions};
