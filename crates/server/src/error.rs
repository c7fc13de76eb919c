use chansock_protocol::{EventError, PackError};

/// Errors from the server send surface.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("cannot send to an empty uid")]
    NilUid,

    #[error(transparent)]
    InvalidEvent(#[from] EventError),

    #[error(transparent)]
    Pack(#[from] PackError),
}
