use thiserror::Error;

use crate::remote::RemoteError;

/// Session-level failures. Per-file problems never end up here; they are
/// reported as `TransferResult`s instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("session {0} is already running")]
    AlreadyRunning(String),

    #[error("session {0} has an unacknowledged result")]
    NotIdle(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("session {0} is not logged in to the remote store")]
    NotAuthenticated(String),

    #[error("remote store: {0}")]
    Remote(#[from] RemoteError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
