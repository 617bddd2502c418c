use crate::connection::ConnectionState;

/// Errors surfaced to callers of the client API.
///
/// Transport failures are not in here: they are recovered by reconnecting
/// and reported only through the lifecycle hooks.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A call was attempted while the connection is not open.
    #[error("not connected (state: {0:?})")]
    NotConnected(ConnectionState),

    /// The callback record cannot observe any outcome.
    #[error("invalid callback: {0}")]
    InvalidCallback(&'static str),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] sockmux_frame::FrameError),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// A task could not be armed.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// The timer thread could not be started.
    #[error("failed to start timer thread: {0}")]
    Spawn(#[from] std::io::Error),
}
