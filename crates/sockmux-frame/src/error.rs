/// Errors that can occur during packet encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The buffer does not match the lengths declared in the preamble.
    #[error("malformed frame (declared {declared} bytes, got {actual})")]
    MalformedFrame { declared: u64, actual: usize },

    /// The declared frame size exceeds the configured maximum.
    #[error("frame too large ({size} bytes, max {max})")]
    OversizedFrame { size: u64, max: usize },

    /// The transport delivered something other than a binary message.
    #[error("unsupported frame format (expected binary message)")]
    UnsupportedFrameFormat,

    /// The header block is not valid UTF-8.
    #[error("frame header is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// The byte stream under a `PacketCodec` failed.
    #[cfg(feature = "async")]
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;
