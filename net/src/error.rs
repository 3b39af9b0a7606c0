use std::fmt;

/// Error kinds shared by every transport-level operation (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("operation timed out")]
    Timeout,
    #[error("channel is closed")]
    Closed,
    #[error("channel was cancelled")]
    Cancelled,
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The wire-level decode error, kept distinct from `ChannelError` so the
/// codec stays transport-agnostic.
#[derive(Debug)]
pub struct MalformedMessage(pub String);

impl fmt::Display for MalformedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed message: {}", self.0)
    }
}

impl std::error::Error for MalformedMessage {}

impl From<MalformedMessage> for ChannelError {
    fn from(e: MalformedMessage) -> Self {
        ChannelError::Malformed(e.0)
    }
}
