//! Error taxonomy shared by the daemon and the upload client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReelError {
    /// Header bytes absent or shorter than the fixed width.
    #[error("malformed header: got {got} bytes, need {need}")]
    MalformedHeader { got: usize, need: usize },

    /// Stream closed before the declared section was complete.
    #[error("short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: u64, received: u64 },

    /// Peer stopped accepting bytes before the buffer was flushed.
    #[error("short write: expected {expected} bytes, wrote {written}")]
    ShortWrite { expected: u64, written: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Filename is missing in the request")]
    MissingFilename,

    #[error("unsafe filename: {0:?}")]
    UnsafeFilename(String),

    #[error("Invalid operation number: {0}")]
    UnknownOperation(i64),

    #[error("metadata too large: {size} bytes (max: {max})")]
    MetadataTooLarge { size: usize, max: usize },

    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: u64, max: u64 },

    /// Server could not create the staging file for an upload.
    #[error("failed to stage upload: {0}")]
    Staging(String),

    #[error("transform failed: {0}")]
    TransformFailed(String),

    #[error("{0} timed out after {1} s")]
    Timeout(&'static str, u64),

    /// The server answered with `status = error`.
    #[error("server reported an error: {0}")]
    Remote(String),
}

impl From<serde_json::Error> for ReelError {
    fn from(e: serde_json::Error) -> Self {
        ReelError::InvalidEnvelope(e.to_string())
    }
}

impl ReelError {
    /// Framing failures leave the stream in an unknown position; nothing more
    /// can be exchanged on that connection.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            ReelError::MalformedHeader { .. }
                | ReelError::ShortRead { .. }
                | ReelError::ShortWrite { .. }
                | ReelError::Io(_)
                | ReelError::Timeout(..)
        )
    }
}

pub type Result<T> = std::result::Result<T, ReelError>;
