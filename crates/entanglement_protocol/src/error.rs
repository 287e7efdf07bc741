//! Error types for the wire protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while framing or parsing wire messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Declared frame length exceeds the frame cap.
    #[error("frame of {length} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Declared length.
        length: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// A critical flag bit that this implementation does not understand.
    #[error("unknown critical flags {flags:#x}")]
    UnknownCriticalFlags {
        /// The offending flag bits.
        flags: u32,
    },

    /// Payload is not valid UTF-8 JSON.
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),

    /// Payload parsed but is not a JSON object.
    #[error("payload is a {0}, not an object")]
    NotAnObject(&'static str),

    /// An underscore key that is not a recognized meta key.
    #[error("{0} is not a valid attribute in a sync message")]
    UnknownMetaKey(String),

    /// A meta key is present but has the wrong shape.
    #[error("bad value for {key}: {reason}")]
    BadMeta {
        /// The meta key.
        key: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// A destination hash string or byte slice could not be parsed.
    #[error("invalid destination hash: {0}")]
    InvalidDestHash(String),
}

impl ProtocolError {
    /// Returns true if this error means the byte stream can no longer be trusted.
    ///
    /// Framing errors close the connection; payload errors only reject one message.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::FrameTooLarge { .. } | ProtocolError::UnknownCriticalFlags { .. }
        )
    }

    pub(crate) fn bad_meta(key: &'static str, reason: impl Into<String>) -> Self {
        ProtocolError::BadMeta {
            key,
            reason: reason.into(),
        }
    }
}
