//! Error types for the sync engine.
//!
//! Most variants are also wire types: a receiver that rejects a message
//! sends the error back to the sender as an `error` operation, and the
//! sender's response futures reject with the decoded error.

use entanglement_protocol::ProtocolError;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Attribute names carried by error objects on the wire.
pub const ERROR_ATTRIBUTES: [&str; 4] = ["message", "transition_id", "object_type", "primary_key"];

/// Errors that can occur during synchronization.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Malformed JSON, unknown attribute, missing primary keys or a bad flag.
    #[error("bad encoding: {0}")]
    BadEncoding(String),

    /// An authorization hook denied receipt or construction.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Owner mismatch.
    #[error("bad owner: {0}")]
    BadOwner(String),

    /// Operation not supported by the registry or class.
    #[error("bad operation: {0}")]
    BadOperation(String),

    /// Object missing, typically a delete of an already deleted object.
    #[error("not found: {0}")]
    NotFound(String),

    /// A requested destination has no connection.
    #[error("not connected to {dest}")]
    NotConnected {
        /// Display name of the destination.
        dest: String,
    },

    /// Transport peer identity does not match the destination.
    #[error("wrong destination: {0}")]
    WrongDestination(String),

    /// A transient transition was terminated by a conflicting operation.
    #[error("broken transition {transition_id} of {sync_type} with keys {primary_key}")]
    BrokenTransition {
        /// The transition that broke.
        transition_id: Uuid,
        /// Type of the object in transition.
        sync_type: String,
        /// Canonical primary key of the object.
        primary_key: String,
    },

    /// A message named a type no registry knows.
    #[error("{0} is not a registered sync class")]
    UnregisteredClass(String),

    /// An error type received from a peer that this build does not know.
    #[error("remote {sync_type}: {message}")]
    Remote {
        /// Wire type name.
        sync_type: String,
        /// Message text.
        message: String,
    },

    /// Framing failure; the byte stream is no longer usable.
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The connection or manager was closed.
    #[error("connection closed")]
    Closed,
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        if err.is_framing() {
            SyncError::Protocol(err)
        } else {
            SyncError::BadEncoding(err.to_string())
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::transport_retryable(err.to_string())
    }
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if a connection attempt failing with this error should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Closed => true,
            SyncError::WrongDestination(_) => false,
            _ => false,
        }
    }

    /// Returns true if the error makes the connection unusable.
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            SyncError::Protocol(_) | SyncError::Transport { .. } | SyncError::Closed
        )
    }

    /// The wire type name, for errors that travel back to the sender.
    pub fn wire_type(&self) -> Option<&'static str> {
        match self {
            SyncError::BadEncoding(_) => Some("BadEncoding"),
            SyncError::Unauthorized(_) => Some("Unauthorized"),
            SyncError::BadOwner(_) => Some("BadOwner"),
            SyncError::BadOperation(_) => Some("BadOperation"),
            SyncError::NotFound(_) => Some("NotFound"),
            SyncError::NotConnected { .. } => Some("NotConnected"),
            SyncError::WrongDestination(_) => Some("WrongDestination"),
            SyncError::BrokenTransition { .. } => Some("BrokenTransition"),
            SyncError::UnregisteredClass(_) => Some("UnregisteredClass"),
            SyncError::Remote { .. }
            | SyncError::Protocol(_)
            | SyncError::Transport { .. }
            | SyncError::Closed => None,
        }
    }

    /// All wire type names, used to register the error classes.
    pub fn wire_types() -> [&'static str; 9] {
        [
            "BadEncoding",
            "Unauthorized",
            "BadOwner",
            "BadOperation",
            "NotFound",
            "NotConnected",
            "WrongDestination",
            "BrokenTransition",
            "UnregisteredClass",
        ]
    }

    /// Encodes the error's attributes for the wire.
    pub fn wire_attributes(&self) -> Map<String, Value> {
        let mut attrs = Map::new();
        match self {
            SyncError::BrokenTransition {
                transition_id,
                sync_type,
                primary_key,
            } => {
                attrs.insert("transition_id".into(), Value::String(transition_id.to_string()));
                attrs.insert("object_type".into(), Value::String(sync_type.clone()));
                attrs.insert("primary_key".into(), Value::String(primary_key.clone()));
                attrs.insert("message".into(), Value::String(self.to_string()));
            }
            SyncError::BadEncoding(m)
            | SyncError::Unauthorized(m)
            | SyncError::BadOwner(m)
            | SyncError::BadOperation(m)
            | SyncError::NotFound(m)
            | SyncError::WrongDestination(m)
            | SyncError::UnregisteredClass(m) => {
                attrs.insert("message".into(), Value::String(m.clone()));
            }
            SyncError::NotConnected { dest } => {
                attrs.insert("message".into(), Value::String(dest.clone()));
            }
            other => {
                attrs.insert("message".into(), Value::String(other.to_string()));
            }
        }
        attrs
    }

    /// Decodes an error received from a peer.
    pub fn from_wire(sync_type: &str, attrs: &Map<String, Value>) -> Self {
        let text = |key: &str| {
            attrs
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let message = text("message");
        match sync_type {
            "BadEncoding" => SyncError::BadEncoding(message),
            "Unauthorized" => SyncError::Unauthorized(message),
            "BadOwner" => SyncError::BadOwner(message),
            "BadOperation" => SyncError::BadOperation(message),
            "NotFound" => SyncError::NotFound(message),
            "NotConnected" => SyncError::NotConnected { dest: message },
            "WrongDestination" => SyncError::WrongDestination(message),
            "UnregisteredClass" => SyncError::UnregisteredClass(message),
            "BrokenTransition" => match Uuid::parse_str(&text("transition_id")) {
                Ok(transition_id) => SyncError::BrokenTransition {
                    transition_id,
                    sync_type: text("object_type"),
                    primary_key: text("primary_key"),
                },
                Err(_) => SyncError::Remote {
                    sync_type: sync_type.to_string(),
                    message,
                },
            },
            _ => SyncError::Remote {
                sync_type: sync_type.to_string(),
                message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(!SyncError::transport_fatal("peer hash mismatch").is_retryable());
        assert!(!SyncError::WrongDestination("mismatch".into()).is_retryable());
        assert!(!SyncError::BadOwner("x".into()).is_retryable());
    }

    #[test]
    fn framing_errors_close_connection() {
        let err: SyncError = ProtocolError::UnknownCriticalFlags { flags: 2 }.into();
        assert!(err.closes_connection());

        // Payload errors reject one message only
        let err: SyncError = ProtocolError::UnknownMetaKey("_x".into()).into();
        assert!(matches!(err, SyncError::BadEncoding(_)));
        assert!(!err.closes_connection());
    }

    #[test]
    fn wire_errors_decode_to_same_variant() {
        let err = SyncError::BadOwner("sent an object belonging to someone else".into());
        let decoded = SyncError::from_wire(err.wire_type().unwrap(), &err.wire_attributes());
        assert_eq!(decoded, err);

        let err = SyncError::BrokenTransition {
            transition_id: Uuid::new_v4(),
            sync_type: "Widget".into(),
            primary_key: "[1]".into(),
        };
        let decoded = SyncError::from_wire("BrokenTransition", &err.wire_attributes());
        assert_eq!(decoded, err);
    }

    #[test]
    fn unknown_wire_type_is_remote() {
        let mut attrs = Map::new();
        attrs.insert("message".into(), Value::String("boom".into()));
        let err = SyncError::from_wire("SqlSyncError", &attrs);
        assert_eq!(
            err,
            SyncError::Remote {
                sync_type: "SqlSyncError".into(),
                message: "boom".into()
            }
        );
        assert!(err.wire_type().is_none());
    }

    #[test]
    fn error_display() {
        let err = SyncError::NotConnected {
            dest: "peer-a".into(),
        };
        assert_eq!(err.to_string(), "not connected to peer-a");
    }
}
