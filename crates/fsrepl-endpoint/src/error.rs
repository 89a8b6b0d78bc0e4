//! Error types for the endpoint subsystem.

use fsrepl_transport::TransportError;
use thiserror::Error;

use crate::backend::BackendError;
use crate::filter::FilterError;

/// Coarse classification of an [`EndpointError`].
///
/// The classification travels over the wire as the error code, so callers of
/// a remote endpoint can tell a policy refusal from a backend hiccup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorKind {
    /// A receive-side mapping does not cover the path.
    AccessDenied = 1,
    /// A send-side filter rejects the path.
    Filtered = 2,
    /// Malformed path or a dataset that is not there.
    NotFound = 3,
    /// Malformed request content.
    InvalidInput = 4,
    /// The filesystem engine failed.
    Backend = 5,
    /// Stream shape mismatch, undecodable payload or unknown call.
    Protocol = 6,
    /// The connection to the peer failed.
    Transport = 7,
}

impl ErrorKind {
    /// Wire code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Inverse of [`ErrorKind::code`]; unknown codes count as backend errors.
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => ErrorKind::AccessDenied,
            2 => ErrorKind::Filtered,
            3 => ErrorKind::NotFound,
            4 => ErrorKind::InvalidInput,
            6 => ErrorKind::Protocol,
            7 => ErrorKind::Transport,
            _ => ErrorKind::Backend,
        }
    }
}

/// Errors that can occur in the endpoint subsystem.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The dataset path does not parse.
    #[error("invalid dataset path {path:?}: {reason}")]
    InvalidPath {
        /// Path as given.
        path: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The sender's filter does not expose the filesystem.
    #[error("endpoint does not allow access to filesystem {fs}")]
    Filtered {
        /// Filesystem as requested.
        fs: String,
    },

    /// The receiver's mapping does not cover the filesystem.
    #[error("access to filesystem {fs} denied")]
    AccessDenied {
        /// Filesystem as requested.
        fs: String,
    },

    /// A destroy batch named something other than a snapshot.
    #[error("version {name:?} is not a snapshot")]
    NotASnapshot {
        /// Offending version name.
        name: String,
    },

    /// The version name does not parse.
    #[error("invalid version name {name:?}: {reason}")]
    InvalidVersion {
        /// Name as given.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Replication status opcode out of range.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),

    /// Path filter or map failed.
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// Filesystem engine error, propagated verbatim.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Stream presence did not match the call.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Structured payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Unknown call, or a call the bound endpoint cannot serve.
    #[error("no handler for given endpoint")]
    NoHandler,

    /// The connection to the remote endpoint failed.
    #[error(transparent)]
    Transport(TransportError),

    /// The remote endpoint failed the call.
    #[error("{message}")]
    Remote {
        /// Classification reported by the remote side.
        kind: ErrorKind,
        /// Remote error message, verbatim.
        message: String,
    },
}

impl EndpointError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EndpointError::InvalidPath { .. } => ErrorKind::NotFound,
            EndpointError::Filtered { .. } => ErrorKind::Filtered,
            EndpointError::AccessDenied { .. } => ErrorKind::AccessDenied,
            EndpointError::NotASnapshot { .. }
            | EndpointError::InvalidVersion { .. }
            | EndpointError::UnknownOpcode(_)
            | EndpointError::Filter(_) => ErrorKind::InvalidInput,
            EndpointError::Backend(_) => ErrorKind::Backend,
            EndpointError::Protocol(_)
            | EndpointError::Serialization(_)
            | EndpointError::NoHandler => ErrorKind::Protocol,
            EndpointError::Transport(_) => ErrorKind::Transport,
            EndpointError::Remote { kind, .. } => *kind,
        }
    }

    /// Whether the path policy refused the request, locally or remotely.
    pub fn is_policy_refusal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Filtered | ErrorKind::AccessDenied)
    }
}

impl From<TransportError> for EndpointError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Remote(remote) => EndpointError::Remote {
                kind: ErrorKind::from_code(remote.code),
                message: remote.message,
            },
            other => EndpointError::Transport(other),
        }
    }
}

/// Result alias for the endpoint subsystem.
pub type Result<T> = std::result::Result<T, EndpointError>;

#[cfg(test)]
mod tests {
    use super::*;
    use fsrepl_transport::RemoteError;

    #[test]
    fn test_kind_codes_roundtrip() {
        for kind in [
            ErrorKind::AccessDenied,
            ErrorKind::Filtered,
            ErrorKind::NotFound,
            ErrorKind::InvalidInput,
            ErrorKind::Backend,
            ErrorKind::Protocol,
            ErrorKind::Transport,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), kind);
        }
        assert_eq!(ErrorKind::from_code(999), ErrorKind::Backend);
    }

    #[test]
    fn test_filtered_and_denied_are_distinct() {
        let filtered = EndpointError::Filtered { fs: "pool/a".into() };
        let denied = EndpointError::AccessDenied { fs: "pool/a".into() };
        assert_ne!(filtered.kind(), denied.kind());
        assert!(filtered.is_policy_refusal());
        assert!(denied.is_policy_refusal());
        assert!(!EndpointError::NoHandler.is_policy_refusal());
    }

    #[test]
    fn test_remote_transport_error_keeps_kind_and_message() {
        let err: EndpointError =
            TransportError::Remote(RemoteError::new(2, "endpoint does not allow access to filesystem x"))
                .into();
        assert_eq!(err.kind(), ErrorKind::Filtered);
        assert_eq!(err.to_string(), "endpoint does not allow access to filesystem x");
    }

    #[test]
    fn test_connection_failure_is_transport() {
        let err: EndpointError = TransportError::ConnectionReset.into();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
