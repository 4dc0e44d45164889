//! Server error types and their wire mapping.

use cryptsync_core::protocol::messages::{ErrorKind, ErrorMessage};
use thiserror::Error;

/// Errors raised while serving a session. Each maps to a typed wire `Error`
/// with the recoverability contract of the protocol: authentication, access
/// and key-index failures are fatal for the client, the rest may reconnect.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Access failed: {0}")]
    Access(String),

    #[error("Key index error: {0}")]
    KeyIndex(String),

    #[error("Incompatible client version: {0}")]
    IncompatibleVersion(String),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Invalid client message: {0}")]
    Client(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Build the wire error frame for this failure.
    pub fn to_message(&self) -> ErrorMessage {
        let (kind, can_recover) = match self {
            Self::Authentication(_) => (ErrorKind::Authentication, false),
            Self::Access(_) => (ErrorKind::Access, false),
            Self::KeyIndex(_) => (ErrorKind::KeyIndex, false),
            Self::IncompatibleVersion(_) => (ErrorKind::IncompatibleVersion, false),
            Self::UnexpectedMessage(_) => (ErrorKind::UnexpectedMessage, true),
            Self::Client(_) => (ErrorKind::Client, true),
            Self::Database(_) | Self::Internal(_) => (ErrorKind::Server, true),
        };
        ErrorMessage {
            kind,
            message: self.to_string(),
            can_recover,
        }
    }

    pub fn is_fatal(&self) -> bool {
        !self.to_message().can_recover
    }
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds_match_contract() {
        assert!(ServerError::Authentication("x".into()).is_fatal());
        assert!(ServerError::Access("x".into()).is_fatal());
        assert!(ServerError::KeyIndex("x".into()).is_fatal());
        assert!(ServerError::IncompatibleVersion("x".into()).is_fatal());
        assert!(!ServerError::UnexpectedMessage("x".into()).is_fatal());
        assert!(!ServerError::Internal("x".into()).is_fatal());
    }
}
