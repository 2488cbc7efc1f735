//! Internal error taxonomy and its mapping to wire statuses.
//!
//! Handlers never let storage or crypto failures cross the wire as-is; each
//! internal error translates to exactly one [`Status`]. Only protocol-framing
//! faults terminate the connection.

use crate::crypto::CryptoError;
use crate::proto::Status;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("unsupported request")]
    Unsupported,
    #[error("request not allowed on this role")]
    BadRole,
    #[error("request not allowed in this conversation state")]
    BadConversationState,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("uninitialized")]
    Uninitialized,
    #[error("rejected")]
    Rejected,
    #[error("busy")]
    Busy,
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

impl ServerError {
    pub fn invalid_value(detail: impl Into<String>) -> Self {
        Self::InvalidValue(detail.into())
    }

    /// The wire status this error maps to.
    pub fn status(&self) -> Status {
        match self {
            ServerError::Protocol(_) => Status::ErrorProtocolViolation,
            ServerError::Unsupported => Status::ErrorUnsupported,
            ServerError::BadRole => Status::ErrorBadRole,
            ServerError::BadConversationState => Status::ErrorBadConversationState,
            ServerError::InvalidSignature | ServerError::Crypto(_) => Status::ErrorInvalidSignature,
            ServerError::InvalidValue(_) => Status::ErrorInvalidValue,
            ServerError::QuotaExceeded => Status::ErrorQuotaExceeded,
            ServerError::AlreadyExists => Status::ErrorAlreadyExists,
            ServerError::NotFound => Status::ErrorNotFound,
            ServerError::Uninitialized => Status::ErrorUninitialized,
            ServerError::Rejected => Status::ErrorRejected,
            ServerError::Busy => Status::ErrorBusy,
            ServerError::Storage(_)
            | ServerError::Encoding(_)
            | ServerError::Io(_)
            | ServerError::Internal(_) => Status::ErrorInternal,
        }
    }

    /// Detail string safe to put on the wire. Internal failures are reduced
    /// to their status; nothing about the server's insides leaks.
    pub fn public_details(&self) -> String {
        match self {
            ServerError::InvalidValue(detail) => detail.clone(),
            ServerError::Protocol(detail) => detail.clone(),
            ServerError::Storage(_)
            | ServerError::Encoding(_)
            | ServerError::Io(_)
            | ServerError::Internal(_) => String::new(),
            other => other.to_string(),
        }
    }

    /// Closes the socket after the response is written.
    pub fn terminates_connection(&self) -> bool {
        matches!(self, ServerError::Protocol(_))
    }
}

impl From<prost::DecodeError> for ServerError {
    fn from(e: prost::DecodeError) -> Self {
        ServerError::Protocol(format!("malformed message: {e}"))
    }
}

impl From<bincode::Error> for ServerError {
    fn from(e: bincode::Error) -> Self {
        ServerError::Encoding(e.to_string())
    }
}

impl From<serde_json::Error> for ServerError {
    fn from(e: serde_json::Error) -> Self {
        ServerError::Encoding(e.to_string())
    }
}

impl From<sled::transaction::TransactionError<ServerError>> for ServerError {
    fn from(e: sled::transaction::TransactionError<ServerError>) -> Self {
        match e {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(e) => ServerError::Storage(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_stable() {
        assert_eq!(ServerError::QuotaExceeded.status(), Status::ErrorQuotaExceeded);
        assert_eq!(ServerError::InvalidSignature.status(), Status::ErrorInvalidSignature);
        assert_eq!(
            ServerError::Internal("db on fire".into()).status(),
            Status::ErrorInternal
        );
    }

    #[test]
    fn internal_details_do_not_leak() {
        let err = ServerError::Internal("sled tree corrupt at /var/db".into());
        assert!(err.public_details().is_empty());

        let err = ServerError::invalid_value("name too long");
        assert_eq!(err.public_details(), "name too long");
    }
}
