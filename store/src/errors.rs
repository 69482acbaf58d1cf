use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinError;

use crate::node::{AttributeType, NodeId};

/// Errors returned by every store operation.
///
/// The enum is serializable, a remote server sends it as response body of a
/// failed request, so the client can hand the identical value back to its
/// caller.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("node {parent} already has a child named {name:?}")]
    DuplicateChild { parent: NodeId, name: String },

    #[error("attribute {name:?} of node {node} is a {stored}, not a {requested}")]
    TypeMismatch {
        node: NodeId,
        name: String,
        stored: AttributeType,
        requested: AttributeType,
    },

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal storage error: {0}")]
    StorageError(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),
}

impl Error {
    pub(crate) fn node_not_found(id: &NodeId) -> Self {
        Error::NotFound(format!("node {}", id))
    }

    pub(crate) fn closed() -> Self {
        Error::IllegalState("store is closed".to_string())
    }
}

impl From<JoinError> for Error {
    fn from(value: JoinError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::Error> for Error {
    fn from(value: redb::Error) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(value: redb::DatabaseError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(value: redb::TableError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(value: redb::TransactionError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(value: redb::StorageError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(value: redb::CommitError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Error::NetworkError(format!(
                "request timed out, outcome unknown: {}",
                value.without_url()
            ))
        } else {
            Error::NetworkError(value.without_url().to_string())
        }
    }
}

impl From<reqwest_middleware::Error> for Error {
    fn from(value: reqwest_middleware::Error) -> Self {
        match value {
            reqwest_middleware::Error::Reqwest(e) => e.into(),
            reqwest_middleware::Error::Middleware(e) => Error::NetworkError(e.to_string()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        // Errors that went through an AsyncRead/AsyncWrite adapter come back
        // as they were.
        if let Some(inner) = value.get_ref().and_then(|e| e.downcast_ref::<Error>()) {
            return inner.clone();
        }

        match value.kind() {
            std::io::ErrorKind::InvalidInput => Error::InvalidRequest(value.to_string()),
            std::io::ErrorKind::NotFound => Error::NotFound(value.to_string()),
            _ => Error::StorageError(value.to_string()),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        let kind = match value {
            Error::NotFound(_) => std::io::ErrorKind::NotFound,
            Error::InvalidRequest(_) => std::io::ErrorKind::InvalidInput,
            Error::IllegalState(_) => std::io::ErrorKind::NotConnected,
            Error::NetworkError(_) => std::io::ErrorKind::BrokenPipe,
            _ => std::io::ErrorKind::Other,
        };
        Self::new(kind, value)
    }
}
