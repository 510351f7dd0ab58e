//! Error types for the Scuttlebutt node

use thiserror::Error;

/// Main error type for node operations
#[derive(Error, Debug)]
pub enum NodeError {
    /// Malformed user input or a message that breaks feed rules
    #[error("Validation error: {0}")]
    Validation(String),

    /// Feed, message or receive log entry is absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Framing, header or MAC violation on a connection
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote peer answered with an error payload
    #[error("Remote error: {0}")]
    Remote(String),

    /// The remote peer closed the stream normally
    #[error("Remote end")]
    RemoteEnd,

    /// The remote peer does not speak `ebt.replicate`
    #[error("Peer does not support EBT")]
    PeerDoesNotSupportEbt,

    /// The surrounding scope was cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Invalid node configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Returns true for [`NodeError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, NodeError::NotFound(_))
    }

    /// Returns true when the remote closed the stream without an error.
    pub fn is_remote_end(&self) -> bool {
        matches!(self, NodeError::RemoteEnd)
    }

    /// Returns true if a remote error says the procedure is unknown to the peer.
    ///
    /// Different implementations word this differently, so a few known
    /// phrasings are accepted.
    pub fn is_method_not_supported(&self) -> bool {
        match self {
            NodeError::Remote(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("method not supported")
                    || msg.contains("not in list of allowed methods")
                    || msg.contains("no such method")
            }
            _ => false,
        }
    }

    /// Returns true for errors raised by the storage engine.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            NodeError::Storage(_)
                | NodeError::Database(_)
                | NodeError::Transaction(_)
                | NodeError::Table(_)
                | NodeError::StorageOp(_)
                | NodeError::Commit(_)
        )
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

/// Result type alias using NodeError
pub type NodeResult<T> = Result<T, NodeError>;
