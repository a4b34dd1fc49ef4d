//! Error types for the kawaraban engine

use thiserror::Error;

/// Main error type for kawaraban operations
#[derive(Error, Debug)]
pub enum BbsError {
    /// Peer address could not be parsed or failed the address filter
    #[error("Invalid node address: {0}")]
    InvalidAddress(String),

    /// Range expression could not be parsed
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// Record line was malformed or failed integrity checks
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Signature verification failed
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Network-related error (unreachable peer, timeout, bad response)
    #[error("Network error: {0}")]
    Network(String),

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

    /// Startup configuration error (bad seed list, unreadable rule file)
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using BbsError
pub type BbsResult<T> = Result<T, BbsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BbsError::InvalidAddress("not-a-node".to_string());
        assert_eq!(format!("{}", err), "Invalid node address: not-a-node");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let bbs_err: BbsError = io_err.into();
        assert!(matches!(bbs_err, BbsError::Io(_)));
    }
}
