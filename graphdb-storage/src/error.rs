use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("node {0} not found")]
    NodeNotFound(u64),

    #[error("edge {0} not found")]
    EdgeNotFound(u64),

    #[error("property index on {0:?} not found")]
    IndexNotFound(String),

    #[error("property index on {0:?} already exists")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("node or edge id space exhausted")]
    IdExhausted,

    #[error(transparent)]
    MalformedValue(#[from] graphdb_api::DecodeError),

    #[error(transparent)]
    WrongValueType(#[from] graphdb_api::WrongValueType),

    #[error("durability error: {0}")]
    DurabilityError(String),

    #[error("snapshot is encrypted but no encryption engine is configured")]
    EncryptionRequired,

    #[error("operation attempted after close")]
    Closed,

    #[error("data directory {0:?} is locked by another instance")]
    AlreadyLocked(String),

    #[error("wal checksum mismatch at offset {offset}")]
    WalChecksumMismatch { offset: u64 },

    #[error("wal record too large: {0} bytes")]
    WalRecordTooLarge(u32),

    #[error("underlying redb error: {0}")]
    Redb(String),
}

impl From<redb::Error> for Error {
    fn from(e: redb::Error) -> Self {
        Error::Redb(e.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Redb(e.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Redb(e.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Redb(e.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Redb(e.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Redb(e.to_string())
    }
}
