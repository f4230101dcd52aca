//! Error type for backing store operations

/// Error type for backing store operations
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),
    #[error("corrupt record at {0}")]
    CorruptRecord(String),
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
}

impl From<redb::TransactionError> for KvError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<KvError> for treecache_common::Error {
    fn from(e: KvError) -> Self {
        Self::backend(e.to_string())
    }
}

pub type KvResult<T> = Result<T, KvError>;
