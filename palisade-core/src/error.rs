//! Error types for all palisade operations.
//!
//! One crate-wide enum with structured variants: infrastructure failures
//! carry the failing operation plus a boxed source, domain failures
//! (membership, request lifecycle, store) are plain variants surfaced to
//! gateway callers. Snapshot races (`SnapOutOfDate`, `Compacted`) are
//! produced by the storage layer and swallowed by the snapshot path.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PalisadeError {
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("storage operation '{operation}' failed")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("raft operation '{operation}' failed")]
    Raft {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("serialization operation '{operation}' failed")]
    Serialization {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("io error: {0}")]
    Io(#[from] Box<std::io::Error>),

    #[error("internal error: {message}")]
    Internal { message: String },

    // Membership reconfiguration failures, surfaced to the gateway caller.
    #[error("member id has been removed from the cluster")]
    MemberRemoved,

    #[error("member id already exists in the cluster")]
    MemberExists,

    #[error("member id not found in the cluster")]
    MemberNotFound,

    #[error("peer url is already used by another member")]
    PeerUrlExists,

    // Request lifecycle.
    #[error("server stopped")]
    Stopped,

    #[error("request canceled")]
    Canceled,

    #[error("request timed out after {duration:?}")]
    Timeout { duration: std::time::Duration },

    #[error("unknown request method")]
    UnknownMethod,

    // Store operation failures, wrapped into the response of the
    // originating request.
    #[error("key not found: {key}")]
    KeyNotFound { key: String },

    #[error("key already exists: {key}")]
    KeyExists { key: String },

    #[error("not a file: {key}")]
    NotAFile { key: String },

    #[error("not a directory: {key}")]
    NotADirectory { key: String },

    #[error("root is read only")]
    RootReadOnly,

    #[error("directory not empty: {key}")]
    DirectoryNotEmpty { key: String },

    #[error("compare failed: {cause}")]
    CompareFailed { cause: String },

    #[error("event index cleared: requested {since}, oldest retained {oldest}")]
    EventIndexCleared { since: u64, oldest: u64 },

    // Snapshot/compaction races. Another path already produced a newer
    // snapshot; callers drop these silently.
    #[error("requested snapshot is out of date")]
    SnapOutOfDate,

    #[error("log has already been compacted past the requested index")]
    Compacted,

    #[error("failed to join cluster: {reason}")]
    ClusterJoin { reason: String },
}

pub type PalisadeResult<T> = std::result::Result<T, PalisadeError>;

impl PalisadeError {
    /// Create a Storage error with a boxed source.
    pub fn storage<E: std::error::Error + Send + Sync + 'static>(
        operation: impl Into<String>,
        source: E,
    ) -> Self {
        PalisadeError::Storage {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a Raft error with a boxed source.
    pub fn raft<E: std::error::Error + Send + Sync + 'static>(
        operation: impl Into<String>,
        source: E,
    ) -> Self {
        PalisadeError::Raft {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a Serialization error with a boxed source.
    pub fn serialization<E: std::error::Error + Send + Sync + 'static>(
        operation: impl Into<String>,
        source: E,
    ) -> Self {
        PalisadeError::Serialization {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error is the store's not-found condition. The cluster
    /// view treats a missing members directory as an empty membership.
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, PalisadeError::KeyNotFound { .. })
    }
}

impl From<std::io::Error> for PalisadeError {
    fn from(err: std::io::Error) -> Self {
        PalisadeError::Io(Box::new(err))
    }
}

impl From<raft::Error> for PalisadeError {
    fn from(err: raft::Error) -> Self {
        PalisadeError::raft("raft", err)
    }
}

impl From<bincode::Error> for PalisadeError {
    fn from(err: bincode::Error) -> Self {
        PalisadeError::serialization("bincode", err)
    }
}

impl From<serde_json::Error> for PalisadeError {
    fn from(err: serde_json::Error) -> Self {
        PalisadeError::serialization("json", err)
    }
}

impl From<protobuf::ProtobufError> for PalisadeError {
    fn from(err: protobuf::ProtobufError) -> Self {
        PalisadeError::serialization("protobuf", err)
    }
}

impl From<redb::Error> for PalisadeError {
    fn from(err: redb::Error) -> Self {
        PalisadeError::storage("redb", err)
    }
}

impl From<redb::DatabaseError> for PalisadeError {
    fn from(err: redb::DatabaseError) -> Self {
        PalisadeError::storage("open database", err)
    }
}

impl From<redb::TransactionError> for PalisadeError {
    fn from(err: redb::TransactionError) -> Self {
        PalisadeError::storage("begin transaction", err)
    }
}

impl From<redb::TableError> for PalisadeError {
    fn from(err: redb::TableError) -> Self {
        PalisadeError::storage("open table", err)
    }
}

impl From<redb::StorageError> for PalisadeError {
    fn from(err: redb::StorageError) -> Self {
        PalisadeError::storage("storage access", err)
    }
}

impl From<redb::CommitError> for PalisadeError {
    fn from(err: redb::CommitError) -> Self {
        PalisadeError::storage("commit transaction", err)
    }
}
