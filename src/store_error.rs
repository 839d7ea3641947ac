use lmdb::Error as LmdbError;
use serde_json::Error as SerdeError;

/// Every failure the store can report.
///
/// Structural errors (`UnknownDatabase`, `SchemaViolation`, `MissingKey`) are
/// programmer errors and are never retried. `BlockedByOtherContext` carries the
/// database name so the caller can ask the user to close other windows.
/// `ServerSideUnavailable` is routine when the store is reached from a context
/// with no storage host.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("unknown database '{0}'")]
    UnknownDatabase(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("storage is not available in this context")]
    ServerSideUnavailable,

    #[error("database '{name}' is blocked by another open context; close other windows using it and retry")]
    BlockedByOtherContext { name: String },

    #[error("key {key} already exists in collection '{collection}'")]
    DuplicateKey { collection: String, key: String },

    #[error("record for collection '{collection}' has no '{field}' key")]
    MissingKey { collection: String, field: String },

    #[error("database '{name}' is stored at version {stored}, cannot open it at version {requested}")]
    VersionRegression {
        name: String,
        stored: u32,
        requested: u32,
    },

    #[error("connection to database '{0}' is closed")]
    ConnectionClosed(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<LmdbError> for StoreError {
    fn from(err: LmdbError) -> Self {
        match err {
            LmdbError::MapFull => {
                StoreError::StorageUnavailable("storage quota exceeded (map full)".to_string())
            }
            LmdbError::Corrupted | LmdbError::Panic => {
                StoreError::StorageUnavailable(format!("database is corrupted: {err}"))
            }
            _ => StoreError::StorageUnavailable(format!("lmdb error: {err}")),
        }
    }
}

impl From<SerdeError> for StoreError {
    fn from(err: SerdeError) -> Self {
        StoreError::Serialization(format!("JSON serialization error: {err}"))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::StorageUnavailable(format!("IO error: {err}"))
    }
}

impl StoreError {
    pub fn schema(msg: impl Into<String>) -> Self {
        StoreError::SchemaViolation(msg.into())
    }

    /// Whether waiting for another context to let go may make a retry succeed.
    pub fn is_contention(&self) -> bool {
        matches!(self, StoreError::BlockedByOtherContext { .. })
    }
}
