use std::time::Duration;

/// The type returned when a message store operation fails.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing medium could not be reached in time, or the store was closed.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// I/O error raised by a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Error raised by the SQLite driver.
    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Error raised by redb.
    #[cfg(feature = "redb")]
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),
    /// Persisted data could not be interpreted.
    #[error("corrupt store data: {0}")]
    Corrupt(String),
    /// Sequence numbers start at 1.
    #[error("invalid sequence number {0}")]
    InvalidSequenceNumber(u64),
    /// The store configuration is incomplete or malformed.
    #[error("invalid store configuration: {0}")]
    Config(String),
}

impl StoreError {
    pub(crate) fn timed_out(timeout: Duration) -> Self {
        Self::Unavailable(format!(
            "operation did not complete within {}ms",
            timeout.as_millis()
        ))
    }
}
