use thiserror::Error;

/// Error type shared across the storage engine. The core propagates these
/// with `?`; the query facade swallows them and reports plain failure.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Physical page has no free slots left.
    #[error("page is full")]
    PageFull,

    /// Slot index is outside `[0, num_records)`.
    #[error("slot {0} out of bounds")]
    SlotOutOfBounds(usize),

    /// Raw page payload is not exactly one page long.
    #[error("expected a 4096-byte page payload, got {0} bytes")]
    InvalidPageSize(usize),

    /// Eviction found no frame with a zero pin count.
    #[error("bufferpool cannot evict: all frames are pinned")]
    AllFramesPinned,

    /// Insert with a primary-key value that already exists.
    #[error("duplicate primary key {0}")]
    DuplicateKey(i64),

    /// Operation on a RID or table name that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Column-count mismatch, key-column update, empty update mask.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;
