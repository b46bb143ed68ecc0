//! Error kinds for the storage, reference, tree, and facade layers.

use thiserror::Error;

/// Errors produced by any layer of the store.
///
/// `Closed` from the design notes has no runtime variant here: `Db::close`
/// and `Storage::close` consume `self`, so a closed handle simply cannot be
/// called again, and the compiler enforces it instead of a runtime flag.
#[derive(Debug, Error)]
pub enum DbError {
    /// `get`/`delete` found no node for the given key.
    #[error("key not found: {key:?}")]
    NotFound { key: String },

    /// The file's contents don't match what the format requires: a
    /// truncated block, a length prefix past the end of the file, or a
    /// root/child address that doesn't name a valid block.
    #[error("corrupt database: {0}")]
    Corrupt(String),

    /// Propagated unchanged from the underlying file I/O.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The OS-level exclusive advisory lock could not be acquired or
    /// released.
    #[error("lock error: {0}")]
    Lock(String),
}

impl DbError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound { .. })
    }
}
