//! Storage error handling
//!
//! Typed errors for the filter store. Guard rejections (non-editable filter,
//! closed handle) get their own variants so callers can map them to boolean
//! refusals instead of treating them as database failures.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during filter store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// The storage handle is released (backgrounded) or was never opened.
    #[error("Store is not ready: the database handle is closed")]
    NotReady,

    /// Rule mutation attempted on a default or subscribed filter.
    #[error("Filter {0} is not editable")]
    NotEditable(i32),

    /// Filter id did not resolve to a persisted filter.
    #[error("Filter {0} is not installed")]
    FilterNotFound(i32),

    /// A custom filter with this subscription URL already exists.
    #[error("A filter subscribed from '{0}' is already installed")]
    AlreadyInstalled(String),

    /// Failed to open the database file
    #[error("Failed to open database at '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// SQLite error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// True for precondition refusals that are signaled as boolean `false`
    /// at the service boundary rather than surfaced as failures.
    pub fn is_guard_rejection(&self) -> bool {
        matches!(
            self,
            StoreError::NotReady
                | StoreError::NotEditable(_)
                | StoreError::FilterNotFound(_)
                | StoreError::AlreadyInstalled(_)
        )
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
