//! Package errors defines the error variables that may be returned
//! during blockfs operations.

use std::io;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum BlockFsError {
    /// Returned when an io operation failed.
    #[error("io error: {0}")]
    Io(String),

    ///////////////////////////////////////////////////////////////////////////
    // These errors can be returned when mounting a filesystem.
    ///////////////////////////////////////////////////////////////////////////
    /// ErrCorrupt is returned when the mount map magic does not match, or
    /// when the data file contains structural damage that can not be
    /// resynchronized.
    #[error("corrupt filesystem: {0}")]
    Corrupt(String),

    /// ErrAlreadyMounted is returned when another process holds the write
    /// lock and the caller asked for exclusive access instead of a
    /// read-only degradation.
    #[error("filesystem is already mounted read-write by another process")]
    AlreadyMounted,

    ///////////////////////////////////////////////////////////////////////////
    // These errors can occur when reading or writing a file node.
    ///////////////////////////////////////////////////////////////////////////
    /// ErrNotFound is returned when the requested name is not present in
    /// the index.
    #[error("file not found: {0}")]
    NotFound(String),

    /// ErrReadOnly is returned when a mutating operation is attempted on a
    /// filesystem mounted without the data lock.
    #[error("filesystem is in read-only mode")]
    ReadOnly,
}

impl From<io::Error> for BlockFsError {
    #[inline]
    fn from(e: io::Error) -> Self {
        Self::Io(e.kind().to_string())
    }
}

pub type Result<T> = std::result::Result<T, BlockFsError>;
