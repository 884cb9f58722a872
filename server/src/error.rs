//! Error taxonomy shared across the daemon.
//!
//! Every error classifies into one of six handling classes that decide
//! how far it propagates: transient I/O reschedules the current item,
//! storage-full parks the scheduler, corruption stops the indexer
//! thread, parse errors skip the offending record.

use std::path::PathBuf;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Exit codes
// ---------------------------------------------------------------------------

pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG: i32 = 1;
pub const EXIT_STORAGE: i32 = 2;
pub const EXIT_MISSING_DEPENDENCY: i32 = 3;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Handling class for an error, independent of which layer raised it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry after the I/O grace period, bounded exponential backoff.
    IoTransient,
    /// Path vanished or stayed unreadable; mark deleted or skip.
    IoPermanent,
    /// Abort the transaction and park until disk frees up.
    StorageFull,
    /// Fatal for the indexer thread.
    StorageCorrupt,
    /// Log and skip the offending record.
    Parse,
    Cancelled,
}

fn classify_io(e: &std::io::Error) -> ErrorClass {
    // ENOSPC
    if e.raw_os_error() == Some(28) {
        return ErrorClass::StorageFull;
    }
    match e.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            ErrorClass::IoPermanent
        }
        _ => ErrorClass::IoTransient,
    }
}

// ---------------------------------------------------------------------------
// Per-layer errors
// ---------------------------------------------------------------------------

/// Inverted-index store failures.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record in {path} at offset {offset}")]
    Corrupt { path: PathBuf, offset: u64 },
}

impl IndexError {
    pub fn class(&self) -> ErrorClass {
        match self {
            IndexError::Io(e) => classify_io(e),
            IndexError::Corrupt { .. } => ErrorClass::StorageCorrupt,
        }
    }
}

/// Metadata store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown service class {0}")]
    UnknownClass(String),
    #[error("malformed update payload: {0}")]
    Parse(String),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => match e.code {
                rusqlite::ErrorCode::DiskFull => ErrorClass::StorageFull,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                    ErrorClass::StorageCorrupt
                }
                _ => ErrorClass::IoTransient,
            },
            StoreError::Sqlite(_) => ErrorClass::IoTransient,
            StoreError::Io(e) => classify_io(e),
            StoreError::UnknownClass(_) | StoreError::Parse(_) => ErrorClass::Parse,
        }
    }
}

/// Batch execution failures.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("batch already executed")]
    AlreadyExecuted,
    #[error("batch cancelled")]
    Cancelled,
}

impl BatchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BatchError::Store(e) => e.class(),
            BatchError::AlreadyExecuted => ErrorClass::Parse,
            BatchError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

/// Mail summary decoding failures.
#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("summary i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("summary version {0} not supported")]
    Version(i32),
    #[error("inline count {0} exceeds limit")]
    CountLimit(u32),
    #[error("string length {0} exceeds limit")]
    StringLimit(u32),
    #[error("truncated record")]
    Truncated,
}

impl SummaryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SummaryError::Io(e) => classify_io(e),
            _ => ErrorClass::Parse,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enospc_classifies_as_storage_full() {
        let e = std::io::Error::from_raw_os_error(28);
        assert_eq!(classify_io(&e), ErrorClass::StorageFull);
    }

    #[test]
    fn missing_path_is_permanent() {
        let e = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(classify_io(&e), ErrorClass::IoPermanent);
    }

    #[test]
    fn parse_errors_never_escalate() {
        assert_eq!(SummaryError::CountLimit(501).class(), ErrorClass::Parse);
        assert_eq!(StoreError::Parse("junk".into()).class(), ErrorClass::Parse);
    }
}
