//! Typed errors surfaced at every API boundary of the engine.
//!
//! The teacher crate (`nfvdat-kv-store`) propagated `anyhow::Error` from
//! top to bottom. The storage engine's contract requires callers to be
//! able to distinguish error *kinds* (§7 of the design), so internal
//! plumbing here returns this enum instead.

use thiserror::Error;

use crate::config::PageId;

/// Stable numeric error codes exposed at the FFI/CLI boundary.
pub mod code {
    pub const OK: i32 = 0;
    pub const INVALID_PARAM: i32 = -1;
    pub const MEMORY: i32 = -2;
    pub const IO: i32 = -3;
    pub const KEY_NOT_FOUND: i32 = -4;
    pub const TRANSACTION_CONFLICT: i32 = -5;
    pub const INVALID_TRANSACTION: i32 = -6;
    pub const GENERIC: i32 = -100;
}

#[derive(Debug, Error)]
pub enum FileError {
    #[error("file not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("file is corrupted")]
    Corrupted,
    #[error("file already exists")]
    AlreadyExists,
    #[error("file is not open")]
    NotOpen,
    #[error("disk is full")]
    DiskFull,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database is not open")]
    NotOpen,
    #[error("invalid magic bytes in header page")]
    InvalidMagic,
    #[error("unsupported on-disk format version")]
    UnsupportedVersion,
    #[error("page size does not match compiled-in constant")]
    InvalidPageSize,
    #[error("database structure is corrupted")]
    Corrupted,
}

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("key not found")]
    KeyNotFound,
    #[error("key exceeds the maximum allowed length")]
    KeyTooLarge,
    #[error("value exceeds the maximum allowed length")]
    ValueTooLarge,
    #[error("buffer pool has no evictable frames")]
    OutOfMemory,
    #[error("operation is not valid in this context")]
    InvalidOperation,
    #[error("value does not match the expected type")]
    TypeMismatch,
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction {0} not found")]
    NotFound(u64),
    #[error("transaction {0} is not active")]
    NotActive(u64),
    #[error("conflicting concurrent transaction")]
    Conflict,
    #[error("transaction {0} timed out")]
    Timeout(u64),
    #[error("deadlock detected")]
    Deadlock,
    #[error("transaction {0} was aborted")]
    Aborted(u64),
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("WAL record is corrupted")]
    Corrupted,
    #[error("crash recovery failed")]
    RecoveryFailed,
    #[error("failed to flush WAL to disk")]
    FlushFailed,
}

/// Fatal structural failure surfaced by the B+-tree driver: bad page kind
/// at a descent step, a cycle in parent search, or depth overflow. The
/// engine treats these as unrecoverable for the current operation.
#[derive(Debug, Error)]
#[error("internal structural error: {0}")]
pub struct InternalError(pub String);

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    File(#[from] FileError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error(transparent)]
    Internal(#[from] InternalError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map to the stable numeric boundary code of spec §6.
    pub fn code(&self) -> i32 {
        match self {
            Error::Operation(OperationError::KeyNotFound) => code::KEY_NOT_FOUND,
            Error::Operation(OperationError::InvalidInput(_)) => code::INVALID_PARAM,
            Error::Operation(OperationError::OutOfMemory) => code::MEMORY,
            Error::Operation(_) => code::INVALID_PARAM,
            Error::Transaction(TransactionError::Conflict) => code::TRANSACTION_CONFLICT,
            Error::Transaction(_) => code::INVALID_TRANSACTION,
            Error::File(FileError::Io(_)) => code::IO,
            Error::File(_) => code::IO,
            Error::Io(_) => code::IO,
            Error::Wal(_) => code::GENERIC,
            Error::Database(_) => code::GENERIC,
            Error::Internal(_) => code::GENERIC,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Error {
        Error::Internal(InternalError(msg.into()))
    }

    pub fn invalid_input(msg: impl Into<String>) -> Error {
        Error::Operation(OperationError::InvalidInput(msg.into()))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Used by recovery/descent code that needs to name the page involved.
pub fn corrupted_page(pid: PageId, why: &str) -> Error {
    log::error!("page {pid} corrupted: {why}");
    Error::Database(DatabaseError::Corrupted)
}
