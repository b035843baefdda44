//! Crate-wide error type.
//!
//! Mirrors the error kinds named in the specification's error handling design: each
//! is a distinct variant so callers can match on what went wrong, with `#[from]`
//! conversions from the handful of std errors that bubble up from filesystem work.

use thiserror::Error;

/// Result alias used throughout this crate.
pub type Result<T = ()> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A bundle file's name or body did not match the expected grammar.
    #[error("bad bundle format: {0}")]
    BadFormat(String),

    /// A record referenced an undeclared property, or was missing a required one.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// A docid or content-hash conflict was detected (e.g. duplicate docid on insert).
    #[error("id conflict: {0}")]
    IdConflict(String),

    /// The document store or index store rejected a write.
    #[error("store error: {0}")]
    StoreError(String),

    /// A directory guard could not be acquired because the directory is marked dirty.
    #[error("directory is dirty, guard acquisition refused")]
    DirectoryDirty,

    /// A filesystem operation (scan, rename, copy) failed.
    #[error("filesystem error: {0}")]
    FilesystemError(#[from] std::io::Error),

    /// The operation was cancelled cooperatively; any work committed so far stands.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn bad_format(msg: impl Into<String>) -> Self {
        Self::BadFormat(msg.into())
    }

    pub fn schema_violation(msg: impl Into<String>) -> Self {
        Self::SchemaViolation(msg.into())
    }

    pub fn id_conflict(msg: impl Into<String>) -> Self {
        Self::IdConflict(msg.into())
    }

    pub fn store_error(msg: impl Into<String>) -> Self {
        Self::StoreError(msg.into())
    }

    /// Per-document and per-record failures never abort a build pass (§7); this is
    /// the predicate the Index Worker's dispatcher uses to decide "log and skip"
    /// versus "abort the pass".
    pub fn is_recoverable_per_record(&self) -> bool {
        matches!(
            self,
            Self::BadFormat(_) | Self::SchemaViolation(_) | Self::IdConflict(_) | Self::StoreError(_)
        )
    }
}
