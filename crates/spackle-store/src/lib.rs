//! The local install database for spackle.
//!
//! This crate provides the storage layer: `StoreLayout` for the install tree
//! and database directory structure, `Database` for install records with
//! atomic, lock-protected writes and reference counting, `GarbageCollector`
//! for unreferenced uninstalled records, and `verify_store_integrity` for
//! checksum and reference count checks. `Database` implements the
//! `SpecIndexable` capability, so it can be merged with remote build caches.

pub mod database;
pub mod gc;
pub mod integrity;
pub mod layout;
pub mod lock;

pub use database::{decode_index, encode_index, Database, Records, INDEX_FORMAT_VERSION};
pub use gc::{GarbageCollector, GcReport};
pub use integrity::{verify_store_integrity, IntegrityFailure, IntegrityReport};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use lock::DbLock;

use std::path::Path;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// On Linux with ext4 `data=ordered` (the default), renames are usually
/// durable without an explicit dir fsync, but POSIX does not guarantee this.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for '{what}': expected {expected}, got {actual}")]
    IntegrityFailure {
        what: String,
        expected: String,
        actual: String,
    },
    #[error("no install record for hash {0}")]
    NoSuchRecord(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt install database: {0}")]
    Corrupt(String),
    #[error(transparent)]
    SpecFile(#[from] spackle_schema::SpecFileError),
}
