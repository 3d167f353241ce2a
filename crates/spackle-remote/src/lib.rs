//! Remote build caches for spackle.
//!
//! This crate reads and publishes build-cache indexes on mirrors. A
//! `RemoteBackend` moves a mirror's `index.json` and its `index.json.hash`
//! sidecar, over HTTP with ureq or in a local directory. `BuildCacheIndex`
//! verifies the index against the sidecar and serves the cached concrete
//! specs through the `SpecIndexable` capability.

pub mod buildcache;
pub mod config;
pub mod http;
pub mod local;

pub use buildcache::{publish_index, BuildCacheIndex, INDEX_HASH_PATH, INDEX_PATH};
pub use config::MirrorConfig;
pub use http::HttpBackend;
pub use local::LocalBackend;

/// Protocol version sent as `X-Spackle-Protocol` header on all HTTP requests.
pub const PROTOCOL_VERSION: u32 = 1;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("HTTP {code} for {url}")]
    Status { url: String, code: u16 },
    #[error("store error: {0}")]
    Store(#[from] spackle_store::StoreError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("mirror config error: {0}")]
    Config(String),
    #[error("integrity failure for '{key}': expected {expected}, got {actual}")]
    IntegrityFailure {
        key: String,
        expected: String,
        actual: String,
    },
}

/// Transport for one mirror's build-cache index.
///
/// A mirror holds `build_cache/index.json` and, next to it,
/// `build_cache/index.json.hash` with the blake3 digest of the index.
pub trait RemoteBackend: Send + Sync {
    /// Raw `index.json`; `NotFound` when the mirror has none.
    fn fetch_index(&self) -> Result<Vec<u8>, RemoteError>;

    /// Trimmed contents of the hash sidecar, `None` when it is absent.
    fn fetch_index_hash(&self) -> Result<Option<String>, RemoteError>;

    /// Replace the index, then its hash sidecar.
    fn store_index(&self, index: &[u8], hash: &str) -> Result<(), RemoteError>;

    /// Mirror location for logs and error messages.
    fn describe(&self) -> String;
}
