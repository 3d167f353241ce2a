//! Merged spec lookup for spackle.
//!
//! This crate ties the local install database and remote build caches
//! together: `SpecIndex` fans hash lookups and queries out over an ordered
//! list of `SpecIndexable` sources, `IndexCache` builds and memoizes those
//! sources for an `IndexLocation` until it is reset, and `Config` loads the
//! install tree, mirror list, and host architecture from TOML.

pub mod config;
pub mod index;
pub mod location;

pub use config::Config;
pub use index::SpecIndex;
pub use location::{IndexCache, IndexLocation};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(String),
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("store error: {0}")]
    Store(#[from] spackle_store::StoreError),
    #[error("remote error: {0}")]
    Remote(#[from] spackle_remote::RemoteError),
    #[error(transparent)]
    Index(#[from] spackle_schema::IndexError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
