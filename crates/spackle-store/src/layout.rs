use crate::StoreError;
use serde::{Deserialize, Serialize};
use spackle_schema::ConcreteSpec;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current database format version. Incremented on incompatible changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const DB_DIR: &str = ".spackle-db";
const VERSION_FILE: &str = "version";

/// Directory layout of an install tree.
///
/// Install prefixes live under `<root>/<arch>/<name>-<version>-<hash>`; the
/// database, its lock, and the format marker live under `<root>/.spackle-db`.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn db_dir(&self) -> PathBuf {
        self.root.join(DB_DIR)
    }

    #[inline]
    pub fn index_file(&self) -> PathBuf {
        self.db_dir().join("index.json")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.db_dir().join("lock")
    }

    /// Install prefix for a concrete spec.
    pub fn prefix_for(&self, spec: &ConcreteSpec) -> PathBuf {
        let leaf = format!("{}-{}-{}", spec.name(), spec.version(), spec.dag_hash());
        if spec.arch().is_empty() {
            self.root.join(leaf)
        } else {
            self.root.join(spec.arch().to_string()).join(leaf)
        }
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        let db_dir = self.db_dir();
        fs::create_dir_all(&db_dir)?;

        let version_path = db_dir.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let mut tmp = NamedTempFile::new_in(&db_dir)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&db_dir)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.db_dir().join(VERSION_FILE))?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
