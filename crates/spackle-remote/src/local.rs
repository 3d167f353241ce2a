use crate::buildcache::{INDEX_HASH_PATH, INDEX_PATH};
use crate::{RemoteBackend, RemoteError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// A mirror in a local (or network-mounted) directory.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, relative: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let path = self.root.join(relative);
        tracing::debug!("read {}", path.display());
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, relative: &str, data: &[u8]) -> Result<(), RemoteError> {
        let path = self.root.join(relative);
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| RemoteError::Io(e.error))?;
        tracing::debug!("wrote {} ({} bytes)", path.display(), data.len());
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl RemoteBackend for LocalBackend {
    fn fetch_index(&self) -> Result<Vec<u8>, RemoteError> {
        self.read(INDEX_PATH)?.ok_or_else(|| {
            RemoteError::NotFound(self.root.join(INDEX_PATH).display().to_string())
        })
    }

    fn fetch_index_hash(&self) -> Result<Option<String>, RemoteError> {
        Ok(self
            .read(INDEX_HASH_PATH)?
            .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_owned()))
    }

    fn store_index(&self, index: &[u8], hash: &str) -> Result<(), RemoteError> {
        self.write(INDEX_PATH, index)?;
        self.write(INDEX_HASH_PATH, hash.as_bytes())
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_index_reads_back_with_its_hash() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().join("mirror"));
        assert!(backend.fetch_index_hash().unwrap().is_none());

        backend.store_index(b"{}", "abc123").unwrap();
        assert_eq!(backend.fetch_index().unwrap(), b"{}");
        assert_eq!(backend.fetch_index_hash().unwrap().as_deref(), Some("abc123"));
        assert!(backend.root().join(INDEX_HASH_PATH).is_file());
    }

    #[test]
    fn hash_sidecar_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.store_index(b"{}", "abc123\n").unwrap();
        assert_eq!(backend.fetch_index_hash().unwrap().as_deref(), Some("abc123"));
    }

    #[test]
    fn missing_index_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        assert!(matches!(
            backend.fetch_index(),
            Err(RemoteError::NotFound(_))
        ));
    }
}
