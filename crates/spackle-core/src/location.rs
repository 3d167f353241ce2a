use crate::{Config, CoreError, SpecIndex};
use spackle_remote::{BuildCacheIndex, MirrorConfig};
use spackle_schema::ArchSpec;
use spackle_store::{Database, StoreLayout};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// Which sources a [`SpecIndex`] should search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexLocation {
    Local,
    Remote,
    #[default]
    LocalAndRemote,
}

impl fmt::Display for IndexLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::LocalAndRemote => "all",
        })
    }
}

impl FromStr for IndexLocation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "all" | "local-and-remote" => Ok(Self::LocalAndRemote),
            other => Err(CoreError::Config(format!(
                "unknown index location '{other}' (expected local, remote or all)"
            ))),
        }
    }
}

/// Lazily opened index sources for one configuration.
///
/// The local database and the build-cache indexes are created on first use
/// and shared by every [`SpecIndex`] handed out afterwards, so a remote index
/// is downloaded at most once until [`IndexCache::reset`].
pub struct IndexCache {
    install_tree: PathBuf,
    mirrors: Vec<MirrorConfig>,
    host: Option<ArchSpec>,
    local: Mutex<Option<Arc<Database>>>,
    remote: Mutex<Option<Vec<Arc<BuildCacheIndex>>>>,
}

impl IndexCache {
    pub fn new(config: &Config) -> Self {
        Self {
            install_tree: config.install_tree.clone(),
            mirrors: config.mirrors(),
            host: config.host.clone(),
            local: Mutex::new(None),
            remote: Mutex::new(None),
        }
    }

    pub fn local_db(&self) -> Result<Arc<Database>, CoreError> {
        let mut slot = self
            .local
            .lock()
            .map_err(|_| CoreError::Config("index cache lock poisoned".to_owned()))?;
        if let Some(db) = slot.as_ref() {
            return Ok(Arc::clone(db));
        }
        let db = Arc::new(Database::open(StoreLayout::new(self.install_tree.clone()))?);
        tracing::debug!("opened install database at {}", self.install_tree.display());
        *slot = Some(Arc::clone(&db));
        Ok(db)
    }

    pub fn remote_dbs(&self) -> Result<Vec<Arc<BuildCacheIndex>>, CoreError> {
        let mut slot = self
            .remote
            .lock()
            .map_err(|_| CoreError::Config("index cache lock poisoned".to_owned()))?;
        if let Some(caches) = slot.as_ref() {
            return Ok(caches.clone());
        }
        let mut caches = Vec::with_capacity(self.mirrors.len());
        for mirror in &self.mirrors {
            let mut cache = BuildCacheIndex::new(&mirror.name, mirror.backend()?);
            if let Some(host) = &self.host {
                cache = cache.with_host(host.clone());
            }
            caches.push(Arc::new(cache));
        }
        *slot = Some(caches.clone());
        Ok(caches)
    }

    pub fn index(&self, location: IndexLocation) -> Result<SpecIndex, CoreError> {
        Ok(match location {
            IndexLocation::Local => SpecIndex::with_local_db(self.local_db()?),
            IndexLocation::Remote => SpecIndex::with_remote_dbs(self.remote_dbs()?),
            IndexLocation::LocalAndRemote => {
                SpecIndex::with_local_and_remote_dbs(self.local_db()?, self.remote_dbs()?)
            }
        })
    }

    /// Forget every opened source; the next request reopens them.
    pub fn reset(&self) {
        if let Ok(mut slot) = self.local.lock() {
            *slot = None;
        }
        if let Ok(mut slot) = self.remote.lock() {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spackle_schema::SpecIndexable;

    fn config(dir: &std::path::Path, mirrors: Vec<MirrorConfig>) -> Config {
        Config {
            install_tree: dir.join("opt"),
            mirrors,
            host: None,
        }
    }

    #[test]
    fn location_names() {
        assert_eq!("local".parse::<IndexLocation>().unwrap(), IndexLocation::Local);
        assert_eq!("remote".parse::<IndexLocation>().unwrap(), IndexLocation::Remote);
        assert_eq!(
            "local-and-remote".parse::<IndexLocation>().unwrap(),
            IndexLocation::LocalAndRemote
        );
        assert_eq!(IndexLocation::LocalAndRemote.to_string(), "all");
        assert!("nowhere".parse::<IndexLocation>().is_err());
    }

    #[test]
    fn sources_are_reused_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let mirror_dir = dir.path().join("mirror");
        let cache = IndexCache::new(&config(
            dir.path(),
            vec![MirrorConfig::new("m", mirror_dir.to_str().unwrap())],
        ));

        let first = cache.remote_dbs().unwrap();
        let second = cache.remote_dbs().unwrap();
        assert!(Arc::ptr_eq(&first[0], &second[0]));

        let db = cache.local_db().unwrap();
        assert!(Arc::ptr_eq(&db, &cache.local_db().unwrap()));

        cache.reset();
        assert!(!Arc::ptr_eq(&first[0], &cache.remote_dbs().unwrap()[0]));
        assert!(!Arc::ptr_eq(&db, &cache.local_db().unwrap()));
    }

    #[test]
    fn location_selects_sources() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(&config(
            dir.path(),
            vec![
                MirrorConfig::new("a", dir.path().join("a").to_str().unwrap()),
                MirrorConfig::new("b", dir.path().join("b").to_str().unwrap()),
            ],
        ));
        assert_eq!(cache.index(IndexLocation::Local).unwrap().sources().len(), 1);
        assert_eq!(cache.index(IndexLocation::Remote).unwrap().sources().len(), 2);
        let all = cache.index(IndexLocation::LocalAndRemote).unwrap();
        assert_eq!(all.sources().len(), 3);
        assert!(all.sources()[0].describe().starts_with("install database"));
    }

    #[test]
    fn unsupported_mirror_scheme_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(&config(
            dir.path(),
            vec![MirrorConfig::new("s3", "s3://bucket/cache")],
        ));
        assert!(matches!(cache.remote_dbs(), Err(CoreError::Remote(_))));
        assert!(cache.index(IndexLocation::Local).is_ok());
    }
}
