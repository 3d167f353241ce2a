use crate::{RemoteBackend, RemoteError};
use spackle_schema::index::{EntryIter, SpecIter};
use spackle_schema::{
    ArchSpec, HashPrefix, IndexEntry, IndexError, IndexQuery, PartialHash, SpecIndexable,
};
use spackle_store::{decode_index, encode_index, Records};
use std::sync::{Arc, RwLock};

pub const INDEX_PATH: &str = "build_cache/index.json";
pub const INDEX_HASH_PATH: &str = "build_cache/index.json.hash";

fn digest(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

struct CachedIndex {
    hash: String,
    records: Arc<Records>,
}

/// The spec index of one mirror's build cache.
///
/// The index is fetched on first use and kept in memory; later fetches
/// only download `index.json` again when `index.json.hash` changed.
pub struct BuildCacheIndex {
    name: String,
    backend: Box<dyn RemoteBackend>,
    host: Option<ArchSpec>,
    cache: RwLock<Option<CachedIndex>>,
}

impl BuildCacheIndex {
    pub fn new(name: impl Into<String>, backend: Box<dyn RemoteBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            host: None,
            cache: RwLock::new(None),
        }
    }

    /// Only serve specs built for `host`, unless a query asks for all
    /// architectures.
    #[must_use]
    pub fn with_host(mut self, host: ArchSpec) -> Self {
        self.host = Some(host);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn cached(&self) -> Option<Arc<Records>> {
        let guard = self.cache.read().ok()?;
        guard.as_ref().map(|c| Arc::clone(&c.records))
    }

    fn cached_hash(&self) -> Option<String> {
        let guard = self.cache.read().ok()?;
        guard.as_ref().map(|c| c.hash.clone())
    }

    /// The mirror's records, from memory if the remote hash is unchanged.
    pub fn fetch(&self) -> Result<Arc<Records>, RemoteError> {
        if let Some(records) = self.cached() {
            return Ok(records);
        }
        self.update()
    }

    /// Re-check the remote hash and download the index if it changed.
    pub fn update(&self) -> Result<Arc<Records>, RemoteError> {
        let remote_hash = self.backend.fetch_index_hash()?;
        if let (Some(remote), Some(cached)) = (&remote_hash, self.cached_hash()) {
            if *remote == cached {
                if let Some(records) = self.cached() {
                    tracing::debug!("build cache '{}' index unchanged", self.name);
                    return Ok(records);
                }
            }
        }

        tracing::debug!(
            "fetching build cache index for '{}' from {}",
            self.name,
            self.backend.describe()
        );
        let data = self.backend.fetch_index()?;
        let actual = digest(&data);
        if let Some(expected) = remote_hash {
            if expected != actual {
                return Err(RemoteError::IntegrityFailure {
                    key: format!("{}/{INDEX_PATH}", self.backend.describe()),
                    expected,
                    actual,
                });
            }
        }

        let text = String::from_utf8(data)
            .map_err(|e| RemoteError::Http(format!("index is not UTF-8: {e}")))?;
        let mut records = decode_index(&text)?;
        for record in records.values_mut() {
            record.installed = false;
            record.in_buildcache = true;
            record.path = None;
        }
        let records = Arc::new(records);
        if let Ok(mut guard) = self.cache.write() {
            *guard = Some(CachedIndex {
                hash: actual,
                records: Arc::clone(&records),
            });
        }
        tracing::info!(
            "build cache '{}' lists {} specs",
            self.name,
            records.len()
        );
        Ok(records)
    }

    fn fetch_or_report(&self) -> Result<Arc<Records>, IndexError> {
        self.fetch().map_err(IndexError::source)
    }
}

/// Publish `records` as the build-cache index of the mirror behind `backend`.
pub fn publish_index(backend: &dyn RemoteBackend, records: &Records) -> Result<(), RemoteError> {
    let mut published = records.clone();
    for record in published.values_mut() {
        record.installed = false;
        record.in_buildcache = true;
        record.path = None;
        record.ref_count = 0;
    }
    let content = encode_index(&published)?;
    backend.store_index(content.as_bytes(), &digest(content.as_bytes()))?;
    tracing::info!(
        "published {} specs to {}",
        published.len(),
        backend.describe()
    );
    Ok(())
}

impl SpecIndexable for BuildCacheIndex {
    fn lookup<'a>(&'a self, prefix: &HashPrefix) -> EntryIter<'a> {
        let prefix = prefix.clone();
        Box::new(
            std::iter::once_with(move || self.fetch_or_report()).flat_map(move |fetched| {
                match fetched {
                    Ok(records) => records
                        .values()
                        .filter(|r| prefix.is_prefix_of(r.hash()))
                        .map(|r| Ok(IndexEntry::new(r.clone())))
                        .collect::<Vec<_>>(),
                    Err(e) => vec![Err(e)],
                }
            }),
        )
    }

    /// Cached specs are never installed, so install status, explicit and
    /// date filters do not apply here.
    fn query<'a>(&'a self, query: &IndexQuery) -> SpecIter<'a> {
        let query = query.clone();
        Box::new(
            std::iter::once_with(move || self.fetch_or_report()).flat_map(move |fetched| {
                match fetched {
                    Ok(records) => records
                        .values()
                        .filter(|r| {
                            let spec = r.spec.spec();
                            query.identity_matches(spec)
                                && query.arch_matches(spec.arch(), self.host.as_ref())
                        })
                        .map(|r| Ok(r.spec.clone()))
                        .collect::<Vec<_>>(),
                    Err(e) => vec![Err(e)],
                }
            }),
        )
    }

    fn describe(&self) -> String {
        format!("build cache '{}' at {}", self.name, self.backend.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalBackend;
    use spackle_schema::{parse_one_or_raise, ConcreteSpec, InstallRecord};

    fn records(specs: &[&str]) -> Records {
        specs
            .iter()
            .map(|text| {
                let spec = ConcreteSpec::freeze(&parse_one_or_raise(text, None).unwrap()).unwrap();
                let mut record = InstallRecord::new(Arc::clone(&spec));
                record.installed = true;
                (spec.dag_hash().clone(), record)
            })
            .collect()
    }

    fn mirror(specs: &[&str]) -> (tempfile::TempDir, Records) {
        let dir = tempfile::tempdir().unwrap();
        let records = records(specs);
        publish_index(&LocalBackend::new(dir.path()), &records).unwrap();
        (dir, records)
    }

    #[test]
    fn published_index_is_served_as_cached_specs() {
        let (dir, records) = mirror(&["zlib@1.3", "openssl@3.1"]);
        let index = BuildCacheIndex::new("local", Box::new(LocalBackend::new(dir.path())));
        let fetched = index.fetch().unwrap();
        assert_eq!(fetched.len(), 2);
        for record in fetched.values() {
            assert!(!record.installed);
            assert!(record.in_buildcache);
        }

        let hash = records.keys().next().unwrap();
        let prefix = HashPrefix::parse(&hash[..6]).unwrap();
        let hits: Vec<_> = index.lookup(&prefix).collect::<Result<_, _>>().unwrap();
        assert!(hits.iter().any(|e| e.hash() == hash));
    }

    #[test]
    fn tampered_index_fails_hash_check() {
        let (dir, _) = mirror(&["zlib@1.3"]);
        let path = dir.path().join(INDEX_PATH);
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push('\n');
        std::fs::write(&path, text).unwrap();

        let index = BuildCacheIndex::new("local", Box::new(LocalBackend::new(dir.path())));
        assert!(matches!(
            index.fetch(),
            Err(RemoteError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn update_picks_up_republished_index() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        publish_index(&backend, &records(&["zlib@1.3"])).unwrap();

        let index = BuildCacheIndex::new("local", Box::new(LocalBackend::new(dir.path())));
        assert_eq!(index.fetch().unwrap().len(), 1);

        publish_index(&backend, &records(&["zlib@1.3", "bzip2@1.0.8"])).unwrap();
        assert_eq!(index.fetch().unwrap().len(), 1);
        assert_eq!(index.update().unwrap().len(), 2);
    }

    #[test]
    fn query_filters_by_host_architecture() {
        let (dir, _) = mirror(&[
            "zlib@1.3 arch=linux-ubuntu22.04-x86_64",
            "zlib@1.3 arch=linux-ubuntu22.04-aarch64",
        ]);
        let host = ArchSpec::parse_triplet("linux-ubuntu22.04-x86_64");
        let index = BuildCacheIndex::new("local", Box::new(LocalBackend::new(dir.path())))
            .with_host(host);

        let native: Vec<_> = index
            .query(&IndexQuery::new())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(native.len(), 1);
        assert_eq!(
            native[0].spec().arch().target.as_deref(),
            Some("x86_64")
        );

        let all: Vec<_> = index
            .query(&IndexQuery::new().with_all_architectures(true))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn unreachable_mirror_is_a_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let index = BuildCacheIndex::new("empty", Box::new(LocalBackend::new(dir.path())));
        let first = index.query(&IndexQuery::new()).next().unwrap();
        assert!(matches!(first, Err(IndexError::Source(_))));
    }
}
