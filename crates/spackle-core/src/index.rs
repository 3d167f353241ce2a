//! Merged spec index over the install database and mirror build caches.

use spackle_remote::BuildCacheIndex;
use spackle_schema::index::{EntryIter, SpecIter};
use spackle_schema::{
    ConcreteHash, ConcretizedSpec, HashPrefix, IndexEntry, IndexError, IndexQuery, SpecIndexable,
};
use spackle_store::Database;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Ordered merge of spec sources.
///
/// Requests go to every source in order and results are concatenated
/// lazily; by convention the local database comes first, then remote build
/// caches. Build one with a single source to search only that source.
#[derive(Clone, Default)]
pub struct SpecIndex {
    sources: Vec<Arc<dyn SpecIndexable>>,
}

impl SpecIndex {
    pub fn new(sources: Vec<Arc<dyn SpecIndexable>>) -> Self {
        Self { sources }
    }

    pub fn with_local_db(db: Arc<Database>) -> Self {
        Self::new(vec![db as Arc<dyn SpecIndexable>])
    }

    pub fn with_remote_dbs(caches: Vec<Arc<BuildCacheIndex>>) -> Self {
        Self::new(
            caches
                .into_iter()
                .map(|c| c as Arc<dyn SpecIndexable>)
                .collect(),
        )
    }

    pub fn with_local_and_remote_dbs(db: Arc<Database>, caches: Vec<Arc<BuildCacheIndex>>) -> Self {
        let mut index = Self::with_local_db(db);
        index.sources.extend(
            caches
                .into_iter()
                .map(|c| c as Arc<dyn SpecIndexable>),
        );
        index
    }

    pub fn sources(&self) -> &[Arc<dyn SpecIndexable>] {
        &self.sources
    }

    /// The one spec whose hash starts with `prefix`. Entries for the same
    /// complete hash from later sources are dropped in favor of the first.
    pub fn lookup_ensuring_single_match(
        &self,
        prefix: &HashPrefix,
    ) -> Result<IndexEntry, IndexError> {
        let mut seen: HashSet<ConcreteHash> = HashSet::new();
        let mut matches = Vec::new();
        for entry in self.lookup(prefix) {
            let entry = entry?;
            if seen.insert(entry.hash().clone()) {
                matches.push(entry);
            }
        }
        match matches.len() {
            0 => Err(IndexError::NoSuchHash(prefix.to_string())),
            1 => Ok(matches.remove(0)),
            _ => Err(IndexError::AmbiguousHash {
                prefix: prefix.to_string(),
                candidates: matches.into_iter().map(|e| e.concretized_spec).collect(),
            }),
        }
    }

    /// Run `query` once per query spec and group the distinct results by the
    /// query spec, in its canonical string form, that selected them.
    pub fn query_collecting_result_map(
        &self,
        query: &IndexQuery,
    ) -> Result<BTreeMap<String, Vec<ConcretizedSpec>>, IndexError> {
        let specs = query.query_specs().ok_or(IndexError::MissingQuerySpecs)?;
        let mut out = BTreeMap::new();
        for spec in specs {
            let narrowed = query.clone().with_specs(vec![spec.clone()]);
            let mut seen = HashSet::new();
            let mut results = Vec::new();
            for found in self.query(&narrowed) {
                let found = found?;
                if seen.insert(found.spec().dag_hash().clone()) {
                    results.push(found);
                }
            }
            out.insert(spec.to_string(), results);
        }
        Ok(out)
    }
}

impl SpecIndexable for SpecIndex {
    fn lookup<'a>(&'a self, prefix: &HashPrefix) -> EntryIter<'a> {
        let prefix = prefix.clone();
        Box::new(self.sources.iter().flat_map(move |source| {
            tracing::debug!("looking up /{prefix} in {}", source.describe());
            source.lookup(&prefix)
        }))
    }

    fn query<'a>(&'a self, query: &IndexQuery) -> SpecIter<'a> {
        let query = query.clone();
        Box::new(self.sources.iter().flat_map(move |source| {
            tracing::debug!("querying {}", source.describe());
            source.query(&query)
        }))
    }

    fn describe(&self) -> String {
        let names: Vec<String> = self.sources.iter().map(|s| s.describe()).collect();
        format!("[{}]", names.join(", "))
    }
}
