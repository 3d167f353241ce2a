use crate::layout::StoreLayout;
use crate::lock::DbLock;
use crate::{fsync_dir, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spackle_schema::index::{EntryIter, SpecIter};
use spackle_schema::spec::NodeRecord;
use spackle_schema::specfile::{node_map, rebuild_nodes};
use spackle_schema::{
    ConcreteHash, ConcreteSpec, ConcretizedSpec, DepFlag, HashPrefix, IndexEntry, IndexError,
    IndexQuery, InstallRecord, PartialHash, SpecIndexable,
};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Version of the `index.json` document.
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Install records keyed by complete DAG hash.
pub type Records = BTreeMap<ConcreteHash, InstallRecord>;

/// Install metadata as stored on disk; the spec itself lives in `nodes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
    installed: bool,
    ref_count: u32,
    explicit: bool,
    installation_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deprecated_for: Option<ConcreteHash>,
    #[serde(default)]
    in_buildcache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatabaseBody {
    version: u32,
    nodes: BTreeMap<String, NodeRecord>,
    installs: BTreeMap<String, RecordEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexDocument {
    database: DatabaseBody,
    /// blake3 over the serialized `database` body. `None` for hand-written indexes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
}

fn body_checksum(body: &DatabaseBody) -> Result<String, StoreError> {
    let json = serde_json::to_string(body)?;
    Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
}

/// Serialize records into an `index.json` document.
pub fn encode_index(records: &Records) -> Result<String, StoreError> {
    let nodes = node_map(records.values().map(|r| r.spec.spec().as_ref()));
    let installs = records
        .iter()
        .map(|(hash, r)| {
            let entry = RecordEntry {
                path: r.path.clone(),
                installed: r.installed,
                ref_count: r.ref_count,
                explicit: r.explicit,
                installation_time: r.installation_time,
                deprecated_for: r.deprecated_for.clone(),
                in_buildcache: r.in_buildcache,
            };
            (hash.to_string(), entry)
        })
        .collect();
    let database = DatabaseBody {
        version: INDEX_FORMAT_VERSION,
        nodes,
        installs,
    };
    let checksum = Some(body_checksum(&database)?);
    Ok(serde_json::to_string_pretty(&IndexDocument { database, checksum })?)
}

/// Parse an `index.json` document, verifying its checksum and every node hash.
pub fn decode_index(text: &str) -> Result<Records, StoreError> {
    let doc: IndexDocument = serde_json::from_str(text)?;
    if doc.database.version != INDEX_FORMAT_VERSION {
        return Err(StoreError::VersionMismatch {
            expected: INDEX_FORMAT_VERSION,
            found: doc.database.version,
        });
    }
    if let Some(expected) = &doc.checksum {
        let actual = body_checksum(&doc.database)?;
        if actual != *expected {
            return Err(StoreError::IntegrityFailure {
                what: "index.json".to_owned(),
                expected: expected.clone(),
                actual,
            });
        }
    }

    let specs = rebuild_nodes(&doc.database.nodes)?;
    let mut records = Records::new();
    for (hash, entry) in doc.database.installs {
        let spec = specs
            .get(&hash)
            .ok_or_else(|| StoreError::Corrupt(format!("record {hash} has no spec node")))?;
        records.insert(
            spec.dag_hash().clone(),
            InstallRecord {
                spec: ConcretizedSpec::new(Arc::clone(spec)),
                path: entry.path,
                installed: entry.installed,
                ref_count: entry.ref_count,
                explicit: entry.explicit,
                installation_time: entry.installation_time,
                deprecated_for: entry.deprecated_for,
                in_buildcache: entry.in_buildcache,
            },
        );
    }
    Ok(records)
}

/// Reference-counted install records for one install tree.
///
/// Every operation reads the index from disk under a shared lock; mutations
/// hold the lock exclusively and replace the index atomically. A record's
/// `ref_count` is the number of records depending on it over link or run
/// edges, plus the number of records deprecated in its favor.
pub struct Database {
    layout: StoreLayout,
}

impl Database {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    /// Open the database of the install tree at `layout`, creating it if needed.
    pub fn open(layout: StoreLayout) -> Result<Self, StoreError> {
        layout.initialize()?;
        Ok(Self::new(layout))
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn load(&self) -> Result<Records, StoreError> {
        let path = self.layout.index_file();
        if !path.exists() {
            return Ok(Records::new());
        }
        decode_index(&fs::read_to_string(&path)?)
    }

    fn persist(&self, records: &Records) -> Result<(), StoreError> {
        let content = encode_index(records)?;
        let dir = self.layout.db_dir();
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.layout.index_file())
            .map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        Ok(())
    }

    /// Snapshot of all records.
    pub fn records(&self) -> Result<Records, StoreError> {
        let _lock = DbLock::shared(&self.layout.lock_file())?;
        self.load()
    }

    /// Run `f` on the records with the database locked, then write them back.
    pub fn write_transaction<T>(
        &self,
        f: impl FnOnce(&mut Records) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _lock = DbLock::exclusive(&self.layout.lock_file())?;
        let mut records = self.load()?;
        let out = f(&mut records)?;
        self.persist(&records)?;
        Ok(out)
    }

    /// Record `spec` as installed at its layout prefix. Dependencies without
    /// a record are added as implicit, installed only if their prefix exists.
    pub fn add(
        &self,
        spec: &Arc<ConcreteSpec>,
        explicit: bool,
    ) -> Result<InstallRecord, StoreError> {
        self.write_transaction(|records| {
            self.add_node(records, spec, explicit, true);
            tracing::info!("recorded {} as installed", spec.short_spec());
            records
                .get(spec.dag_hash())
                .cloned()
                .ok_or_else(|| StoreError::NoSuchRecord(spec.dag_hash().to_string()))
        })
    }

    fn add_node(
        &self,
        records: &mut Records,
        spec: &Arc<ConcreteSpec>,
        explicit: bool,
        installed: bool,
    ) {
        let prefix = self.layout.prefix_for(spec);
        if let Some(record) = records.get_mut(spec.dag_hash()) {
            if installed && !record.installed {
                record.installed = true;
                record.path = Some(prefix);
                record.installation_time = Utc::now();
            }
            record.explicit |= explicit;
            return;
        }

        for edge in spec.dependencies() {
            let dep_installed = self.layout.prefix_for(&edge.spec).is_dir();
            self.add_node(records, &edge.spec, false, dep_installed);
            if edge.depflag.intersects(DepFlag::LINK_RUN) {
                if let Some(dep) = records.get_mut(edge.spec.dag_hash()) {
                    dep.ref_count += 1;
                }
            }
        }

        let mut record = InstallRecord::new(Arc::clone(spec));
        record.path = Some(prefix);
        record.installed = installed;
        record.explicit = explicit;
        tracing::debug!("adding record {}", spec.name_hash());
        records.insert(spec.dag_hash().clone(), record);
    }

    /// Uninstall `hash`. A record still referenced by dependents stays behind
    /// as missing; otherwise it is dropped and its dependencies released.
    pub fn remove(&self, hash: &ConcreteHash) -> Result<InstallRecord, StoreError> {
        self.write_transaction(|records| {
            let record = records
                .get_mut(hash)
                .ok_or_else(|| StoreError::NoSuchRecord(hash.to_string()))?;
            if record.ref_count > 0 {
                record.installed = false;
                tracing::debug!("{hash} still referenced, keeping record");
                return Ok(record.clone());
            }
            let record = records
                .remove(hash)
                .ok_or_else(|| StoreError::NoSuchRecord(hash.to_string()))?;
            release_references(records, &record);
            Ok(record)
        })
    }

    /// Mark `hash` as deprecated in favor of `replacement`.
    pub fn deprecate(
        &self,
        hash: &ConcreteHash,
        replacement: &ConcreteHash,
    ) -> Result<(), StoreError> {
        self.write_transaction(|records| {
            if !records.contains_key(replacement) {
                return Err(StoreError::NoSuchRecord(replacement.to_string()));
            }
            let record = records
                .get_mut(hash)
                .ok_or_else(|| StoreError::NoSuchRecord(hash.to_string()))?;
            let previous = record.deprecated_for.replace(replacement.clone());
            record.installed = false;
            if let Some(previous) = previous {
                decrement(records, &previous);
            }
            if let Some(target) = records.get_mut(replacement) {
                target.ref_count += 1;
            }
            tracing::info!("deprecated {hash} in favor of {replacement}");
            Ok(())
        })
    }

    /// Records whose hash starts with `prefix`, whatever their install status.
    pub fn get_by_hash_local(&self, prefix: &HashPrefix) -> Result<Vec<InstallRecord>, StoreError> {
        Ok(self
            .records()?
            .into_values()
            .filter(|r| prefix.is_prefix_of(r.hash()))
            .collect())
    }

    /// Records passing every filter of `query`.
    pub fn query_local(&self, query: &IndexQuery) -> Result<Vec<InstallRecord>, StoreError> {
        Ok(self
            .records()?
            .into_values()
            .filter(|r| query.record_matches(r) && query.identity_matches(r.spec.spec()))
            .collect())
    }

    /// Recompute every reference count from the records themselves and
    /// report the ones that disagree as `(hash, recorded, expected)`.
    pub fn verify_ref_counts(&self) -> Result<Vec<(ConcreteHash, u32, u32)>, StoreError> {
        let records = self.records()?;
        let expected = expected_ref_counts(&records);
        Ok(records
            .iter()
            .filter_map(|(hash, r)| {
                let want = expected.get(hash).copied().unwrap_or(0);
                (want != r.ref_count).then(|| (hash.clone(), r.ref_count, want))
            })
            .collect())
    }
}

pub(crate) fn expected_ref_counts(records: &Records) -> BTreeMap<ConcreteHash, u32> {
    let mut counts = BTreeMap::new();
    for record in records.values() {
        for target in references(record) {
            if records.contains_key(&target) {
                *counts.entry(target).or_insert(0) += 1;
            }
        }
    }
    counts
}

/// Hashes a record holds a reference on.
pub(crate) fn references(record: &InstallRecord) -> Vec<ConcreteHash> {
    record
        .spec
        .spec()
        .dependencies()
        .iter()
        .filter(|e| e.depflag.intersects(DepFlag::LINK_RUN))
        .map(|e| e.spec.dag_hash().clone())
        .chain(record.deprecated_for.clone())
        .collect()
}

pub(crate) fn release_references(records: &mut Records, record: &InstallRecord) {
    for target in references(record) {
        decrement(records, &target);
    }
}

/// Drop one reference on `hash`; an uninstalled record that reaches zero
/// is removed and releases its own references in turn.
fn decrement(records: &mut Records, hash: &ConcreteHash) {
    let Some(record) = records.get_mut(hash) else {
        return;
    };
    record.ref_count = record.ref_count.saturating_sub(1);
    if record.ref_count == 0 && !record.installed {
        if let Some(record) = records.remove(hash) {
            tracing::debug!("releasing unreferenced record {}", record.spec);
            release_references(records, &record);
        }
    }
}

fn deferred<'a, T: 'a>(
    load: impl FnOnce() -> Result<Vec<T>, StoreError> + 'a,
) -> Box<dyn Iterator<Item = Result<T, IndexError>> + 'a> {
    Box::new(std::iter::once_with(load).flat_map(|loaded| match loaded {
        Ok(items) => items.into_iter().map(Ok).collect::<Vec<_>>(),
        Err(e) => vec![Err(IndexError::source(e))],
    }))
}

impl SpecIndexable for Database {
    fn lookup<'a>(&'a self, prefix: &HashPrefix) -> EntryIter<'a> {
        let prefix = prefix.clone();
        deferred(move || {
            Ok(self
                .get_by_hash_local(&prefix)?
                .into_iter()
                .map(IndexEntry::new)
                .collect())
        })
    }

    fn query<'a>(&'a self, query: &IndexQuery) -> SpecIter<'a> {
        let query = query.clone();
        deferred(move || {
            Ok(self
                .query_local(&query)?
                .into_iter()
                .map(|r| r.spec)
                .collect())
        })
    }

    fn describe(&self) -> String {
        format!("install database at {}", self.layout.root().display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spackle_schema::{parse_one_or_raise, InstallStatuses};

    fn concrete(text: &str) -> Arc<ConcreteSpec> {
        ConcreteSpec::freeze(&parse_one_or_raise(text, None).unwrap()).unwrap()
    }

    fn setup() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(StoreLayout::new(dir.path())).unwrap();
        (dir, db)
    }

    #[test]
    fn add_records_dependencies_with_ref_counts() {
        let (_dir, db) = setup();
        let hdf5 = concrete("hdf5@1.14 ^zlib@1.3 ^[deptypes=build] cmake@3.27");
        let record = db.add(&hdf5, true).unwrap();
        assert!(record.installed);
        assert!(record.explicit);

        let records = db.records().unwrap();
        assert_eq!(records.len(), 3);
        let zlib = hdf5.find("zlib").unwrap().dag_hash();
        let cmake = hdf5.find("cmake").unwrap().dag_hash();
        assert_eq!(records[zlib].ref_count, 1);
        assert!(!records[zlib].installed);
        assert!(!records[zlib].explicit);
        assert_eq!(records[cmake].ref_count, 0);
        assert!(db.verify_ref_counts().unwrap().is_empty());
    }

    #[test]
    fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let hdf5 = concrete("hdf5@1.14 ^zlib@1.3");
        Database::open(StoreLayout::new(dir.path()))
            .unwrap()
            .add(&hdf5, true)
            .unwrap();
        let db = Database::open(StoreLayout::new(dir.path())).unwrap();
        let records = db.records().unwrap();
        assert_eq!(records[hdf5.dag_hash()].spec.spec().dag_hash(), hdf5.dag_hash());
    }

    #[test]
    fn remove_keeps_referenced_records() {
        let (_dir, db) = setup();
        let hdf5 = concrete("hdf5@1.14 ^zlib@1.3");
        let zlib = hdf5.find("zlib").unwrap().dag_hash().clone();
        db.add(&hdf5, true).unwrap();
        db.add(&Arc::clone(&hdf5.dependencies()[0].spec), true).unwrap();

        let kept = db.remove(&zlib).unwrap();
        assert!(!kept.installed);
        assert_eq!(db.records().unwrap().len(), 2);

        db.remove(hdf5.dag_hash()).unwrap();
        assert!(db.records().unwrap().is_empty());
    }

    #[test]
    fn deprecation_counts_as_reference() {
        let (_dir, db) = setup();
        let old = concrete("zlib@1.2");
        let new = concrete("zlib@1.3");
        db.add(&old, true).unwrap();
        db.add(&new, true).unwrap();
        db.deprecate(old.dag_hash(), new.dag_hash()).unwrap();

        let records = db.records().unwrap();
        assert_eq!(records[new.dag_hash()].ref_count, 1);
        assert_eq!(records[old.dag_hash()].status(), InstallStatuses::DEPRECATED);
        assert!(db.verify_ref_counts().unwrap().is_empty());
    }

    #[test]
    fn tampered_index_fails_checksum() {
        let (_dir, db) = setup();
        db.add(&concrete("zlib@1.3"), true).unwrap();
        let path = db.layout().index_file();
        let text = fs::read_to_string(&path)
            .unwrap()
            .replace("\"explicit\": true", "\"explicit\": false");
        fs::write(&path, text).unwrap();
        assert!(matches!(
            db.records(),
            Err(StoreError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn lookup_and_query_through_the_index_trait() {
        let (_dir, db) = setup();
        let hdf5 = concrete("hdf5@1.14 ^zlib@1.3");
        db.add(&hdf5, true).unwrap();

        let prefix = HashPrefix::parse(&hdf5.dag_hash()[..5]).unwrap();
        let hits: Vec<_> = db.lookup(&prefix).collect::<Result<_, _>>().unwrap();
        assert!(hits.iter().any(|e| e.hash() == hdf5.dag_hash()));

        let installed: Vec<_> = db
            .query(&IndexQuery::new())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(installed.len(), 1);

        let everything: Vec<_> = db
            .query(&IndexQuery::new().with_installed(InstallStatuses::ANY))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(everything.len(), 2);
    }

    #[test]
    fn unreadable_index_surfaces_as_source_error() {
        let (_dir, db) = setup();
        fs::write(db.layout().index_file(), "not json").unwrap();
        let first = db.lookup(&HashPrefix::parse("ab").unwrap()).next().unwrap();
        assert!(matches!(first, Err(IndexError::Source(_))));
    }
}
