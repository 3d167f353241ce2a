use spackle_core::{Config, CoreError, IndexCache, IndexLocation, SpecIndex};
use spackle_remote::{publish_index, LocalBackend, MirrorConfig};
use spackle_schema::{
    parse_one_or_raise, ConcreteSpec, HashPrefix, IndexError, IndexQuery, InstallRecord,
    InstallStatuses, SpecIndexable,
};
use spackle_store::{Database, Records};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

fn concrete(text: &str) -> Arc<ConcreteSpec> {
    ConcreteSpec::freeze(&parse_one_or_raise(text, None).unwrap()).unwrap()
}

/// Two specs whose hashes share their first two characters.
fn colliding_pair() -> (Arc<ConcreteSpec>, Arc<ConcreteSpec>) {
    let mut by_prefix: HashMap<String, Arc<ConcreteSpec>> = HashMap::new();
    for minor in 0.. {
        let spec = concrete(&format!("pkg@1.{minor}"));
        let head = spec.dag_hash().to_string()[..2].to_owned();
        if let Some(other) = by_prefix.get(&head) {
            return (Arc::clone(other), spec);
        }
        by_prefix.insert(head, spec);
    }
    unreachable!()
}

fn publish(dir: &Path, specs: &[&Arc<ConcreteSpec>]) {
    let records: Records = specs
        .iter()
        .map(|s| (s.dag_hash().clone(), InstallRecord::new(Arc::clone(s))))
        .collect();
    publish_index(&LocalBackend::new(dir), &records).unwrap();
}

struct Setup {
    _dir: tempfile::TempDir,
    cache: IndexCache,
    db: Arc<Database>,
}

/// `local` installed in the database, `remote` published to one mirror.
fn setup(local: &[&Arc<ConcreteSpec>], remote: &[&Arc<ConcreteSpec>]) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let mirror = dir.path().join("mirror");
    publish(&mirror, remote);

    let config = Config {
        install_tree: dir.path().join("opt"),
        mirrors: vec![MirrorConfig::new("mirror", mirror.to_str().unwrap())],
        host: None,
    };
    let cache = IndexCache::new(&config);
    let db = cache.local_db().unwrap();
    for spec in local {
        db.add(spec, true).unwrap();
    }
    Setup {
        _dir: dir,
        cache,
        db,
    }
}

#[test]
fn shared_prefix_across_local_and_remote_is_ambiguous() {
    let (a, b) = colliding_pair();
    let s = setup(&[&a], &[&b]);
    let index = s.cache.index(IndexLocation::LocalAndRemote).unwrap();

    let head = HashPrefix::parse(&a.dag_hash().to_string()[..2]).unwrap();
    match index.lookup_ensuring_single_match(&head) {
        Err(IndexError::AmbiguousHash { candidates, .. }) => {
            assert_eq!(candidates.len(), 2);
            let err = IndexError::AmbiguousHash {
                prefix: head.to_string(),
                candidates,
            };
            assert!(err.to_string().contains("pkg"));
        }
        other => panic!("expected an ambiguous match, got {other:?}"),
    }

    let local_only = s.cache.index(IndexLocation::Local).unwrap();
    let entry = local_only.lookup_ensuring_single_match(&head).unwrap();
    assert_eq!(entry.hash(), a.dag_hash());
}

#[test]
fn complete_hash_finds_one_spec() {
    let (a, b) = colliding_pair();
    let s = setup(&[&a], &[&b]);
    let index = s.cache.index(IndexLocation::LocalAndRemote).unwrap();

    let entry = index
        .lookup_ensuring_single_match(&b.dag_hash().to_prefix())
        .unwrap();
    assert_eq!(entry.hash(), b.dag_hash());
    assert!(!entry.record.installed);
    assert!(entry.record.in_buildcache);
}

#[test]
fn unknown_prefix_is_no_such_hash() {
    let (a, b) = colliding_pair();
    let s = setup(&[&a], &[&b]);
    let index = s.cache.index(IndexLocation::LocalAndRemote).unwrap();

    let unused = ["ffff", "0000"]
        .into_iter()
        .find(|p| {
            !a.dag_hash().to_string().starts_with(p) && !b.dag_hash().to_string().starts_with(p)
        })
        .unwrap();
    assert!(matches!(
        index.lookup_ensuring_single_match(&HashPrefix::parse(unused).unwrap()),
        Err(IndexError::NoSuchHash(_))
    ));
}

#[test]
fn installed_and_cached_spec_resolves_to_local_record() {
    let zlib = concrete("zlib@1.3");
    let s = setup(&[&zlib], &[&zlib]);
    let index = s.cache.index(IndexLocation::LocalAndRemote).unwrap();

    let prefix = zlib.dag_hash().to_prefix();
    assert_eq!(index.lookup(&prefix).count(), 2);
    let entry = index.lookup_ensuring_single_match(&prefix).unwrap();
    assert!(entry.record.installed);
    assert!(entry.record.explicit);
}

#[test]
fn query_merges_installed_and_cached_specs() {
    let zlib = concrete("zlib@1.3");
    let hdf5 = concrete("hdf5@1.14 ^zlib@1.3");
    let openssl = concrete("openssl@3.1");
    let s = setup(&[&hdf5], &[&zlib, &openssl]);
    let index = s.cache.index(IndexLocation::LocalAndRemote).unwrap();

    let query = IndexQuery::new()
        .with_specs(vec![
            parse_one_or_raise("zlib", None).unwrap(),
            parse_one_or_raise("openssl", None).unwrap(),
        ])
        .with_installed(InstallStatuses::ANY);
    let map = index.query_collecting_result_map(&query).unwrap();
    assert_eq!(map["zlib"].len(), 1);
    assert_eq!(map["openssl"].len(), 1);

    let local = SpecIndex::with_local_db(Arc::clone(&s.db));
    let map = local.query_collecting_result_map(&query).unwrap();
    assert_eq!(map["zlib"].len(), 1);
    assert!(map["openssl"].is_empty());
}

#[test]
fn broken_mirror_surfaces_as_index_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        install_tree: dir.path().join("opt"),
        mirrors: vec![MirrorConfig::new(
            "empty",
            dir.path().join("nothing").to_str().unwrap(),
        )],
        host: None,
    };
    let cache = IndexCache::new(&config);
    let index = cache.index(IndexLocation::Remote).unwrap();
    let err = index
        .lookup_ensuring_single_match(&HashPrefix::parse("ab").unwrap())
        .unwrap_err();
    assert!(matches!(err, IndexError::Source(_)));
    assert!(matches!(CoreError::from(err), CoreError::Index(_)));
}
