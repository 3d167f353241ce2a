use crate::database::{references, Database, Records};
use crate::StoreError;
use std::fs;

pub struct GarbageCollector<'a> {
    db: &'a Database,
}

#[derive(Debug, Default)]
pub struct GcReport {
    /// `name/hash` of every record that is (or would be) dropped.
    pub orphaned: Vec<String>,
    pub removed_records: usize,
    pub removed_prefixes: usize,
}

/// Drop records nobody references that are not installed, repeating until
/// no new garbage appears.
fn sweep(records: &mut Records, report: &mut GcReport) -> Vec<std::path::PathBuf> {
    let mut prefixes = Vec::new();
    loop {
        let garbage: Vec<_> = records
            .iter()
            .filter(|(_, r)| r.ref_count == 0 && !r.installed)
            .map(|(hash, _)| hash.clone())
            .collect();
        if garbage.is_empty() {
            return prefixes;
        }
        for hash in garbage {
            let Some(record) = records.remove(&hash) else {
                continue;
            };
            for target in references(&record) {
                if let Some(dep) = records.get_mut(&target) {
                    dep.ref_count = dep.ref_count.saturating_sub(1);
                }
            }
            report.orphaned.push(record.spec.to_string());
            prefixes.extend(record.path);
        }
    }
}

impl<'a> GarbageCollector<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn collect(&self, dry_run: bool) -> Result<GcReport, StoreError> {
        let mut report = GcReport::default();
        if dry_run {
            let mut records = self.db.records()?;
            sweep(&mut records, &mut report);
            return Ok(report);
        }

        let prefixes = self.db.write_transaction(|records| Ok(sweep(records, &mut report)))?;
        report.removed_records = report.orphaned.len();
        for prefix in prefixes {
            if prefix.is_dir() {
                fs::remove_dir_all(&prefix)?;
                report.removed_prefixes += 1;
            }
        }
        tracing::info!(
            "gc removed {} records and {} prefixes",
            report.removed_records,
            report.removed_prefixes
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::StoreLayout;
    use spackle_schema::{parse_one_or_raise, ConcreteSpec};
    use std::sync::Arc;

    fn setup() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(StoreLayout::new(dir.path())).unwrap();
        (dir, db)
    }

    fn concrete(text: &str) -> Arc<ConcreteSpec> {
        ConcreteSpec::freeze(&parse_one_or_raise(text, None).unwrap()).unwrap()
    }

    #[test]
    fn gc_removes_unreferenced_missing_records() {
        let (_dir, db) = setup();
        let app = concrete("app@1 ^[deptypes=build] cmake@3.27 ^zlib@1.3");
        db.add(&app, true).unwrap();

        let report = GarbageCollector::new(&db).collect(false).unwrap();
        assert_eq!(report.removed_records, 1);
        assert!(report.orphaned[0].starts_with("cmake/"));

        let records = db.records().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.contains_key(app.find("zlib").unwrap().dag_hash()));
    }

    #[test]
    fn gc_dry_run_does_not_remove() {
        let (_dir, db) = setup();
        db.add(&concrete("app@1 ^[deptypes=build] cmake@3.27"), true)
            .unwrap();

        let report = GarbageCollector::new(&db).collect(true).unwrap();
        assert_eq!(report.orphaned.len(), 1);
        assert_eq!(report.removed_records, 0);
        assert_eq!(db.records().unwrap().len(), 2);
    }

    #[test]
    fn gc_reaches_fixpoint_through_chains() {
        let (_dir, db) = setup();
        let app = concrete("app@1 ^libb@1 ^libc@1");
        db.add(&app, true).unwrap();
        db.write_transaction(|records| {
            records
                .get_mut(app.dag_hash())
                .map(|r| r.installed = false)
                .ok_or_else(|| StoreError::NoSuchRecord(app.dag_hash().to_string()))
        })
        .unwrap();

        let report = GarbageCollector::new(&db).collect(false).unwrap();
        assert_eq!(report.removed_records, 3);
        assert!(db.records().unwrap().is_empty());
    }

    #[test]
    fn gc_preserves_installed_records() {
        let (_dir, db) = setup();
        db.add(&concrete("zlib@1.3"), false).unwrap();
        let report = GarbageCollector::new(&db).collect(false).unwrap();
        assert!(report.orphaned.is_empty());
        assert_eq!(db.records().unwrap().len(), 1);
    }
}
