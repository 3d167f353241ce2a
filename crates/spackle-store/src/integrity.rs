use crate::database::Database;
use crate::layout::StoreLayout;
use crate::StoreError;

#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub checked: usize,
    pub passed: usize,
    pub failed: Vec<IntegrityFailure>,
}

#[derive(Debug)]
pub struct IntegrityFailure {
    pub hash: String,
    pub reason: String,
}

/// Check the index checksum and node hashes, every reference count, and
/// that each installed record's prefix exists.
pub fn verify_store_integrity(layout: &StoreLayout) -> Result<IntegrityReport, StoreError> {
    let db = Database::new(layout.clone());
    let mut report = IntegrityReport::default();

    let records = match db.records() {
        Ok(records) => records,
        Err(
            e @ (StoreError::IntegrityFailure { .. }
            | StoreError::SpecFile(_)
            | StoreError::Corrupt(_)),
        ) => {
            report.checked = 1;
            report.failed.push(IntegrityFailure {
                hash: "index.json".to_owned(),
                reason: e.to_string(),
            });
            return Ok(report);
        }
        Err(e) => return Err(e),
    };

    let mismatches = db.verify_ref_counts()?;
    report.checked = records.len();
    for (hash, record) in &records {
        let mut reasons = Vec::new();
        if let Some((_, recorded, expected)) = mismatches.iter().find(|(h, _, _)| h == hash) {
            reasons.push(format!("ref_count is {recorded}, dependents account for {expected}"));
        }
        if record.installed && !record.path.as_ref().is_some_and(|p| p.is_dir()) {
            reasons.push("installed prefix is missing".to_owned());
        }
        if reasons.is_empty() {
            report.passed += 1;
        } else {
            report.failed.push(IntegrityFailure {
                hash: record.spec.to_string(),
                reason: reasons.join("; "),
            });
        }
    }

    Ok(report)
}
