use super::{json_pretty, EXIT_STORE_ERROR, EXIT_SUCCESS};
use spackle_core::{Config, IndexCache};
use spackle_store::verify_store_integrity;

pub fn run(config: &Config, json: bool) -> Result<u8, String> {
    let db = IndexCache::new(config).local_db().map_err(|e| e.to_string())?;
    let report = verify_store_integrity(db.layout()).map_err(|e| format!("store error: {e}"))?;

    if json {
        let failed: Vec<_> = report
            .failed
            .iter()
            .map(|f| serde_json::json!({ "spec": f.hash, "reason": f.reason }))
            .collect();
        let payload = serde_json::json!({
            "checked": report.checked,
            "passed": report.passed,
            "failed": failed,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "database integrity: {}/{} records passed",
            report.passed, report.checked
        );
        for f in &report.failed {
            println!("  FAIL {}: {}", f.hash, f.reason);
        }
    }

    if report.failed.is_empty() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_STORE_ERROR)
    }
}
