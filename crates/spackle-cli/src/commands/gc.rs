use super::{json_pretty, EXIT_SUCCESS};
use spackle_core::{Config, IndexCache};
use spackle_store::GarbageCollector;

pub fn run(config: &Config, dry_run: bool, json: bool) -> Result<u8, String> {
    let db = IndexCache::new(config).local_db().map_err(|e| e.to_string())?;
    let report = GarbageCollector::new(&db)
        .collect(dry_run)
        .map_err(|e| format!("store error: {e}"))?;

    if json {
        let payload = serde_json::json!({
            "dry_run": dry_run,
            "orphaned": report.orphaned,
            "removed_records": report.removed_records,
            "removed_prefixes": report.removed_prefixes,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        let prefix = if dry_run { "would remove" } else { "removed" };
        println!(
            "gc: {prefix} {} records, {} prefixes",
            report.removed_records, report.removed_prefixes
        );
        for spec in &report.orphaned {
            println!("  {spec}");
        }
    }
    Ok(EXIT_SUCCESS)
}
