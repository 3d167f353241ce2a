use super::{colorize_status, json_pretty, open_index, spec_json, status_label, EXIT_SUCCESS};
use spackle_core::Config;
use spackle_schema::HashPrefix;

pub fn run(config: &Config, hash: &str, location: &str, json: bool) -> Result<u8, String> {
    let prefix = HashPrefix::parse(hash).map_err(|e| format!("parse error: {e}"))?;
    let index = open_index(config, location)?;
    let entry = index
        .lookup_ensuring_single_match(&prefix)
        .map_err(|e| e.to_string())?;

    let status = status_label(&entry.record);
    if json {
        let mut payload = spec_json(&entry.concretized_spec);
        payload["status"] = serde_json::Value::from(status);
        payload["explicit"] = serde_json::Value::from(entry.record.explicit);
        payload["path"] = serde_json::json!(entry.record.path);
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("{}", entry.concretized_spec.spec().short_spec());
        println!("  hash:   {}", entry.hash());
        println!("  status: {}", colorize_status(status));
        if let Some(path) = &entry.record.path {
            println!("  prefix: {}", path.display());
        }
    }
    Ok(EXIT_SUCCESS)
}
