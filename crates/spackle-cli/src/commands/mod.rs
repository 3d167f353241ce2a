pub mod find;
pub mod gc;
pub mod lookup;
pub mod parse;
pub mod verify;

use spackle_core::{Config, IndexCache, IndexLocation, SpecIndex};
use spackle_schema::{ConcretizedSpec, InstallRecord};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_PARSE_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Status word of a record as shown in listings.
pub fn status_label(record: &InstallRecord) -> &'static str {
    if record.installed {
        "installed"
    } else if record.deprecated_for.is_some() {
        "deprecated"
    } else if record.in_buildcache {
        "cached"
    } else {
        "missing"
    }
}

pub fn colorize_status(status: &str) -> String {
    use console::Style;
    match status {
        "installed" => Style::new().green().apply_to(status).to_string(),
        "cached" => Style::new().cyan().apply_to(status).to_string(),
        "missing" => Style::new().yellow().apply_to(status).to_string(),
        "deprecated" => Style::new().dim().apply_to(status).to_string(),
        other => other.to_owned(),
    }
}

pub fn spec_json(spec: &ConcretizedSpec) -> serde_json::Value {
    let concrete = spec.spec();
    serde_json::json!({
        "name": concrete.name(),
        "version": concrete.version().to_string(),
        "hash": concrete.dag_hash().to_string(),
        "spec": concrete.to_string(),
    })
}

pub fn open_index(config: &Config, location: &str) -> Result<SpecIndex, String> {
    let location = location
        .parse::<IndexLocation>()
        .map_err(|e| e.to_string())?;
    tracing::debug!("searching {location} specs");
    IndexCache::new(config)
        .index(location)
        .map_err(|e| e.to_string())
}
