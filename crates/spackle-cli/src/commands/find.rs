use super::{json_pretty, open_index, spec_json, EXIT_SUCCESS};
use spackle_core::Config;
use spackle_schema::{parse, ConcretizedSpec, IndexQuery, InstallStatuses, SpecIndexable};
use std::collections::HashSet;

pub struct FindArgs<'a> {
    pub specs: &'a [String],
    pub installed: &'a str,
    pub explicit: Option<bool>,
    pub all_architectures: bool,
    pub location: &'a str,
}

fn sorted(mut specs: Vec<ConcretizedSpec>) -> Vec<ConcretizedSpec> {
    specs.sort_by(|a, b| {
        let (a, b) = (a.spec(), b.spec());
        (a.name(), a.version(), a.dag_hash()).cmp(&(b.name(), b.version(), b.dag_hash()))
    });
    specs
}

fn print_rows(specs: &[ConcretizedSpec]) {
    for spec in specs {
        let concrete = spec.spec();
        println!("{:<40} {}", concrete.short_spec(), concrete.arch());
    }
}

pub fn run(config: &Config, args: &FindArgs<'_>, json: bool) -> Result<u8, String> {
    let statuses = InstallStatuses::parse(args.installed).map_err(|e| format!("parse error: {e}"))?;
    let mut query = IndexQuery::new()
        .with_installed(statuses)
        .with_all_architectures(args.all_architectures);
    if let Some(explicit) = args.explicit {
        query = query.with_explicit(explicit);
    }
    let index = open_index(config, args.location)?;

    if args.specs.is_empty() {
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for spec in index.query(&query) {
            let spec = spec.map_err(|e| e.to_string())?;
            if seen.insert(spec.spec().dag_hash().clone()) {
                found.push(spec);
            }
        }
        let found = sorted(found);
        if json {
            let payload: Vec<_> = found.iter().map(spec_json).collect();
            println!("{}", json_pretty(&payload)?);
        } else if found.is_empty() {
            println!("no specs found");
        } else {
            print_rows(&found);
        }
        return Ok(EXIT_SUCCESS);
    }

    let specs = parse(&args.specs.join(" ")).map_err(|e| format!("parse error: {e}"))?;
    let results = index
        .query_collecting_result_map(&query.with_specs(specs))
        .map_err(|e| e.to_string())?;

    if json {
        let payload: serde_json::Map<String, serde_json::Value> = results
            .into_iter()
            .map(|(query, found)| {
                let rows: Vec<_> = sorted(found).iter().map(spec_json).collect();
                (query, serde_json::Value::from(rows))
            })
            .collect();
        println!("{}", json_pretty(&payload)?);
    } else {
        for (query, found) in results {
            println!("==> {query}: {} found", found.len());
            print_rows(&sorted(found));
        }
    }
    Ok(EXIT_SUCCESS)
}
