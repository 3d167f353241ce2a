use super::{json_pretty, EXIT_SUCCESS};
use spackle_schema::SpecParser;

pub fn run(args: &[String], tokens: bool, json: bool) -> Result<u8, String> {
    let text = args.join(" ");
    let parser = SpecParser::new(&text).map_err(|e| format!("parse error: {e}"))?;

    if tokens {
        let tokens = parser.tokens().map_err(|e| format!("parse error: {e}"))?;
        if json {
            let payload: Vec<_> = tokens
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "kind": t.kind.to_string(),
                        "text": t.text,
                        "start": t.start,
                        "end": t.end,
                    })
                })
                .collect();
            println!("{}", json_pretty(&payload)?);
        } else {
            for token in &tokens {
                let kind = token.kind.to_string();
                println!("{kind:<28} {}", token.text);
            }
        }
        return Ok(EXIT_SUCCESS);
    }

    let specs = parser
        .all_specs()
        .map_err(|e| format!("parse error: {e}"))?;
    tracing::debug!("parsed {} specs", specs.len());
    if json {
        let payload: Vec<String> = specs.iter().map(ToString::to_string).collect();
        println!("{}", json_pretty(&payload)?);
    } else {
        for spec in &specs {
            println!("{spec}");
        }
    }
    Ok(EXIT_SUCCESS)
}
