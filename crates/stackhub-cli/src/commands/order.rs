use super::{describe, json_pretty, EXIT_SUCCESS};
use serde::Serialize;
use stackhub_core::{ensure_lifecycle_order, CoreError};
use stackhub_schema::parse_manifest_file;
use std::path::Path;

#[derive(Serialize)]
struct OrderEntry<'a> {
    name: &'a str,
    mandatory: bool,
    depends: &'a [String],
}

/// Print the lifecycle order without running anything.
pub fn run(manifest_path: &Path, json: bool) -> Result<u8, String> {
    let mut manifest =
        parse_manifest_file(manifest_path).map_err(|e| describe(&CoreError::from(e)))?;
    manifest
        .validate()
        .map_err(|e| describe(&CoreError::from(e)))?;
    let order = ensure_lifecycle_order(&mut manifest)
        .map_err(|e| describe(&e))?
        .to_vec();

    let entries: Vec<OrderEntry<'_>> = order
        .iter()
        .filter_map(|name| {
            manifest.component(name).map(|c| OrderEntry {
                name,
                mandatory: manifest.is_mandatory(name),
                depends: &c.depends,
            })
        })
        .collect();

    if json {
        println!("{}", json_pretty(&entries)?);
    } else {
        for (i, entry) in entries.iter().enumerate() {
            let marker = if entry.mandatory { " " } else { "?" };
            if entry.depends.is_empty() {
                println!("{:>3}{marker} {}", i + 1, entry.name);
            } else {
                println!(
                    "{:>3}{marker} {} (after {})",
                    i + 1,
                    entry.name,
                    entry.depends.join(", ")
                );
            }
        }
    }
    Ok(EXIT_SUCCESS)
}
