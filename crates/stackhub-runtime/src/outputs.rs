use std::collections::BTreeMap;

const OUTPUTS_MARKER: &str = "Outputs:";
const KIND_KEY: &str = "kind";
const TIMESTAMP_KEY: &str = "timestamp";
const PROVIDES_KEY: &str = "provides";

/// Parse every `Outputs:` block from a component's stdout.
///
/// A block starts at a line reading exactly `Outputs:` and runs until the
/// first blank line. Lines inside a block that are not `key = value` are
/// ignored. A key seen more than once accumulates into a comma-joined list.
pub fn parse_outputs(stdout: &[u8]) -> BTreeMap<String, String> {
    let text = String::from_utf8_lossy(stdout);
    let mut outputs: BTreeMap<String, String> = BTreeMap::new();
    let mut in_block = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if !in_block {
            in_block = trimmed == OUTPUTS_MARKER;
            continue;
        }
        if trimmed.is_empty() {
            in_block = false;
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        outputs
            .entry(key.to_owned())
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_owned());
    }
    outputs
}

/// Reserved keys a backup implementation reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservedOutputs {
    pub kind: Option<String>,
    pub timestamp: Option<String>,
}

/// Remove the reserved `kind` and `timestamp` keys from `outputs`.
pub fn split_reserved(outputs: &mut BTreeMap<String, String>) -> ReservedOutputs {
    ReservedOutputs {
        kind: outputs.remove(KIND_KEY),
        timestamp: outputs.remove(TIMESTAMP_KEY),
    }
}

/// Remove the `provides` key and return the capabilities it lists.
pub fn take_dynamic_provides(outputs: &mut BTreeMap<String, String>) -> Vec<String> {
    let Some(raw) = outputs.remove(PROVIDES_KEY) else {
        return Vec::new();
    };
    let mut caps: Vec<String> = Vec::new();
    for cap in raw.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        if !caps.iter().any(|c| c == cap) {
            caps.push(cap.to_owned());
        }
    }
    caps
}
