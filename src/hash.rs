// Deterministic fingerprints. Used both as cache keys and as change
// detectors, so the input must be canonicalized before hashing.

use serde_json::Value;

/// Short hex fingerprint of a byte string.
pub fn fingerprint(bytes: impl AsRef<[u8]>) -> String {
    blake3::hash(bytes.as_ref()).to_hex()[..16].to_string()
}

/// Fingerprint of a JSON value with object keys sorted at every level.
pub fn fingerprint_json(value: &Value) -> String {
    fingerprint(canonical_string(value))
}

fn canonical_string(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap(),
                        canonical_string(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_string).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}
