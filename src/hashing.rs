//! Hashing System - SHA-256 Content Addressing
//!
//! Deterministic hashes for render cache keys, rendered output and polygon
//! identities.

use sha2::{Sha256, Digest};
use serde::Serialize;
use serde_json::{Value, to_string};

use crate::payload::TaskType;
use crate::store::DependencyEpoch;

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    let sorted = sort_value(&v);
    to_string(&sorted)
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let sorted_map: serde_json::Map<String, Value> = sorted
                .into_iter()
                .map(|(k, v)| (k.clone(), sort_value(v)))
                .collect();
            Value::Object(sorted_map)
        }
        Value::Array(arr) => {
            Value::Array(arr.iter().map(sort_value).collect())
        }
        _ => v.clone()
    }
}

/// Hash of any serializable content in canonical form
pub fn compute_content_hash<T: Serialize>(content: &T) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(content)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Render cache key
/// cache_key = sha256(task_type + canonical_payload + dependency_epoch + engine_version)
pub fn compute_cache_key(
    task_type: TaskType,
    payload: &impl Serialize,
    epoch: DependencyEpoch,
    engine_version: &str,
) -> Result<String, serde_json::Error> {
    let canonical_payload = canonical_json(payload)?;
    let combined = format!(
        "{}:{}:{}:{}",
        task_type, canonical_payload, epoch, engine_version
    );
    Ok(sha256_hex(combined.as_bytes()))
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorted() {
        let obj = json!({"z": 1, "a": 2, "m": {"y": 1, "b": 2}});
        let canonical = canonical_json(&obj).unwrap();
        assert_eq!(canonical, r#"{"a":2,"m":{"b":2,"y":1},"z":1}"#);
    }

    #[test]
    fn test_hash_deterministic() {
        let data = b"test data";
        assert_eq!(sha256_hex(data), sha256_hex(data));
        assert_eq!(sha256_hex(data).len(), 64);
    }

    #[test]
    fn test_cache_key_inputs() {
        let payload = json!({"code": "zoom(3)"});
        let k1 = compute_cache_key(TaskType::FromSource, &payload, DependencyEpoch(1), "1.0.0").unwrap();
        let k2 = compute_cache_key(TaskType::FromSource, &payload, DependencyEpoch(1), "1.0.0").unwrap();
        assert_eq!(k1, k2);

        let later = compute_cache_key(TaskType::FromSource, &payload, DependencyEpoch(2), "1.0.0").unwrap();
        assert_ne!(k1, later);
        let other_task =
            compute_cache_key(TaskType::FromBuilderIr, &payload, DependencyEpoch(1), "1.0.0").unwrap();
        assert_ne!(k1, other_task);
    }
}
