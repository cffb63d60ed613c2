//! Content Hasher
//!
//! Deterministic hash over a canonical JSON form, used to key the per-stage
//! LLM cache and the hot enrichment cache. Canonical form: object keys
//! sorted recursively, compact separators, and whitespace runs inside
//! string scalars collapsed to a single space. Two values that differ only
//! in key order or in string whitespace hash identically.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value into its canonical form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// SHA-256 hex digest of the canonical form.
pub fn content_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// Short hash for human-readable cache keys (first 8 hex chars).
pub fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())[..8].to_string()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            let normalized = normalize_whitespace(s);
            out.push_str(&serde_json::to_string(&normalized).expect("string serialization"));
        },
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        },
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("key serialization"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        },
    }
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_invariant_under_key_reordering() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":{"x":true,"y":[1,2]}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":{"y":[1,2],"x":true},"a":1}"#).unwrap();
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_hash_invariant_under_string_whitespace() {
        let a = json!({"description": "a  fast\n company"});
        let b = json!({"description": " a fast company "});
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_distinct_values_hash_differently() {
        let a = json!({"company": "TechStart"});
        let b = json!({"company": "TechStar"});
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        let original = json!({
            "company": "TechStart",
            "metrics": {"growth": 0.15, "customers": 1200},
            "tags": ["saas", "b2b"],
            "active": true,
            "parent": null
        });

        let serialized = serde_json::to_string(&original).unwrap();
        let reparsed: Value = serde_json::from_str(&serialized).unwrap();
        assert_eq!(content_hash(&original), content_hash(&reparsed));
    }

    #[test]
    fn test_canonical_form_is_compact_and_sorted() {
        let v: Value = serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap();
        assert_eq!(canonical_json(&v), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn test_short_hash_is_stable() {
        assert_eq!(short_hash("techstart.com.br"), short_hash("techstart.com.br"));
        assert_eq!(short_hash("techstart.com.br").len(), 8);
    }
}
