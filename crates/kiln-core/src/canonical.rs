//! Stable serialization for deterministic hashing
//!
//! Hashing heterogeneous nested config requires a canonical form: object keys
//! sorted recursively at every nesting level, array order preserved.
//! Semantically identical values that were built in different key orders
//! must serialize to the same string.

use crate::ContentHash;
use serde::Serialize;
use serde_json::Value;

/// Serialize a value to its canonical JSON string.
///
/// Keys are sorted recursively; array element order is preserved.
pub fn to_canonical_string<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let json = serde_json::to_value(value)?;
    let mut out = String::new();
    write_canonical(&json, &mut out);
    Ok(out)
}

/// Hash a value's canonical JSON form.
pub fn hash_canonical<T: Serialize>(value: &T) -> serde_json::Result<ContentHash> {
    Ok(ContentHash::from_str(&to_canonical_string(value)?))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Keys come from serde_json and are always serializable.
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => {
            out.push_str(&serde_json::to_string(other).unwrap_or_default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_matter() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(
            to_canonical_string(&a).unwrap(),
            to_canonical_string(&b).unwrap()
        );
        assert_eq!(hash_canonical(&a).unwrap(), hash_canonical(&b).unwrap());
    }

    #[test]
    fn test_nested_sorting_at_every_level() {
        let v = json!({"z": {"b": {"d": 1, "c": 2}, "a": 0}});
        assert_eq!(
            to_canonical_string(&v).unwrap(),
            r#"{"z":{"a":0,"b":{"c":2,"d":1}}}"#
        );
    }

    #[test]
    fn test_array_order_preserved() {
        let a = json!({"list": [3, 1, 2]});
        let b = json!({"list": [1, 2, 3]});
        assert_ne!(
            to_canonical_string(&a).unwrap(),
            to_canonical_string(&b).unwrap()
        );
        assert_eq!(to_canonical_string(&a).unwrap(), r#"{"list":[3,1,2]}"#);
    }

    #[test]
    fn test_objects_inside_arrays_are_sorted() {
        let a = json!([{"b": 1, "a": 2}]);
        let b = json!([{"a": 2, "b": 1}]);
        assert_eq!(
            to_canonical_string(&a).unwrap(),
            to_canonical_string(&b).unwrap()
        );
    }

    #[test]
    fn test_value_change_changes_hash() {
        let a = json!({"prompt": "a knight"});
        let b = json!({"prompt": "a knight "});
        assert_ne!(hash_canonical(&a).unwrap(), hash_canonical(&b).unwrap());
    }

    #[test]
    fn test_scalars() {
        assert_eq!(to_canonical_string(&json!(null)).unwrap(), "null");
        assert_eq!(to_canonical_string(&json!(true)).unwrap(), "true");
        assert_eq!(to_canonical_string(&json!("s")).unwrap(), "\"s\"");
    }
}
