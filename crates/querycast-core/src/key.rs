//! Cache key canonicalization.
//!
//! Two logically identical queries must land in the same cache slot no
//! matter how their parameters were assembled, so parameter objects are
//! rendered as JSON with object keys sorted at every depth.

use serde_json::Value;

/// Delimiter between key parts.
pub const KEY_DELIMITER: char = ':';

/// Build a cache key from a base name and optional parameters.
///
/// Returns `base` unchanged when there are no parameters (`None`, `null`
/// or an empty object).
#[must_use]
pub fn generate_key(base: &str, params: Option<&Value>) -> String {
    match params {
        None | Some(Value::Null) => base.to_string(),
        Some(Value::Object(map)) if map.is_empty() => base.to_string(),
        Some(params) => {
            let mut key = String::with_capacity(base.len() + 32);
            key.push_str(base);
            key.push(KEY_DELIMITER);
            write_canonical(params, &mut key);
            key
        }
    }
}

/// Join key parts with [`KEY_DELIMITER`], e.g. `["post", "1"]` → `post:1`.
pub fn key_from_parts<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut key = String::new();
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            key.push(KEY_DELIMITER);
        }
        key.push_str(part.as_ref());
    }
    key
}

/// Render a JSON value with object keys sorted recursively.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<(&String, &Value)> = map.iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (name, v)) in pairs.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(name.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
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
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Map};

    #[test]
    fn test_generate_key_without_params() {
        assert_eq!(generate_key("feed", None), "feed");
        assert_eq!(generate_key("feed", Some(&Value::Null)), "feed");
        assert_eq!(generate_key("feed", Some(&json!({}))), "feed");
    }

    #[test]
    fn test_generate_key_sorts_params() {
        let key = generate_key("search", Some(&json!({"q": "rust", "limit": 10})));
        assert_eq!(key, r#"search:{"limit":10,"q":"rust"}"#);
    }

    #[test]
    fn test_generate_key_sorts_nested_objects() {
        let a = generate_key("x", Some(&json!({"f": {"b": 1, "a": [{"z": 1, "y": 2}]}})));
        assert_eq!(a, r#"x:{"f":{"a":[{"y":2,"z":1}],"b":1}}"#);
    }

    #[test]
    fn test_generate_key_escapes_strings() {
        let key = generate_key("u", Some(&json!({"name": "a\"b"})));
        assert_eq!(key, r#"u:{"name":"a\"b"}"#);
    }

    #[test]
    fn test_key_from_parts() {
        assert_eq!(key_from_parts(["post", "1"]), "post:1");
        assert_eq!(key_from_parts(vec!["feed".to_string()]), "feed");
        assert_eq!(key_from_parts(Vec::<&str>::new()), "");
    }

    proptest! {
        #[test]
        fn prop_key_independent_of_insertion_order(
            pairs in proptest::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..8)
        ) {
            let forward: Map<String, Value> = pairs
                .iter()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();
            let backward: Map<String, Value> = pairs
                .iter()
                .rev()
                .map(|(k, v)| (k.clone(), json!(v)))
                .collect();

            prop_assert_eq!(
                generate_key("q", Some(&Value::Object(forward))),
                generate_key("q", Some(&Value::Object(backward)))
            );
        }

        #[test]
        fn prop_distinct_params_distinct_keys(a in any::<i64>(), b in any::<i64>()) {
            prop_assume!(a != b);
            prop_assert_ne!(
                generate_key("q", Some(&json!({"page": a}))),
                generate_key("q", Some(&json!({"page": b})))
            );
        }
    }
}
