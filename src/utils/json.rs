use serde_json::{Map, Value};

/// Returns the first non-null value among `paths`. A path may use dots to
/// descend into nested objects (`"employer.name"`).
pub fn lookup<'a>(value: &'a Value, paths: &[&str]) -> Option<&'a Value> {
    paths
        .iter()
        .filter_map(|path| lookup_path(value, path))
        .find(|found| !found.is_null())
}

fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
}

/// Like [`lookup`] but only yields non-empty trimmed text. Numbers are
/// rendered so identifiers such as account numbers survive either encoding.
pub fn lookup_str(value: &Value, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|path| {
        let text = match lookup_path(value, path)? {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    })
}

pub fn lookup_array<'a>(value: &'a Value, paths: &[&str]) -> Option<&'a Vec<Value>> {
    paths
        .iter()
        .find_map(|path| lookup_path(value, path).and_then(Value::as_array))
}

/// Recursively sorts object keys so logically equal payloads serialize to the
/// same bytes regardless of the order the provider emitted them in.
pub fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonical_json(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn lookup_walks_aliases_and_dotted_paths() {
        let payload = json!({ "employer": { "name": "Acme" }, "pay_date": null, "payDate": "2024-01-31" });
        assert_eq!(lookup_str(&payload, &["employer.name"]).as_deref(), Some("Acme"));
        assert_eq!(
            lookup(&payload, &["pay_date", "payDate"]),
            Some(&json!("2024-01-31"))
        );
        assert_eq!(lookup(&payload, &["missing"]), None);
    }

    #[test]
    fn lookup_str_skips_blank_and_renders_numbers() {
        let payload = json!({ "a": "  ", "b": 12345678 });
        assert_eq!(lookup_str(&payload, &["a", "b"]).as_deref(), Some("12345678"));
    }

    #[test]
    fn canonical_json_ignores_key_order() {
        let left = json!({ "b": 1, "a": { "y": [ { "d": 1, "c": 2 } ], "x": null } });
        let right = json!({ "a": { "x": null, "y": [ { "c": 2, "d": 1 } ] }, "b": 1 });
        assert_eq!(
            serde_json::to_string(&canonical_json(&left)).unwrap(),
            serde_json::to_string(&canonical_json(&right)).unwrap()
        );
    }
}
