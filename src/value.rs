//! The parameter accessor: resolves a dotted path against a heterogeneous
//! JSON-shaped document. `serde_json::Value` already is the tagged union
//! {Null, Bool, Number, String, Array, Object} the rest of this crate needs,
//! arbitrary-precision numbers included, so we operate on it directly rather
//! than introducing a parallel enum.

use serde_json::Value;

/// Exact-key match takes priority over dot-splitting, so a literal key like
/// `"commits.0.commit-id"` resolves before `commits` is ever split off.
pub fn get<'a>(path: &str, doc: &'a Value) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(doc);
    }
    match doc {
        Value::Object(map) => {
            if let Some(v) = map.get(path) {
                return Some(v);
            }
            let (head, tail) = split_head(path);
            get(tail, map.get(head)?)
        }
        Value::Array(arr) => {
            let (head, tail) = split_head(path);
            let index: usize = head.parse().ok()?;
            get(tail, arr.get(index)?)
        }
        _ => None,
    }
}

/// Like `get`, but renders arrays/objects as canonical JSON and scalars in
/// their natural textual form (no surrounding quotes on strings).
pub fn get_as_string(path: &str, doc: &Value) -> Option<String> {
    get(path, doc).map(render_scalar_or_json)
}

fn render_scalar_or_json(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Walks the same way as `get` but mutates the leaf in place. Returns
/// whether the path resolved to an existing slot.
pub fn replace(path: &str, doc: &mut Value, new_value: Value) -> bool {
    if path.is_empty() {
        *doc = new_value;
        return true;
    }
    match doc {
        Value::Object(map) => {
            if map.contains_key(path) {
                map.insert(path.to_string(), new_value);
                return true;
            }
            let (head, tail) = split_head(path);
            match map.get_mut(head) {
                Some(next) => replace(tail, next, new_value),
                None => false,
            }
        }
        Value::Array(arr) => {
            let (head, tail) = split_head(path);
            match head.parse::<usize>().ok().and_then(|i| arr.get_mut(i)) {
                Some(next) => replace(tail, next, new_value),
                None => false,
            }
        }
        _ => false,
    }
}

fn split_head(path: &str) -> (&str, &str) {
    match path.split_once('.') {
        Some((head, tail)) => (head, tail),
        None => (path, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exact_key_beats_dotted_descent() {
        let doc = json!({
            "commits.0.commit-id": "exact",
            "commits": [{"commit-id": "nested"}],
        });
        assert_eq!(
            get_as_string("commits.0.commit-id", &doc).as_deref(),
            Some("exact")
        );
    }

    #[test]
    fn dotted_descent_through_array_index() {
        let doc = json!({"commits": [{"commit-id": "abc123"}]});
        assert_eq!(
            get_as_string("commits.0.commit-id", &doc).as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn negative_or_non_integer_index_is_not_found() {
        let doc = json!({"items": [1, 2, 3]});
        assert!(get("items.-1", &doc).is_none());
        assert!(get("items.abc", &doc).is_none());
        assert!(get("items.99", &doc).is_none());
    }

    #[test]
    fn missing_key_is_not_found() {
        let doc = json!({"a": 1});
        assert!(get("b", &doc).is_none());
        assert!(get("a.b", &doc).is_none());
    }

    #[test]
    fn path_on_scalar_is_not_found() {
        let doc = json!({"a": 1});
        assert!(get("a.b", &doc).is_none());
    }

    #[test]
    fn replace_round_trips_through_get() {
        let mut doc = json!({"payload": "not yet decoded"});
        let decoded = json!({"nested": {"value": 42}});
        assert!(replace("payload", &mut doc, decoded.clone()));
        assert_eq!(get("payload.nested.value", &doc), Some(&json!(42)));
    }

    #[test]
    fn replace_on_missing_path_is_noop() {
        let mut doc = json!({"a": 1});
        assert!(!replace("b.c", &mut doc, json!(5)));
        assert_eq!(doc, json!({"a": 1}));
    }
}
