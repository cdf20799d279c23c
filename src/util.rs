//! Shared utility functions for the kag-bridge crate.

use serde_json::Value;

/// Recursively drop `null`, `{}` and `[]` values from a JSON document.
///
/// Returns `None` when the value itself is null.
pub fn strip_empty_fields(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => Some(Value::Object(
            map.into_iter()
                .filter_map(|(key, v)| strip_empty_fields(v).filter(is_present).map(|v| (key, v)))
                .collect(),
        )),
        Value::Array(items) => Some(Value::Array(
            items
                .into_iter()
                .filter_map(|v| strip_empty_fields(v).filter(is_present))
                .collect(),
        )),
        other => Some(other),
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Null => false,
        _ => true,
    }
}

/// True when `key` is a non-empty run of ASCII digits.
pub fn is_numeric_id(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit())
}

/// Truncate a string for log output, respecting char boundaries.
pub fn truncate_for_log(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_empty_fields_nested() {
        let input = json!({
            "content": "hi",
            "extra": null,
            "refs": [],
            "meta": {"inner": {}, "keep": 1},
            "list": [null, {}, "x"]
        });
        let stripped = strip_empty_fields(input).unwrap();
        assert_eq!(
            stripped,
            json!({"content": "hi", "meta": {"keep": 1}, "list": ["x"]})
        );
    }

    #[test]
    fn test_strip_empty_fields_null_root() {
        assert_eq!(strip_empty_fields(Value::Null), None);
    }

    #[test]
    fn test_strip_empty_fields_keeps_scalars() {
        assert_eq!(strip_empty_fields(json!(0)), Some(json!(0)));
        assert_eq!(strip_empty_fields(json!("")), Some(json!("")));
        assert_eq!(strip_empty_fields(json!(false)), Some(json!(false)));
    }

    #[test]
    fn test_is_numeric_id() {
        assert!(is_numeric_id("12"));
        assert!(!is_numeric_id("CsQa"));
        assert!(!is_numeric_id(""));
        assert!(!is_numeric_id("-1"));
    }

    #[test]
    fn test_truncate_for_log() {
        assert_eq!(truncate_for_log("short", 10), "short");
        assert_eq!(truncate_for_log("abcdefgh", 3), "abc...");
        assert_eq!(truncate_for_log("知识图谱问答", 2), "知识...");
    }
}
