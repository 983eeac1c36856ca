//! Path extraction over nested payload documents
//!
//! A path is a dot-separated list of object keys (`form.child.age`). Extraction
//! never fails: a missing key, or a non-object node met before the last
//! segment, yields `None`. Multi-path extraction walks a fallback chain and
//! returns the first present, non-null value, which is how fields that moved
//! between payload versions are read.

use crate::types::FieldValue;
use serde_json::Value;

/// Split a path into its segments
pub fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('.')
}

/// Extract the node at `path`. A JSON `null` leaf is returned as-is.
pub fn extract<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }

    let mut current = document;
    for segment in split_path(path) {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

/// First present, non-null node along a fallback chain of paths
pub fn extract_multi<'a, S: AsRef<str>>(document: &'a Value, paths: &[S]) -> Option<&'a Value> {
    paths
        .iter()
        .filter_map(|path| extract(document, path.as_ref()))
        .find(|value| !value.is_null())
}

/// Extract and convert to a [`FieldValue`] in one step
pub fn extract_value<S: AsRef<str>>(document: &Value, paths: &[S]) -> Option<FieldValue> {
    extract_multi(document, paths).and_then(FieldValue::from_json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "form": {
                "age": 12,
                "child": {"muac": "11.2", "name": null},
                "tags": ["a", "b"],
                "label": "text"
            }
        })
    }

    #[test]
    fn test_extract_nested() {
        let d = doc();
        assert_eq!(extract(&d, "form.age"), Some(&json!(12)));
        assert_eq!(extract(&d, "form.child.muac"), Some(&json!("11.2")));
    }

    #[test]
    fn test_extract_missing_segment() {
        let d = doc();
        assert_eq!(extract(&d, "form.weight"), None);
        assert_eq!(extract(&d, "other.age"), None);
    }

    #[test]
    fn test_extract_through_non_container() {
        let d = doc();
        assert_eq!(extract(&d, "form.label.inner"), None);
        assert_eq!(extract(&d, "form.tags.0"), None);
    }

    #[test]
    fn test_extract_null_leaf_is_present() {
        let d = doc();
        assert_eq!(extract(&d, "form.child.name"), Some(&Value::Null));
    }

    #[test]
    fn test_extract_empty_path() {
        assert_eq!(extract(&doc(), ""), None);
    }

    #[test]
    fn test_extract_multi_fallback() {
        let d = json!({"a": {"c": 7}});
        assert_eq!(extract_multi(&d, &["a.b", "a.c"]), Some(&json!(7)));
        assert_eq!(extract_multi(&d, &["a.b", "a.d"]), None);
    }

    #[test]
    fn test_extract_multi_skips_null() {
        let d = json!({"a": {"b": null, "c": "x"}});
        assert_eq!(extract_multi(&d, &["a.b", "a.c"]), Some(&json!("x")));
    }

    #[test]
    fn test_extract_multi_prefers_first_path() {
        let d = json!({"a": {"b": 1, "c": 2}});
        assert_eq!(extract_value(&d, &["a.b", "a.c"]), Some(FieldValue::Integer(1)));
    }
}
