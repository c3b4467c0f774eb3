//! Tool Runner backends
//!
//! The engine talks to tools only through [`sdk::ToolRunner`]. Two backends
//! ship with it: an HTTP client for a remote runner and an in-process runner
//! backed by closures.

pub mod http;
pub mod memory;

pub use http::HttpToolRunner;
pub use memory::{InMemoryToolRunner, ToolHandler};

use serde_json::Value;

/// Follow a dotted path into a tool result.
///
/// Numeric segments index arrays (`0.id` is the `id` of the first element);
/// an empty path returns the value itself.
pub fn extract_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            Value::Object(map) => map.get(segment),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_first_id() {
        let result = json!([{"id": "f-1"}, {"id": "f-2"}]);
        assert_eq!(extract_path(&result, "0.id"), Some(&json!("f-1")));
        assert_eq!(extract_path(&result, "1.id"), Some(&json!("f-2")));
    }

    #[test]
    fn test_extract_nested_object() {
        let result = json!({"data": {"items": [{"code": 7}]}});
        assert_eq!(extract_path(&result, "data.items.0.code"), Some(&json!(7)));
        assert_eq!(extract_path(&result, ""), Some(&result));
    }

    #[test]
    fn test_extract_missing() {
        let result = json!([]);
        assert_eq!(extract_path(&result, "0.id"), None);
        assert_eq!(extract_path(&json!("text"), "id"), None);
    }
}
