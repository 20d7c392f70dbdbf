//! Canonical JSON encoding for fingerprints and error capture.
//!
//! [`stable_string`] is the deduplication contract: two values with the
//! same content produce the same string regardless of object key order.
//! Any change to the key sort, depth cap, or sentinel encoding is a
//! behavior change for every dedupe cache keyed on its output.

use serde_json::Value;

/// Sentinel substituted for containers nested past the depth cap.
pub const MAX_DEPTH_SENTINEL: &str = "[MaxDepth]";

/// Sentinel rendered for absent optional fields (a record with no `data`
/// is not the same record as one whose `data` is JSON null).
pub const UNDEFINED_SENTINEL: &str = "[Undefined]";

/// Serializes `value` canonically: object keys sorted lexicographically,
/// containers nested deeper than `max_depth` replaced by the literal
/// string [`MAX_DEPTH_SENTINEL`].
///
/// Scalars always render; only objects and arrays count toward depth.
///
/// # Examples
///
/// ```
/// use beacon::util::json::stable_string;
/// use serde_json::json;
///
/// let a = stable_string(&json!({"b": 1, "a": 2}), 10);
/// let b = stable_string(&json!({"a": 2, "b": 1}), 10);
/// assert_eq!(a, b);
/// assert_eq!(a, r#"{"a":2,"b":1}"#);
/// ```
pub fn stable_string(value: &Value, max_depth: usize) -> String {
    let mut out = String::new();
    write_stable(&mut out, value, 0, max_depth);
    out
}

fn write_stable(out: &mut String, value: &Value, depth: usize, max_depth: usize) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            // serde_json handles escaping; scalars cannot fail to serialize.
            out.push_str(&serde_json::to_string(value).unwrap_or_default());
        }
        Value::Array(_) | Value::Object(_) if depth >= max_depth => {
            out.push('"');
            out.push_str(MAX_DEPTH_SENTINEL);
            out.push('"');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable(out, item, depth + 1, max_depth);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_stable(out, &map[key.as_str()], depth + 1, max_depth);
            }
            out.push('}');
        }
    }
}

/// Captures an error as a JSON value for the `err` slot of a log record:
/// the concrete type name, the display message, and the source chain.
///
/// # Examples
///
/// ```
/// use beacon::util::json::error_value;
///
/// let err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
/// let value = error_value(&err);
/// assert_eq!(value["message"], "missing");
/// assert!(value["$error"].as_str().unwrap().contains("io::error"));
/// ```
pub fn error_value<E: std::error::Error>(err: &E) -> Value {
    let mut chain = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(Value::String(cause.to_string()));
        source = cause.source();
    }

    let mut map = serde_json::Map::new();
    map.insert(
        "$error".to_owned(),
        Value::String(std::any::type_name::<E>().to_owned()),
    );
    map.insert("message".to_owned(), Value::String(err.to_string()));
    if !chain.is_empty() {
        map.insert("chain".to_owned(), Value::Array(chain));
    }
    Value::Object(map)
}
