//! # JSON Support
//!
//! Parsing with simd-json, serialization with `serde_json`, and `jsonify`
//! for building JSON responses under the application's JSON settings.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::exceptions::HttpException;
use crate::response::Response;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

fn decode_error(e: &simd_json::Error) -> Error {
    HttpException::bad_request()
        .with_description(format!("Failed to decode JSON object: {e}"))
        .into()
}

/// Decode a request body held as text
///
/// # Errors
///
/// Returns a 400 HTTP error for malformed or mismatched JSON.
pub fn parse_json<T: DeserializeOwned>(json_str: &str) -> Result<T> {
    let mut bytes = json_str.as_bytes().to_vec();
    parse_json_bytes(&mut bytes)
}

/// Decode a request body in place; simd-json mutates the buffer
///
/// # Errors
///
/// Returns a 400 HTTP error for malformed or mismatched JSON.
pub fn parse_json_bytes<T: DeserializeOwned>(bytes: &mut [u8]) -> Result<T> {
    simd_json::from_slice(bytes).map_err(|e| decode_error(&e))
}

/// Compact JSON text
///
/// # Errors
///
/// Returns `Error::Json` for values serde cannot represent.
pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Two-space indented JSON text
///
/// # Errors
///
/// Returns `Error::Json` for values serde cannot represent.
pub fn to_json_pretty<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Recursively order object keys
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Build a JSON response
///
/// Honors `json_sort_keys`, `jsonify_prettyprint_regular` (or debug) and
/// `jsonify_mimetype`.
///
/// # Errors
///
/// Returns `Error::Json` for values serde cannot represent.
pub fn jsonify<T: Serialize>(value: &T, config: &Config) -> Result<Response> {
    let mut value = serde_json::to_value(value)?;
    if config.json_sort_keys {
        value = sort_keys(value);
    }
    let body = if config.jsonify_prettyprint_regular || config.debug {
        to_json_pretty(&value)?
    } else {
        to_json(&value)?
    };
    Ok(Response::new(format!("{body}\n")).with_content_type(&config.jsonify_mimetype))
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Signup {
        user: String,
        #[serde(default)]
        remember: bool,
    }

    #[test]
    fn test_request_body_into_struct() {
        let signup: Signup = parse_json(r#"{"user": "ann", "remember": true}"#).unwrap();
        assert_eq!(signup.user, "ann");
        assert!(signup.remember);

        let mut raw = br#"{"user": "bo"}"#.to_vec();
        let signup: Signup = parse_json_bytes(&mut raw).unwrap();
        assert!(!signup.remember);
    }

    #[test]
    fn test_malformed_body_is_bad_request() {
        let err = parse_json::<Value>("{user: ann}").unwrap_err();
        assert_eq!(err.code(), Some(400));
        let err = parse_json::<Signup>(r#"{"remember": true}"#).unwrap_err();
        assert_eq!(err.code(), Some(400));
    }

    #[test]
    fn test_serializer_keeps_insertion_order() {
        let mut fields = IndexMap::new();
        fields.insert("zeta", 1);
        fields.insert("alpha", 2);
        assert_eq!(to_json(&fields).unwrap(), r#"{"zeta":1,"alpha":2}"#);
    }

    #[test]
    fn test_jsonify_sorts_nested_keys() {
        let config = Config::default();
        let response = jsonify(&json!({"b": {"y": 1, "x": 2}, "a": [{"d": 0, "c": 0}]}), &config)
            .unwrap();
        assert_eq!(response.mimetype(), "application/json");
        assert_eq!(
            response.text_body(),
            Some("{\"a\":[{\"c\":0,\"d\":0}],\"b\":{\"x\":2,\"y\":1}}\n")
        );
    }

    #[test]
    fn test_jsonify_pretty_in_debug() {
        let config = Config {
            debug: true,
            jsonify_mimetype: "application/vnd.api+json".to_string(),
            ..Config::default()
        };
        let response = jsonify(&json!({"a": 1}), &config).unwrap();
        assert_eq!(response.text_body(), Some("{\n  \"a\": 1\n}\n"));
        assert_eq!(response.mimetype(), "application/vnd.api+json");
    }
}
