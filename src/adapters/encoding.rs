//! Upstream body decoding.
//!
//! Backends declare how their bodies decode (`json`, `xml`, `string`); the
//! decoded form is always a JSON object map so the entity formatter and the
//! merger work on one shape. Collection bodies land under the synthetic
//! `"collection"` key. The `no-op` encoding never reaches this module: the
//! pipeline streams those bodies through untouched.
use bytes::Bytes;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{config::models::Encoding, core::formatter::COLLECTION_KEY};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("Invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid XML body: {0}")]
    Xml(String),

    #[error("Body is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Expected a JSON object at the document root, got {0}")]
    NotAnObject(&'static str),

    #[error("Expected a JSON array for a collection backend, got {0}")]
    NotACollection(&'static str),

    #[error("The no-op encoding carries no decodable body")]
    NoopBody,
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Decode an upstream body into the pipeline's object-map form.
pub fn decode_body(
    encoding: Encoding,
    body: &Bytes,
    is_collection: bool,
) -> Result<Map<String, Value>, DecodeError> {
    match encoding {
        Encoding::Json => {
            let value: Value = serde_json::from_slice(body)?;
            shape(value, is_collection)
        }
        Encoding::Xml => {
            let text = std::str::from_utf8(body)?;
            let value: Value =
                quick_xml::de::from_str(text).map_err(|e| DecodeError::Xml(e.to_string()))?;
            shape(value, is_collection)
        }
        Encoding::String => {
            let text = std::str::from_utf8(body)?;
            let mut map = Map::new();
            map.insert("content".to_string(), Value::String(text.to_string()));
            Ok(map)
        }
        Encoding::Noop => Err(DecodeError::NoopBody),
    }
}

/// Enforce the expected document shape: objects at the root, or arrays
/// wrapped under the collection key.
fn shape(value: Value, is_collection: bool) -> Result<Map<String, Value>, DecodeError> {
    if is_collection {
        match value {
            Value::Array(items) => {
                let mut map = Map::new();
                map.insert(COLLECTION_KEY.to_string(), Value::Array(items));
                Ok(map)
            }
            other => Err(DecodeError::NotACollection(type_name(&other))),
        }
    } else {
        match value {
            Value::Object(map) => Ok(map),
            other => Err(DecodeError::NotAnObject(type_name(&other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_json_object() {
        let body = Bytes::from_static(br#"{"id": 1, "name": "kim"}"#);
        let map = decode_body(Encoding::Json, &body, false).unwrap();
        assert_eq!(Value::Object(map), json!({"id": 1, "name": "kim"}));
    }

    #[test]
    fn wraps_json_collection() {
        let body = Bytes::from_static(br#"[{"id": 1}, {"id": 2}]"#);
        let map = decode_body(Encoding::Json, &body, true).unwrap();
        assert_eq!(
            Value::Object(map),
            json!({"collection": [{"id": 1}, {"id": 2}]})
        );
    }

    #[test]
    fn object_for_collection_backend_is_an_error() {
        let body = Bytes::from_static(br#"{"id": 1}"#);
        assert!(decode_body(Encoding::Json, &body, true).is_err());
    }

    #[test]
    fn array_for_object_backend_is_an_error() {
        let body = Bytes::from_static(br#"[1, 2]"#);
        assert!(decode_body(Encoding::Json, &body, false).is_err());
    }

    #[test]
    fn string_bodies_land_under_content() {
        let body = Bytes::from_static(b"plain text payload");
        let map = decode_body(Encoding::String, &body, false).unwrap();
        assert_eq!(Value::Object(map), json!({"content": "plain text payload"}));
    }

    #[test]
    fn decodes_xml_elements() {
        let body = Bytes::from_static(b"<user><id>1</id><name>kim</name></user>");
        let map = decode_body(Encoding::Xml, &body, false).unwrap();
        assert!(map.contains_key("id"), "decoded: {map:?}");
        assert!(map.contains_key("name"), "decoded: {map:?}");
    }

    #[test]
    fn malformed_json_is_an_error() {
        let body = Bytes::from_static(b"{nope");
        assert!(matches!(
            decode_body(Encoding::Json, &body, false),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn noop_body_is_an_error() {
        let body = Bytes::from_static(b"raw");
        assert!(matches!(
            decode_body(Encoding::Noop, &body, false),
            Err(DecodeError::NoopBody)
        ));
    }
}
