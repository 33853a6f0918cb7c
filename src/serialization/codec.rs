//! Bidirectional typed encoding onto a JSON-compatible tree.
//!
//! The encoder maps the [`Value`](super::Value) space onto plain JSON plus a
//! small set of tagged wrappers:
//!
//! - bytes: `{"__object__": "bytes", "__content__": "<base64>"}`
//! - complex: `{"__object__": "complex", "__content__": {"real": r, "imag": i}}`
//! - ndarray: `{"__object__": "ndarray", "__content__":
//!   {"array": "<base64 of raw element bytes>", "dtype": "<f8", "shape": [..]}}`
//!
//! Mapping keys are escaped so that the document database's dotted-path
//! semantics stay unambiguous: integer keys become `_integer[<n>]` and a
//! literal `.` in string keys becomes the six-character escape sequence
//! backslash-`u002e`. The
//! decoder is the exact inverse; unknown `__object__` tags are rejected.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Map as JsonMap, Number, Value as JsonValue};

use super::value::{Key, NdArray, Value, ValueMap};
use crate::error::{LabError, LabResult};

/// Field carrying the wrapper tag in encoded objects.
pub const OBJECT_TAG: &str = "__object__";
/// Field carrying the wrapper payload in encoded objects.
pub const CONTENT_TAG: &str = "__content__";

const INTEGER_KEY_PREFIX: &str = "_integer[";
const DOT_ESCAPE: &str = "\\u002e";

//==============================================================================
// Keys
//==============================================================================

/// Escapes a mapping key into its encoded string form.
pub fn escape_key(key: &Key) -> String {
    match key {
        Key::Int(n) => format!("{}{}]", INTEGER_KEY_PREFIX, n),
        Key::Str(s) => s.replace('.', DOT_ESCAPE),
    }
}

/// Recovers a mapping key from its encoded string form.
///
/// Strings of the exact shape `_integer[<decimal>]` decode to integer keys;
/// anything else is a string key with dot escapes reversed.
pub fn unescape_key(raw: &str) -> Key {
    if let Some(stripped) = raw.strip_prefix(INTEGER_KEY_PREFIX) {
        if let Some(payload) = stripped.strip_suffix(']') {
            if let Ok(n) = payload.parse::<i64>() {
                return Key::Int(n);
            }
        }
    }
    Key::Str(raw.replace(DOT_ESCAPE, "."))
}

//==============================================================================
// Encoding
//==============================================================================

fn encode_f64(value: f64) -> LabResult<JsonValue> {
    Number::from_f64(value)
        .map(JsonValue::Number)
        .ok_or_else(|| LabError::NotSerializable(format!("non-finite float {}", value)))
}

/// Encodes a value into the JSON-compatible tree.
pub fn encode(value: &Value) -> LabResult<JsonValue> {
    Ok(match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Int(n) => JsonValue::Number(Number::from(*n)),
        Value::Float(f) => encode_f64(*f)?,
        Value::Str(s) => JsonValue::String(s.clone()),
        Value::Complex(c) => json!({
            OBJECT_TAG: "complex",
            CONTENT_TAG: {"real": encode_f64(c.re)?, "imag": encode_f64(c.im)?},
        }),
        Value::Bytes(bytes) => json!({
            OBJECT_TAG: "bytes",
            CONTENT_TAG: BASE64.encode(bytes),
        }),
        Value::Array(array) => json!({
            OBJECT_TAG: "ndarray",
            CONTENT_TAG: {
                "array": BASE64.encode(array.to_le_bytes()),
                "dtype": array.dtype(),
                "shape": array.shape(),
            },
        }),
        Value::Seq(items) => {
            JsonValue::Array(items.iter().map(encode).collect::<LabResult<Vec<_>>>()?)
        }
        Value::Map(map) => {
            let mut object = JsonMap::with_capacity(map.len());
            for (key, item) in map.iter() {
                object.insert(escape_key(key), encode(item)?);
            }
            JsonValue::Object(object)
        }
    })
}

//==============================================================================
// Decoding
//==============================================================================

fn content_of(object: &JsonMap<String, JsonValue>, tag: &str) -> LabResult<JsonValue> {
    object
        .get(CONTENT_TAG)
        .cloned()
        .ok_or_else(|| LabError::NotSerializable(format!("'{}' wrapper without content", tag)))
}

fn decode_wrapper(tag: &str, object: &JsonMap<String, JsonValue>) -> LabResult<Value> {
    match tag {
        "bytes" => {
            let content = content_of(object, tag)?;
            let encoded = content
                .as_str()
                .ok_or_else(|| LabError::NotSerializable("bytes content must be base64".into()))?;
            let bytes = BASE64
                .decode(encoded)
                .map_err(|e| LabError::NotSerializable(format!("invalid base64: {}", e)))?;
            Ok(Value::Bytes(bytes))
        }
        "complex" => {
            let content = content_of(object, tag)?;
            let real = content.get("real").and_then(JsonValue::as_f64);
            let imag = content.get("imag").and_then(JsonValue::as_f64);
            match (real, imag) {
                (Some(re), Some(im)) => Ok(Value::Complex(num_complex::Complex64::new(re, im))),
                _ => Err(LabError::NotSerializable(
                    "complex content must carry real and imag".into(),
                )),
            }
        }
        "ndarray" => {
            let content = content_of(object, tag)?;
            let payload = content
                .get("array")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| {
                    LabError::NotSerializable("ndarray content must carry base64 bytes".into())
                })?;
            let dtype = content
                .get("dtype")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| {
                    LabError::NotSerializable("ndarray content must carry a dtype".into())
                })?;
            let shape: Vec<usize> = content
                .get("shape")
                .and_then(JsonValue::as_array)
                .ok_or_else(|| {
                    LabError::NotSerializable("ndarray content must carry a shape".into())
                })?
                .iter()
                .map(|v| {
                    v.as_u64().map(|n| n as usize).ok_or_else(|| {
                        LabError::NotSerializable("ndarray shape must be unsigned ints".into())
                    })
                })
                .collect::<LabResult<_>>()?;
            let bytes = BASE64
                .decode(payload)
                .map_err(|e| LabError::NotSerializable(format!("invalid base64: {}", e)))?;
            Ok(Value::Array(NdArray::from_le_bytes(dtype, &shape, &bytes)?))
        }
        other => Err(LabError::UnknownType(other.to_string())),
    }
}

/// Decodes a JSON-compatible tree back into a value.
pub fn decode(encoded: &JsonValue) -> LabResult<Value> {
    Ok(match encoded {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::String(s) => Value::Str(s.clone()),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                return Err(LabError::NotSerializable(format!(
                    "number {} does not fit the value space",
                    n
                )));
            }
        }
        JsonValue::Array(items) => {
            Value::Seq(items.iter().map(decode).collect::<LabResult<Vec<_>>>()?)
        }
        JsonValue::Object(object) => {
            if let Some(tag) = object.get(OBJECT_TAG) {
                let tag = tag.as_str().ok_or_else(|| {
                    LabError::NotSerializable("__object__ tag must be a string".into())
                })?;
                decode_wrapper(tag, object)?
            } else {
                let mut map = ValueMap::new();
                for (raw_key, item) in object {
                    map.insert(unescape_key(raw_key), decode(item)?);
                }
                Value::Map(map)
            }
        }
    })
}

//==============================================================================
// Document-database bridge
//==============================================================================

/// Encodes a value and converts the encoded tree to BSON.
pub fn encode_to_bson(value: &Value) -> LabResult<mongodb::bson::Bson> {
    let encoded = encode(value)?;
    mongodb::bson::to_bson(&encoded).map_err(|e| LabError::NotSerializable(e.to_string()))
}

/// Converts BSON back to the JSON tree and decodes it.
pub fn decode_from_bson(bson: &mongodb::bson::Bson) -> LabResult<Value> {
    let encoded: JsonValue = mongodb::bson::from_bson(bson.clone())
        .map_err(|e| LabError::NotSerializable(e.to_string()))?;
    decode(&encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;
    use num_complex::Complex64;

    fn round_trip(value: Value) -> Value {
        let encoded = encode(&value).expect("encode");
        decode(&encoded).expect("decode")
    }

    #[test]
    fn test_scalar_round_trips() {
        for value in [
            Value::Null,
            Value::Bool(true),
            Value::Int(-42),
            Value::Float(2.5),
            Value::Str("spin".into()),
        ] {
            assert_eq!(round_trip(value.clone()), value);
        }
    }

    #[test]
    fn test_bytes_round_trip_and_wrapper_shape() {
        let value = Value::bytes(vec![0u8, 1, 2, 254, 255]);
        let encoded = encode(&value).expect("encode");
        assert_eq!(encoded[OBJECT_TAG], "bytes");
        assert_eq!(decode(&encoded).expect("decode"), value);
    }

    #[test]
    fn test_complex_round_trip() {
        let value = Value::Complex(Complex64::new(-1.25, 3.5));
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn test_ndarray_round_trip_all_dtypes() {
        let arrays = vec![
            NdArray::Int32(arr1(&[1i32, 2, 3]).into_dyn()),
            NdArray::Int64(arr1(&[-5i64, 5]).into_dyn()),
            NdArray::Float32(arr1(&[0.5f32]).into_dyn()),
            NdArray::Float64(arr1(&[1.0, 2.0, 3.0]).into_dyn()),
            NdArray::Complex128(arr1(&[Complex64::new(0.0, 1.0)]).into_dyn()),
        ];
        for array in arrays {
            let value = Value::Array(array);
            assert_eq!(round_trip(value.clone()), value);
        }
    }

    #[test]
    fn test_integer_and_dotted_keys_round_trip() {
        let mut map = ValueMap::new();
        map.insert(1i64, "int");
        map.insert(-7i64, "negative int");
        map.insert("a.b", "dot");
        map.insert("plain", "no dot");
        let value = Value::Map(map);

        let encoded = encode(&value).expect("encode");
        let object = encoded.as_object().expect("object");
        assert!(object.contains_key("_integer[1]"));
        assert!(object.contains_key("_integer[-7]"));
        assert!(object.contains_key("a\\u002eb"));

        assert_eq!(decode(&encoded).expect("decode"), value);
    }

    #[test]
    fn test_integer_prefix_with_garbage_payload_stays_string() {
        assert_eq!(unescape_key("_integer[abc]"), Key::Str("_integer[abc]".into()));
        assert_eq!(unescape_key("_integer[12"), Key::Str("_integer[12".into()));
        assert_eq!(unescape_key("_integer[12]"), Key::Int(12));
        assert_eq!(unescape_key("_integer[-3]"), Key::Int(-3));
    }

    #[test]
    fn test_unknown_object_tag_is_rejected() {
        let encoded = json!({OBJECT_TAG: "quaternion", CONTENT_TAG: [1, 2, 3, 4]});
        assert!(matches!(
            decode(&encoded),
            Err(LabError::UnknownType(tag)) if tag == "quaternion"
        ));
    }

    #[test]
    fn test_non_finite_float_is_rejected() {
        assert!(matches!(
            encode(&Value::Float(f64::NAN)),
            Err(LabError::NotSerializable(_))
        ));
    }

    #[test]
    fn test_encode_of_decode_is_identity_on_encoded_trees() {
        let document = json!({
            "metadata": {"_integer[3]": "three", "a\\u002eb": 1},
            "payload": {
                OBJECT_TAG: "ndarray",
                CONTENT_TAG: {
                    "array": BASE64.encode(
                        NdArray::Float64(arr1(&[1.0, 2.0]).into_dyn()).to_le_bytes()
                    ),
                    "dtype": "<f8",
                    "shape": [2],
                },
            },
        });
        let decoded = decode(&document).expect("decode");
        let re_encoded = encode(&decoded).expect("encode");
        assert_eq!(re_encoded, document);
    }

    #[test]
    fn test_nested_sequences_round_trip() {
        let value = Value::Seq(vec![
            Value::Int(1),
            Value::Seq(vec![Value::Str("nested".into()), Value::Null]),
            Value::Map(
                [("k", Value::Float(0.25))]
                    .into_iter()
                    .collect::<ValueMap>(),
            ),
        ]);
        assert_eq!(round_trip(value.clone()), value);
    }
}
