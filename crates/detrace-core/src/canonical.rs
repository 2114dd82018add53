//! Canonical serialization and content fingerprints.
//!
//! Every replay lookup key and every payload digest in detrace is computed
//! over the canonical byte form produced here, so the rules are strict:
//!
//! - map keys sorted ascending by Unicode code point
//! - no insignificant whitespace
//! - integers rendered as plain decimal, never reformatted
//! - floats rendered as their shortest round-trippable decimal
//! - CR and CRLF in string values normalized to LF
//! - NaN / Infinity rejected
//! - raw binary never embedded; blobs are referenced as `{"$blob": "<hex>"}`
//!
//! The fingerprint is the BLAKE3 hex digest of the canonical bytes.

use serde_json::Value;

use crate::error::{CoreError, Result};

/// Key under which a binary payload reference is stored in place of bytes.
pub const BLOB_REF_KEY: &str = "$blob";

/// Produce the canonical byte representation of a JSON-compatible value.
pub fn canonicalize(value: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(128);
    let mut path = String::from("$");
    write_canonical(&mut out, value, &mut path)?;
    Ok(out)
}

/// BLAKE3 hex digest of the canonical bytes of `value`.
pub fn fingerprint(value: &Value) -> Result<String> {
    let bytes = canonicalize(value)?;
    Ok(hash_bytes(&bytes))
}

/// BLAKE3 hex digest of raw bytes. Used for blob addressing.
pub fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Build the canonical reference value for a binary blob.
pub fn blob_ref(hash_hex: &str) -> Value {
    let mut map = serde_json::Map::with_capacity(1);
    map.insert(BLOB_REF_KEY.to_string(), Value::String(hash_hex.to_string()));
    Value::Object(map)
}

fn write_canonical(out: &mut Vec<u8>, value: &Value, path: &mut String) -> Result<()> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => write_number(out, n, path)?,
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push(b'[');
            let base_len = path.len();
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                path.push_str(&format!("[{i}]"));
                write_canonical(out, item, path)?;
                path.truncate(base_len);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // BTreeMap ordering over UTF-8 strings is code-point order.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            let base_len = path.len();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(out, key);
                out.push(b':');
                path.push('.');
                path.push_str(key);
                write_canonical(out, &map[key.as_str()], path)?;
                path.truncate(base_len);
            }
            out.push(b'}');
        }
    }
    Ok(())
}

fn write_number(out: &mut Vec<u8>, n: &serde_json::Number, path: &str) -> Result<()> {
    if n.is_i64() || n.is_u64() {
        // Integer text is preserved as parsed; serde_json keeps it exact.
        out.extend_from_slice(n.to_string().as_bytes());
        return Ok(());
    }
    match n.as_f64() {
        Some(f) if f.is_finite() => {
            // Rust's f64 Display is the shortest decimal that round-trips.
            let text = format!("{f}");
            out.extend_from_slice(text.as_bytes());
            // Keep integral floats distinguishable from integers.
            if !text.contains('.') && !text.contains('e') && !text.contains('E') {
                out.extend_from_slice(b".0");
            }
            Ok(())
        }
        _ => Err(CoreError::Canonicalization {
            path: path.to_string(),
            reason: "non-finite number".to_string(),
        }),
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    let normalized = normalize_line_endings(s);
    out.push(b'"');
    for c in normalized.chars() {
        match c {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\t' => out.extend_from_slice(b"\\t"),
            c if (c as u32) < 0x20 => {
                out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes());
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}

fn normalize_line_endings(s: &str) -> std::borrow::Cow<'_, str> {
    if !s.contains('\r') {
        return std::borrow::Cow::Borrowed(s);
    }
    std::borrow::Cow::Owned(s.replace("\r\n", "\n").replace('\r', "\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_map_keys_sorted_by_code_point() {
        let a = json!({"b": 2, "a": 1});
        let b = json!({"a": 1, "b": 2});
        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
        assert_eq!(
            String::from_utf8(canonicalize(&a).unwrap()).unwrap(),
            r#"{"a":1,"b":2}"#
        );
    }

    #[test]
    fn test_unordered_maps_share_fingerprint() {
        let a = json!({"b": 2, "a": 1});
        let b = json!({"a": 1, "b": 2});
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn test_canonical_idempotence() {
        let value = json!({
            "nested": {"z": [1, 2, {"y": null}], "a": true},
            "text": "line1\r\nline2",
            "score": 0.5
        });
        let once = canonicalize(&value).unwrap();
        let reparsed: Value = serde_json::from_slice(&once).unwrap();
        let twice = canonicalize(&reparsed).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_integers_preserved_exactly() {
        let value = json!({"big": 9007199254740993i64, "neg": -42});
        let text = String::from_utf8(canonicalize(&value).unwrap()).unwrap();
        assert!(text.contains("9007199254740993"));
        assert!(text.contains("-42"));
    }

    #[test]
    fn test_float_shortest_round_trip() {
        assert_eq!(
            String::from_utf8(canonicalize(&json!(0.1)).unwrap()).unwrap(),
            "0.1"
        );
        assert_eq!(
            String::from_utf8(canonicalize(&json!(1.5)).unwrap()).unwrap(),
            "1.5"
        );
        // Integral floats keep a trailing .0 so they never collide with ints.
        let v = serde_json::Number::from_f64(3.0).map(Value::Number).unwrap();
        assert_eq!(String::from_utf8(canonicalize(&v).unwrap()).unwrap(), "3.0");
    }

    #[test]
    fn test_line_endings_normalized_to_lf() {
        let crlf = json!({"msg": "a\r\nb"});
        let lf = json!({"msg": "a\nb"});
        assert_eq!(fingerprint(&crlf).unwrap(), fingerprint(&lf).unwrap());
    }

    #[test]
    fn test_fingerprint_differs_on_value_change() {
        let a = json!({"k": 1});
        let b = json!({"k": 2});
        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn test_blob_ref_shape() {
        let r = blob_ref("abc123");
        assert_eq!(r[BLOB_REF_KEY], "abc123");
    }

    #[test]
    fn test_fingerprint_is_blake3_hex() {
        let fp = fingerprint(&json!({"a": 1})).unwrap();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_control_chars_escaped() {
        let v = json!("bell\u{0007}");
        let text = String::from_utf8(canonicalize(&v).unwrap()).unwrap();
        assert_eq!(text, "\"bell\\u0007\"");
    }
}
