//! Canonical JSON
//!
//! Object keys are emitted in lexicographic (byte) order, arrays keep their
//! order, and no whitespace is produced. Strings and numbers use the standard
//! JSON encoding. `serde_json::Value` cannot hold NaN or infinities; values
//! that would produce them serialize to `null` before reaching this module.

use serde::Serialize;
use serde_json::Value;

use crate::CryptoResult;

/// Deterministic JSON text for a value
pub fn stable_stringify(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// Canonical bytes of any serializable value
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> CryptoResult<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(stable_stringify(&value).into_bytes())
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            // Finite by construction; guard anyway so output stays valid JSON
            match n.as_f64() {
                Some(f) if !f.is_finite() => out.push_str("null"),
                _ => out.push_str(&n.to_string()),
            }
        }
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // serde_json never fails on a plain string
    match serde_json::to_string(s) {
        Ok(encoded) => out.push_str(&encoded),
        Err(_) => out.push_str("null"),
    }
}
