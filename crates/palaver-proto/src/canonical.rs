//! Canonical JSON.
//!
//! Signatures cover the canonical form of a payload: object keys sorted
//! lexicographically by their UTF-8 bytes, no insignificant whitespace, and
//! minimal string escaping. Signer and verifier must produce the same bytes
//! or verification fails, so this module is the single source of truth for
//! that form.

use serde_json::Value;

/// Renders a JSON value in canonical form.
///
/// Object keys are emitted in sorted order, arrays keep their order, and no
/// whitespace is inserted. The output is what gets signed and verified.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// Returns a copy of `value` with the top-level `signatures` and `unsigned`
/// fields removed.
///
/// Signatures never cover themselves, and `unsigned` is reserved for data
/// added after signing (server timestamps and the like).
pub fn signable_json(value: &Value) -> Value {
    let mut signable = value.clone();
    if let Some(object) = signable.as_object_mut() {
        object.remove("signatures");
        object.remove("unsigned");
    }
    signable
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(number) => out.push_str(&number.to_string()),
        Value::String(string) => write_string(string, out),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        },
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                if let Some(item) = map.get(*key) {
                    write_value(item, out);
                }
            }
            out.push('}');
        },
    }
}

fn write_string(string: &str, out: &mut String) {
    out.push('"');
    for character in string.chars() {
        match character {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            control if (control as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", control as u32));
            },
            other => out.push(other),
        }
    }
    out.push('"');
}
