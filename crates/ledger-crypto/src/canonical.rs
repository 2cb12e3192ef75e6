use ledger_types::{PayloadDigest, Request, ValidationError};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Keys the ledger excludes from the top level of a request's signing input.
const SIGNATURE_KEYS: &[&str] = &["signature", "signatures"];

/// Canonical encoding rules used for consensus matching and signing:
/// 1. Compact JSON, no insignificant whitespace.
/// 2. Object keys in lexicographic byte order at every depth.
/// 3. Strings use serde_json escaping; numbers keep their serde_json rendering.
///
/// The rules do not depend on how the `Value` map is ordered internally.
pub fn to_canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, ValidationError> {
    let value = serde_json::to_value(value)?;
    Ok(to_canonical_json(&value).into_bytes())
}

/// Wire form of a request. Identical logical requests yield identical bytes.
pub fn canonical_request_bytes(request: &Request) -> Result<Vec<u8>, ValidationError> {
    canonical_bytes(request)
}

pub fn payload_digest(value: &Value) -> PayloadDigest {
    PayloadDigest::new(sha256_32(to_canonical_json(value).as_bytes()))
}

/// Ledger signing serialization: sorted `key:value` pairs joined by `|`,
/// list items joined by `,`, booleans as `True`/`False`, null as empty.
pub fn serialize_for_signing(value: &Value) -> String {
    serialize_signing_value(value, true)
}

pub fn request_signing_input(request: &Request) -> Result<Vec<u8>, ValidationError> {
    let value = request.to_value()?;
    Ok(serialize_for_signing(&value).into_bytes())
}

/// Removes dot-separated field paths from a JSON value in place. Missing
/// paths are ignored; `*` matches every key of an object or item of an array.
pub fn strip_paths(value: &mut Value, paths: &[String]) {
    for path in paths {
        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        if !segments.is_empty() {
            strip_path(value, &segments);
        }
    }
}

fn strip_path(value: &mut Value, segments: &[&str]) {
    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => return,
    };
    match value {
        Value::Object(map) => {
            if rest.is_empty() {
                if *head == "*" {
                    map.clear();
                } else {
                    map.remove(*head);
                }
            } else if *head == "*" {
                for child in map.values_mut() {
                    strip_path(child, rest);
                }
            } else if let Some(child) = map.get_mut(*head) {
                strip_path(child, rest);
            }
        }
        Value::Array(items) if *head == "*" && !rest.is_empty() => {
            for item in items {
                strip_path(item, rest);
            }
        }
        _ => {}
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_json_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
    }
}

fn write_json_string(s: &str, out: &mut String) {
    // Serializing a &str cannot fail.
    out.push_str(&Value::String(s.to_owned()).to_string());
}

fn serialize_signing_value(value: &Value, top_level: bool) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| serialize_signing_value(item, false))
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(map) => {
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|key| !(top_level && SIGNATURE_KEYS.contains(&key.as_str())))
                .collect();
            keys.sort();
            keys.into_iter()
                .map(|key| format!("{key}:{}", serialize_signing_value(&map[key], false)))
                .collect::<Vec<_>>()
                .join("|")
        }
    }
}

pub(crate) fn sha256_32(input: &[u8]) -> [u8; 32] {
    Sha256::digest(input).into()
}
