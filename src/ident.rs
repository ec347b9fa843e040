//! Content-hash task identity.
//!
//! A task id is a 128-bit blake3 digest over the app name, the normalized
//! source text, the declared free variables, and the canonical JSON of the
//! call arguments. Arguments that are futures contribute their task id (the
//! placeholder object already is exactly that), so identity is recursive but
//! well-defined over an acyclic graph.

use serde_json::Value;

/// Length of a task id in hex characters (128 bits).
pub const ID_LEN: usize = 32;

/// Compute a task id.
pub fn task_id(
    app_name: &str,
    source: &str,
    free_vars: &Value,
    args: &Value,
    kwargs: &Value,
) -> String {
    let mut hasher = blake3::Hasher::new();
    // Length-prefix each field so adjacent fields cannot alias.
    for field in [
        app_name.as_bytes().to_vec(),
        normalize_source(source).into_bytes(),
        canonical_json(free_vars).into_bytes(),
        canonical_json(args).into_bytes(),
        canonical_json(kwargs).into_bytes(),
    ] {
        hasher.update(&(field.len() as u64).to_le_bytes());
        hasher.update(&field);
    }
    let digest = hasher.finalize();
    hex_prefix(digest.as_bytes())
}

/// Hash of an app's implementation alone: source text plus free variables.
pub fn app_hash(source: &str, free_vars: &Value) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(normalize_source(source).as_bytes());
    hasher.update(canonical_json(free_vars).as_bytes());
    hex_prefix(hasher.finalize().as_bytes())
}

fn hex_prefix(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(ID_LEN);
    for byte in &bytes[..ID_LEN / 2] {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Strip common leading indentation and trailing whitespace per line.
/// Comments are preserved: they are part of the captured source.
pub fn normalize_source(source: &str) -> String {
    let lines: Vec<&str> = source.lines().collect();
    let indent = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);
    let mut out = String::with_capacity(source.len());
    for line in &lines {
        let stripped = if line.len() >= indent { &line[indent..] } else { "" };
        out.push_str(stripped.trim_end());
        out.push('\n');
    }
    // Trailing blank lines do not change identity.
    while out.ends_with("\n\n") {
        out.pop();
    }
    out
}

/// Render JSON with object keys sorted recursively, so key order in the
/// caller's map never changes the digest.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
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
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_is_stable() {
        let args = json!([1, "two", {"three": 3}]);
        let a = task_id("app", "fn body() {}", &json!({}), &args, &json!({}));
        let b = task_id("app", "fn body() {}", &json!({}), &args, &json!({}));
        assert_eq!(a, b);
        assert_eq!(a.len(), ID_LEN);
    }

    #[test]
    fn source_change_changes_id() {
        let args = json!([1]);
        let a = task_id("app", "let x = 1;", &json!({}), &args, &json!({}));
        let b = task_id("app", "let x = 2;", &json!({}), &args, &json!({}));
        assert_ne!(a, b);
    }

    #[test]
    fn comments_affect_identity() {
        let a = app_hash("x + 1 // add one", &json!({}));
        let b = app_hash("x + 1", &json!({}));
        assert_ne!(a, b);
    }

    #[test]
    fn indentation_does_not_affect_identity() {
        let a = app_hash("    line one\n    line two", &json!({}));
        let b = app_hash("line one\nline two", &json!({}));
        assert_eq!(a, b);
    }

    #[test]
    fn key_order_does_not_affect_identity() {
        let a = json!({"b": 2, "a": 1});
        let b = json!({"a": 1, "b": 2});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn future_args_hash_by_task_id() {
        let dep = crate::codec::dep_ref("aaaa");
        let other = crate::codec::dep_ref("bbbb");
        let a = task_id("app", "src", &json!({}), &json!([dep]), &json!({}));
        let b = task_id("app", "src", &json!({}), &json!([other]), &json!({}));
        assert_ne!(a, b);
    }
}
