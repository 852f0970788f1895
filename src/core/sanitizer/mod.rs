//! Input sanitization and threat heuristics.
//!
//! Every function here is total: inputs are degraded to a safe form, never
//! rejected with an error. Deciding whether a detected threat blocks a request
//! is left to the caller.
pub mod html;
pub mod text;
pub mod threats;

use serde::Serialize;
use serde_json::{Map, Value};

pub use html::sanitize_html;
pub use text::{sanitize_email, sanitize_filename, sanitize_text, sanitize_url};
pub use threats::{
    ThreatKind, contains_path_traversal, contains_sql_injection, contains_xss, detect_threats,
};

/// How a field should be interpreted before sanitizing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputKind {
    #[default]
    Text,
    Html,
    Url,
    Email,
    Filename,
}

/// Outcome of [`validate_input`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputValidation {
    pub is_valid: bool,
    pub sanitized: String,
    pub threats: Vec<ThreatKind>,
}

/// Scan `input` for threats and sanitize it according to `kind`.
///
/// Threats are reported, not enforced. A URL or email that sanitizes to the
/// empty string from a non-empty input is also reported as invalid.
pub fn validate_input(input: &str, kind: InputKind) -> InputValidation {
    let threats = detect_threats(input);

    let sanitized = match kind {
        InputKind::Text => sanitize_text(input),
        InputKind::Html => sanitize_html(input),
        InputKind::Url => sanitize_url(input),
        InputKind::Email => sanitize_email(input),
        InputKind::Filename => sanitize_filename(input),
    };

    let rejected = matches!(kind, InputKind::Url | InputKind::Email)
        && !input.trim().is_empty()
        && sanitized.is_empty();

    InputValidation {
        is_valid: threats.is_empty() && !rejected,
        sanitized,
        threats,
    }
}

/// Deep-sanitize a JSON document.
///
/// Strings under a key listed in `html_fields` are cleaned with
/// [`sanitize_html`]; every other string goes through [`sanitize_text`].
/// Object keys are sanitized as text; when two keys sanitize to the same text
/// the member iterated first wins. Numbers, booleans and nulls pass through.
pub fn sanitize_json(value: Value, html_fields: &[String]) -> Value {
    sanitize_value(value, html_fields, false)
}

fn sanitize_value(value: Value, html_fields: &[String], rich: bool) -> Value {
    match value {
        Value::String(s) if rich => Value::String(sanitize_html(&s)),
        Value::String(s) => Value::String(sanitize_text(&s)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| sanitize_value(item, html_fields, rich))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                let clean = sanitize_text(&key);
                // keys that clean to the same text keep the first value
                if out.contains_key(&clean) {
                    tracing::debug!(key = %clean, "Dropping JSON member whose key collides after sanitizing");
                    continue;
                }
                let rich = html_fields.iter().any(|field| field == &key);
                out.insert(clean, sanitize_value(item, html_fields, rich));
            }
            Value::Object(out)
        }
        other => other,
    }
}

/// Collect every string leaf of a JSON document (keys included).
pub fn string_leaves(value: &Value) -> Vec<&str> {
    let mut out = Vec::new();
    collect_strings(value, &mut out);
    out
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        Value::Object(map) => {
            for (key, item) in map {
                out.push(key);
                collect_strings(item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_validate_clean_text() {
        let result = validate_input("  hello   world ", InputKind::Text);
        assert!(result.is_valid);
        assert_eq!(result.sanitized, "hello world");
        assert!(result.threats.is_empty());
    }

    #[test]
    fn test_validate_reports_sql_injection() {
        let result = validate_input("' OR 1=1 --", InputKind::Text);
        assert!(!result.is_valid);
        assert_eq!(result.threats, vec![ThreatKind::SqlInjection]);
        // threats never block sanitization
        assert_eq!(result.sanitized, "' OR 1=1 --");
    }

    #[test]
    fn test_validate_html_reports_xss_and_cleans() {
        let result = validate_input("<p>hi</p><script>alert(1)</script>", InputKind::Html);
        assert!(!result.is_valid);
        assert!(result.threats.contains(&ThreatKind::Xss));
        assert_eq!(result.sanitized, "<p>hi</p>");
    }

    #[test]
    fn test_validate_url_and_email_shapes() {
        assert!(!validate_input("ftp://example.com", InputKind::Url).is_valid);
        assert!(validate_input("https://example.com", InputKind::Url).is_valid);
        assert!(validate_input("", InputKind::Url).is_valid);
        assert!(!validate_input("not-an-email", InputKind::Email).is_valid);
        assert_eq!(
            validate_input("Ops@Example.com", InputKind::Email).sanitized,
            "ops@example.com"
        );
    }

    #[test]
    fn test_validate_filename() {
        let result = validate_input("../secret.txt", InputKind::Filename);
        assert_eq!(result.threats, vec![ThreatKind::PathTraversal]);
        assert_eq!(result.sanitized, "_secret.txt");
    }

    #[test]
    fn test_sanitize_json_deep() {
        let html_fields = vec!["content".to_string()];
        let input = json!({
            "title": "  Big \t premiere ",
            "content": "<p onclick=x>Body</p><script>evil()</script>",
            "tags": ["  a ", {"content": "<b>nested</b><iframe></iframe>"}],
            "views": 42,
            "published": true,
            "cover": null
        });

        let out = sanitize_json(input, &html_fields);

        assert_eq!(out["title"], "Big premiere");
        assert_eq!(out["content"], "<p>Body</p>");
        assert_eq!(out["tags"][0], "a");
        assert_eq!(out["tags"][1]["content"], "<b>nested</b>");
        assert_eq!(out["views"], 42);
        assert_eq!(out["published"], true);
        assert!(out["cover"].is_null());
    }

    #[test]
    fn test_colliding_keys_keep_first_member() {
        let input = json!({"title": "kept", "title ": "dropped", "title\t\t": "also dropped"});
        let out = sanitize_json(input, &[]);
        let object = out.as_object().unwrap();
        assert_eq!(object.len(), 1);
        assert_eq!(out["title"], "kept");
    }

    #[test]
    fn test_string_leaves_includes_keys() {
        let value = json!({"a": ["x", {"b": "y"}], "n": 1});
        let mut leaves = string_leaves(&value);
        leaves.sort_unstable();
        assert_eq!(leaves, vec!["a", "b", "n", "x", "y"]);
    }
}
