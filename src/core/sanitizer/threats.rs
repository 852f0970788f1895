//! Heuristic threat detectors.
//!
//! These are keyword/pattern matchers for obviously malicious payloads. They
//! are NOT sound: obfuscated input will slip through and benign prose can
//! trip them. Results feed logging and request rejection in the API guard;
//! the data-access layer must still use parameterized queries and output
//! encoding regardless of what is reported here.
use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Serialize, Serializer};

/// SQL injection patterns
static SQL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // Union-based injection
        Regex::new(r"(?i)\bunion\b(\s+all)?\s+\bselect\b").expect("valid regex"),
        Regex::new(r"(?i)\bselect\b\s+[\w\*,\s]+\s+\bfrom\b\s+\w+").expect("valid regex"),
        // Boolean tautologies
        Regex::new(r"(?i)\b(or|and)\b\s+\d+\s*=\s*\d+").expect("valid regex"),
        Regex::new(r#"(?i)'\s*(or|and)\s*'"#).expect("valid regex"),
        Regex::new(r#"(?i)'\s*\bor\b\s+['"]?\w+['"]?\s*=\s*['"]?\w+"#).expect("valid regex"),
        // Data manipulation
        Regex::new(r"(?i)\binsert\b\s+\binto\b\s+\w+").expect("valid regex"),
        Regex::new(r"(?i)\bdelete\b\s+\bfrom\b\s+\w+").expect("valid regex"),
        Regex::new(r"(?i)\bdrop\b\s+\b(table|database|schema)\b").expect("valid regex"),
        Regex::new(r"(?i)\btruncate\b\s+\btable\b").expect("valid regex"),
        Regex::new(r"(?i)\bupdate\b\s+\w+\s+\bset\b\s+\w+\s*=").expect("valid regex"),
        // Statement termination and comments
        Regex::new(r"(?i);\s*\b(drop|delete|update|insert|alter|create|truncate|exec)\b")
            .expect("valid regex"),
        Regex::new(r"'\s*--").expect("valid regex"),
        Regex::new(r";\s*--").expect("valid regex"),
        Regex::new(r"/\*.*\*/").expect("valid regex"),
        // SQL execution
        Regex::new(r"(?i)\b(exec|execute)\s*\(").expect("valid regex"),
        Regex::new(r"(?i)\b(xp_cmdshell|sp_executesql)\b").expect("valid regex"),
        // Time-based blind injection
        Regex::new(r"(?i)\b(benchmark|sleep|pg_sleep)\s*\(").expect("valid regex"),
        Regex::new(r"(?i)\bwaitfor\s+delay\b").expect("valid regex"),
    ]
});

/// XSS attack patterns
static XSS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // Script tags
        Regex::new(r"(?i)<\s*script[^>]*>").expect("valid regex"),
        Regex::new(r"(?i)<\s*/\s*script\s*>").expect("valid regex"),
        // Event handlers inside a tag
        Regex::new(r"(?i)<[^>]*\bon[a-z]+\s*=").expect("valid regex"),
        // Script-bearing protocols
        Regex::new(r"(?i)javascript\s*:").expect("valid regex"),
        Regex::new(r"(?i)vbscript\s*:").expect("valid regex"),
        Regex::new(r"(?i)data\s*:\s*text/html").expect("valid regex"),
        // Dangerous tags
        Regex::new(r"(?i)<\s*(iframe|object|embed|applet|svg|meta|base)\b").expect("valid regex"),
        // JavaScript sinks
        Regex::new(r"(?i)\beval\s*\(").expect("valid regex"),
        Regex::new(r"(?i)\bdocument\s*\.\s*(cookie|write|location)\b").expect("valid regex"),
        Regex::new(r"(?i)expression\s*\(").expect("valid regex"),
    ]
});

/// Path traversal patterns
static PATH_TRAVERSAL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"\.\./").expect("valid regex"),
        Regex::new(r"\.\.\\").expect("valid regex"),
        Regex::new(r"(?i)%2e%2e(%2f|%5c|/|\\)").expect("valid regex"),
        Regex::new(r"(?i)%252e%252e").expect("valid regex"),
        Regex::new(r"(?i)%c0%ae%c0%ae").expect("valid regex"),
        Regex::new(r"%00").expect("valid regex"),
        Regex::new(r"\x00").expect("valid regex"),
    ]
});

/// Class of attack a heuristic matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreatKind {
    SqlInjection,
    Xss,
    PathTraversal,
}

impl ThreatKind {
    /// Label reported to callers and logged with events
    pub fn label(&self) -> &'static str {
        match self {
            ThreatKind::SqlInjection => "SQL Injection",
            ThreatKind::Xss => "XSS",
            ThreatKind::PathTraversal => "Path Traversal",
        }
    }
}

impl std::fmt::Display for ThreatKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl Serialize for ThreatKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.label())
    }
}

fn decoded(input: &str) -> Cow<'_, str> {
    urlencoding::decode(input).unwrap_or(Cow::Borrowed(input))
}

fn matches_any(patterns: &[Regex], input: &str) -> bool {
    if input.len() < 3 {
        return false;
    }
    let decoded = decoded(input);
    patterns
        .iter()
        .any(|pattern| pattern.is_match(input) || pattern.is_match(&decoded))
}

/// Heuristic SQL injection check over raw and percent-decoded input.
pub fn contains_sql_injection(input: &str) -> bool {
    matches_any(&SQL_PATTERNS, input)
}

/// Heuristic XSS check over raw and percent-decoded input.
pub fn contains_xss(input: &str) -> bool {
    matches_any(&XSS_PATTERNS, input)
}

/// Heuristic directory traversal check.
pub fn contains_path_traversal(input: &str) -> bool {
    if input.len() < 2 {
        return false;
    }
    let decoded = decoded(input);
    PATH_TRAVERSAL_PATTERNS
        .iter()
        .any(|pattern| pattern.is_match(input) || pattern.is_match(&decoded))
}

/// Run every detector and return the labels that fired, in a stable order.
pub fn detect_threats(input: &str) -> Vec<ThreatKind> {
    let mut threats = Vec::new();
    if contains_sql_injection(input) {
        threats.push(ThreatKind::SqlInjection);
    }
    if contains_xss(input) {
        threats.push(ThreatKind::Xss);
    }
    if contains_path_traversal(input) {
        threats.push(ThreatKind::PathTraversal);
    }
    threats
}
