//! Fine-grained checks for routes wrapped with the API guard.
//!
//! [`GuardOptions`] is what a route declares; [`GuardPolicy`] is those options
//! resolved against the live configuration. [`validate_request`] is the
//! request validation step; the tower layer in
//! `adapters::guard_layer` drives the rest of the pipeline.
use std::time::Duration;

use http::{HeaderMap, Method, header};
use serde::Serialize;
use serde_json::{Value, json};

use crate::{
    config::SecurityConfig,
    core::{
        events::{SecurityEventLog, Severity},
        sanitizer::{self, ThreatKind},
    },
};

/// Sanitized JSON body, attached to the request for the inner handler.
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedPayload(pub Value);

/// Internal failure detail a handler attaches to its (generic) 500 response.
/// The guard logs it and strips it; it never reaches the wire.
#[derive(Debug, Clone)]
pub struct InternalErrorDetail(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateLimitMode {
    Configured,
    Custom { max_requests: u32, window: Duration },
    Disabled,
}

/// Per-route guard declaration.
#[derive(Debug, Clone)]
pub struct GuardOptions {
    methods: Vec<Method>,
    require_auth: bool,
    rate_limit: RateLimitMode,
    max_body_bytes: Option<usize>,
}

impl Default for GuardOptions {
    fn default() -> Self {
        Self {
            methods: vec![Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE],
            require_auth: false,
            rate_limit: RateLimitMode::Configured,
            max_body_bytes: None,
        }
    }
}

impl GuardOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the route to these methods.
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().collect();
        self
    }

    pub fn require_auth(mut self, require: bool) -> Self {
        self.require_auth = require;
        self
    }

    /// Override the configured API rate limit for this route.
    pub fn rate_limit(mut self, max_requests: u32, window: Duration) -> Self {
        self.rate_limit = RateLimitMode::Custom {
            max_requests,
            window,
        };
        self
    }

    pub fn without_rate_limit(mut self) -> Self {
        self.rate_limit = RateLimitMode::Disabled;
        self
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = Some(limit);
        self
    }

    /// Fill the gaps from the current configuration snapshot.
    pub fn resolve(&self, config: &SecurityConfig) -> GuardPolicy {
        let rate_limit = match self.rate_limit {
            RateLimitMode::Disabled => None,
            RateLimitMode::Custom {
                max_requests,
                window,
            } => Some((max_requests, window)),
            RateLimitMode::Configured => Some((
                config.rate_limit.api_max_requests,
                config
                    .rate_limit
                    .api_window_duration()
                    .unwrap_or(Duration::from_secs(15 * 60)),
            )),
        };

        GuardPolicy {
            allowed_methods: self.methods.clone(),
            require_auth: self.require_auth,
            rate_limit,
            max_body_bytes: self.max_body_bytes.unwrap_or(config.guard.max_body_bytes),
            allowed_content_types: config
                .guard
                .allowed_content_types
                .iter()
                .map(|ct| ct.to_ascii_lowercase())
                .collect(),
            html_fields: config.guard.html_fields.clone(),
        }
    }
}

/// Guard settings in effect for one request.
#[derive(Debug, Clone)]
pub struct GuardPolicy {
    pub allowed_methods: Vec<Method>,
    pub require_auth: bool,
    /// `(max_requests, window)`, `None` when disabled
    pub rate_limit: Option<(u32, Duration)>,
    pub max_body_bytes: usize,
    pub allowed_content_types: Vec<String>,
    pub html_fields: Vec<String>,
}

impl GuardPolicy {
    pub fn allows_method(&self, method: &Method) -> bool {
        if method == Method::OPTIONS || self.allowed_methods.contains(method) {
            return true;
        }
        method == Method::HEAD && self.allowed_methods.contains(&Method::GET)
    }

    /// Value for the `Allow` header of a 405.
    pub fn allow_header(&self) -> String {
        self.allowed_methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Everything `validate_request` looks at.
#[derive(Debug, Clone, Copy)]
pub struct ValidationInput<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
    pub client_ip: &'a str,
}

/// Outcome of request validation.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub threats: Vec<ThreatKind>,
    /// Sanitized JSON body, when the body was JSON
    #[serde(skip)]
    pub sanitized: Option<Value>,
    /// The body (declared or actual) exceeded the limit
    #[serde(skip)]
    pub too_large: bool,
}

fn media_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
}

fn carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Validate method, content type, size and payload of an API request.
///
/// JSON bodies are parsed and deep-sanitized. The raw body, the query string
/// and every decoded JSON string are run through the threat heuristics; any
/// hit is logged as `api_security_threat` and makes the request invalid.
pub fn validate_request(
    input: ValidationInput<'_>,
    policy: &GuardPolicy,
    events: &SecurityEventLog,
) -> RequestValidation {
    let mut result = RequestValidation::default();

    if !policy.allows_method(input.method) {
        result
            .errors
            .push(format!("Method {} not allowed", input.method));
    }

    let media_type = media_type(input.headers);
    if carries_body(input.method) && !input.body.is_empty() {
        match media_type.as_deref() {
            Some(mt) if policy.allowed_content_types.iter().any(|allowed| allowed == mt) => {}
            Some(mt) => result.errors.push(format!("Unsupported content type: {mt}")),
            None => result.errors.push("Missing content type".to_string()),
        }
    }

    let declared = input
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok());
    if declared.unwrap_or(0) > policy.max_body_bytes || input.body.len() > policy.max_body_bytes {
        result.too_large = true;
        result.errors.push(format!(
            "Request body exceeds {} bytes",
            policy.max_body_bytes
        ));
        result.is_valid = false;
        return result;
    }

    let raw = String::from_utf8_lossy(input.body);
    let mut threats = sanitizer::detect_threats(&raw);

    if let Some(query) = input.query {
        threats.extend(sanitizer::detect_threats(query));
    }

    let is_json = media_type
        .as_deref()
        .is_some_and(|mt| mt == "application/json" || mt.ends_with("+json"));
    if is_json && !input.body.is_empty() {
        match serde_json::from_slice::<Value>(input.body) {
            Ok(value) => {
                for leaf in sanitizer::string_leaves(&value) {
                    threats.extend(sanitizer::detect_threats(leaf));
                }
                result.sanitized = Some(sanitizer::sanitize_json(value, &policy.html_fields));
            }
            Err(e) => result.errors.push(format!("Invalid JSON body: {e}")),
        }
    }

    let mut unique = Vec::new();
    for threat in threats {
        if !unique.contains(&threat) {
            unique.push(threat);
        }
    }
    result.threats = unique;

    if !result.threats.is_empty() {
        events.log(
            "api_security_threat",
            Severity::High,
            json!({
                "path": input.path,
                "method": input.method.as_str(),
                "ip": input.client_ip,
                "threats": result.threats,
            }),
        );
        result
            .errors
            .push("Potential security threat detected".to_string());
    }

    result.is_valid = result.errors.is_empty();
    result
}

/// Severity of an `api_access` event for a response status.
pub fn access_severity(status: http::StatusCode) -> Severity {
    if status.is_server_error() {
        Severity::High
    } else if status.is_client_error() {
        Severity::Medium
    } else {
        Severity::Low
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::{HeaderValue, StatusCode};

    use super::*;
    use crate::{config::Environment, core::events::MemoryEventSink};

    fn policy() -> GuardPolicy {
        GuardOptions::new()
            .methods([Method::POST])
            .resolve(&SecurityConfig::default())
    }

    fn json_headers(len: usize) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        headers
    }

    fn run(
        method: Method,
        headers: &HeaderMap,
        body: &[u8],
        policy: &GuardPolicy,
    ) -> (RequestValidation, Arc<MemoryEventSink>) {
        let sink = Arc::new(MemoryEventSink::new());
        let events = SecurityEventLog::new(sink.clone(), Environment::Test);
        let result = validate_request(
            ValidationInput {
                method: &method,
                path: "/api/videos",
                query: None,
                headers,
                body,
                client_ip: "198.51.100.9",
            },
            policy,
            &events,
        );
        (result, sink)
    }

    #[test]
    fn test_sql_threat_in_json_body() {
        let body = br#"{"q": "1; DROP TABLE videos;"}"#;
        let (result, sink) = run(Method::POST, &json_headers(body.len()), body, &policy());

        assert!(!result.is_valid);
        assert!(result.threats.contains(&ThreatKind::SqlInjection));
        let events = sink.named("api_security_threat");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::High);
        assert_eq!(events[0].details["threats"][0], "SQL Injection");
    }

    #[test]
    fn test_clean_json_is_sanitized() {
        let body = br#"{"title": "  New   season ", "content": "<p style=x>Hi</p><script>x</script>"}"#;
        let mut p = policy();
        p.html_fields = vec!["content".to_string()];
        // the script tag is still a threat; drop it to test sanitization alone
        let body_clean = br#"{"title": "  New   season ", "content": "<p style=x>Hi</p>"}"#;
        let (result, sink) = run(Method::POST, &json_headers(body_clean.len()), body_clean, &p);

        assert!(result.is_valid, "{:?}", result.errors);
        let sanitized = result.sanitized.unwrap();
        assert_eq!(sanitized["title"], "New season");
        assert_eq!(sanitized["content"], "<p>Hi</p>");
        assert!(sink.events().is_empty());

        let (dirty, _) = run(Method::POST, &json_headers(body.len()), body, &p);
        assert!(dirty.threats.contains(&ThreatKind::Xss));
    }

    #[test]
    fn test_method_not_allowed() {
        let (result, _) = run(Method::DELETE, &HeaderMap::new(), b"", &policy());
        assert!(!result.is_valid);
        assert_eq!(result.errors, vec!["Method DELETE not allowed".to_string()]);
    }

    #[test]
    fn test_unsupported_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/xml"));
        let (result, _) = run(Method::POST, &headers, b"<a/>", &policy());
        assert!(!result.is_valid);
        assert!(result.errors[0].contains("application/xml"));
    }

    #[test]
    fn test_charset_parameter_is_ignored() {
        let mut headers = json_headers(2);
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("Application/JSON; charset=utf-8"),
        );
        let (result, _) = run(Method::POST, &headers, b"{}", &policy());
        assert!(result.is_valid, "{:?}", result.errors);
    }

    #[test]
    fn test_declared_size_over_limit() {
        let p = GuardOptions::new()
            .methods([Method::POST])
            .max_body_bytes(16)
            .resolve(&SecurityConfig::default());
        let (result, _) = run(Method::POST, &json_headers(4096), b"{}", &p);
        assert!(result.too_large);
        assert!(!result.is_valid);
    }

    #[test]
    fn test_invalid_json() {
        let body = b"{not json";
        let (result, _) = run(Method::POST, &json_headers(body.len()), body, &policy());
        assert!(!result.is_valid);
        assert!(result.errors[0].starts_with("Invalid JSON body"));
    }

    #[test]
    fn test_resolve_uses_configured_limits() {
        let config = SecurityConfig::default();
        let resolved = GuardOptions::new().resolve(&config);
        assert_eq!(resolved.rate_limit, Some((100, Duration::from_secs(900))));
        assert_eq!(resolved.max_body_bytes, 1024 * 1024);

        let custom = GuardOptions::new()
            .rate_limit(3, Duration::from_secs(1))
            .resolve(&config);
        assert_eq!(custom.rate_limit, Some((3, Duration::from_secs(1))));
        assert_eq!(GuardOptions::new().without_rate_limit().resolve(&config).rate_limit, None);
    }

    #[test]
    fn test_allow_header_and_head() {
        let p = GuardOptions::new()
            .methods([Method::GET, Method::POST])
            .resolve(&SecurityConfig::default());
        assert_eq!(p.allow_header(), "GET, POST");
        assert!(p.allows_method(&Method::HEAD));
        assert!(!p.allows_method(&Method::DELETE));
    }

    #[test]
    fn test_access_severity() {
        assert_eq!(access_severity(StatusCode::OK), Severity::Low);
        assert_eq!(access_severity(StatusCode::NOT_FOUND), Severity::Medium);
        assert_eq!(access_severity(StatusCode::BAD_GATEWAY), Severity::High);
    }
}
