//! Response hardening: fixed security headers and the CORS allow-list.
use axum::{
    body::Body,
    response::{IntoResponse, Response},
};
use eyre::{Result, WrapErr};
use http::{
    HeaderMap, HeaderName, HeaderValue, StatusCode,
    header::{
        ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
        ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE,
        CONTENT_SECURITY_POLICY, REFERRER_POLICY, SERVER, STRICT_TRANSPORT_SECURITY, VARY,
        X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS, X_XSS_PROTECTION,
    },
};

use crate::config::{CorsConfig, Environment, HeadersConfig};

static PERMISSIONS_POLICY: HeaderName = HeaderName::from_static("permissions-policy");
static X_POWERED_BY: HeaderName = HeaderName::from_static("x-powered-by");

/// The fixed header set stamped on every response.
#[derive(Debug, Clone)]
pub struct SecurityHeaders {
    values: Vec<(HeaderName, HeaderValue)>,
}

impl Default for SecurityHeaders {
    fn default() -> Self {
        // defaults are static ASCII and always parse
        Self::from_config(&HeadersConfig::default()).unwrap_or_else(|_| Self { values: Vec::new() })
    }
}

impl SecurityHeaders {
    pub fn from_config(config: &HeadersConfig) -> Result<Self> {
        let value = |name: &str, raw: &str| {
            HeaderValue::from_str(raw).wrap_err_with(|| format!("Invalid value for header {name}"))
        };

        Ok(Self {
            values: vec![
                (
                    CONTENT_SECURITY_POLICY,
                    value("content-security-policy", &config.content_security_policy)?,
                ),
                (X_FRAME_OPTIONS, HeaderValue::from_static("DENY")),
                (X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff")),
                (X_XSS_PROTECTION, HeaderValue::from_static("1; mode=block")),
                (REFERRER_POLICY, value("referrer-policy", &config.referrer_policy)?),
                (
                    STRICT_TRANSPORT_SECURITY,
                    value("strict-transport-security", &config.strict_transport_security)?,
                ),
                (
                    PERMISSIONS_POLICY.clone(),
                    value("permissions-policy", &config.permissions_policy)?,
                ),
            ],
        })
    }

    /// Overwrite the security headers and drop server fingerprints. Idempotent.
    pub fn apply(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.values {
            headers.insert(name.clone(), value.clone());
        }
        headers.remove(SERVER);
        headers.remove(&X_POWERED_BY);
    }
}

/// Cross-origin policy for one environment.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    allowed_origins: Vec<String>,
    allow_methods: HeaderValue,
    allow_headers: HeaderValue,
    max_age: HeaderValue,
}

fn varies_on_origin(headers: &HeaderMap) -> bool {
    headers
        .get_all(VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case("origin"))
}

impl CorsPolicy {
    pub fn from_config(config: &CorsConfig, environment: Environment) -> Result<Self> {
        let allow_methods = HeaderValue::from_str(&config.allowed_methods.join(", "))
            .wrap_err("Invalid cors.allowed_methods")?;
        let allow_headers = HeaderValue::from_str(&config.allowed_headers.join(", "))
            .wrap_err("Invalid cors.allowed_headers")?;

        Ok(Self {
            allowed_origins: config
                .origins_for(environment)
                .iter()
                .map(|o| o.trim_end_matches('/').to_string())
                .collect(),
            allow_methods,
            allow_headers,
            max_age: HeaderValue::from(config.max_age_secs),
        })
    }

    pub fn is_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|allowed| allowed == origin)
    }

    pub fn allowed_origins(&self) -> &[String] {
        &self.allowed_origins
    }

    /// Add CORS headers for a request carrying `origin`.
    ///
    /// A disallowed origin gets no CORS headers at all; the browser then
    /// blocks the response without the server saying why.
    pub fn apply(&self, headers: &mut HeaderMap, origin: Option<&str>) {
        match origin {
            Some(origin) if self.is_allowed(origin) => {
                if let Ok(value) = HeaderValue::from_str(origin) {
                    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
                    if !varies_on_origin(headers) {
                        headers.append(VARY, HeaderValue::from_static("Origin"));
                    }
                }
            }
            Some(_) => return,
            None => {}
        }

        headers.insert(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, self.allow_methods.clone());
        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, self.allow_headers.clone());
        headers.insert(ACCESS_CONTROL_MAX_AGE, self.max_age.clone());
    }

    /// Empty 200 answer to an `OPTIONS` preflight.
    pub fn preflight(&self, origin: Option<&str>) -> Response {
        let mut response = (StatusCode::OK, Body::empty()).into_response();
        self.apply(response.headers_mut(), origin);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(environment: Environment) -> CorsPolicy {
        let config = CorsConfig {
            production_origins: vec!["https://admin.example.com".to_string()],
            ..CorsConfig::default()
        };
        CorsPolicy::from_config(&config, environment).unwrap()
    }

    #[test]
    fn test_security_headers_applied_and_fingerprints_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(SERVER, HeaderValue::from_static("nginx"));
        headers.insert("x-powered-by", HeaderValue::from_static("Next.js"));

        let security = SecurityHeaders::default();
        security.apply(&mut headers);

        assert_eq!(headers[X_FRAME_OPTIONS], "DENY");
        assert_eq!(headers[X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(headers[X_XSS_PROTECTION], "1; mode=block");
        assert_eq!(headers[REFERRER_POLICY], "strict-origin-when-cross-origin");
        assert!(headers[CONTENT_SECURITY_POLICY]
            .to_str()
            .unwrap()
            .contains("frame-ancestors 'none'"));
        assert!(headers.contains_key(STRICT_TRANSPORT_SECURITY));
        assert!(headers.contains_key("permissions-policy"));
        assert!(!headers.contains_key(SERVER));
        assert!(!headers.contains_key("x-powered-by"));
    }

    #[test]
    fn test_security_headers_idempotent() {
        let security = SecurityHeaders::default();
        let mut once = HeaderMap::new();
        security.apply(&mut once);
        let mut twice = once.clone();
        security.apply(&mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_invalid_header_config_is_error() {
        let config = HeadersConfig {
            content_security_policy: "bad\nvalue".to_string(),
            ..HeadersConfig::default()
        };
        assert!(SecurityHeaders::from_config(&config).is_err());
    }

    #[test]
    fn test_allowed_origin_is_echoed() {
        let mut headers = HeaderMap::new();
        policy(Environment::Development).apply(&mut headers, Some("http://localhost:3000"));

        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "http://localhost:3000");
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(headers[ACCESS_CONTROL_MAX_AGE], "86400");
        assert!(headers[ACCESS_CONTROL_ALLOW_METHODS]
            .to_str()
            .unwrap()
            .contains("DELETE"));
    }

    #[test]
    fn test_disallowed_origin_gets_nothing() {
        let mut headers = HeaderMap::new();
        policy(Environment::Production).apply(&mut headers, Some("https://evil.example"));
        assert!(headers.is_empty());

        // dev origins are not accepted in production
        policy(Environment::Production).apply(&mut headers, Some("http://localhost:3000"));
        assert!(headers.is_empty());
    }

    #[test]
    fn test_absent_origin_gets_methods_without_echo() {
        let mut headers = HeaderMap::new();
        policy(Environment::Production).apply(&mut headers, None);
        assert!(!headers.contains_key(ACCESS_CONTROL_ALLOW_ORIGIN));
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert!(headers.contains_key(ACCESS_CONTROL_ALLOW_HEADERS));
    }

    #[test]
    fn test_preflight_is_empty_ok() {
        let response =
            policy(Environment::Production).preflight(Some("https://admin.example.com"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://admin.example.com"
        );
    }

    #[test]
    fn test_vary_origin_added_once() {
        let cors = policy(Environment::Development);
        let mut headers = HeaderMap::new();
        headers.insert(VARY, HeaderValue::from_static("Accept-Encoding"));
        cors.apply(&mut headers, Some("http://localhost:3000"));
        cors.apply(&mut headers, Some("http://localhost:3000"));
        assert_eq!(headers.get_all(VARY).iter().count(), 2);
    }
}
