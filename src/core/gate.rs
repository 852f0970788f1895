//! Coarse, path-based request gate.
//!
//! [`RequestGate::evaluate`] runs the linear decision list every inbound
//! request goes through: scanner and suspicious path blocking, the body size cap,
//! preflight handling, public/static bypasses and finally session
//! verification. It decides; the HTTP adapter acts on the decision.
use http::{HeaderMap, Method, header};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use crate::{
    config::GateConfig,
    core::{
        events::{SecurityEventLog, Severity},
        session,
        token::{SessionClaims, TokenService},
    },
};

/// Scanner and attack tool signatures
static SCANNER_AGENTS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\bsqlmap\b").expect("valid regex"),
        Regex::new(r"(?i)\bnikto\b").expect("valid regex"),
        Regex::new(r"(?i)\bnmap\b").expect("valid regex"),
        Regex::new(r"(?i)\bmasscan\b").expect("valid regex"),
        Regex::new(r"(?i)\bzgrab\b").expect("valid regex"),
        Regex::new(r"(?i)\bnuclei\b").expect("valid regex"),
        Regex::new(r"(?i)\bmetasploit\b").expect("valid regex"),
        Regex::new(r"(?i)\bburp\s*suite\b|\bburpsuite\b").expect("valid regex"),
        Regex::new(r"(?i)\bacunetix\b").expect("valid regex"),
        Regex::new(r"(?i)\bnessus\b").expect("valid regex"),
        Regex::new(r"(?i)\bowasp\b.*\bzap\b").expect("valid regex"),
        Regex::new(r"(?i)\b(dir|go)buster\b").expect("valid regex"),
        Regex::new(r"(?i)\bwpscan\b").expect("valid regex"),
        Regex::new(r"(?i)\bjoomscan\b").expect("valid regex"),
        Regex::new(r"(?i)\bw3af\b").expect("valid regex"),
        Regex::new(r"(?i)\barachni\b").expect("valid regex"),
        Regex::new(r"(?i)\bskipfish\b").expect("valid regex"),
        Regex::new(r"(?i)\bhydra\b").expect("valid regex"),
        Regex::new(r"(?i)\bffuf\b").expect("valid regex"),
    ]
});

/// Paths no legitimate client of this dashboard asks for
static SUSPICIOUS_PATHS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // CMS and admin panels
        Regex::new(r"(?i)/wp-(admin|login|content|includes)").expect("valid regex"),
        Regex::new(r"(?i)/xmlrpc\.php").expect("valid regex"),
        Regex::new(r"(?i)/(phpmyadmin|pma|myadmin|adminer)").expect("valid regex"),
        Regex::new(r"(?i)/(administrator|admin\.php|config\.php|setup\.php)").expect("valid regex"),
        // VCS and dotfiles
        Regex::new(r"(?i)/\.(git|svn|hg|bzr)(/|$)").expect("valid regex"),
        Regex::new(r"(?i)/\.(env|htaccess|htpasswd|ds_store|aws|ssh)").expect("valid regex"),
        // Server internals
        Regex::new(r"(?i)/(cgi-bin|server-status|server-info)(/|$)").expect("valid regex"),
        Regex::new(r"(?i)/web\.config$").expect("valid regex"),
        Regex::new(r"(?i)\.(bak|sql|old|swp)$").expect("valid regex"),
        // Traversal
        Regex::new(r"\.\./|\.\.\\|(?i)%2e%2e").expect("valid regex"),
    ]
});

/// What the gate decided for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Refuse outright with a plain-text body
    Block {
        status: http::StatusCode,
        body: &'static str,
    },
    /// Answer an `OPTIONS` preflight
    Preflight,
    /// Pass through without authentication
    Bypass,
    /// Pass through; `None` when the route does not require a session and none was sent
    Proceed(Option<SessionClaims>),
    /// Send a browser to the login page
    Redirect {
        location: String,
        clear_cookie: bool,
    },
    /// JSON 401 for API-style paths
    Unauthorized { clear_cookie: bool },
}

impl GateDecision {
    /// Label used for the request outcome counter
    pub fn outcome(&self) -> &'static str {
        match self {
            GateDecision::Block { .. } => "blocked",
            GateDecision::Preflight => "preflight",
            GateDecision::Bypass => "bypass",
            GateDecision::Proceed(Some(_)) => "authenticated",
            GateDecision::Proceed(None) => "proceed",
            GateDecision::Redirect { .. } => "redirect",
            GateDecision::Unauthorized { .. } => "unauthorized",
        }
    }
}

/// What the gate needs to know about a request.
#[derive(Debug, Clone, Copy)]
pub struct GateRequest<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub client_ip: &'a str,
}

/// Path classification rules plus compiled extra signatures.
#[derive(Debug, Clone, Default)]
pub struct RequestGate {
    config: GateConfig,
    extra_agents: Vec<Regex>,
    extra_paths: Vec<Regex>,
}

fn compile_all(patterns: &[String], what: &str) -> eyre::Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| eyre::eyre!("Invalid {} pattern '{}': {}", what, p, e)))
        .collect()
}

impl RequestGate {
    pub fn new(config: GateConfig) -> eyre::Result<Self> {
        let extra_agents = compile_all(&config.suspicious_user_agents, "user agent")?;
        let extra_paths = compile_all(&config.suspicious_paths, "path")?;
        Ok(Self {
            config,
            extra_agents,
            extra_paths,
        })
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn is_suspicious_user_agent(&self, user_agent: &str) -> bool {
        SCANNER_AGENTS
            .iter()
            .chain(self.extra_agents.iter())
            .any(|re| re.is_match(user_agent))
    }

    pub fn is_suspicious_path(&self, path: &str) -> bool {
        SUSPICIOUS_PATHS
            .iter()
            .chain(self.extra_paths.iter())
            .any(|re| re.is_match(path))
    }

    pub fn is_static(&self, path: &str) -> bool {
        self.config
            .static_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Public API namespace and every `/api/*` outside the auth namespace.
    pub fn is_unauthenticated_api(&self, path: &str) -> bool {
        if path.starts_with(self.config.public_api_prefix.as_str()) {
            return true;
        }
        path.starts_with("/api/") && !path.starts_with(self.config.auth_api_prefix.as_str())
    }

    pub fn is_public_route(&self, path: &str) -> bool {
        self.config.public_routes.iter().any(|route| route == path)
    }

    /// `/` matches only itself; other routes match themselves and their sub-paths.
    pub fn is_protected(&self, path: &str) -> bool {
        self.config.protected_routes.iter().any(|route| {
            if route == "/" {
                return path == "/";
            }
            path == route
                || path
                    .strip_prefix(route.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    fn is_api_path(path: &str) -> bool {
        path == "/api" || path.starts_with("/api/")
    }

    fn deny_session(&self, path: &str, clear_cookie: bool) -> GateDecision {
        if Self::is_api_path(path) {
            GateDecision::Unauthorized { clear_cookie }
        } else {
            GateDecision::Redirect {
                location: self.config.login_path.clone(),
                clear_cookie,
            }
        }
    }

    /// Run the decision list for one request.
    pub fn evaluate(
        &self,
        request: GateRequest<'_>,
        tokens: &TokenService,
        events: &SecurityEventLog,
    ) -> GateDecision {
        let path = request.path;
        let user_agent = request
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if !user_agent.is_empty() && self.is_suspicious_user_agent(user_agent) {
            events.log(
                "suspicious_user_agent",
                Severity::High,
                json!({"userAgent": user_agent, "path": path, "ip": request.client_ip}),
            );
            return GateDecision::Block {
                status: http::StatusCode::FORBIDDEN,
                body: "Access Denied",
            };
        }

        if self.is_suspicious_path(path) {
            events.log(
                "suspicious_path_access",
                Severity::High,
                json!({"path": path, "userAgent": user_agent, "ip": request.client_ip}),
            );
            return GateDecision::Block {
                status: http::StatusCode::NOT_FOUND,
                body: "Not Found",
            };
        }

        if request.method != Method::GET {
            let declared = request
                .headers
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            if let Some(size) = declared.filter(|size| *size > self.config.max_body_bytes) {
                events.log(
                    "large_request_blocked",
                    Severity::Medium,
                    json!({"path": path, "size": size, "ip": request.client_ip}),
                );
                return GateDecision::Block {
                    status: http::StatusCode::PAYLOAD_TOO_LARGE,
                    body: "Request too large",
                };
            }
        }

        if request.method == Method::OPTIONS {
            return GateDecision::Preflight;
        }

        if self.is_static(path) || self.is_unauthenticated_api(path) {
            return GateDecision::Bypass;
        }

        if self.is_public_route(path) {
            return GateDecision::Bypass;
        }

        let Some(token) = session::session_token(request.headers) else {
            if self.is_protected(path) {
                return self.deny_session(path, false);
            }
            return GateDecision::Proceed(None);
        };

        match tokens.verify(&token) {
            Ok(claims) => GateDecision::Proceed(Some(claims)),
            Err(e) => {
                events.log(
                    "invalid_session_token",
                    Severity::Medium,
                    json!({"path": path, "reason": e.to_string(), "ip": request.client_ip}),
                );
                self.deny_session(path, true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use http::{HeaderValue, StatusCode};

    use super::*;
    use crate::{
        config::Environment,
        core::{events::MemoryEventSink, token::SessionIdentity},
    };

    struct Fixture {
        gate: RequestGate,
        tokens: TokenService,
        sink: Arc<MemoryEventSink>,
        events: SecurityEventLog,
    }

    fn fixture() -> Fixture {
        let sink = Arc::new(MemoryEventSink::new());
        Fixture {
            gate: RequestGate::default(),
            tokens: TokenService::new(
                "gate-test-secret-gate-test-secret",
                "video-admin-dashboard",
                "video-admin-users",
                Duration::from_secs(7200),
            ),
            events: SecurityEventLog::new(sink.clone(), Environment::Test),
            sink,
        }
    }

    impl Fixture {
        fn run(&self, method: Method, path: &str, headers: &HeaderMap) -> GateDecision {
            self.gate.evaluate(
                GateRequest {
                    method: &method,
                    path,
                    headers,
                    client_ip: "127.0.0.1",
                },
                &self.tokens,
                &self.events,
            )
        }
    }

    fn with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_scanner_agent_blocked() {
        let f = fixture();
        let decision = f.run(Method::GET, "/dashboard", &with("user-agent", "sqlmap/1.7.2#stable"));
        assert_eq!(
            decision,
            GateDecision::Block {
                status: StatusCode::FORBIDDEN,
                body: "Access Denied"
            }
        );
        assert_eq!(f.sink.named("suspicious_user_agent")[0].severity, Severity::High);
    }

    #[test]
    fn test_browser_agent_passes() {
        let f = fixture();
        let ua = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_0) AppleWebKit/605.1.15 Safari/605.1.15";
        assert_eq!(f.run(Method::GET, "/login", &with("user-agent", ua)), GateDecision::Bypass);
        assert!(f.sink.events().is_empty());
    }

    #[test]
    fn test_suspicious_path_is_not_found() {
        let f = fixture();
        for path in ["/wp-admin/setup.php", "/.env", "/.git/config", "/phpmyadmin/index.php"] {
            let decision = f.run(Method::GET, path, &HeaderMap::new());
            assert_eq!(
                decision,
                GateDecision::Block {
                    status: StatusCode::NOT_FOUND,
                    body: "Not Found"
                },
                "{path}"
            );
        }
        assert_eq!(f.sink.named("suspicious_path_access").len(), 4);
    }

    #[test]
    fn test_large_non_get_blocked() {
        let f = fixture();
        let headers = with("content-length", &(11 * 1024 * 1024).to_string());
        assert!(matches!(
            f.run(Method::POST, "/api/videos", &headers),
            GateDecision::Block {
                status: StatusCode::PAYLOAD_TOO_LARGE,
                ..
            }
        ));
        assert_eq!(f.sink.named("large_request_blocked")[0].severity, Severity::Medium);

        // GET is never size-checked
        assert_eq!(f.run(Method::GET, "/api/videos", &headers), GateDecision::Bypass);
    }

    #[test]
    fn test_preflight() {
        let f = fixture();
        assert_eq!(f.run(Method::OPTIONS, "/api/auth/login", &HeaderMap::new()), GateDecision::Preflight);
    }

    #[test]
    fn test_bypasses() {
        let f = fixture();
        let none = HeaderMap::new();
        assert_eq!(f.run(Method::GET, "/_next/static/chunk.js", &none), GateDecision::Bypass);
        assert_eq!(f.run(Method::GET, "/favicon.ico", &none), GateDecision::Bypass);
        assert_eq!(f.run(Method::GET, "/api/public/health", &none), GateDecision::Bypass);
        assert_eq!(f.run(Method::GET, "/api/videos", &none), GateDecision::Bypass);
        assert_eq!(f.run(Method::POST, "/api/auth/login", &none), GateDecision::Bypass);
    }

    #[test]
    fn test_protected_without_cookie_redirects() {
        let f = fixture();
        let none = HeaderMap::new();
        for path in ["/", "/dashboard", "/videos/42/edit", "/settings"] {
            assert_eq!(
                f.run(Method::GET, path, &none),
                GateDecision::Redirect {
                    location: "/login".to_string(),
                    clear_cookie: false
                },
                "{path}"
            );
        }
    }

    #[test]
    fn test_protected_prefix_respects_segments() {
        let gate = RequestGate::default();
        assert!(gate.is_protected("/videos"));
        assert!(gate.is_protected("/videos/1"));
        assert!(!gate.is_protected("/videosx"));
        assert!(!gate.is_protected("/about"));
    }

    #[test]
    fn test_valid_cookie_proceeds_with_claims() {
        let f = fixture();
        let token = f
            .tokens
            .issue(&SessionIdentity::new("admin", "root", "admin"))
            .unwrap();
        let headers = with("cookie", &format!("auth-token={token}"));

        match f.run(Method::GET, "/videos", &headers) {
            GateDecision::Proceed(Some(claims)) => {
                assert_eq!(claims.username, "root");
                assert_eq!(claims.role, "admin");
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_bad_cookie_clears_and_redirects() {
        let f = fixture();
        let headers = with("cookie", "auth-token=forged.token.value");
        assert_eq!(
            f.run(Method::GET, "/dashboard", &headers),
            GateDecision::Redirect {
                location: "/login".to_string(),
                clear_cookie: true
            }
        );
        assert_eq!(f.sink.named("invalid_session_token").len(), 1);
    }

    #[test]
    fn test_bad_cookie_on_api_path_is_unauthorized() {
        let f = fixture();
        let headers = with("cookie", "auth-token=forged.token.value");
        assert_eq!(
            f.run(Method::GET, "/api/auth/session", &headers),
            GateDecision::Unauthorized { clear_cookie: true }
        );
    }

    #[test]
    fn test_unprotected_page_without_cookie_proceeds() {
        let f = fixture();
        assert_eq!(f.run(Method::GET, "/about", &HeaderMap::new()), GateDecision::Proceed(None));
    }

    #[test]
    fn test_extra_patterns_from_config() {
        let gate = RequestGate::new(GateConfig {
            suspicious_user_agents: vec!["(?i)badbot".to_string()],
            suspicious_paths: vec!["^/internal/".to_string()],
            ..GateConfig::default()
        })
        .unwrap();
        assert!(gate.is_suspicious_user_agent("BadBot/2.0"));
        assert!(gate.is_suspicious_path("/internal/metrics"));

        let broken = RequestGate::new(GateConfig {
            suspicious_paths: vec!["(".to_string()],
            ..GateConfig::default()
        });
        assert!(broken.is_err());
    }
}
