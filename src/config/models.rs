//! Configuration data structures for Portcullis.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files and to
//! `PORTCULLIS__*` environment variables. Every section carries defaults so a
//! development instance only needs a signing secret and admin credentials.
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default issuer claim bound into every session token.
pub const DEFAULT_TOKEN_ISSUER: &str = "video-admin-dashboard";
/// Default audience claim bound into every session token.
pub const DEFAULT_TOKEN_AUDIENCE: &str = "video-admin-users";
/// Name of the session cookie carrying the signed token.
pub const SESSION_COOKIE_NAME: &str = "auth-token";

/// Deployment environment. Drives CORS origin selection, cookie `Secure`
/// flag and the shape of security event output.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    #[default]
    Development,
    Production,
    Test,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
            Environment::Test => "test",
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session token signing parameters.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct JwtConfig {
    /// HMAC secret shared by every instance
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    /// Token lifetime, parsed by humantime (e.g. "2h")
    pub ttl: String,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            issuer: DEFAULT_TOKEN_ISSUER.to_string(),
            audience: DEFAULT_TOKEN_AUDIENCE.to_string(),
            ttl: "2h".to_string(),
        }
    }
}

impl JwtConfig {
    pub fn ttl_duration(&self) -> Result<Duration, humantime::DurationError> {
        humantime::parse_duration(&self.ttl)
    }
}

/// The single administrator account of the dashboard.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AdminConfig {
    pub username: String,
    pub password: String,
    pub user_id: String,
    pub role: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            user_id: "admin".to_string(),
            role: "admin".to_string(),
        }
    }
}

/// Where rate-limit counters live.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStoreConfig {
    /// Per-process counters. Only correct for a single instance.
    #[default]
    Memory,
    /// Redis-compatible REST endpoint shared by every instance.
    Rest {
        url: String,
        token: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

fn default_key_prefix() -> String {
    "portcullis:rl:".to_string()
}

/// Rate limit thresholds for the API guard and the login endpoint.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitSettings {
    pub api_max_requests: u32,
    /// Parsed by humantime, e.g. "1m", "15m"
    pub api_window: String,
    pub login_max_attempts: u32,
    pub login_window: String,
    /// Minimum time between opportunistic sweeps of expired in-memory records
    pub sweep_interval: String,
    pub store: RateLimitStoreConfig,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            api_max_requests: 100,
            api_window: "15m".to_string(),
            login_max_attempts: 5,
            login_window: "15m".to_string(),
            sweep_interval: "1m".to_string(),
            store: RateLimitStoreConfig::Memory,
        }
    }
}

impl RateLimitSettings {
    pub fn api_window_duration(&self) -> Result<Duration, humantime::DurationError> {
        humantime::parse_duration(&self.api_window)
    }

    pub fn login_window_duration(&self) -> Result<Duration, humantime::DurationError> {
        humantime::parse_duration(&self.login_window)
    }

    pub fn sweep_interval_duration(&self) -> Result<Duration, humantime::DurationError> {
        humantime::parse_duration(&self.sweep_interval)
    }
}

/// Cross-origin policy. The active allow-list depends on [`Environment`].
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CorsConfig {
    pub production_origins: Vec<String>,
    pub development_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            production_origins: Vec::new(),
            development_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            allowed_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            allowed_headers: ["Content-Type", "Authorization", "X-Requested-With"]
                .iter()
                .map(|h| h.to_string())
                .collect(),
            max_age_secs: 86_400,
        }
    }
}

impl CorsConfig {
    /// Origins accepted in the given environment.
    pub fn origins_for(&self, environment: Environment) -> &[String] {
        if environment.is_production() {
            &self.production_origins
        } else {
            &self.development_origins
        }
    }
}

/// Security response headers. Only the CSP is commonly tuned per deployment.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HeadersConfig {
    pub content_security_policy: String,
    pub strict_transport_security: String,
    pub referrer_policy: String,
    pub permissions_policy: String,
}

impl Default for HeadersConfig {
    fn default() -> Self {
        Self {
            content_security_policy: "default-src 'self'; script-src 'self' 'unsafe-inline' 'unsafe-eval'; \
style-src 'self' 'unsafe-inline'; img-src 'self' data: https:; font-src 'self' data:; \
connect-src 'self' https:; media-src 'self' https:; frame-ancestors 'none'; base-uri 'self'; form-action 'self'"
                .to_string(),
            strict_transport_security: "max-age=31536000; includeSubDomains; preload".to_string(),
            referrer_policy: "strict-origin-when-cross-origin".to_string(),
            permissions_policy: "camera=(), microphone=(), geolocation=(), payment=()".to_string(),
        }
    }
}

/// Path classification and coarse blocking rules of the request gate.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GateConfig {
    pub login_path: String,
    /// Exact-match routes that never require a session
    pub public_routes: Vec<String>,
    /// Routes requiring a session (exact match or path-segment prefix)
    pub protected_routes: Vec<String>,
    /// Prefixes served as static assets
    pub static_prefixes: Vec<String>,
    pub public_api_prefix: String,
    pub auth_api_prefix: String,
    /// Largest accepted `content-length` for non-GET requests
    pub max_body_bytes: u64,
    /// Extra scanner signatures (regex) on top of the built-in list
    pub suspicious_user_agents: Vec<String>,
    /// Extra suspicious paths (regex) on top of the built-in list
    pub suspicious_paths: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            login_path: "/login".to_string(),
            public_routes: vec![
                "/login".to_string(),
                "/api/auth/login".to_string(),
                "/api/auth/logout".to_string(),
            ],
            protected_routes: [
                "/",
                "/dashboard",
                "/videos",
                "/categories",
                "/notifications",
                "/slider",
                "/settings",
                "/legal",
            ]
            .iter()
            .map(|r| r.to_string())
            .collect(),
            static_prefixes: vec![
                "/_next/".to_string(),
                "/static/".to_string(),
                "/images/".to_string(),
                "/favicon.ico".to_string(),
            ],
            public_api_prefix: "/api/public/".to_string(),
            auth_api_prefix: "/api/auth/".to_string(),
            max_body_bytes: 10 * 1024 * 1024,
            suspicious_user_agents: Vec::new(),
            suspicious_paths: Vec::new(),
        }
    }
}

/// Defaults for routes wrapped by the API guard.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GuardConfig {
    pub max_body_bytes: usize,
    pub allowed_content_types: Vec<String>,
    /// JSON fields treated as rich text (HTML sanitized instead of flattened)
    pub html_fields: Vec<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 1024 * 1024,
            allowed_content_types: vec![
                "application/json".to_string(),
                "multipart/form-data".to_string(),
                "application/x-www-form-urlencoded".to_string(),
                "text/plain".to_string(),
            ],
            html_fields: vec!["content".to_string(), "body".to_string()],
        }
    }
}

/// Root configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SecurityConfig {
    pub listen_addr: String,
    pub environment: Environment,
    pub jwt: JwtConfig,
    pub admin: AdminConfig,
    pub rate_limit: RateLimitSettings,
    pub cors: CorsConfig,
    pub headers: HeadersConfig,
    pub gate: GateConfig,
    pub guard: GuardConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".to_string(),
            environment: Environment::Development,
            jwt: JwtConfig::default(),
            admin: AdminConfig::default(),
            rate_limit: RateLimitSettings::default(),
            cors: CorsConfig::default(),
            headers: HeadersConfig::default(),
            gate: GateConfig::default(),
            guard: GuardConfig::default(),
        }
    }
}

impl SecurityConfig {
    /// Create a new configuration builder
    pub fn builder() -> SecurityConfigBuilder {
        SecurityConfigBuilder::default()
    }
}

/// Builder for SecurityConfig, mostly used by tests and embedders.
#[derive(Default)]
pub struct SecurityConfigBuilder {
    config: SecurityConfig,
}

impl SecurityConfigBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.config.environment = environment;
        self
    }

    pub fn jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.jwt.secret = secret.into();
        self
    }

    pub fn admin(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.admin.username = username.into();
        self.config.admin.password = password.into();
        self
    }

    pub fn rate_limit(mut self, settings: RateLimitSettings) -> Self {
        self.config.rate_limit = settings;
        self
    }

    pub fn cors(mut self, cors: CorsConfig) -> Self {
        self.config.cors = cors;
        self
    }

    pub fn gate(mut self, gate: GateConfig) -> Self {
        self.config.gate = gate;
        self
    }

    pub fn guard(mut self, guard: GuardConfig) -> Self {
        self.config.guard = guard;
        self
    }

    /// Build the final SecurityConfig
    pub fn build(self) -> Result<SecurityConfig, String> {
        if self.config.jwt.secret.is_empty() {
            return Err("jwt.secret is required".to_string());
        }
        Ok(self.config)
    }
}
