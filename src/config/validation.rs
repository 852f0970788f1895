#![allow(clippy::collapsible_if)]

use std::net::SocketAddr;

use regex::Regex;

use crate::config::models::{
    AdminConfig, CorsConfig, GateConfig, JwtConfig, RateLimitSettings, RateLimitStoreConfig,
    SecurityConfig,
};

/// Minimum signing secret length accepted in production.
pub const MIN_PRODUCTION_SECRET_LEN: usize = 32;

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Security configuration validator
pub struct SecurityConfigValidator;

impl SecurityConfigValidator {
    /// Validate the entire configuration, collecting every problem found.
    pub fn validate(config: &SecurityConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        errors.extend(Self::validate_jwt(&config.jwt, config.environment.is_production()));
        errors.extend(Self::validate_admin(&config.admin));
        errors.extend(Self::validate_rate_limit(&config.rate_limit));
        errors.extend(Self::validate_cors(
            &config.cors,
            config.environment.is_production(),
        ));
        errors.extend(Self::validate_gate(&config.gate));

        if config.guard.max_body_bytes == 0 {
            errors.push(ValidationError::InvalidField {
                field: "guard.max_body_bytes".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_jwt(jwt: &JwtConfig, production: bool) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if jwt.secret.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "jwt.secret".to_string(),
            });
        } else if production && jwt.secret.len() < MIN_PRODUCTION_SECRET_LEN {
            errors.push(ValidationError::InvalidField {
                field: "jwt.secret".to_string(),
                message: format!(
                    "Production secrets must be at least {MIN_PRODUCTION_SECRET_LEN} bytes"
                ),
            });
        }

        if jwt.issuer.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "jwt.issuer".to_string(),
            });
        }
        if jwt.audience.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "jwt.audience".to_string(),
            });
        }

        match jwt.ttl_duration() {
            Ok(ttl) if ttl.is_zero() => errors.push(ValidationError::InvalidField {
                field: "jwt.ttl".to_string(),
                message: "Token lifetime must be greater than zero".to_string(),
            }),
            Ok(_) => {}
            Err(e) => errors.push(ValidationError::InvalidField {
                field: "jwt.ttl".to_string(),
                message: e.to_string(),
            }),
        }

        errors
    }

    fn validate_admin(admin: &AdminConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if admin.username.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "admin.username".to_string(),
            });
        }
        if admin.password.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "admin.password".to_string(),
            });
        }
        errors
    }

    fn validate_rate_limit(settings: &RateLimitSettings) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for (field, value) in [
            ("rate_limit.api_max_requests", settings.api_max_requests),
            ("rate_limit.login_max_attempts", settings.login_max_attempts),
        ] {
            if value == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "Must be greater than 0".to_string(),
                });
            }
        }

        for (field, value) in [
            ("rate_limit.api_window", &settings.api_window),
            ("rate_limit.login_window", &settings.login_window),
            ("rate_limit.sweep_interval", &settings.sweep_interval),
        ] {
            match humantime::parse_duration(value) {
                Ok(d) if d.is_zero() => errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "Duration must be greater than zero".to_string(),
                }),
                Ok(_) => {}
                Err(e) => errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: format!("Invalid duration '{value}': {e}"),
                }),
            }
        }

        if let RateLimitStoreConfig::Rest { url, token, .. } = &settings.store {
            if let Err(e) = Self::validate_url(url, "rate_limit.store.url") {
                errors.push(e);
            }
            if token.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: "rate_limit.store.token".to_string(),
                });
            }
        }

        errors
    }

    fn validate_cors(cors: &CorsConfig, production: bool) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for origin in cors
            .production_origins
            .iter()
            .chain(cors.development_origins.iter())
        {
            if let Err(e) = Self::validate_url(origin, &format!("cors origin '{origin}'")) {
                errors.push(e);
            }
        }

        if production {
            if let Some(origin) = cors
                .production_origins
                .iter()
                .find(|o| o.starts_with("http://"))
            {
                errors.push(ValidationError::InvalidField {
                    field: "cors.production_origins".to_string(),
                    message: format!("Production origin '{origin}' must use https"),
                });
            }
        }

        for method in &cors.allowed_methods {
            if method.parse::<http::Method>().is_err() {
                errors.push(ValidationError::InvalidField {
                    field: "cors.allowed_methods".to_string(),
                    message: format!("'{method}' is not an HTTP method"),
                });
            }
        }

        errors
    }

    fn validate_gate(gate: &GateConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !gate.login_path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: "gate.login_path".to_string(),
                message: "Paths must start with '/'".to_string(),
            });
        }

        for route in gate
            .public_routes
            .iter()
            .chain(gate.protected_routes.iter())
            .chain(gate.static_prefixes.iter())
        {
            if !route.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: format!("gate route: {route}"),
                    message: "Paths must start with '/'".to_string(),
                });
            }
        }

        if gate.protected_routes.contains(&gate.login_path)
            && !gate.public_routes.contains(&gate.login_path)
        {
            errors.push(ValidationError::InvalidField {
                field: "gate.protected_routes".to_string(),
                message: format!(
                    "Login path '{}' cannot be protected (redirect loop)",
                    gate.login_path
                ),
            });
        }

        for pattern in gate
            .suspicious_user_agents
            .iter()
            .chain(gate.suspicious_paths.iter())
        {
            if let Err(e) = Regex::new(pattern) {
                errors.push(ValidationError::InvalidField {
                    field: "gate pattern".to_string(),
                    message: format!("Invalid regex '{pattern}': {e}"),
                });
            }
        }

        if gate.max_body_bytes == 0 {
            errors.push(ValidationError::InvalidField {
                field: "gate.max_body_bytes".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        errors
    }

    /// Validate URL format
    fn validate_url(url: &str, field_name: &str) -> ValidationResult<()> {
        match url::Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
            Ok(parsed) => Err(ValidationError::InvalidField {
                field: field_name.to_string(),
                message: format!(
                    "URL scheme '{}' is not supported. Use http or https",
                    parsed.scheme()
                ),
            }),
            Err(e) => Err(ValidationError::InvalidField {
                field: field_name.to_string(),
                message: format!("Invalid URL '{url}': {e}"),
            }),
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            errors[0].to_string()
        } else {
            let error_messages: Vec<String> = errors
                .iter()
                .enumerate()
                .map(|(i, e)| format!("  {}. {}", i + 1, e))
                .collect();
            format!(
                "Found {} validation errors:\n{}",
                errors.len(),
                error_messages.join("\n")
            )
        }
    }
}
