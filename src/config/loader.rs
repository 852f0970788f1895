use std::path::Path;

use config::{Config, Environment as EnvSource, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::SecurityConfig;

/// Conventional variables mapped onto configuration keys. They take priority
/// over both the file and the `PORTCULLIS__*` namespace.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("APP_ENV", "environment"),
    ("JWT_SECRET", "jwt.secret"),
    ("ADMIN_USERNAME", "admin.username"),
    ("ADMIN_PASSWORD", "admin.password"),
    ("RATE_LIMIT_REST_URL", "rate_limit.store.url"),
    ("RATE_LIMIT_REST_TOKEN", "rate_limit.store.token"),
];

fn file_format(config_path: &Path) -> FileFormat {
    match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Toml, // Default to TOML
    }
}

/// Load configuration from a file (if it exists) layered with environment variables.
/// Supports multiple formats: YAML, JSON, TOML, etc.
pub async fn load_config(config_path: &str) -> Result<SecurityConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<SecurityConfig> {
    let config_path = Path::new(config_path);

    let mut builder = Config::builder()
        .add_source(
            File::new(
                config_path
                    .to_str()
                    .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
                file_format(config_path),
            )
            .required(false),
        )
        .add_source(
            EnvSource::with_prefix("PORTCULLIS")
                .prefix_separator("__")
                .separator("__"),
        );

    let rest_store_configured = std::env::var("RATE_LIMIT_REST_URL").is_ok();
    if rest_store_configured {
        builder = builder
            .set_override("rate_limit.store.type", "rest")
            .wrap_err("Failed to select REST rate limit store")?;
    }

    for (variable, key) in ENV_OVERRIDES {
        builder = builder
            .set_override_option(*key, std::env::var(variable).ok())
            .with_context(|| format!("Failed to apply {variable} override"))?;
    }

    let settings = builder
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let security_config: SecurityConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(security_config)
}
