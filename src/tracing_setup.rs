use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// JSON logs for production, one object per line
pub fn init_tracing() -> Result<()> {
    Registry::default()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install JSON tracing subscriber")?;

    tracing::info!("Portcullis structured logging initialized");
    Ok(())
}

/// Human-readable logs for development
pub fn init_console_tracing() -> Result<()> {
    Registry::default()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install console tracing subscriber")?;

    tracing::info!("Portcullis console logging initialized");
    Ok(())
}

/// Initialize tracing with an explicit filter directive and format
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    }
    .wrap_err("Failed to install tracing subscriber")?;

    tracing::info!(level, json_format, "Portcullis logging initialized");
    Ok(())
}

/// Span for one pass through the security pipeline
pub fn create_request_span(
    request_id: &str,
    method: &str,
    path: &str,
    client_ip: &str,
) -> tracing::Span {
    tracing::info_span!(
        "security_pipeline",
        request_id = request_id,
        http.method = method,
        http.path = path,
        client.ip = client_ip,
        http.status_code = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_with_config() {
        assert!(init_tracing_with_config("debug", true, true).is_ok());
        // a second global subscriber is refused, not a panic
        assert!(init_tracing_with_config("debug", false, false).is_err());
    }

    #[test]
    fn test_invalid_level_is_error() {
        assert!(init_tracing_with_config("portcullis=verbose", true, false).is_err());
    }

    #[test]
    fn test_create_request_span() {
        tracing::subscriber::with_default(Registry::default(), || {
            let span = create_request_span("req-1", "GET", "/dashboard", "192.0.2.1");
            assert_eq!(span.metadata().map(|m| m.name()), Some("security_pipeline"));
        });
    }
}
