use std::{future::IntoFuture, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use portcullis::{
    adapters::{FileConfigProvider, build_router, rate_limiter_from_settings},
    config::{Environment, SecurityConfigValidator, loader::load_config},
    core::{SecurityService, SessionIdentity, SharedSecurity, TokenService, events::TracingEventSink},
    metrics,
    ports::config_provider::ConfigProvider,
    tracing_setup,
    utils::GracefulShutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "portcullis.toml")]
    config: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a configuration file
    Validate {
        #[clap(short, long, default_value = "portcullis.toml")]
        config: String,
    },
    /// Write a starter configuration file with a fresh signing secret
    Init {
        #[clap(short, long, default_value = "portcullis.toml")]
        config: String,
    },
    /// Start the server (default)
    Serve {
        #[clap(short, long, default_value = "portcullis.toml")]
        config: String,
    },
    /// Print a session token for the configured admin, for scripted API calls
    IssueToken {
        #[clap(short, long, default_value = "portcullis.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::IssueToken { config }) => issue_token_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let provider =
        FileConfigProvider::new(config_path).context("Failed to create config provider")?;
    let config = provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;

    let tracing_result = if config.environment.is_production() {
        tracing_setup::init_tracing()
    } else {
        tracing_setup::init_console_tracing()
    };
    tracing_result.map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    metrics::init_metrics().map_err(|e| eyre!("Failed to initialize metrics: {}", e))?;

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let environment = config.environment;

    let limiter = rate_limiter_from_settings(&config.rate_limit)?;
    let sink = Arc::new(TracingEventSink::new(environment));
    let shared = SecurityService::new(config, limiter, sink)
        .context("Failed to build security service")?
        .into_shared();

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    spawn_config_watcher(
        Arc::new(provider),
        shared.clone(),
        graceful_shutdown.shutdown_token(),
    );

    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_handler_shutdown.run_signal_handler().await {
            tracing::error!("Signal handler error: {}", e);
        }
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    tracing::info!(
        %addr,
        %environment,
        store = shared.load().limiter().store_name(),
        "Portcullis listening"
    );

    let app = build_router(shared);
    let shutdown_token = graceful_shutdown.shutdown_token();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_token.cancelled().await;
    });

    let drain_token = graceful_shutdown.shutdown_token();
    let drain_timeout = graceful_shutdown.drain_timeout();
    tokio::select! {
        result = server.into_future() => result.context("Server error")?,
        _ = async move {
            drain_token.cancelled().await;
            tokio::time::sleep(drain_timeout).await;
        } => {
            tracing::warn!(?drain_timeout, "In-flight requests did not drain in time, exiting");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Rebuild the security service whenever the config file changes.
///
/// The rate limiter and event sink carry over, so counters survive a reload.
/// A config that fails to load or validate is logged and ignored.
fn spawn_config_watcher(
    provider: Arc<dyn ConfigProvider>,
    shared: SharedSecurity,
    shutdown: portcullis::utils::ShutdownToken,
) {
    let Some(mut notify_rx) = provider.watch() else {
        tracing::warn!("Config provider offers no change notifications; hot reload disabled");
        return;
    };
    let debounce = Duration::from_millis(500);

    tokio::spawn(async move {
        tracing::info!(source = %provider.source(), "Config watcher started");
        let cancelled = shutdown.cancelled();
        tokio::pin!(cancelled);

        loop {
            tokio::select! {
                _ = &mut cancelled => break,
                signal = notify_rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                }
            }

            // editors often write in several steps
            tokio::time::sleep(debounce).await;
            while notify_rx.try_recv().is_ok() {}

            match provider.load_config().await {
                Ok(config) => match shared.load().reload(config) {
                    Ok(service) => {
                        shared.store(Arc::new(service));
                        tracing::info!("Security configuration reloaded");
                    }
                    Err(e) => tracing::error!(
                        "Failed to apply reloaded configuration: {:#}. Keeping old configuration.",
                        e
                    ),
                },
                Err(e) => tracing::error!(
                    "Failed to reload configuration: {:#}. Keeping old configuration.",
                    e
                ),
            }
        }

        tracing::info!("Config watcher stopped");
    });
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        println!("Note: '{config_path}' not found, validating defaults and environment only");
    }

    let config = match load_config(config_path).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match SecurityConfigValidator::validate(&config) {
        Ok(()) => {
            println!("Configuration is valid.");
            println!();
            println!("   Listen address:   {}", config.listen_addr);
            println!("   Environment:      {}", config.environment);
            println!(
                "   Rate limit store: {}",
                match config.rate_limit.store {
                    portcullis::config::RateLimitStoreConfig::Memory => "memory (single instance)",
                    portcullis::config::RateLimitStoreConfig::Rest { .. } => "rest (shared)",
                }
            );
            println!(
                "   CORS origins:     {}",
                config.cors.origins_for(config.environment).join(", ")
            );
            println!(
                "   Protected routes: {}",
                config.gate.protected_routes.join(", ")
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("Error: configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let secret = format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    );
    let template = format!(
        r#"# Portcullis configuration
#
# Every value can be overridden with PORTCULLIS__SECTION__KEY environment
# variables; JWT_SECRET, ADMIN_USERNAME, ADMIN_PASSWORD, APP_ENV,
# RATE_LIMIT_REST_URL and RATE_LIMIT_REST_TOKEN are also honored.

listen_addr = "127.0.0.1:3000"
environment = "development"

[jwt]
secret = "{secret}"
ttl = "2h"

[admin]
username = "admin"
password = "change-me"

[rate_limit]
api_max_requests = 100
api_window = "15m"
login_max_attempts = 5
login_window = "15m"

# Counters shared by every instance. Without this block each instance
# keeps its own counters.
# [rate_limit.store]
# type = "rest"
# url = "https://your-kv-endpoint.example.com"
# token = "..."

[cors]
production_origins = ["https://admin.example.com"]
development_origins = ["http://localhost:3000"]
"#
    );

    tokio::fs::write(path, template)
        .await
        .context("Failed to write config file")?;
    println!("Created configuration at: {config_path}");
    println!("   Change the admin password, then run 'portcullis serve --config {config_path}'");
    Ok(())
}

/// Print a token for the configured admin
async fn issue_token_command(config_path: &str) -> Result<()> {
    let config = load_config(config_path).await?;
    SecurityConfigValidator::validate(&config).context("Invalid configuration")?;

    if config.environment == Environment::Production {
        eprintln!("Warning: issuing a production token; treat it like the admin password");
    }

    let tokens = TokenService::from_config(&config.jwt)?;
    let identity = SessionIdentity::new(
        &config.admin.user_id,
        &config.admin.username,
        &config.admin.role,
    );
    let token = tokens
        .issue(&identity)
        .map_err(|e| eyre!("Failed to issue token: {}", e))?;
    println!("{token}");
    Ok(())
}
