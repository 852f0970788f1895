//! Portcullis - a request security pipeline for admin dashboards.
//!
//! Portcullis sits in front of a video administration dashboard built on
//! axum and decides, for every request, whether it may reach the
//! application. It follows a **hexagonal architecture**: the decision logic
//! lives in `core`, the seams to the outside world are traits in `ports`,
//! and `adapters` wire them into axum, the filesystem and HTTP stores.
//!
//! # Features
//! - Signed session tokens (HS256) carried in an `HttpOnly` cookie or a bearer header
//! - Fixed-window rate limiting, in memory or shared through a REST counter store
//! - Input sanitization with SQL injection / XSS / path traversal detection
//! - Security headers, a content security policy and an origin allow-list for CORS
//! - A request gate that blocks scanners, redirects anonymous page loads and
//!   forwards the verified identity to handlers
//! - An API guard layer that validates and rewrites JSON bodies per route
//! - A structured security event log with severity levels
//! - Live configuration reload & validation
//!
//! # Quick Example
//! ```no_run
//! use portcullis::{SecurityService, build_router, config::loader::load_config};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("portcullis.toml").await?;
//! let shared = SecurityService::with_defaults(config)?.into_shared();
//! let app = build_router(shared);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//! axum::serve(listener, app).await?;
//! # Ok(()) }
//! ```
//!
//! Application routes are protected by handing them to [`secure_router`] and
//! attaching an [`ApiGuardLayer`] to API handlers that accept bodies.
//!
//! # Error Handling
//! Setup and configuration APIs return `eyre::Result<T>` with context attached
//! through `WrapErr`. Request-path failures are domain errors that map onto
//! JSON error responses and never leak internal detail in production.
//!
//! # Concurrency & Data Structures
//! Rate-limit counters live in `scc::HashMap`; the active configuration is an
//! `arc_swap::ArcSwap` so reloads never block requests.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{ApiGuardLayer, FileConfigProvider, build_router, secure_router},
    core::{GuardOptions, SecurityService, SharedSecurity},
    utils::GracefulShutdown,
};
