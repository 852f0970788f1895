//! Core security orchestration service.
//!
//! The `SecurityService` bundles one configuration snapshot with the leaf
//! services built from it (token verifier, header and CORS policy, request
//! gate) and the long-lived runtime state (rate limiter, event log). A config
//! reload builds a new service through [`SecurityService::reload`] that keeps
//! the same limiter and event sink, then swaps it in atomically.
use std::sync::Arc;

use arc_swap::ArcSwap;
use eyre::{Result, WrapErr};

use crate::{
    config::{Environment, SecurityConfig},
    core::{
        events::{SecurityEventLog, TracingEventSink},
        gate::RequestGate,
        headers::{CorsPolicy, SecurityHeaders},
        rate_limiter::RateLimiter,
        token::TokenService,
    },
    ports::event_sink::SecurityEventSink,
};

/// Handle shared by the router, middleware and the config watcher.
pub type SharedSecurity = Arc<ArcSwap<SecurityService>>;

/// Everything the pipeline stages need for one configuration snapshot.
#[derive(Debug)]
pub struct SecurityService {
    config: Arc<SecurityConfig>,
    tokens: TokenService,
    limiter: RateLimiter,
    events: SecurityEventLog,
    headers: SecurityHeaders,
    cors: CorsPolicy,
    gate: RequestGate,
}

impl SecurityService {
    /// Build a service around an existing limiter and event sink.
    pub fn new(
        config: SecurityConfig,
        limiter: RateLimiter,
        sink: Arc<dyn SecurityEventSink>,
    ) -> Result<Self> {
        let tokens = TokenService::from_config(&config.jwt)?;
        let headers = SecurityHeaders::from_config(&config.headers)
            .wrap_err("Failed to build security headers")?;
        let cors = CorsPolicy::from_config(&config.cors, config.environment)
            .wrap_err("Failed to build CORS policy")?;
        let gate = RequestGate::new(config.gate.clone()).wrap_err("Failed to build request gate")?;
        let events = SecurityEventLog::new(sink, config.environment);

        Ok(Self {
            config: Arc::new(config),
            tokens,
            limiter,
            events,
            headers,
            cors,
            gate,
        })
    }

    /// In-memory limiter and a tracing event sink.
    pub fn with_defaults(config: SecurityConfig) -> Result<Self> {
        let sweep = config
            .rate_limit
            .sweep_interval_duration()
            .wrap_err("Invalid rate_limit.sweep_interval")?;
        let sink = Arc::new(TracingEventSink::new(config.environment));
        Self::new(config, RateLimiter::in_memory(sweep), sink)
    }

    /// Build the replacement for a new configuration, keeping counters and sink.
    pub fn reload(&self, config: SecurityConfig) -> Result<Self> {
        let sink = self.events.sink();
        Self::new(config, self.limiter.clone(), sink)
    }

    /// Wrap in the shared, hot-swappable handle.
    pub fn into_shared(self) -> SharedSecurity {
        Arc::new(ArcSwap::from_pointee(self))
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub fn environment(&self) -> Environment {
        self.config.environment
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn events(&self) -> &SecurityEventLog {
        &self.events
    }

    pub fn headers(&self) -> &SecurityHeaders {
        &self.headers
    }

    pub fn cors(&self) -> &CorsPolicy {
        &self.cors
    }

    pub fn gate(&self) -> &RequestGate {
        &self.gate
    }

    /// Apply security headers and CORS for `origin` to an outgoing response.
    pub fn finish_response(&self, headers: &mut http::HeaderMap, origin: Option<&str>) {
        self.headers.apply(headers);
        self.cors.apply(headers, origin);
    }
}
