pub mod config_providers;
pub mod guard_layer;
pub mod http_handler;
pub mod middleware;
pub mod rest_store;

/// Re-export commonly used types from adapters
pub use config_providers::FileConfigProvider;
pub use guard_layer::ApiGuardLayer;
pub use http_handler::{HandlerError, auth_routes, build_router, secure_router};
pub use middleware::request_gate_middleware;
pub use rest_store::{RestCounterStore, rate_limiter_from_settings};
