pub mod config_provider;
pub mod event_sink;
pub mod rate_limit_store;
