use async_trait::async_trait;
use eyre::Result;
use tokio::sync::mpsc;

use crate::config::models::SecurityConfig;

/// Source of security configuration that may change while the process runs.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Load and validate the current configuration.
    async fn load_config(&self) -> Result<SecurityConfig>;

    /// Change notifications. Each signal should trigger a `load_config`.
    /// Only the first caller gets the receiver; later calls return `None`.
    fn watch(&self) -> Option<mpsc::Receiver<()>>;

    /// Where the configuration comes from, for logs.
    fn source(&self) -> String;
}
