use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use eyre::{Result, WrapErr};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    config::{RateLimitSettings, RateLimitStoreConfig},
    core::rate_limiter::RateLimiter,
    ports::rate_limit_store::{RateLimitDecision, RateLimitStore, StoreError, StoreResult},
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// One reply of a `/multi-exec` pipeline.
#[derive(Debug, Deserialize)]
struct PipelineReply {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Counter store on a Redis-compatible REST endpoint.
///
/// The window starts with the first attempt and the counter is shared by every
/// instance pointing at the same endpoint. See [`RateLimitStore::hit`] on this
/// type for how attempts are counted.
pub struct RestCounterStore {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    key_prefix: String,
}

impl std::fmt::Debug for RestCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestCounterStore")
            .field("endpoint", &self.endpoint)
            .field("key_prefix", &self.key_prefix)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl RestCounterStore {
    pub fn new(
        base_url: &str,
        token: impl Into<String>,
        key_prefix: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(4)
            .build()
            .wrap_err("Failed to create rate limit store client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/multi-exec", base_url.trim_end_matches('/')),
            token: token.into(),
            key_prefix: key_prefix.into(),
        })
    }

    fn key(&self, identifier: &str) -> String {
        format!("{}{}", self.key_prefix, identifier)
    }

    async fn exec(&self, commands: Value) -> StoreResult<Vec<PipelineReply>> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&commands)
            .send()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let replies: Vec<PipelineReply> = response
            .json()
            .await
            .map_err(|e| StoreError::Protocol(e.to_string()))?;

        if let Some(error) = replies.iter().find_map(|r| r.error.clone()) {
            return Err(StoreError::Protocol(error));
        }

        Ok(replies)
    }
}

fn reply_opt_int(replies: &[PipelineReply], index: usize) -> StoreResult<Option<i64>> {
    let reply = replies
        .get(index)
        .ok_or_else(|| StoreError::Protocol(format!("missing reply #{index}")))?;

    let parsed = match &reply.result {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };
    parsed
        .map(Some)
        .ok_or_else(|| StoreError::Protocol(format!("reply #{index} is not an integer")))
}

fn reply_int(replies: &[PipelineReply], index: usize) -> StoreResult<i64> {
    reply_opt_int(replies, index)?
        .ok_or_else(|| StoreError::Protocol(format!("reply #{index} is null")))
}

#[async_trait]
impl RateLimitStore for RestCounterStore {
    /// One transaction opens the window if needed (`SET key 0 PX <window> NX`)
    /// and reads `GET key` / `PTTL key`. A caller already at the limit is
    /// refused there and the counter is left alone. Otherwise a second
    /// transaction re-opens the window if it lapsed and runs `INCR key`; its
    /// result decides. Concurrent callers racing past the read can push the
    /// counter over the limit, but each of them is still refused by the
    /// incremented value.
    async fn hit(
        &self,
        key: &str,
        max_attempts: u32,
        window: Duration,
    ) -> StoreResult<RateLimitDecision> {
        let key = self.key(key);
        let window_ms = window.as_millis().max(1).to_string();

        let replies = self
            .exec(json!([
                ["SET", key, "0", "PX", window_ms, "NX"],
                ["GET", key],
                ["PTTL", key]
            ]))
            .await?;

        let current = reply_opt_int(&replies, 1)?.unwrap_or(0);
        let mut pttl = reply_int(&replies, 2)?;

        let count = if current >= i64::from(max_attempts) {
            current.saturating_add(1)
        } else {
            // the window may have lapsed since the read; never INCR a key without a TTL
            let replies = self
                .exec(json!([
                    ["SET", key, "0", "PX", window_ms, "NX"],
                    ["INCR", key],
                    ["PTTL", key]
                ]))
                .await?;
            pttl = reply_int(&replies, 2)?;
            reply_int(&replies, 1)?
        };

        let now = Utc::now();
        let reset_at = if pttl > 0 {
            now + chrono::Duration::milliseconds(pttl)
        } else {
            now + chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero())
        };

        let count = u32::try_from(count.max(0)).unwrap_or(u32::MAX);
        Ok(RateLimitDecision {
            allowed: count <= max_attempts,
            limit: max_attempts,
            remaining: max_attempts.saturating_sub(count),
            reset_at,
        })
    }

    async fn reset(&self, key: &str) -> StoreResult<()> {
        self.exec(json!([["DEL", self.key(key)]])).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "rest"
    }
}

/// Build the rate limiter described by `settings.store`.
///
/// With a REST store, the in-memory store stays behind it as the fallback
/// used while the endpoint is unreachable.
pub fn rate_limiter_from_settings(settings: &RateLimitSettings) -> Result<RateLimiter> {
    let sweep = settings
        .sweep_interval_duration()
        .wrap_err("Invalid rate_limit.sweep_interval")?;

    match &settings.store {
        RateLimitStoreConfig::Memory => {
            tracing::warn!(
                "Using in-memory rate limit counters; limits are per instance and reset on restart"
            );
            Ok(RateLimiter::in_memory(sweep))
        }
        RateLimitStoreConfig::Rest {
            url,
            token,
            key_prefix,
        } => {
            let store = RestCounterStore::new(url, token.clone(), key_prefix.clone())?;
            tracing::info!(endpoint = %url, "Using shared REST rate limit store");
            Ok(RateLimiter::with_store(Arc::new(store), sweep))
        }
    }
}
