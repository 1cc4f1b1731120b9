use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fork_interface::{BlockRef, StorageKey, StoragePair, StorageQueryService, StorageValue};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::debug;

/// Runtime configuration for the node connection.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RpcConfig {
    /// The HTTP address of the node. The HTTP endpoint is used on purpose: websocket endpoints
    /// usually cap the message size well below what a bulk storage query returns.
    #[serde(default = "default_rpc_url")]
    pub url: String,
    /// The timeout for a single request, in seconds
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// The maximum size of a response, in bytes
    #[serde(default = "default_max_response_size")]
    pub max_response_size: u32,
    /// How many times a request is attempted before its error is returned
    #[serde(default = "default_max_retries_per_request")]
    pub max_retries_per_request: u32,
    /// Delay before each request, in milliseconds
    #[serde(default)]
    pub delay_between_requests_ms: u64,
    /// Retries of a request wait two, four, eight... times this long, in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Upper bound of the wait before a single retry, in milliseconds
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
}

fn default_rpc_url() -> String {
    "http://localhost:9933".into()
}

const fn default_request_timeout_seconds() -> u64 {
    60
}

const fn default_max_response_size() -> u32 {
    1024 * 1024 * 1024 // 1 GiB
}

const fn default_max_retries_per_request() -> u32 {
    5
}

const fn default_retry_base_delay_ms() -> u64 {
    250
}

const fn default_max_retry_delay_ms() -> u64 {
    10_000
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: default_rpc_url(),
            request_timeout_seconds: default_request_timeout_seconds(),
            max_response_size: default_max_response_size(),
            max_retries_per_request: default_max_retries_per_request(),
            delay_between_requests_ms: 0,
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
        }
    }
}

/// Errors returned by [`SubstrateRpcService`].
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The client could not be built from the configuration.
    #[error("invalid rpc url {url}")]
    Build {
        /// The configured url.
        url: String,
        /// The underlying client error.
        #[source]
        source: jsonrpsee::core::Error,
    },
    /// A request failed after exhausting its retries.
    #[error("rpc request `{method}` failed")]
    Request {
        /// The JSON-RPC method.
        method: &'static str,
        /// The error of the last attempt.
        #[source]
        source: jsonrpsee::core::Error,
    },
    /// The node has no best block to pin the snapshot to.
    #[error("the node did not return a best block hash")]
    MissingBlockHash,
}

/// A [`StorageQueryService`] talking to a node over JSON-RPC.
#[derive(Debug, Clone)]
pub struct SubstrateRpcService {
    client: HttpClient,
    delay_between_requests: Duration,
    max_retries_per_request: u32,
    retry_base_delay_ms: u64,
    max_retry_delay: Duration,
    counter: Arc<AtomicU64>,
}

impl SubstrateRpcService {
    /// Connects to the node described by `config`.
    pub fn new(config: &RpcConfig) -> Result<Self, RpcError> {
        let client = HttpClientBuilder::default()
            .max_response_size(config.max_response_size)
            .request_timeout(Duration::from_secs(config.request_timeout_seconds))
            .build(&config.url)
            .map_err(|source| RpcError::Build {
                url: config.url.clone(),
                source,
            })?;
        Ok(Self::with_client(client, config))
    }

    /// Wraps an existing client, taking pacing and retry settings from `config`.
    pub fn with_client(client: HttpClient, config: &RpcConfig) -> Self {
        Self {
            client,
            delay_between_requests: Duration::from_millis(config.delay_between_requests_ms),
            max_retries_per_request: config.max_retries_per_request,
            retry_base_delay_ms: config.retry_base_delay_ms,
            max_retry_delay: Duration::from_millis(config.max_retry_delay_ms),
            counter: Default::default(),
        }
    }

    /// The number of requests sent so far, retries excluded.
    pub fn requests_sent(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Exponential backoff where each wait keeps at least half of its nominal delay.
    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(self.retry_base_delay_ms)
            .max_delay(self.max_retry_delay)
            .map(|delay| delay / 2 + jitter(delay / 2))
            .take(self.max_retries_per_request.saturating_sub(1) as usize)
    }

    async fn request<R>(&self, method: &'static str, params: Vec<Value>) -> Result<R, RpcError>
    where
        R: DeserializeOwned + Send,
    {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        debug!(id, method, "Sending request");

        // Explicit request delay, to avoid getting rate limited
        if !self.delay_between_requests.is_zero() {
            tokio::time::sleep(self.delay_between_requests).await;
        }

        let result = Retry::spawn(self.retry_strategy(), || {
            self.client.request::<R, _>(method, params.clone())
        })
        .await;

        debug!(
            id,
            method,
            successful = result.is_ok(),
            elapsed = ?start.elapsed(),
            "Completed request"
        );
        result.map_err(|source| RpcError::Request { method, source })
    }
}

fn key_param(key: &StorageKey) -> Value {
    Value::from(key.as_str())
}

fn block_param(at: &BlockRef) -> Value {
    Value::from(at.as_str())
}

#[async_trait]
impl StorageQueryService for SubstrateRpcService {
    type Error = RpcError;

    async fn point_in_time(&self) -> Result<BlockRef, Self::Error> {
        let hash: Option<String> = self.request("chain_getBlockHash", vec![]).await?;
        hash.map(BlockRef::new).ok_or(RpcError::MissingBlockHash)
    }

    async fn keys_paged(
        &self,
        prefix: &StorageKey,
        page_size: u32,
        cursor: Option<&StorageKey>,
        at: &BlockRef,
    ) -> Result<Vec<StorageKey>, Self::Error> {
        let params = vec![
            key_param(prefix),
            Value::from(page_size),
            cursor.map(key_param).unwrap_or(Value::Null),
            block_param(at),
        ];
        self.request("state_getKeysPaged", params).await
    }

    async fn storage_value(
        &self,
        key: &StorageKey,
        at: &BlockRef,
    ) -> Result<Option<StorageValue>, Self::Error> {
        self.request("state_getStorage", vec![key_param(key), block_param(at)])
            .await
    }

    async fn pairs_under_prefix(
        &self,
        prefix: &StorageKey,
        at: &BlockRef,
    ) -> Result<Vec<StoragePair>, Self::Error> {
        self.request("state_getPairs", vec![key_param(prefix), block_param(at)])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: RpcConfig = serde_json::from_str(r#"{"url":"http://node:9933"}"#).unwrap();
        assert_eq!(
            config,
            RpcConfig {
                url: "http://node:9933".to_string(),
                ..Default::default()
            }
        );
        assert_eq!(config.max_retries_per_request, 5);
        assert_eq!(config.retry_base_delay_ms, 250);
    }

    #[test]
    fn retry_waits_grow_up_to_the_cap() {
        let service = SubstrateRpcService::new(&RpcConfig {
            max_retries_per_request: 6,
            retry_base_delay_ms: 100,
            max_retry_delay_ms: 1_000,
            ..Default::default()
        })
        .unwrap();

        let waits: Vec<Duration> = service.retry_strategy().collect();
        assert_eq!(waits.len(), 5);
        let nominal = [200, 400, 800, 1_000, 1_000].map(Duration::from_millis);
        for (wait, nominal) in waits.iter().zip(nominal) {
            assert!(*wait >= nominal / 2, "{wait:?} below half of {nominal:?}");
            assert!(*wait <= nominal, "{wait:?} above {nominal:?}");
        }
    }

    #[test]
    fn single_attempt_never_waits() {
        let service = SubstrateRpcService::new(&RpcConfig {
            max_retries_per_request: 1,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(service.retry_strategy().count(), 0);
    }

    #[test]
    fn invalid_url_is_rejected() {
        let config = RpcConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            SubstrateRpcService::new(&config),
            Err(RpcError::Build { .. })
        ));
    }
}
