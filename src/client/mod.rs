//! Client Library
//!
//! Callers use [`ExecClient`] (async) or [`BlockingExecClient`] (sync) to run
//! commands on an execution service.
//!
//! - Connections are pooled per address ([`pool`])
//! - Only transport failures that never reached the server are retried, with
//!   exponential backoff and jitter ([`retry`]). A decoded
//!   [`CommandResponse`] is always returned as is, even when `success` is
//!   false, because the command may have side effects.
//! - Cancelling the caller's [`CancellationToken`] aborts the in-flight RPC.
//!   This is best effort: dropping the HTTP request cancels the execution
//!   only if the server notices the disconnect; otherwise the command runs
//!   until its own timeout.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use execguard::client::{ClientConfig, ExecClient};
//!
//! # async fn run() -> Result<(), execguard::client::ClientError> {
//! let client = ExecClient::connect(ClientConfig::new("127.0.0.1:50051"))?;
//! let response = client.execute("echo hello", Duration::from_secs(10)).await?;
//! assert!(response.success);
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod retry;
pub mod transport;

pub use pool::{ConnectionPool, Connector, PoolConfig, PooledConnection};
pub use retry::{retry_with_backoff, Backoff, RetryConfig, RetryError};
pub use transport::HttpConnector;

use crate::engine::HARD_TIMEOUT_CEILING_SECS;
use crate::metrics;
use crate::rpc::protocol::{
    RpcError, RpcRequest, METHOD_EXECUTE_COMMAND, METHOD_HEALTH_CHECK, RESOURCE_EXHAUSTED,
};
use crate::service::{CommandRequest, CommandResponse, HealthStatus};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Client failure classification
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Could not exchange a request with the server
    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    /// The server is at its concurrency limit
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The server answered with a JSON-RPC error
    #[error("server error: {0}")]
    Rpc(RpcError),

    /// The server's answer could not be decoded
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("call cancelled")]
    Cancelled,

    #[error("client is closed")]
    Closed,

    #[error("failed to start client runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ClientError>,
    },
}

impl ClientError {
    pub fn transport(message: impl Into<String>, retryable: bool) -> Self {
        Self::Transport {
            message: message.into(),
            retryable,
        }
    }

    /// Only transport failures that never reached the server are retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { retryable: true, .. })
    }
}

impl From<RpcError> for ClientError {
    fn from(error: RpcError) -> Self {
        if error.code == RESOURCE_EXHAUSTED {
            Self::ResourceExhausted(error.message)
        } else {
            Self::Rpc(error)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Service address, `host:port` or a URL
    pub addr: String,

    pub retry: RetryConfig,

    pub pool: PoolConfig,

    pub connect_timeout_secs: u64,

    /// Added to the command timeout to bound the whole RPC
    pub request_margin_secs: u64,

    pub probe_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:50051".to_string(),
            retry: RetryConfig::default(),
            pool: PoolConfig::default(),
            connect_timeout_secs: 5,
            request_margin_secs: 10,
            probe_timeout_secs: 2,
        }
    }
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Upper bound on one RPC carrying a command with this timeout
    fn call_timeout(&self, timeout_seconds: i32) -> Duration {
        let command = if timeout_seconds > 0 {
            (timeout_seconds as u64).min(HARD_TIMEOUT_CEILING_SECS)
        } else {
            HARD_TIMEOUT_CEILING_SECS
        };
        Duration::from_secs(command + self.request_margin_secs)
    }
}

/// Whole seconds for the wire, rounding any fraction up
fn timeout_to_seconds(timeout: Duration) -> i32 {
    let seconds = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    i32::try_from(seconds).unwrap_or(i32::MAX)
}

/// Async client for the execution service
pub struct ExecClient<C: Connector = HttpConnector> {
    config: ClientConfig,
    pool: ConnectionPool<C>,
    next_id: AtomicU64,
}

impl ExecClient<HttpConnector> {
    /// Create an HTTP client; no connection is opened until the first call
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        if config.addr.trim().is_empty() {
            return Err(ClientError::transport("no service address configured", false));
        }
        let connector = HttpConnector::new(
            Duration::from_secs(config.connect_timeout_secs),
            Duration::from_secs(config.probe_timeout_secs),
        );
        Ok(Self::with_connector(config, connector))
    }
}

impl<C: Connector> ExecClient<C> {
    pub fn with_connector(config: ClientConfig, connector: C) -> Self {
        let pool = ConnectionPool::new(connector, config.pool.clone());
        Self {
            config,
            pool,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    /// Run `command` with input validation on
    ///
    /// A zero timeout leaves the choice to the server's default. Fractional
    /// seconds round up, so any non-zero timeout is at least one second.
    pub async fn execute(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResponse, ClientError> {
        self.execute_request(
            CommandRequest::new(command).with_timeout(timeout_to_seconds(timeout)),
        )
        .await
    }

    pub async fn execute_request(
        &self,
        request: CommandRequest,
    ) -> Result<CommandResponse, ClientError> {
        self.execute_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Like [`execute_request`](Self::execute_request), aborted when `cancel` fires
    pub async fn execute_with_cancel(
        &self,
        request: CommandRequest,
        cancel: CancellationToken,
    ) -> Result<CommandResponse, ClientError> {
        let call_timeout = self.config.call_timeout(request.timeout_seconds);
        let params = serde_json::to_value(&request)
            .map_err(|e| ClientError::Protocol(format!("failed to encode request: {}", e)))?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Call cancelled by caller");
                Err(ClientError::Cancelled)
            }
            result = self.call(METHOD_EXECUTE_COMMAND, params, call_timeout) => result,
        }
    }

    /// Query the service's `HealthCheck`
    pub async fn health(&self) -> Result<HealthStatus, ClientError> {
        let timeout = Duration::from_secs(self.config.probe_timeout_secs.max(1));
        self.call(METHOD_HEALTH_CHECK, serde_json::Value::Null, timeout)
            .await
    }

    /// Drain the pool; later calls fail with [`ClientError::Closed`]
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<T, ClientError> {
        let this = self;
        let value = retry_with_backoff(&self.config.retry, ClientError::is_retryable, move |attempt| {
            if attempt > 0 {
                metrics::CLIENT_RETRIES_TOTAL.with_label_values(&[method]).inc();
            }
            this.call_once(method, params.clone(), timeout)
        })
        .await
        .map_err(|e| match e {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { attempts, last } => ClientError::RetriesExhausted {
                attempts,
                last: Box::new(last),
            },
        })?;

        serde_json::from_value(value)
            .map_err(|e| ClientError::Protocol(format!("unexpected {} result: {}", method, e)))
    }

    async fn call_once(
        &self,
        method: &'static str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, ClientError> {
        let addr = self.config.addr.as_str();
        let mut conn = self.pool.checkout(addr).await?;

        let params = (!params.is_null()).then_some(params);
        let request = RpcRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, params);

        let result = self
            .pool
            .connector()
            .call(conn.get(), addr, &request, timeout)
            .await;

        if result.is_err() {
            conn.mark_unhealthy();
        }
        self.pool.checkin(conn).await;

        let response = result?;
        if response.id.is_some_and(|id| id != request.id) {
            return Err(ClientError::Protocol(format!(
                "response id {:?} does not match request id {}",
                response.id, request.id
            )));
        }
        response.into_result().map_err(ClientError::from)
    }
}

/// Synchronous client for callers outside an async runtime
///
/// Owns a current-thread tokio runtime. Must not be used from within an async
/// context.
pub struct BlockingExecClient {
    inner: ExecClient<HttpConnector>,
    runtime: tokio::runtime::Runtime,
}

impl BlockingExecClient {
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ClientError::Runtime)?;
        Ok(Self {
            inner: ExecClient::connect(config)?,
            runtime,
        })
    }

    pub fn execute(&self, command: &str, timeout: Duration) -> Result<CommandResponse, ClientError> {
        self.runtime.block_on(self.inner.execute(command, timeout))
    }

    pub fn execute_request(&self, request: CommandRequest) -> Result<CommandResponse, ClientError> {
        self.runtime.block_on(self.inner.execute_request(request))
    }

    pub fn health(&self) -> Result<HealthStatus, ClientError> {
        self.runtime.block_on(self.inner.health())
    }

    pub fn close(&self) {
        self.runtime.block_on(self.inner.close())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::INVALID_PARAMS;

    #[test]
    fn test_retryable_classification() {
        assert!(ClientError::transport("refused", true).is_retryable());
        assert!(!ClientError::transport("timed out", false).is_retryable());
        assert!(!ClientError::ResourceExhausted("busy".into()).is_retryable());
        assert!(!ClientError::Protocol("garbage".into()).is_retryable());
        assert!(!ClientError::Cancelled.is_retryable());
    }

    #[test]
    fn test_rpc_error_mapping() {
        let busy = ClientError::from(RpcError::resource_exhausted("16 in flight"));
        assert!(matches!(busy, ClientError::ResourceExhausted(ref m) if m == "16 in flight"));

        let params = ClientError::from(RpcError::invalid_params("bad"));
        assert!(matches!(params, ClientError::Rpc(ref e) if e.code == INVALID_PARAMS));
    }

    #[test]
    fn test_call_timeout_bounds() {
        let config = ClientConfig::default();
        assert_eq!(config.call_timeout(10), Duration::from_secs(20));
        assert_eq!(config.call_timeout(0), Duration::from_secs(310));
        assert_eq!(config.call_timeout(100_000), Duration::from_secs(310));
    }

    #[test]
    fn test_timeout_rounds_up_to_whole_seconds() {
        assert_eq!(timeout_to_seconds(Duration::ZERO), 0);
        assert_eq!(timeout_to_seconds(Duration::from_nanos(1)), 1);
        assert_eq!(timeout_to_seconds(Duration::from_millis(500)), 1);
        assert_eq!(timeout_to_seconds(Duration::from_secs(2)), 2);
        assert_eq!(timeout_to_seconds(Duration::from_millis(2001)), 3);
        assert_eq!(timeout_to_seconds(Duration::MAX), i32::MAX);
    }

    #[test]
    fn test_connect_requires_address() {
        assert!(ExecClient::connect(ClientConfig::new("  ")).is_err());
        assert!(ExecClient::connect(ClientConfig::new("127.0.0.1:1")).is_ok());
    }

    #[test]
    fn test_exhausted_error_display() {
        let err = ClientError::RetriesExhausted {
            attempts: 3,
            last: Box::new(ClientError::transport("connection refused", true)),
        };
        assert_eq!(
            err.to_string(),
            "giving up after 3 attempts: transport error: connection refused"
        );
    }
}
