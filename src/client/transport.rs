//! HTTP Transport
//!
//! Sends JSON-RPC requests to the service with HTTP POST to `/rpc`.
//!
//! Each pooled connection is a `reqwest::Client` limited to one idle
//! keep-alive socket. reqwest connects lazily, so "connection refused"
//! surfaces on the first request rather than in [`Connector::connect`]; it is
//! still classified as a retryable transport failure.

use super::pool::Connector;
use super::ClientError;
use crate::rpc::{RpcRequest, RpcResponse};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

/// Build the base URL for an address (`host:port` or a full URL)
pub fn base_url(addr: &str) -> String {
    let addr = addr.trim_end_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

/// Whether an HTTP status from a proxy or load balancer is worth retrying
pub fn should_retry_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

#[derive(Debug, Clone)]
pub struct HttpConnector {
    connect_timeout: Duration,
    probe_timeout: Duration,
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(2))
    }
}

impl HttpConnector {
    pub fn new(connect_timeout: Duration, probe_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            probe_timeout,
        }
    }
}

fn classify_send_error(e: reqwest::Error) -> ClientError {
    if e.is_connect() {
        // Never reached the server; safe to retry
        ClientError::transport(format!("failed to connect: {}", e), true)
    } else if e.is_timeout() {
        // The command may already be running
        ClientError::transport(format!("request timed out: {}", e), false)
    } else {
        ClientError::transport(format!("request failed: {}", e), false)
    }
}

#[async_trait]
impl Connector for HttpConnector {
    type Conn = reqwest::Client;

    async fn connect(&self, addr: &str) -> Result<reqwest::Client, ClientError> {
        debug!("Creating HTTP client for {}", addr);
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .pool_max_idle_per_host(1)
            .no_proxy()
            .build()
            .map_err(|e| ClientError::transport(format!("failed to build HTTP client: {}", e), false))
    }

    async fn probe(&self, conn: &reqwest::Client, addr: &str) -> bool {
        let url = format!("{}/health", base_url(addr));
        match conn.get(&url).timeout(self.probe_timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Health probe to {} failed: {}", addr, e);
                false
            }
        }
    }

    async fn call(
        &self,
        conn: &reqwest::Client,
        addr: &str,
        request: &RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse, ClientError> {
        let url = format!("{}/rpc", base_url(addr));
        debug!("POST {} method={} id={}", url, request.method, request.id);

        let response = conn
            .post(&url)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::transport(
                format!("HTTP request failed with status: {}", status),
                should_retry_status(status),
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::transport(format!("failed to read response: {}", e), false))?;

        serde_json::from_slice(&body)
            .map_err(|e| ClientError::Protocol(format!("undecodable response: {}", e)))
    }
}
