// HTTP server for the execution service
//
// Routes:
// - POST /rpc      JSON-RPC 2.0 (ExecuteCommand, HealthCheck)
// - GET  /health   HealthStatus JSON, for liveness probes and client pool probes
// - GET  /metrics  Prometheus text exposition

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use super::protocol::{
    RpcError, RpcRequest, RpcResponse, JSONRPC_VERSION, METHOD_EXECUTE_COMMAND,
    METHOD_HEALTH_CHECK,
};
use crate::metrics;
use crate::service::{CommandRequest, ExecutionService, HealthState, ServiceError};

/// Build the router for a service
pub fn router(service: Arc<ExecutionService>) -> Router {
    Router::new()
        .route("/rpc", post(rpc_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// Bind the listening socket
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind RPC server to {}", addr))
}

/// Serve until `shutdown` resolves
///
/// On shutdown the service stops admitting commands and the server stops
/// accepting connections; requests already running are allowed to finish.
pub async fn serve<F>(listener: TcpListener, service: Arc<ExecutionService>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    metrics::init().context("Failed to initialize metrics")?;

    let addr = listener.local_addr().context("Listener has no local address")?;
    info!("Execution service listening on {}", addr);

    let app = router(Arc::clone(&service));
    let draining = Arc::clone(&service);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            draining.shutdown();
        })
        .await
        .context("RPC server error")?;

    info!("Execution service stopped");
    Ok(())
}

async fn rpc_handler(State(service): State<Arc<ExecutionService>>, body: Bytes) -> Json<RpcResponse> {
    Json(dispatch(&service, &body).await)
}

/// Decode one JSON-RPC request and route it
pub async fn dispatch(service: &ExecutionService, body: &[u8]) -> RpcResponse {
    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            debug!("Rejecting unparseable request: {}", e);
            return RpcResponse::err(None, RpcError::parse_error(format!("Parse error: {}", e)));
        }
    };

    let id = value.get("id").and_then(Value::as_u64);
    let request: RpcRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(e) => {
            return RpcResponse::err(
                id,
                RpcError::invalid_request(format!("Invalid request: {}", e)),
            )
        }
    };

    if request.jsonrpc != JSONRPC_VERSION {
        return RpcResponse::err(
            id,
            RpcError::invalid_request(format!(
                "Unsupported jsonrpc version: {}",
                request.jsonrpc
            )),
        );
    }

    let id = Some(request.id);
    match request.method.as_str() {
        METHOD_EXECUTE_COMMAND => {
            let params = request.params.unwrap_or(Value::Null);
            let command: CommandRequest = match serde_json::from_value(params) {
                Ok(command) => command,
                Err(e) => {
                    return RpcResponse::err(
                        id,
                        RpcError::invalid_params(format!("Invalid params: {}", e)),
                    )
                }
            };

            match service.execute_command(command).await {
                Ok(response) => to_result(id, &response),
                Err(e) => RpcResponse::err(id, service_error(e)),
            }
        }
        METHOD_HEALTH_CHECK => to_result(id, &service.health_check()),
        other => RpcResponse::err(id, RpcError::method_not_found(other)),
    }
}

fn to_result<T: serde::Serialize>(id: Option<u64>, payload: &T) -> RpcResponse {
    match serde_json::to_value(payload) {
        Ok(value) => RpcResponse::ok(id, value),
        Err(e) => RpcResponse::err(
            id,
            RpcError::internal_error(format!("Failed to encode result: {}", e)),
        ),
    }
}

fn service_error(error: ServiceError) -> RpcError {
    match error {
        ServiceError::ResourceExhausted { .. } => RpcError::resource_exhausted(error.to_string()),
        ServiceError::ShuttingDown => RpcError::unavailable(error.to_string()),
        ServiceError::Internal(_) => {
            error!("Execution failed internally: {}", error);
            RpcError::internal_error(error.to_string())
        }
    }
}

async fn health_handler(State(service): State<Arc<ExecutionService>>) -> Response {
    let health = service.health_check();
    let status = match health.status {
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
    };
    (status, Json(health)).into_response()
}

async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics_text,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}
