//! Execution Service
//!
//! Wires the [`PolicyValidator`] and a [`CommandEngine`] behind the two RPC
//! operations, `ExecuteCommand` and `HealthCheck`.
//!
//! Each request moves through `Received → Validating → (Rejected | Executing)
//! → Completed`. Validation happens before admission control, so a rejected
//! command never takes a permit and the engine is never invoked for it.
//! Engine failures (non-zero exit, timeout, spawn failure) are reported as
//! unsuccessful [`CommandResponse`]s; only admission and shutdown produce a
//! [`ServiceError`].

use crate::engine::{CommandEngine, ExecutionResult, TimeoutPolicy, EXIT_CODE_NOT_RUN};
use crate::metrics;
use crate::policy::PolicyValidator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Default admission limit
pub const DEFAULT_MAX_CONCURRENT: usize = 16;

/// Version reported by `HealthCheck`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

fn default_validate_input() -> bool {
    true
}

/// `ExecuteCommand` parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Command line to run
    pub command: String,

    /// Requested timeout; zero or negative means the service default
    #[serde(default)]
    pub timeout_seconds: i32,

    /// Apply pattern/allowlist checks (emptiness and length are always checked)
    #[serde(default = "default_validate_input")]
    pub validate_input: bool,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout_seconds: 0,
            validate_input: true,
        }
    }

    pub fn with_timeout(mut self, timeout_seconds: i32) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_validation(mut self, validate_input: bool) -> Self {
        self.validate_input = validate_input;
        self
    }
}

/// `ExecuteCommand` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// True iff the process exited with code 0 within its timeout
    pub success: bool,

    /// Combined stdout+stderr, size-capped
    pub output: String,

    /// Empty on success
    pub error: String,

    pub exit_code: i32,

    /// Seconds, sub-second precision
    pub execution_time: f64,
}

impl CommandResponse {
    /// Response for a command the validator refused
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: reason.into(),
            exit_code: EXIT_CODE_NOT_RUN,
            execution_time: 0.0,
        }
    }
}

impl From<ExecutionResult> for CommandResponse {
    fn from(result: ExecutionResult) -> Self {
        let success = result.success();
        let error = match result.error {
            Some(error) => error,
            None if success => String::new(),
            None => format!("command failed with exit code {}", result.exit_code),
        };

        Self {
            success,
            output: result.output,
            error,
            exit_code: result.exit_code,
            execution_time: result.execution_time.as_secs_f64(),
        }
    }
}

/// Coarse service health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    /// Every execution permit is in use
    Degraded,
    /// Shutting down
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// `HealthCheck` result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,

    /// Whole seconds since service start (monotonic)
    #[serde(alias = "uptime_seconds")]
    pub uptime: i64,

    pub version: String,
}

/// Process-scoped start time
#[derive(Debug, Clone, Copy)]
pub struct Uptime {
    started: Instant,
}

impl Uptime {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn seconds(&self) -> i64 {
        i64::try_from(self.elapsed().as_secs()).unwrap_or(i64::MAX)
    }
}

impl Default for Uptime {
    fn default() -> Self {
        Self::start()
    }
}

/// Service-level errors (never command failures)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("resource exhausted: {limit} executions already in flight")]
    ResourceExhausted { limit: usize },

    #[error("service is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub timeouts: TimeoutPolicy,
    pub max_concurrent: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutPolicy::default(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

/// The RPC-facing execution service
pub struct ExecutionService {
    validator: PolicyValidator,
    engine: Arc<dyn CommandEngine>,
    timeouts: TimeoutPolicy,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    uptime: Uptime,
}

impl ExecutionService {
    pub fn new(
        config: ServiceConfig,
        validator: PolicyValidator,
        engine: Arc<dyn CommandEngine>,
        uptime: Uptime,
    ) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            validator,
            engine,
            timeouts: config.timeouts,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            uptime,
        }
    }

    /// Validate, admit and run one command
    ///
    /// Dropping the returned future (for example when the client disconnects)
    /// cancels the execution.
    pub async fn execute_command(
        &self,
        request: CommandRequest,
    ) -> Result<CommandResponse, ServiceError> {
        let span = info_span!("execute", request_id = %Uuid::new_v4());
        self.execute_inner(request).instrument(span).await
    }

    async fn execute_inner(&self, request: CommandRequest) -> Result<CommandResponse, ServiceError> {
        debug!(state = "Received", timeout_seconds = request.timeout_seconds);

        debug!(state = "Validating", validate_input = request.validate_input);
        if let Err(violation) = self
            .validator
            .validate(&request.command, request.validate_input)
        {
            metrics::POLICY_REJECTIONS_TOTAL.inc();
            info!(state = "Rejected", "Command rejected: {}", violation);
            return Ok(CommandResponse::rejected(violation.to_string()));
        }

        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                metrics::ADMISSION_REJECTIONS_TOTAL.inc();
                warn!("At capacity ({} in flight), rejecting", self.max_concurrent);
                return Err(ServiceError::ResourceExhausted {
                    limit: self.max_concurrent,
                });
            }
            Err(TryAcquireError::Closed) => return Err(ServiceError::ShuttingDown),
        };

        let timeout = self.timeouts.resolve(request.timeout_seconds);
        debug!(state = "Executing", ?timeout);

        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        let engine = Arc::clone(&self.engine);
        let command = request.command;

        let task = tokio::spawn(
            async move {
                let _permit = permit;
                metrics::EXECUTIONS_IN_FLIGHT.inc();
                let result = engine.run(&command, timeout, cancel).await;
                metrics::EXECUTIONS_IN_FLIGHT.dec();
                result
            }
            .in_current_span(),
        );

        let result = task
            .await
            .map_err(|e| ServiceError::Internal(format!("execution task failed: {}", e)))?;
        guard.disarm();

        metrics::EXECUTIONS_TOTAL
            .with_label_values(&[result.outcome.as_str()])
            .inc();
        metrics::EXECUTION_DURATION_SECONDS.observe(result.execution_time.as_secs_f64());
        debug!(state = "Completed", outcome = %result.outcome, exit_code = result.exit_code);

        Ok(CommandResponse::from(result))
    }

    /// Current health; never waits on the engine
    pub fn health_check(&self) -> HealthStatus {
        let status = if self.permits.is_closed() {
            HealthState::Unhealthy
        } else if self.permits.available_permits() == 0 {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        metrics::SERVICE_UPTIME_SECONDS.set(self.uptime.elapsed().as_secs_f64());

        HealthStatus {
            status,
            uptime: self.uptime.seconds(),
            version: VERSION.to_string(),
        }
    }

    /// Executions currently holding a permit
    pub fn in_flight(&self) -> usize {
        if self.permits.is_closed() {
            return 0;
        }
        self.max_concurrent
            .saturating_sub(self.permits.available_permits())
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Stop admitting new executions; in-flight ones run to completion
    pub fn shutdown(&self) {
        info!("Execution service shutting down, no longer admitting commands");
        self.permits.close();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.permits.is_closed()
    }
}
