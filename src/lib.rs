//! ExecGuard Library
//!
//! A secure remote command execution service: a policy validator, a bounded
//! execution engine, an RPC service wiring the two together, and a retrying,
//! pooling client library.
//!
//! Data flows client → service → validator (reject early) → engine → service
//! → client.

pub mod client;
pub mod config;
pub mod engine;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod rpc;
pub mod service;

pub use client::{BlockingExecClient, ClientConfig, ClientError, ExecClient};
pub use config::Config;
pub use engine::{CommandEngine, EngineConfig, ExecutionMode, ExecutionOutcome, ProcessEngine};
pub use policy::{PolicyMode, PolicyValidator, PolicyViolation};
pub use service::{CommandRequest, CommandResponse, ExecutionService, HealthState, HealthStatus};
