// Prometheus metrics for the execution service
//
// Exposed on the /metrics HTTP endpoint:
// - Executions by outcome (counter)
// - Execution durations (histogram)
// - Policy and admission rejections (counter)
// - In-flight executions (gauge)
// - Service uptime (gauge)
// - Client retries (counter)

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry, TextEncoder,
};
use std::sync::{Arc, Mutex, Once};

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Execution metrics
    pub static ref EXECUTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("execguard_executions_total", "Total number of commands executed"),
        &["outcome"]
    ).expect("Failed to create executions total metric");

    pub static ref EXECUTION_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("execguard_execution_duration_seconds", "Command execution time in seconds")
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
    ).expect("Failed to create execution duration metric");

    pub static ref EXECUTIONS_IN_FLIGHT: IntGauge = IntGauge::new(
        "execguard_executions_in_flight",
        "Number of commands currently running"
    ).expect("Failed to create in-flight metric");

    // Rejection metrics
    pub static ref POLICY_REJECTIONS_TOTAL: IntCounter = IntCounter::new(
        "execguard_policy_rejections_total",
        "Total number of commands rejected by the validation policy"
    ).expect("Failed to create policy rejections metric");

    pub static ref ADMISSION_REJECTIONS_TOTAL: IntCounter = IntCounter::new(
        "execguard_admission_rejections_total",
        "Total number of requests rejected because the service was at capacity"
    ).expect("Failed to create admission rejections metric");

    // Client metrics
    pub static ref CLIENT_RETRIES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("execguard_client_retries_total", "Total number of client retry attempts"),
        &["method"]
    ).expect("Failed to create client retries metric");

    pub static ref SERVICE_UPTIME_SECONDS: Gauge = Gauge::new(
        "execguard_uptime_seconds",
        "Service uptime in seconds"
    ).expect("Failed to create uptime metric");
}

static INIT: Once = Once::new();
static INIT_ERROR: Mutex<Option<String>> = Mutex::new(None);

/// Register all metrics with [`REGISTRY`]
///
/// Safe to call more than once; registration only happens on the first call.
pub fn init() -> anyhow::Result<()> {
    INIT.call_once(|| {
        if let Err(e) = register_all() {
            if let Ok(mut slot) = INIT_ERROR.lock() {
                *slot = Some(e.to_string());
            }
        }
    });

    match INIT_ERROR.lock().ok().and_then(|slot| slot.clone()) {
        Some(e) => Err(anyhow::anyhow!("Failed to register metrics: {}", e)),
        None => Ok(()),
    }
}

fn register_all() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(EXECUTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(EXECUTION_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(EXECUTIONS_IN_FLIGHT.clone()))?;
    REGISTRY.register(Box::new(POLICY_REJECTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ADMISSION_REJECTIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CLIENT_RETRIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SERVICE_UPTIME_SECONDS.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
