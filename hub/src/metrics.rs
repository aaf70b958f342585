use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_messages_total",
        "Total frames received from rovers"
    ))
    .unwrap();
    pub static ref REJECTED_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_rejected_messages_total",
        "Total frames answered with an ERROR envelope"
    ))
    .unwrap();
    pub static ref STALE_WRITES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_stale_writes_total",
        "Total registry writes dropped as stale or duplicate"
    ))
    .unwrap();
    pub static ref ACTIVE_SESSIONS: Gauge = Gauge::with_opts(Opts::new(
        "hub_active_sessions",
        "Rover connections currently open"
    ))
    .unwrap();
    pub static ref ROVERS_OFFLINE_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_rovers_marked_offline_total",
        "Total rovers demoted to OFFLINE by the liveness monitor"
    ))
    .unwrap();
    pub static ref ROVERS_ERROR_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_rovers_escalated_error_total",
        "Total rovers moved to ERROR"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_db_failures_total",
        "Total transient database failures"
    ))
    .unwrap();
    pub static ref PERSIST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "hub_persist_latency_seconds",
            "Time taken to persist a batch of rover states"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref PERSIST_BATCH_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "hub_persist_batch_size",
        "Current persist batch size being processed"
    ))
    .unwrap();
    pub static ref PERSIST_QUEUE_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "hub_persist_queue_full_total",
        "Total number of times the persist queue was full (backpressure events)"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REJECTED_MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STALE_WRITES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_SESSIONS.clone()))?;
    REGISTRY.register(Box::new(ROVERS_OFFLINE_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ROVERS_ERROR_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DB_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PERSIST_LATENCY_SECONDS.clone()))?;
    REGISTRY.register(Box::new(PERSIST_BATCH_SIZE.clone()))?;
    REGISTRY.register(Box::new(PERSIST_QUEUE_FULL_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
