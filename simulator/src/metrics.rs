use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

use crate::errors::Result;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_SENT_TOTAL: Counter = Counter::with_opts(Opts::new(
        "simulator_messages_sent_total",
        "Total payloads accepted by the sink"
    ))
    .expect("valid metric options");
    pub static ref SEND_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "simulator_send_failures_total",
        "Total payloads the sink failed to deliver"
    ))
    .expect("valid metric options");
    pub static ref RECONNECTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "simulator_reconnects_total",
        "Total sink reconnect attempts"
    ))
    .expect("valid metric options");
    pub static ref SWEEP_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "simulator_sweep_duration_seconds",
            "Time taken by one pass over the fleet"
        )
        .buckets(vec![
            0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0
        ])
    )
    .expect("valid metric options");
}

pub fn init_metrics() -> Result<()> {
    REGISTRY.register(Box::new(MESSAGES_SENT_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SEND_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONNECTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SWEEP_DURATION_SECONDS.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
