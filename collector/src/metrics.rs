use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Opts, Registry, TextEncoder};

use crate::errors::Result;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_messages_total",
        "Total telemetry payloads written to the payload log"
    ))
    .expect("valid metric options");
    pub static ref REJECTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "collector_rejected_total",
        "Total datagrams answered with an error or dropped"
    ))
    .expect("valid metric options");
}

pub fn init_metrics() -> Result<()> {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REJECTED_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
