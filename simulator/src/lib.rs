pub mod clock;
pub mod config;
pub mod errors;
pub mod fleet;
pub mod locations;
pub mod metrics;
pub mod scheduler;
pub mod sink;
pub mod telemetry;
