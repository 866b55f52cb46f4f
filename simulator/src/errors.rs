use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid distribution: {0}")]
    Distribution(#[from] rand_distr::NormalError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Sink error: {0}")]
    Sink(#[from] crate::sink::SinkError),
}

pub type Result<T> = std::result::Result<T, Error>;
