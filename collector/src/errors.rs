use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Payload log error: {0}")]
    PayloadLog(String),
}

pub type Result<T> = std::result::Result<T, Error>;
