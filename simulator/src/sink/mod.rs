//! Transport collaborators the scheduler hands payloads to.

mod cef;
mod coap;
mod http;
mod mqtt;
mod syslog;

#[cfg(feature = "amqp")]
mod amqp;
#[cfg(feature = "kafka")]
mod kafka;

use async_trait::async_trait;
use thiserror::Error;

use crate::telemetry::Payload;

pub use cef::CefEvent;
pub use coap::{CoapSink, CoapSinkConfig};
pub use http::{KafkaRestSink, KafkaRestSinkConfig};
pub use mqtt::{MqttSink, MqttSinkConfig};
pub use syslog::{SyslogProtocol, SyslogSink, SyslogSinkConfig, FACILITY_USER, SEVERITY_NOTICE};

#[cfg(feature = "amqp")]
pub use amqp::{AmqpSink, AmqpSinkConfig};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaSink, KafkaSinkConfig};

#[derive(Debug, Error)]
pub enum SinkError {
    /// The link to the target is down. The scheduler reconnects before
    /// sending again.
    #[error("connection error: {0}")]
    Connection(String),

    /// The target answered but refused the message.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SinkError {
    pub fn is_connection(&self) -> bool {
        matches!(self, SinkError::Connection(_))
    }
}

pub type SinkResult<T> = std::result::Result<T, SinkError>;

#[async_trait]
pub trait Sink: Send {
    /// Human readable target of a message keyed by `key`, for logs.
    fn destination(&self, key: &str) -> String;

    /// Delivers one payload. `key` is the device serial number; transports
    /// use it as topic suffix, record key or routing hint.
    async fn send(&mut self, key: &str, payload: &Payload) -> SinkResult<()>;

    /// One attempt at re-establishing the link.
    async fn reconnect(&mut self) -> SinkResult<()>;

    /// Drains outstanding sends and releases the link.
    async fn close(&mut self) -> SinkResult<()>;
}

#[async_trait]
impl<S: Sink + ?Sized> Sink for Box<S> {
    fn destination(&self, key: &str) -> String {
        (**self).destination(key)
    }

    async fn send(&mut self, key: &str, payload: &Payload) -> SinkResult<()> {
        (**self).send(key, payload).await
    }

    async fn reconnect(&mut self) -> SinkResult<()> {
        (**self).reconnect().await
    }

    async fn close(&mut self) -> SinkResult<()> {
        (**self).close().await
    }
}
