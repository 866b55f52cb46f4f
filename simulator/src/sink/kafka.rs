use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, info};

use super::{Sink, SinkError, SinkResult};
use crate::telemetry::Payload;

#[derive(Debug, Clone)]
pub struct KafkaSinkConfig {
    pub bootstrap_servers: String,
    pub client_id: String,
    pub topic: String,
    pub delivery_timeout: Duration,
    /// Extra librdkafka properties, `key=value`.
    pub properties: Vec<(String, String)>,
}

/// Native Kafka producer keyed by serial number.
pub struct KafkaSink {
    config: KafkaSinkConfig,
    producer: FutureProducer,
}

impl KafkaSink {
    pub fn new(config: KafkaSinkConfig) -> SinkResult<Self> {
        let producer = Self::create(&config)?;
        info!(
            "Kafka producer {} ready for {}",
            config.client_id, config.bootstrap_servers
        );
        Ok(Self { config, producer })
    }

    fn create(config: &KafkaSinkConfig) -> SinkResult<FutureProducer> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", &config.client_id)
            .set(
                "message.timeout.ms",
                config.delivery_timeout.as_millis().to_string(),
            );
        for (key, value) in &config.properties {
            client_config.set(key, value);
        }
        client_config.create().map_err(classify)
    }
}

fn classify(err: KafkaError) -> SinkError {
    match err {
        KafkaError::MessageProduction(code) => SinkError::Rejected(code.to_string()),
        other => SinkError::Connection(other.to_string()),
    }
}

#[async_trait]
impl Sink for KafkaSink {
    fn destination(&self, _key: &str) -> String {
        format!("topic {}", self.config.topic)
    }

    async fn send(&mut self, key: &str, payload: &Payload) -> SinkResult<()> {
        let value = payload.to_json_vec()?;
        let record = FutureRecord::to(&self.config.topic).key(key).payload(&value);

        self.producer
            .send(record, Timeout::After(self.config.delivery_timeout))
            .await
            .map(|_| debug!("Record/key '{}' produced to topic '{}'", key, self.config.topic))
            .map_err(|(e, _)| classify(e))
    }

    async fn reconnect(&mut self) -> SinkResult<()> {
        self.producer = Self::create(&self.config)?;
        Ok(())
    }

    async fn close(&mut self) -> SinkResult<()> {
        info!("Flushing Kafka producer");
        self.producer
            .flush(Timeout::After(self.config.delivery_timeout))
            .map_err(classify)
    }
}
