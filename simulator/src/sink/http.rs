use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use super::{Sink, SinkError, SinkResult};
use crate::telemetry::Payload;

const CONTENT_TYPE_KAFKA_JSON: &str = "application/vnd.kafka.json.v2+json";
const ACCEPT_KAFKA: &str = "application/vnd.kafka.v2+json, application/vnd.kafka+json, application/json";

#[derive(Debug, Clone)]
pub struct KafkaRestSinkConfig {
    /// e.g. `http://localhost:8082`
    pub base_url: String,
    pub topic: String,
    pub timeout: Duration,
}

#[derive(Serialize)]
struct Record<'a> {
    key: &'a str,
    value: &'a Payload,
}

#[derive(Serialize)]
struct ProduceRequest<'a> {
    records: [Record<'a>; 1],
}

/// Produces JSON records through a Kafka REST proxy (v2 API).
pub struct KafkaRestSink {
    config: KafkaRestSinkConfig,
    client: reqwest::Client,
}

impl KafkaRestSink {
    pub fn new(config: KafkaRestSinkConfig) -> SinkResult<Self> {
        let client = Self::build_client(&config)?;
        info!("Kafka REST proxy at {}", config.base_url);
        Ok(Self { config, client })
    }

    fn build_client(config: &KafkaRestSinkConfig) -> SinkResult<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SinkError::Connection(e.to_string()))
    }

    pub fn url(&self) -> String {
        format!(
            "{}/topics/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.topic
        )
    }
}

fn classify(err: reqwest::Error) -> SinkError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        SinkError::Connection(err.to_string())
    } else {
        SinkError::Rejected(err.to_string())
    }
}

#[async_trait]
impl Sink for KafkaRestSink {
    fn destination(&self, _key: &str) -> String {
        format!("topic {}", self.config.topic)
    }

    async fn send(&mut self, key: &str, payload: &Payload) -> SinkResult<()> {
        let body = serde_json::to_vec(&ProduceRequest {
            records: [Record {
                key,
                value: payload,
            }],
        })?;

        let response = self
            .client
            .post(self.url())
            .header(CONTENT_TYPE, CONTENT_TYPE_KAFKA_JSON)
            .header(ACCEPT, ACCEPT_KAFKA)
            .body(body)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if status == StatusCode::OK {
            debug!("Message produced to topic {}: {}", self.config.topic, key);
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(SinkError::Rejected(format!("{} | {}", status, text)))
        }
    }

    async fn reconnect(&mut self) -> SinkResult<()> {
        self.client = Self::build_client(&self.config)?;
        Ok(())
    }

    async fn close(&mut self) -> SinkResult<()> {
        debug!("Stopped HTTP client");
        Ok(())
    }
}
