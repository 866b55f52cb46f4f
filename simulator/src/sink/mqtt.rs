use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Sink, SinkError, SinkResult};
use crate::telemetry::Payload;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct MqttSinkConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub topic_prefix: String,
    pub manufacturer: String,
    pub device_family: String,
    pub capacity: usize,
}

/// Publishes JSON payloads with QoS 1 to
/// `{prefix}/{manufacturer}/{device_family}/{serial}`.
pub struct MqttSink {
    config: MqttSinkConfig,
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    eventloop: JoinHandle<()>,
}

impl MqttSink {
    /// Starts the client and waits up to `CONNECT_WAIT` for the broker's ConnAck.
    pub async fn connect(config: MqttSinkConfig) -> SinkResult<Self> {
        let sink = Self::start(config);
        if sink.wait_connected(CONNECT_WAIT).await {
            Ok(sink)
        } else {
            sink.eventloop.abort();
            Err(sink.unreachable())
        }
    }

    /// Starts the client and its event loop without waiting for the broker.
    fn start(config: MqttSinkConfig) -> Self {
        let (client, connected, eventloop) = Self::spawn(&config);
        Self {
            config,
            client,
            connected,
            eventloop,
        }
    }

    async fn wait_connected(&self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        while tokio::time::Instant::now() < deadline {
            if self.is_connected() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.is_connected()
    }

    fn unreachable(&self) -> SinkError {
        SinkError::Connection(format!(
            "broker {}:{} still unreachable",
            self.config.host, self.config.port
        ))
    }

    fn spawn(config: &MqttSinkConfig) -> (AsyncClient, Arc<AtomicBool>, JoinHandle<()>) {
        info!(
            "Connecting to MQTT broker at {}:{} as {}",
            config.host, config.port, config.client_id
        );

        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);
        mqtt_options.set_keep_alive(config.keep_alive);
        mqtt_options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, config.capacity);
        let connected = Arc::new(AtomicBool::new(false));
        let state = connected.clone();

        // rumqttc reconnects on the next poll after an error
        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            info!("Connected to MQTT broker");
                            state.store(true, Ordering::SeqCst);
                        } else {
                            error!("Failed to connect, return code {:?}", ack.code);
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        state.store(false, Ordering::SeqCst);
                        debug!("MQTT disconnect sent, stopping event loop");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if state.swap(false, Ordering::SeqCst) {
                            warn!("Disconnected from MQTT broker: {}", e);
                        } else {
                            error!("MQTT eventloop error: {}", e);
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        (client, connected, handle)
    }

    pub fn topic(&self, serial_number: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.config.topic_prefix,
            self.config.manufacturer,
            self.config.device_family,
            serial_number
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for MqttSink {
    fn destination(&self, key: &str) -> String {
        format!("topic {}", self.topic(key))
    }

    async fn send(&mut self, key: &str, payload: &Payload) -> SinkResult<()> {
        if !self.is_connected() {
            return Err(SinkError::Connection("not connected to broker".to_string()));
        }

        let body = payload.to_json_vec()?;
        self.client
            .publish(self.topic(key), QoS::AtLeastOnce, false, body)
            .await
            .map_err(|e| SinkError::Connection(e.to_string()))
    }

    async fn reconnect(&mut self) -> SinkResult<()> {
        if self.eventloop.is_finished() {
            let (client, connected, eventloop) = Self::spawn(&self.config);
            self.client = client;
            self.connected = connected;
            self.eventloop = eventloop;
        }

        if self.wait_connected(CONNECT_WAIT).await {
            Ok(())
        } else {
            Err(self.unreachable())
        }
    }

    async fn close(&mut self) -> SinkResult<()> {
        info!("Stopping MQTT loop");
        if let Err(e) = self.client.disconnect().await {
            warn!("Failed to request MQTT disconnect: {}", e);
            self.eventloop.abort();
            return Ok(());
        }

        if tokio::time::timeout(DRAIN_TIMEOUT, &mut self.eventloop)
            .await
            .is_err()
        {
            warn!("MQTT event loop did not drain within {:?}", DRAIN_TIMEOUT);
            self.eventloop.abort();
        }
        Ok(())
    }
}
