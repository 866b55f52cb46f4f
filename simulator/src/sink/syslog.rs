use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use super::cef::CefEvent;
use super::{Sink, SinkError, SinkResult};
use crate::telemetry::{Field, Payload};

pub const FACILITY_USER: u8 = 1;
pub const SEVERITY_NOTICE: u8 = 5;
const SIGNATURE_ID: u32 = 100;
const MAX_MESSAGE_LENGTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SyslogProtocol {
    #[default]
    Udp,
    Tcp,
}

#[derive(Debug, Clone)]
pub struct SyslogSinkConfig {
    pub host: String,
    pub port: u16,
    pub protocol: SyslogProtocol,
    /// Host name stamped on every line.
    pub hostname: String,
    pub vendor: String,
    pub product: String,
    pub facility: u8,
    pub severity: u8,
}

enum Transport {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

/// RFC 3164 lines carrying a CEF telemetry event.
pub struct SyslogSink {
    config: SyslogSinkConfig,
    transport: Option<Transport>,
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn connection_error(err: std::io::Error) -> SinkError {
    SinkError::Connection(err.to_string())
}

impl SyslogSink {
    pub async fn connect(config: SyslogSinkConfig) -> SinkResult<Self> {
        let transport = Self::open(&config).await?;
        info!(
            "Syslog client connected to {}:{} over {:?}",
            config.host, config.port, config.protocol
        );
        Ok(Self {
            config,
            transport: Some(transport),
        })
    }

    async fn open(config: &SyslogSinkConfig) -> SinkResult<Transport> {
        let addr = (config.host.as_str(), config.port);
        match config.protocol {
            SyslogProtocol::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(connection_error)?;
                socket.connect(addr).await.map_err(connection_error)?;
                Ok(Transport::Udp(socket))
            }
            SyslogProtocol::Tcp => {
                let stream = TcpStream::connect(addr).await.map_err(connection_error)?;
                Ok(Transport::Tcp(stream))
            }
        }
    }

    pub fn event(&self, serial_number: &str, payload: &Payload) -> CefEvent {
        let field = |f: Field| payload.get(f).map(text).unwrap_or_default();
        let unit = payload
            .get(Field::Unit)
            .map(text)
            .unwrap_or_else(|| "C".to_string());

        CefEvent::new(&self.config.vendor, &self.config.product, serial_number)
            .signature_id(SIGNATURE_ID)
            .name("Telemetry")
            .severity(self.config.severity)
            .extension("cfp1", field(Field::Temperature))
            .extension("cfp1Label", unit)
            .extension("cfp2", field(Field::Latitude))
            .extension("cfp2Label", "lat")
            .extension("cfp3", field(Field::Longitude))
            .extension("cfp3Label", "lon")
            .extension("deviceDirection", field(Field::Location))
    }

    /// Full syslog line, ASCII only, capped at 1024 bytes.
    pub fn line(&self, serial_number: &str, payload: &Payload, at: DateTime<Utc>) -> String {
        let pri = u16::from(self.config.facility) * 8 + u16::from(self.config.severity);
        let mut line = format!(
            "<{}>{} {} {}\n",
            pri,
            at.format("%b %d %H:%M:%S"),
            self.config.hostname,
            self.event(serial_number, payload).build()
        );
        line.retain(|c| c.is_ascii());
        if line.len() > MAX_MESSAGE_LENGTH {
            line.truncate(MAX_MESSAGE_LENGTH - 1);
            line.push('\n');
        }
        line
    }
}

#[async_trait]
impl Sink for SyslogSink {
    fn destination(&self, _key: &str) -> String {
        format!("syslog {}:{}", self.config.host, self.config.port)
    }

    async fn send(&mut self, key: &str, payload: &Payload) -> SinkResult<()> {
        let line = self.line(key, payload, Utc::now());
        match self.transport.as_mut() {
            Some(Transport::Udp(socket)) => {
                socket.send(line.as_bytes()).await.map_err(connection_error)?;
            }
            Some(Transport::Tcp(stream)) => {
                stream
                    .write_all(line.as_bytes())
                    .await
                    .map_err(connection_error)?;
            }
            None => return Err(SinkError::Connection("not connected".to_string())),
        }
        debug!("Syslog message sent: {}", line.trim_end());
        Ok(())
    }

    async fn reconnect(&mut self) -> SinkResult<()> {
        self.transport = None;
        self.transport = Some(Self::open(&self.config).await?);
        Ok(())
    }

    async fn close(&mut self) -> SinkResult<()> {
        if let Some(Transport::Tcp(mut stream)) = self.transport.take() {
            if let Err(e) = stream.shutdown().await {
                warn!("Failed to shut down syslog stream: {}", e);
            }
        }
        info!("Stopped syslog client");
        Ok(())
    }
}
