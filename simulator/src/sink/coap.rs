use async_trait::async_trait;
use coap_lite::{CoapRequest, ContentFormat, MessageClass, MessageType, Packet, RequestType, ResponseType};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use super::{Sink, SinkError, SinkResult};
use crate::telemetry::Payload;

const MAX_DATAGRAM: usize = 1500;

#[derive(Debug, Clone)]
pub struct CoapSinkConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub timeout: Duration,
}

/// Confirmable CoAP POSTs of JSON payloads to a single resource.
pub struct CoapSink {
    config: CoapSinkConfig,
    socket: Option<UdpSocket>,
    message_id: u16,
}

impl CoapSink {
    pub async fn connect(config: CoapSinkConfig) -> SinkResult<Self> {
        let socket = Self::open(&config).await?;
        info!("CoAP client ready for coap://{}:{}/{}", config.host, config.port, config.path);
        Ok(Self {
            config,
            socket: Some(socket),
            message_id: rand::random(),
        })
    }

    async fn open(config: &CoapSinkConfig) -> SinkResult<UdpSocket> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| SinkError::Connection(e.to_string()))?;
        socket
            .connect((config.host.as_str(), config.port))
            .await
            .map_err(|e| SinkError::Connection(e.to_string()))?;
        Ok(socket)
    }

    pub fn uri(&self) -> String {
        format!(
            "coap://{}:{}/{}",
            self.config.host,
            self.config.port,
            self.config.path.trim_start_matches('/')
        )
    }

    fn request(&mut self, body: Vec<u8>) -> SinkResult<(u16, Vec<u8>)> {
        self.message_id = self.message_id.wrapping_add(1);

        let mut request: CoapRequest<SocketAddr> = CoapRequest::new();
        request.set_method(RequestType::Post);
        request.set_path(&self.config.path);
        request.message.header.set_type(MessageType::Confirmable);
        request.message.header.message_id = self.message_id;
        request.message.set_token(self.message_id.to_be_bytes().to_vec());
        request.message.set_content_format(ContentFormat::ApplicationJSON);
        request.message.payload = body;

        let bytes = request
            .message
            .to_bytes()
            .map_err(|e| SinkError::Rejected(format!("cannot encode CoAP request: {:?}", e)))?;
        Ok((self.message_id, bytes))
    }
}

fn empty_ack(message_id: u16) -> SinkResult<Vec<u8>> {
    let mut ack = Packet::new();
    ack.header.set_type(MessageType::Acknowledgement);
    ack.header.code = MessageClass::Empty;
    ack.header.message_id = message_id;
    ack.to_bytes()
        .map_err(|e| SinkError::Rejected(format!("cannot encode CoAP ACK: {:?}", e)))
}

fn is_success(class: &MessageClass) -> bool {
    matches!(
        class,
        MessageClass::Response(
            ResponseType::Created
                | ResponseType::Deleted
                | ResponseType::Valid
                | ResponseType::Changed
                | ResponseType::Content
        )
    )
}

#[async_trait]
impl Sink for CoapSink {
    fn destination(&self, _key: &str) -> String {
        format!("URI {}", self.uri())
    }

    async fn send(&mut self, _key: &str, payload: &Payload) -> SinkResult<()> {
        let body = payload.to_json_vec()?;
        let (message_id, packet) = self.request(body)?;
        let token = message_id.to_be_bytes();
        let timeout = self.config.timeout;
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| SinkError::Connection("socket not open".to_string()))?;

        socket
            .send(&packet)
            .await
            .map_err(|e| SinkError::Connection(e.to_string()))?;

        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let size = tokio::time::timeout(timeout, socket.recv(&mut buf))
                .await
                .map_err(|_| SinkError::Connection(format!("no response within {:?}", timeout)))?
                .map_err(|e| SinkError::Connection(e.to_string()))?;

            let response = Packet::from_bytes(&buf[..size])
                .map_err(|e| SinkError::Rejected(format!("malformed CoAP response: {:?}", e)))?;

            if response.header.code == MessageClass::Empty {
                if response.header.get_type() == MessageType::Reset
                    && response.header.message_id == message_id
                {
                    return Err(SinkError::Rejected("request reset by server".to_string()));
                }
                // separate response follows the empty ACK
                debug!("CoAP message {} acknowledged, awaiting response", message_id);
                continue;
            }

            // late answers to earlier, timed-out requests
            if response.get_token() != token.as_slice() {
                debug!(
                    "Ignoring CoAP response for message {}",
                    response.header.message_id
                );
                continue;
            }

            if response.header.get_type() == MessageType::Confirmable {
                let ack = empty_ack(response.header.message_id)?;
                socket
                    .send(&ack)
                    .await
                    .map_err(|e| SinkError::Connection(e.to_string()))?;
            }

            debug!("Result ({:?}): {}", response.header.code, String::from_utf8_lossy(&response.payload));
            return if is_success(&response.header.code) {
                Ok(())
            } else {
                Err(SinkError::Rejected(format!("{:?}", response.header.code)))
            };
        }
    }

    async fn reconnect(&mut self) -> SinkResult<()> {
        self.socket = None;
        self.socket = Some(Self::open(&self.config).await?);
        info!("Recreated CoAP client socket for {}", self.uri());
        Ok(())
    }

    async fn close(&mut self) -> SinkResult<()> {
        self.socket = None;
        debug!("Closed CoAP client socket");
        Ok(())
    }
}
