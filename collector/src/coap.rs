//! CoAP endpoint that accepts telemetry POSTs and appends them to the payload log.

use coap_lite::{CoapRequest, ContentFormat, Packet, RequestType, ResponseType};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::errors::Result;
use crate::metrics::{MESSAGES_TOTAL, REJECTED_TOTAL};
use crate::payload_log::PayloadLog;

const MAX_DATAGRAM: usize = 1500;
const WELL_KNOWN_CORE: &str = ".well-known/core";

pub struct CoapServer {
    socket: UdpSocket,
    path: String,
    log: PayloadLog,
}

impl CoapServer {
    pub async fn bind(addr: &str, path: &str, log: PayloadLog) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("CoAP server listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            path: path.trim_matches('/').to_string(),
            log,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Resource listing in CoRE link format.
    fn link_format(&self) -> String {
        format!("</{}>,</{}>;ct=40", self.path, WELL_KNOWN_CORE)
    }

    /// Builds the reply for one datagram. `None` means nothing is sent back.
    pub fn handle(&mut self, datagram: &[u8], peer: SocketAddr) -> Option<Vec<u8>> {
        let packet = match Packet::from_bytes(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping malformed datagram from {}: {:?}", peer, e);
                REJECTED_TOTAL.inc();
                return None;
            }
        };

        let mut request = CoapRequest::from_packet(packet, peer);
        let path = request.get_path();
        let is_post = request.get_method() == &RequestType::Post;
        let is_get = request.get_method() == &RequestType::Get;
        let message_id = request.message.header.message_id;
        let body = std::mem::take(&mut request.message.payload);

        let (status, reply, link) = if path == self.path && is_post {
            info!("{:?} from {} ({})", request.get_method(), peer, message_id);
            match self.log.append(&body) {
                Ok(()) => {
                    MESSAGES_TOTAL.inc();
                    (ResponseType::Content, b"OK".to_vec(), false)
                }
                Err(e) => {
                    error!("Failed to append payload from {}: {}", peer, e);
                    REJECTED_TOTAL.inc();
                    (ResponseType::InternalServerError, Vec::new(), false)
                }
            }
        } else if path == WELL_KNOWN_CORE && is_get {
            (ResponseType::Content, self.link_format().into_bytes(), true)
        } else if path == self.path || path == WELL_KNOWN_CORE {
            REJECTED_TOTAL.inc();
            (ResponseType::MethodNotAllowed, Vec::new(), false)
        } else {
            debug!("No resource at /{} for {}", path, peer);
            REJECTED_TOTAL.inc();
            (ResponseType::NotFound, Vec::new(), false)
        };

        // acknowledgements and resets carry no request to answer
        let response = request.response.as_mut()?;
        response.set_status(status);
        response.message.payload = reply;
        if link {
            response
                .message
                .set_content_format(ContentFormat::ApplicationLinkFormat);
        }

        match response.message.to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("Failed to encode CoAP response for {}: {:?}", peer, e);
                None
            }
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (size, peer) = self.socket.recv_from(&mut buf).await?;
            if let Some(reply) = self.handle(&buf[..size], peer) {
                if let Err(e) = self.socket.send_to(&reply, peer).await {
                    warn!("Failed to reply to {}: {}", peer, e);
                }
            }
        }
    }
}
