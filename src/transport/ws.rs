//! A minimal RFC6455 WebSocket transport realizing [`ClientLink`] over a
//! raw `TcpStream`: opening handshake, then frame (un)masking carrying
//! Guacamole instructions as **text** frames, since that is what a
//! browser Guacamole client actually sends and expects. No
//! permessage-deflate, no origin checking beyond the upgrade headers
//! themselves — partial-frame reassembly happens here at the WebSocket
//! layer; partial-instruction reassembly happens separately, at the
//! [`crate::instruction::StreamDecoder`] layer.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::engine::Engine as _;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::client_link::{ClientLink, CloseReason, LinkClosed, LinkState};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_FRAME_PAYLOAD: u64 = crate::instruction::DEFAULT_MAX_FRAME_BYTES as u64;

/// Why the RFC6455 opening handshake was refused.
#[derive(Debug, Error)]
pub enum WsHandshakeError {
    #[error("not a WebSocket upgrade request")]
    NotUpgrade,
    #[error("unsupported Sec-WebSocket-Version (expected 13)")]
    UnsupportedVersion,
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("malformed request line or headers: {0}")]
    Malformed(String),
    #[error("I/O error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

/// One accepted WebSocket connection, carrying Guacamole instructions
/// as text frames. Produced by [`accept`].
pub struct WsClientLink {
    rx: BufReader<OwnedReadHalf>,
    tx: OwnedWriteHalf,
    state: LinkState,
}

enum IncomingFrame {
    DataFin(Vec<u8>),
    DataUnfin(Vec<u8>),
    Ping,
    Pong,
    Close,
}

impl IncomingFrame {
    async fn read_from(rx: &mut BufReader<OwnedReadHalf>) -> std::io::Result<Self> {
        let mut head = [0u8; 2];
        rx.read_exact(&mut head).await?;
        let opcode = head[0] & 0b0000_1111;
        let fin = head[0] & 0b1000_0000 != 0;
        if head[1] & 0b1000_0000 == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "client frame is missing the required MASK bit",
            ));
        }
        let mut payload_len = (head[1] & 0b0111_1111) as u64;
        if payload_len == 126 {
            let mut ext = [0u8; 2];
            rx.read_exact(&mut ext).await?;
            payload_len = u16::from_be_bytes(ext) as u64;
        } else if payload_len == 127 {
            let mut ext = [0u8; 8];
            rx.read_exact(&mut ext).await?;
            payload_len = u64::from_be_bytes(ext);
        }
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "client frame exceeds the maximum payload size",
            ));
        }
        let mut mask = [0u8; 4];
        rx.read_exact(&mut mask).await?;
        let mut payload = vec![0u8; payload_len as usize];
        rx.read_exact(&mut payload).await?;
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }

        match opcode {
            // Text (0x1) and continuation (0x0) both carry instruction
            // data; Guacamole-over-WebSocket is text-only, so binary
            // (0x2) is refused rather than silently accepted.
            0x1 | 0x0 if fin => Ok(IncomingFrame::DataFin(payload)),
            0x1 | 0x0 => Ok(IncomingFrame::DataUnfin(payload)),
            0x9 => Ok(IncomingFrame::Ping),
            0xA => Ok(IncomingFrame::Pong),
            0x8 => Ok(IncomingFrame::Close),
            other => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported WebSocket opcode 0x{other:x}"),
            )),
        }
    }
}

impl WsClientLink {
    /// Encodes `payload` as a single, unmasked, FIN-set text frame
    /// (server-to-client frames are never masked, per RFC6455 §5.1).
    fn encode_text_frame(payload: &[u8]) -> Vec<u8> {
        let len = payload.len();
        let mut header = Vec::with_capacity(10 + len);
        header.push(0b1000_0001); // FIN | opcode 0x1 (text)
        if len > 65535 {
            header.push(127);
            header.extend_from_slice(&(len as u64).to_be_bytes());
        } else if len > 125 {
            header.push(126);
            header.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            header.push(len as u8);
        }
        header.extend_from_slice(payload);
        header
    }

    async fn send_close_frame(&mut self) {
        let _ = self.tx.write_all(&[0x88, 0x00]).await;
    }
}

#[async_trait]
impl ClientLink for WsClientLink {
    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkClosed> {
        if self.state == LinkState::Closed {
            return Err(LinkClosed);
        }
        let encoded = Self::encode_text_frame(frame);
        if self.tx.write_all(&encoded).await.is_err() {
            self.state = LinkState::Closed;
            return Err(LinkClosed);
        }
        Ok(())
    }

    async fn receive(&mut self) -> Option<Vec<u8>> {
        if self.state == LinkState::Closed {
            return None;
        }
        let mut message = Vec::new();
        loop {
            match IncomingFrame::read_from(&mut self.rx).await {
                Ok(IncomingFrame::DataFin(mut data)) => {
                    message.append(&mut data);
                    trace!(bytes = message.len(), "received WebSocket text message");
                    return Some(message);
                }
                Ok(IncomingFrame::DataUnfin(mut data)) => message.append(&mut data),
                Ok(IncomingFrame::Ping) | Ok(IncomingFrame::Pong) => continue,
                Ok(IncomingFrame::Close) => {
                    self.send_close_frame().await;
                    self.state = LinkState::Closed;
                    return None;
                }
                Err(e) => {
                    debug!(error = %e, "WebSocket read failed, ending session");
                    self.state = LinkState::Closed;
                    return None;
                }
            }
        }
    }

    async fn close(&mut self, _reason: CloseReason) {
        if self.state == LinkState::Closed {
            return;
        }
        self.send_close_frame().await;
        let _ = self.tx.shutdown().await;
        self.state = LinkState::Closed;
    }

    fn state(&self) -> LinkState {
        self.state
    }
}

/// Performs the RFC6455 server-side opening handshake on a freshly
/// accepted TCP connection and returns the resulting [`WsClientLink`].
/// The request path/query (carrying whatever token the caller uses to
/// build a [`crate::config::ConnectionConfig`]) is returned alongside it,
/// since the core has no notion of URIs itself.
pub async fn accept(socket: TcpStream) -> Result<(WsClientLink, String), WsHandshakeError> {
    let _ = socket.set_nodelay(true);
    let (read_half, write_half) = socket.into_split();
    let mut rx = BufReader::new(read_half);

    let mut request_line = String::new();
    rx.read_line(&mut request_line).await?;
    let mut parts = request_line.split_whitespace();
    let _method = parts
        .next()
        .ok_or_else(|| WsHandshakeError::Malformed("empty request line".into()))?;
    let uri = parts
        .next()
        .ok_or_else(|| WsHandshakeError::Malformed("missing request target".into()))?
        .to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        rx.read_line(&mut line).await?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let is_upgrade = headers
        .get("connection")
        .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"))
        && headers
            .get("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !is_upgrade {
        return Err(WsHandshakeError::NotUpgrade);
    }
    if headers.get("sec-websocket-version").map(String::as_str) != Some("13") {
        return Err(WsHandshakeError::UnsupportedVersion);
    }
    let key = headers
        .get("sec-websocket-key")
        .ok_or(WsHandshakeError::MissingKey)?;

    let accept_src = format!("{key}{WS_GUID}");
    let digest_hex = sha1_smol::Sha1::from(accept_src).hexdigest();
    let digest_bytes = hex::decode(digest_hex)
        .map_err(|e| WsHandshakeError::Malformed(format!("sha1 digest: {e}")))?;
    let accept_value = BASE64.encode(digest_bytes);

    let mut tx = write_half;
    tx.write_all(
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Accept: {accept_value}\r\n\r\n"
        )
        .as_bytes(),
    )
    .await?;

    Ok((
        WsClientLink {
            rx,
            tx,
            state: LinkState::Open,
        },
        uri,
    ))
}
