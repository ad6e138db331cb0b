/// Wire protocol between nodes
use crate::error::{BenchError, Result};
use crate::messaging::envelope::Envelope;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest frame payload we accept from a peer
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Message types in the protocol
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Message {
    /// Sent by the dialing side when establishing a connection
    #[serde(rename = "handshake")]
    Handshake {
        node_id: String,
        /// Base64 DER public key; `node_id` must be derived from it
        public_key: String,
        protocol_version: u8,
        listen_port: u16,
    },

    /// Acknowledgment of handshake
    #[serde(rename = "handshake_ack")]
    HandshakeAck {
        node_id: String,
        public_key: String,
        protocol_version: u8,
    },

    /// Ping message for keepalive
    #[serde(rename = "ping")]
    Ping { timestamp: i64 },

    /// Pong response to ping
    #[serde(rename = "pong")]
    Pong { timestamp: i64 },

    /// Connection close notification
    #[serde(rename = "close")]
    Close { reason: String },

    /// Gossiped envelopes, pooled and relayed by the receiver
    #[serde(rename = "envelopes")]
    Envelopes { envelopes: Vec<Envelope> },

    /// Envelopes addressed to this peer only (mail server deliveries)
    #[serde(rename = "p2p_envelopes")]
    P2pEnvelopes { envelopes: Vec<Envelope> },

    /// Request for archived envelopes, sealed with the mail server key
    #[serde(rename = "messages_request")]
    MessagesRequest { envelope: Envelope },
}

impl Message {
    /// Serialize message to JSON bytes
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from JSON bytes
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Get message type as string
    pub fn message_type(&self) -> &'static str {
        match self {
            Message::Handshake { .. } => "handshake",
            Message::HandshakeAck { .. } => "handshake_ack",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::Close { .. } => "close",
            Message::Envelopes { .. } => "envelopes",
            Message::P2pEnvelopes { .. } => "p2p_envelopes",
            Message::MessagesRequest { .. } => "messages_request",
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message({})", self.message_type())
    }
}

/// Write one message as a length-prefixed frame
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = message.to_bytes().map_err(|e| {
        BenchError::Protocol(format!("Failed to serialize {}: {}", message.message_type(), e))
    })?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(BenchError::Protocol(format!(
            "{} of {} bytes exceeds frame limit",
            message.message_type(),
            payload.len()
        )));
    }

    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Read one length-prefixed frame and decode the message inside it.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly before a new frame.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(BenchError::Io(e)),
    }

    let length = u32::from_be_bytes(len_buf) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(BenchError::Protocol(format!(
            "Frame of {} bytes exceeds limit of {}",
            length, MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    let message = Message::from_bytes(&payload)
        .map_err(|e| BenchError::Protocol(format!("Invalid message: {}", e)))?;
    Ok(Some(message))
}
