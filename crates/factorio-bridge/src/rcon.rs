//! Source RCON protocol sessions for Factorio
//!
//! Implements the Valve Source RCON protocol used by Factorio's headless server.
//! Protocol spec: https://developer.valvesoftware.com/wiki/Source_RCON_Protocol
//!
//! A [`Session`] is one authenticated connection. The protocol carries no
//! usable correlation beyond the packet id, so a session allows exactly one
//! outstanding request: `exchange` takes `&mut self`, and a session whose
//! exchange was abandoned mid-flight refuses further use.

use crate::reassembler::{Ingest, Reassembler};
use crate::transport::BoxedStream;
use agent_bridge_core::{BridgeError, Response, Result, ServerId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// RCON packet type constants
pub mod packet_type {
    /// Response to an exec command
    pub const RESPONSE_VALUE: i32 = 0;
    /// Authentication response / Execute command (context-dependent)
    pub const EXEC_COMMAND: i32 = 2;
    /// Authentication response (same wire value as exec)
    pub const AUTH_RESPONSE: i32 = 2;
    /// Authenticate with password
    pub const AUTH: i32 = 3;
}

/// Largest size field accepted for a packet (id + type + body + 2 nulls)
pub const MAX_PACKET_SIZE: usize = 4096;

/// Largest request body that fits in one packet
pub const MAX_BODY_LEN: usize = MAX_PACKET_SIZE - 10;

/// Id the server answers with when authentication is rejected
const AUTH_REJECTED_ID: i32 = -1;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// RCON packet types for creating packets
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PacketType {
    /// Execute a command
    ExecCommand,
    /// Authenticate with password
    Auth,
}

impl PacketType {
    /// Get the wire protocol value
    pub fn as_i32(self) -> i32 {
        match self {
            PacketType::ExecCommand => packet_type::EXEC_COMMAND,
            PacketType::Auth => packet_type::AUTH,
        }
    }
}

/// A single RCON packet.
///
/// Bodies stay raw bytes: a large response is split at arbitrary byte
/// offsets, so a body may end in the middle of a UTF-8 sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct RconPacket {
    pub id: i32,
    pub packet_type: i32,
    pub body: Vec<u8>,
}

impl RconPacket {
    /// Create a new packet
    pub fn new(id: i32, packet_type: PacketType, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            packet_type: packet_type.as_i32(),
            body: body.into(),
        }
    }

    /// Serialize packet to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        // Size = id(4) + type(4) + body + null(1) + null(1)
        let size = 4 + 4 + self.body.len() + 2;

        let mut buf = Vec::with_capacity(4 + size);
        buf.extend_from_slice(&(size as i32).to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.packet_type.to_le_bytes());
        buf.extend_from_slice(&self.body);
        buf.push(0); // Body null terminator
        buf.push(0); // Packet null terminator

        buf
    }

    /// Parse packet from bytes (excluding size prefix)
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 10 {
            return Err(BridgeError::MalformedResponse(
                "RCON packet too short".to_string(),
            ));
        }

        let id = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let packet_type = i32::from_le_bytes([data[4], data[5], data[6], data[7]]);

        // Body is everything after type until the first null
        let body_end = data[8..]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(data.len() - 8);

        Ok(Self {
            id,
            packet_type,
            body: data[8..8 + body_end].to_vec(),
        })
    }

    /// Body as text, for logging
    pub fn body_preview(&self, max: usize) -> String {
        let end = self.body.len().min(max);
        String::from_utf8_lossy(&self.body[..end]).into_owned()
    }
}

/// Write one packet
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &RconPacket) -> std::io::Result<()> {
    writer.write_all(&packet.to_bytes()).await?;
    writer.flush().await
}

/// Read one packet
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<RconPacket> {
    // Read size (4 bytes, little endian)
    let mut size_buf = [0u8; 4];
    reader.read_exact(&mut size_buf).await?;
    let size = i32::from_le_bytes(size_buf);

    if size < 10 || size as usize > MAX_PACKET_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("RCON packet size out of range: {} bytes", size),
        ));
    }

    // Read packet body
    let mut data = vec![0u8; size as usize];
    reader.read_exact(&mut data).await?;

    RconPacket::from_bytes(&data)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

/// Authentication state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    Closed,
}

/// One authenticated, strictly synchronous RCON connection
pub struct Session<S = BoxedStream> {
    id: u64,
    server: ServerId,
    stream: S,
    state: AuthState,
    /// Next packet id; doubles as the request/response sequence counter
    next_seq: i32,
    in_flight: bool,
    reassembler: Reassembler,
}

impl<S> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("state", &self.state)
            .field("next_seq", &self.next_seq)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Session<S> {
    /// Wrap a freshly opened stream
    pub fn new(server: ServerId, stream: S) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            server,
            stream,
            state: AuthState::Unauthenticated,
            next_seq: 1,
            in_flight: false,
            reassembler: Reassembler::new(),
        }
    }

    /// Process-unique session id
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn server(&self) -> &ServerId {
        &self.server
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Whether the session can take another request
    pub fn is_reusable(&self) -> bool {
        self.state == AuthState::Authenticated && !self.in_flight
    }

    /// Mark the session unusable
    pub fn close(&mut self) {
        self.state = AuthState::Closed;
    }

    fn next_id(&mut self) -> i32 {
        let id = self.next_seq;
        // Stay clear of the -1 rejection id on wrap-around
        self.next_seq = if self.next_seq == i32::MAX { 1 } else { self.next_seq + 1 };
        id
    }

    fn io_error(&mut self, what: &str, err: std::io::Error) -> BridgeError {
        self.state = AuthState::Closed;
        BridgeError::unavailable(&self.server, format!("RCON {} failed: {}", what, err))
    }

    /// Authenticate with the server password
    pub async fn authenticate(&mut self, password: &str, timeout: Duration) -> Result<()> {
        if self.state != AuthState::Unauthenticated {
            return Err(BridgeError::unavailable(
                &self.server,
                "authenticate called on a used session",
            ));
        }

        match tokio::time::timeout(timeout, self.authenticate_inner(password)).await {
            Ok(result) => result,
            Err(_) => {
                self.state = AuthState::Closed;
                Err(BridgeError::Timeout(timeout))
            }
        }
    }

    async fn authenticate_inner(&mut self, password: &str) -> Result<()> {
        let auth_id = self.next_id();
        let packet = RconPacket::new(auth_id, PacketType::Auth, password);

        if let Err(e) = write_packet(&mut self.stream, &packet).await {
            return Err(self.io_error("auth send", e));
        }

        loop {
            let response = match read_packet(&mut self.stream).await {
                Ok(packet) => packet,
                Err(e) => return Err(self.io_error("auth recv", e)),
            };

            // Some servers send an empty RESPONSE_VALUE ahead of the auth response
            if response.packet_type == packet_type::RESPONSE_VALUE {
                continue;
            }

            if response.id == AUTH_REJECTED_ID {
                self.state = AuthState::Closed;
                return Err(BridgeError::unavailable(
                    &self.server,
                    "RCON authentication failed",
                ));
            }

            if response.id != auth_id {
                warn!(
                    "RCON auth response ID mismatch: expected {}, got {}",
                    auth_id, response.id
                );
            }

            self.state = AuthState::Authenticated;
            info!("RCON session {} authenticated with {}", self.id, self.server);
            return Ok(());
        }
    }

    /// Send one request body and wait for its complete response.
    ///
    /// Any failure closes the session: the stream may still hold bytes of
    /// the failed response, so it can never be reused safely.
    pub async fn exchange(&mut self, body: &str, timeout: Duration) -> Result<Response> {
        match self.state {
            AuthState::Authenticated => {}
            AuthState::Unauthenticated => {
                return Err(BridgeError::unavailable(&self.server, "RCON not authenticated"));
            }
            AuthState::Closed => {
                return Err(BridgeError::unavailable(&self.server, "RCON session closed"));
            }
        }
        if self.in_flight {
            // A previous exchange was dropped before it finished
            self.state = AuthState::Closed;
            return Err(BridgeError::unavailable(
                &self.server,
                "RCON session has an abandoned request in flight",
            ));
        }
        if body.len() > MAX_BODY_LEN {
            return Err(BridgeError::PayloadTooLarge {
                size: body.len(),
                ceiling: MAX_BODY_LEN,
            });
        }

        self.in_flight = true;
        self.reassembler.reset();

        let result = match tokio::time::timeout(timeout, self.exchange_inner(body)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout(timeout)),
        };

        match &result {
            Ok(_) => self.in_flight = false,
            Err(e) => {
                warn!("RCON session {} failed: {}", self.id, e);
                self.state = AuthState::Closed;
            }
        }
        result
    }

    async fn exchange_inner(&mut self, body: &str) -> Result<Response> {
        let cmd_id = self.next_id();
        let packet = RconPacket::new(cmd_id, PacketType::ExecCommand, body);

        debug!("RCON exec [{}]: {}", cmd_id, &body[..floor_char_boundary(body, 100)]);
        if let Err(e) = write_packet(&mut self.stream, &packet).await {
            return Err(self.io_error("send", e));
        }

        loop {
            let response_packet = match read_packet(&mut self.stream).await {
                Ok(packet) => packet,
                Err(e) => return Err(self.io_error("recv", e)),
            };

            if response_packet.id != cmd_id {
                warn!(
                    "Discarding RCON packet with ID {} while waiting for {}",
                    response_packet.id, cmd_id
                );
                continue;
            }

            debug!(
                "RCON response [{}]: {}",
                cmd_id,
                response_packet.body_preview(100)
            );

            match self.reassembler.ingest(&response_packet.body)? {
                Ingest::Incomplete => continue,
                Ingest::Complete(response) => return Ok(response),
            }
        }
    }

    /// Shut down the stream
    pub async fn disconnect(&mut self) {
        let _ = self.stream.shutdown().await;
        self.state = AuthState::Closed;
        info!("RCON session {} disconnected", self.id);
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}
