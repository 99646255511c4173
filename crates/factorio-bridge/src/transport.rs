//! Transport abstractions for RCON sessions
//!
//! A [`Connector`] opens a raw byte stream to a server endpoint. The pool
//! only ever talks to this trait, so tests can swap TCP for in-memory pipes.

use agent_bridge_core::{BridgeError, Result, ServerEndpoint};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Byte stream an RCON session runs over
pub trait RconStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RconStream for T {}

/// Boxed stream used by pooled sessions
pub type BoxedStream = Box<dyn RconStream>;

/// Trait for opening transport streams to a server
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new stream; authentication happens on top of it
    async fn connect(&self, endpoint: &ServerEndpoint) -> Result<BoxedStream>;
}

/// TCP connector with a connect timeout
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &ServerEndpoint) -> Result<BoxedStream> {
        debug!("Opening TCP stream to {}", endpoint.address);

        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(&endpoint.address),
        )
        .await
        .map_err(|_| {
            BridgeError::unavailable(
                &endpoint.id,
                format!("connect timed out after {:?}", self.connect_timeout),
            )
        })?
        .map_err(|e| BridgeError::unavailable(&endpoint.id, format!("connect failed: {}", e)))?;

        // Requests are small and strictly request/response
        stream
            .set_nodelay(true)
            .map_err(|e| BridgeError::unavailable(&endpoint.id, format!("set_nodelay: {}", e)))?;

        Ok(Box::new(stream))
    }
}
