//! Outbound connection seam
//!
//! The adapter layer owns routing and socket options; the transport only
//! needs a way to open raw TCP-like streams. Tunnel modes dial through the
//! same seam so every connection honors the caller's dialer.

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::error::Result;

use super::stream::{IntoStream, Stream};

/// Async connect abstraction used by the handshake and the HTTP tunnel.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a duplex byte stream to `addr` ("host:port").
    async fn dial(&self, addr: &str) -> Result<Stream>;
}

/// Plain TCP dialer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> Result<Stream> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream.into_stream())
    }
}
