pub mod connector;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

pub use connector::TransportConnector;

/// Default receiver video port.
pub const VIDEO_PORT: u16 = 15557;
/// Default receiver control port.
pub const CONTROL_PORT: u16 = 15558;
/// Loopback host the receiver is reached through.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// A fixed receiver address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn loopback(port: u16) -> Self {
        Self::new(LOOPBACK_HOST, port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Opens a single duplex byte stream to an endpoint.
///
/// The connector owns the retry policy; a dialer makes exactly one attempt.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn dial(&self, endpoint: &Endpoint) -> std::io::Result<Self::Stream>;
}

/// Plain TCP dialer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self, endpoint: &Endpoint) -> std::io::Result<TcpStream> {
        let stream = TcpStream::connect((endpoint.host(), endpoint.port())).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
