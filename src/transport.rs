//! Byte transports the supervisor runs sessions over.

use crate::error::{Result, SessionError};
use futures_util::future::BoxFuture;
use log::debug;
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxTransport = Box<dyn Transport>;

/// Opens a fresh transport for each connection attempt.
pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<BoxTransport>>;

    /// Human readable endpoint for logs.
    fn endpoint(&self) -> String;
}

const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Connects over TCP with keep-alive enabled.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    port: u16,
    keepalive: Option<Duration>,
}

impl TcpConnector {
    pub fn new<A: Into<String>>(address: A, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            keepalive: Some(TCP_KEEPALIVE),
        }
    }

    pub fn keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> BoxFuture<'_, Result<BoxTransport>> {
        Box::pin(async move {
            let stream = TcpStream::connect((self.address.as_str(), self.port))
                .await
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::ConnectionRefused => SessionError::ConnectionFailed,
                    _ => SessionError::from(e),
                })?;
            stream.set_nodelay(true)?;
            if let Some(time) = self.keepalive {
                SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(time))?;
            }
            debug!("TCP connection established to {}", self.endpoint());
            Ok(Box::new(stream) as BoxTransport)
        })
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}
