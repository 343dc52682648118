//! In-memory device simulator shared by the integration tests.

#![allow(dead_code)]

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use linkwire::codec::{CodecConfig, Frame, FrameCodec, Role};
use linkwire::negotiator::Negotiator;
use linkwire::transport::{BoxTransport, Connector};
use linkwire::{Protocol, Result, SessionConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::Framed;

pub const KEY: &str = "0123456789abcdef";

/// Hands the device end of every new connection to the test.
pub struct DuplexConnector {
    tx: mpsc::UnboundedSender<DuplexStream>,
    connects: AtomicUsize,
}

impl DuplexConnector {
    pub fn new() -> (Arc<Self>, Accept) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            tx,
            connects: AtomicUsize::new(0),
        });
        (connector, Accept(Mutex::new(rx)))
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Connector for DuplexConnector {
    fn connect(&self) -> BoxFuture<'_, Result<BoxTransport>> {
        Box::pin(async move {
            let (near, far) = tokio::io::duplex(64 * 1024);
            self.connects.fetch_add(1, Ordering::SeqCst);
            let _ = self.tx.send(far);
            Ok(Box::new(near) as BoxTransport)
        })
    }

    fn endpoint(&self) -> String {
        "duplex".into()
    }
}

pub struct Accept(Mutex<mpsc::UnboundedReceiver<DuplexStream>>);

impl Accept {
    pub async fn next(&self, protocol: &dyn Protocol) -> SimDevice {
        let stream = self
            .0
            .lock()
            .await
            .recv()
            .await
            .expect("connector dropped");
        SimDevice::new(stream, protocol.codec_config(), protocol)
    }
}

/// Device side of one connection.
pub struct SimDevice {
    pub wire: Framed<DuplexStream, FrameCodec>,
    negotiator: Negotiator,
}

impl SimDevice {
    fn new(stream: DuplexStream, config: CodecConfig, protocol: &dyn Protocol) -> Self {
        Self {
            wire: Framed::new(stream, FrameCodec::new(config, Role::Device, KEY)),
            negotiator: Negotiator::new(protocol.negotiation(), Role::Device, KEY),
        }
    }

    pub async fn recv(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(300), self.wire.next())
            .await
            .expect("no frame from controller")
            .expect("connection closed")
            .expect("transport error")
            .expect("malformed frame")
    }

    pub async fn send(&mut self, frame: Frame) {
        self.wire.send(frame).await.expect("device write failed");
    }

    /// Answers the controller's key exchange and switches to the session key.
    pub async fn handshake(&mut self) {
        assert_eq!(self.negotiator.start().unwrap(), None);
        while !self.negotiator.is_complete() {
            let frame = self.recv().await;
            if let Some(reply) = self.negotiator.on_frame(&frame).unwrap() {
                self.send(reply).await;
            }
        }
        let key = self.negotiator.session_key().unwrap().to_vec();
        self.wire.codec_mut().set_key(key);
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn tuya_config(version: &str) -> SessionConfig {
    SessionConfig {
        device_id: "bf0123456789abcdef".into(),
        address: "127.0.0.1".into(),
        local_key: KEY.into(),
        version: version.into(),
        request_status_on_connect: false,
        ..SessionConfig::default()
    }
}

pub fn powermax_config() -> SessionConfig {
    SessionConfig {
        device_id: "panel".into(),
        address: "127.0.0.1".into(),
        port: 5000,
        protocol: linkwire::ProtocolKind::Powermax,
        request_status_on_connect: false,
        ..SessionConfig::default()
    }
}
