//! # Linkwire
//!
//! Asynchronous session manager for local devices that speak length-framed,
//! optionally encrypted binary protocols over a persistent connection.
//! Ships with the Tuya local API (3.1 to 3.5) and Visonic Powermax panels.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use linkwire::{Params, SessionBuilder, tuya};
//! use serde_json::json;
//!
//! # async fn run() -> linkwire::Result<()> {
//! let session = SessionBuilder::new("DEVICE_ID", "0123456789abcdef")
//!     .address("192.168.1.20")
//!     .version("3.4")
//!     .build()?;
//! session.connect().await?;
//! session
//!     .send(tuya::CommandType::Control, tuya::set_dps(json!({"1": true})))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
mod macros;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod liveness;
pub mod manager;
pub mod negotiator;
pub mod powermax;
pub mod protocol;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod tuya;

pub use codec::{CodecConfig, Frame, FrameCodec, Role};
pub use config::{Backoff, ProtocolKind, SessionBuilder, SessionConfig};
pub use error::{Result, SessionError};
pub use manager::{Manager, ManagerEvent};
pub use protocol::{Params, Protocol, StateUpdate};
pub use session::{ConnectionState, Session};
pub use supervisor::{SessionEvent, Supervisor};
pub use transport::{Connector, TcpConnector, Transport};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
