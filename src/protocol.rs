//! Protocol seam shared by the session machinery.
//!
//! A [`Protocol`] describes one device family: how frames are laid out, which
//! message types exist and how each is handled, how application requests are
//! turned into frames, and whether a key negotiation precedes normal traffic.
//! The dispatch tables are `const` slices of [`MessageDescriptor`]s whose
//! handlers are plain functions, so every message type is resolved statically.

use crate::codec::{CodecConfig, Frame};
use crate::config::{ProtocolKind, SessionConfig};
use crate::error::Result;
use crate::negotiator::NegotiationScheme;
use crate::powermax::PowermaxProtocol;
use crate::session::Session;
use crate::tuya::{TuyaProtocol, Version};
use serde_json::Value;
use std::sync::Arc;

/// Handler invoked for an inbound frame of a given type.
pub type HandlerFn = fn(&Frame) -> Result<Outcome>;

/// Dispatch table entry for one wire code.
#[derive(Debug)]
pub struct MessageDescriptor {
    pub code: u32,
    pub name: &'static str,
    /// Expected payload length, 0 for variable-length messages.
    pub payload_len: usize,
    /// Receiving this type obliges us to acknowledge it; sending it obliges the peer.
    pub ack_required: bool,
    /// Allowed before the session is ready.
    pub handshake: bool,
    pub handler: HandlerFn,
}

impl MessageDescriptor {
    pub fn accepts_len(&self, len: usize) -> bool {
        self.payload_len == 0 || self.payload_len == len
    }
}

/// Finds the descriptor for `code` in a static table.
pub fn lookup(table: &'static [MessageDescriptor], code: u32) -> Option<&'static MessageDescriptor> {
    table.iter().find(|d| d.code == code)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Application-level parameters of an outbound command.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Params {
    #[default]
    None,
    Json(Value),
    Raw(Vec<u8>),
}

/// Structured state change extracted from an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    /// A data point changed value (optionally on a sub-device).
    Point {
        cid: Option<String>,
        id: String,
        value: Value,
    },
    /// A discrete panel or device event.
    Event {
        kind: &'static str,
        source: u8,
        code: u8,
    },
    /// A recognised message without a structured decoding.
    Raw { cmd: u32, payload: Vec<u8> },
}

/// Result of handling one inbound frame.
#[derive(Debug, Default, PartialEq)]
pub struct Outcome {
    pub updates: Vec<StateUpdate>,
    /// Commands to send in response, through the normal send path.
    pub follow_ups: Vec<(u32, Params)>,
}

impl Outcome {
    pub fn updates(updates: Vec<StateUpdate>) -> Self {
        Self {
            updates,
            follow_ups: Vec::new(),
        }
    }

    pub fn follow_up(mut self, cmd: u32, params: Params) -> Self {
        self.follow_ups.push((cmd, params));
        self
    }
}

/// Handler for messages that carry nothing of interest.
pub fn handle_ignore(_frame: &Frame) -> Result<Outcome> {
    Ok(Outcome::default())
}

/// Handler that forwards the payload untouched.
pub fn handle_raw(frame: &Frame) -> Result<Outcome> {
    Ok(Outcome::updates(vec![StateUpdate::Raw {
        cmd: frame.cmd,
        payload: frame.payload.clone(),
    }]))
}

/// One device protocol family.
pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;

    fn codec_config(&self) -> CodecConfig;

    /// Key negotiation to run after connecting, if the version requires one.
    fn negotiation(&self) -> Option<NegotiationScheme>;

    fn descriptor(&self, code: u32, direction: Direction) -> Option<&'static MessageDescriptor>;

    /// Descriptor applied to inbound codes missing from the table.
    fn fallback(&self) -> &'static MessageDescriptor;

    /// Builds the frame for an outbound command. Sequence numbers are assigned by the caller.
    fn build(&self, cmd: u32, params: &Params, session: &Session) -> Result<Frame>;

    /// Undoes protocol-level payload wrapping of an inbound frame.
    fn open(&self, frame: Frame, session: &Session) -> Result<Frame>;

    /// Keep-alive command sent when the link has been idle.
    fn heartbeat(&self, session: &Session) -> (u32, Params);

    /// Command that asks the device for its full state.
    fn status_request(&self) -> Option<(u32, Params)>;

    /// Builds the acknowledgment for an inbound frame that requires one.
    fn ack_for(&self, inbound: &Frame) -> Option<Frame>;

    /// True if the frame is itself an acknowledgment.
    fn is_ack(&self, frame: &Frame) -> bool;

    /// Correlation id under which an outbound frame waits for its acknowledgment.
    fn correlation_out(&self, frame: &Frame) -> u32;

    /// Correlation id an inbound frame acknowledges, if any.
    fn correlation_in(&self, frame: &Frame) -> Option<u32>;
}

/// Selects the protocol implementation for a session configuration.
pub fn for_config(config: &SessionConfig) -> Result<Arc<dyn Protocol>> {
    match config.protocol {
        ProtocolKind::Tuya => {
            let version: Version = config.version.parse()?;
            Ok(Arc::new(TuyaProtocol::new(version)))
        }
        ProtocolKind::Powermax => Ok(Arc::new(PowermaxProtocol::new())),
    }
}
