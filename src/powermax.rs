//! Visonic Powermax panel protocol.
//!
//! Frames use the tabled layout (`0D type payload sum 0A`): the panel sends no
//! length field, so fixed lengths come from the tables below and the other
//! types run to the first valid postamble. Every message the
//! panel marks as acknowledgeable is answered with a bare `0x02` frame before
//! it is processed, and the panel answers each of our commands the same way,
//! so at most one command is in flight at a time.

use crate::codec::{CodecConfig, Encryption, Endian, Frame, Framing, Integrity, LengthTable};
use crate::error::{Result, SessionError};
use crate::negotiator::NegotiationScheme;
use crate::protocol::{
    Direction, MessageDescriptor, Outcome, Params, Protocol, StateUpdate, handle_ignore,
    handle_raw, lookup,
};
use crate::session::Session;
use log::{debug, warn};

define_command_type! {
    /// Message types sent by the panel.
    ReceiveType {
        Ack = 0x02,
        Timeout = 0x06,
        Denied = 0x08,
        Stop = 0x0B,
        DownloadRetry = 0x25,
        Settings = 0x33,
        Info = 0x3C,
        SettingsItem = 0x3F,
        EventLog = 0xA0,
        ZonesName = 0xA3,
        Status = 0xA5,
        ZonesType = 0xA6,
        Panel = 0xA7,
        Powerlink = 0xAB,
        Powermaster = 0xB0,
        F1 = 0xF1,
    }
}

/// Requests we send to the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendType {
    Ack,
    Status,
    Restore,
    Enroll,
    Arm,
    EventLog,
    Download,
    Exit,
}

impl SendType {
    pub fn code(self) -> u32 {
        match self {
            SendType::Ack => 0x02,
            SendType::Status => 0xA2,
            SendType::Restore | SendType::Enroll => 0xAB,
            SendType::Arm => 0xA1,
            SendType::EventLog => 0xA0,
            SendType::Download => 0x24,
            SendType::Exit => 0x0F,
        }
    }

    /// Payload sent when no parameters are supplied.
    fn template(self) -> &'static [u8] {
        match self {
            SendType::Ack | SendType::Exit => &[],
            SendType::Status => &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x43],
            SendType::Restore => &[0x06, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x43],
            SendType::Enroll => &[0x0A, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x43],
            SendType::Arm => &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x43],
            SendType::EventLog => &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x43],
            SendType::Download => &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        }
    }

    /// Offset of the two PIN bytes within the payload.
    fn pin_offset(self) -> Option<usize> {
        match self {
            SendType::Arm => Some(4),
            SendType::EventLog | SendType::Enroll => Some(3),
            SendType::Download => Some(2),
            _ => None,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        [
            SendType::Ack,
            SendType::Status,
            SendType::Restore,
            SendType::Arm,
            SendType::EventLog,
            SendType::Download,
            SendType::Exit,
        ]
        .into_iter()
        .find(|t| t.code() == code)
    }

    /// Request parameters with the PIN filled in.
    pub fn with_pin(self, pin: &str) -> Result<(u32, Params)> {
        let offset = self
            .pin_offset()
            .ok_or_else(|| SessionError::Config(format!("{:?} takes no PIN", self)))?;
        let mut payload = self.template().to_vec();
        payload[offset..offset + 2].copy_from_slice(&pin_bytes(pin)?);
        Ok((self.code(), Params::Raw(payload)))
    }

    pub fn request(self) -> (u32, Params) {
        (self.code(), Params::Raw(self.template().to_vec()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmMode {
    Disarm = 0x00,
    ArmHome = 0x04,
    ArmAway = 0x05,
    ArmHomeInstant = 0x14,
    ArmAwayInstant = 0x15,
}

/// Builds an arm or disarm request.
pub fn arm(mode: ArmMode, pin: &str) -> Result<(u32, Params)> {
    let (code, params) = SendType::Arm.with_pin(pin)?;
    let Params::Raw(mut payload) = params else {
        return Err(SessionError::InvalidPayload);
    };
    payload[3] = mode as u8;
    Ok((code, Params::Raw(payload)))
}

/// Converts a four digit PIN to its two byte wire form (`"1234"` -> `[0x12, 0x34]`).
pub fn pin_bytes(pin: &str) -> Result<[u8; 2]> {
    if pin.len() != 4 || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SessionError::Config("PIN must be four digits".into()));
    }
    let bytes = hex::decode(pin).map_err(|e| SessionError::Config(e.to_string()))?;
    Ok([bytes[0], bytes[1]])
}

const PANEL_RECORD_LEN: usize = 2;
const PANEL_RECORDS_START: usize = 2;

/// One update per `(zone, event)` record of a panel frame.
fn handle_panel(frame: &Frame) -> Result<Outcome> {
    let payload = &frame.payload;
    let count = *payload.first().ok_or(SessionError::InvalidPayload)? as usize;
    let end = PANEL_RECORDS_START + count * PANEL_RECORD_LEN;
    let records = payload
        .get(PANEL_RECORDS_START..end)
        .ok_or(SessionError::FrameLengthMismatch {
            declared: end,
            actual: payload.len(),
        })?;
    let updates = records
        .chunks_exact(PANEL_RECORD_LEN)
        .map(|r| StateUpdate::Event {
            kind: "panel",
            source: r[0],
            code: r[1],
        })
        .collect();
    Ok(Outcome::updates(updates))
}

fn handle_event_log(frame: &Frame) -> Result<Outcome> {
    let p = &frame.payload;
    if p.len() < 10 {
        return Err(SessionError::InvalidPayload);
    }
    // The first record only announces how many entries follow.
    let update = if p[1] == 1 {
        StateUpdate::Event {
            kind: "eventlog_count",
            source: 0,
            code: p[0],
        }
    } else {
        StateUpdate::Event {
            kind: "eventlog",
            source: p[8],
            code: p[9],
        }
    };
    Ok(Outcome::updates(vec![update]))
}

fn handle_status(frame: &Frame) -> Result<Outcome> {
    let p = &frame.payload;
    if p.len() >= 6 && p[1] == 0x04 {
        let mut updates = vec![StateUpdate::Event {
            kind: "system_status",
            source: p[2],
            code: p[3],
        }];
        if p[4] != 0 {
            updates.push(StateUpdate::Event {
                kind: "zone_event",
                source: p[4],
                code: p[5],
            });
        }
        return Ok(Outcome::updates(updates));
    }
    handle_raw(frame)
}

fn handle_powerlink(frame: &Frame) -> Result<Outcome> {
    match frame.payload.first() {
        Some(0x03) => Ok(Outcome::updates(vec![StateUpdate::Event {
            kind: "keepalive",
            source: 0,
            code: 0x03,
        }])),
        Some(0x0A) if frame.payload.get(2) == Some(&0x01) => {
            debug!("Panel requests powerlink enrollment");
            let (code, params) = SendType::Enroll.request();
            Ok(Outcome::default().follow_up(code, params))
        }
        _ => handle_raw(frame),
    }
}

fn handle_denied(_frame: &Frame) -> Result<Outcome> {
    warn!("Panel denied the last request");
    Ok(Outcome::updates(vec![StateUpdate::Event {
        kind: "denied",
        source: 0,
        code: ReceiveType::Denied as u8,
    }]))
}

fn handle_timeout(_frame: &Frame) -> Result<Outcome> {
    let (code, params) = SendType::Exit.request();
    Ok(Outcome::updates(vec![StateUpdate::Event {
        kind: "timeout",
        source: 0,
        code: ReceiveType::Timeout as u8,
    }])
    .follow_up(code, params))
}

fn handle_download_retry(frame: &Frame) -> Result<Outcome> {
    let delay = frame.payload.get(2).copied().unwrap_or_default();
    debug!("Panel asks to retry download in {}s", delay);
    Ok(Outcome::updates(vec![StateUpdate::Event {
        kind: "download_retry",
        source: 0,
        code: delay,
    }]))
}

macro_rules! receive {
    ($ty:ident, $len:literal, $ack:literal, $handler:path) => {
        MessageDescriptor {
            code: ReceiveType::$ty as u32,
            name: stringify!($ty),
            payload_len: $len,
            ack_required: $ack,
            handshake: false,
            handler: $handler,
        }
    };
}

static RECEIVE: &[MessageDescriptor] = &[
    receive!(Ack, 0, false, handle_ignore),
    receive!(Timeout, 0, false, handle_timeout),
    receive!(Denied, 0, true, handle_denied),
    receive!(Stop, 0, true, handle_raw),
    receive!(DownloadRetry, 10, true, handle_download_retry),
    receive!(Settings, 10, true, handle_raw),
    receive!(Info, 10, true, handle_raw),
    receive!(SettingsItem, 0, true, handle_raw),
    receive!(EventLog, 11, true, handle_event_log),
    receive!(ZonesName, 11, true, handle_raw),
    receive!(Status, 11, true, handle_status),
    receive!(ZonesType, 11, true, handle_raw),
    receive!(Panel, 11, true, handle_panel),
    receive!(Powerlink, 11, true, handle_powerlink),
    receive!(Powermaster, 0, true, handle_raw),
    receive!(F1, 5, false, handle_raw),
];

macro_rules! send {
    ($name:literal, $code:literal, $ack:literal) => {
        MessageDescriptor {
            code: $code,
            name: $name,
            payload_len: 0,
            ack_required: $ack,
            handshake: false,
            handler: handle_ignore,
        }
    };
}

static SEND: &[MessageDescriptor] = &[
    send!("Ack", 0x02, false),
    send!("Exit", 0x0F, false),
    send!("Download", 0x24, true),
    send!("EventLog", 0xA0, true),
    send!("Arm", 0xA1, true),
    send!("Status", 0xA2, true),
    send!("Powerlink", 0xAB, true),
];

static UNKNOWN: MessageDescriptor = MessageDescriptor {
    code: 0,
    name: "Unknown",
    payload_len: 0,
    ack_required: true,
    handshake: false,
    handler: handle_ignore,
};

/// Payload lengths on the wire. Settings items and Powermaster messages vary.
const LENGTHS: LengthTable = LengthTable {
    inbound: &[
        (0x02, 0),
        (0x06, 0),
        (0x08, 0),
        (0x0B, 0),
        (0x25, 10),
        (0x33, 10),
        (0x3C, 10),
        (0xA0, 11),
        (0xA3, 11),
        (0xA5, 11),
        (0xA6, 11),
        (0xA7, 11),
        (0xAB, 11),
        (0xF1, 5),
    ],
    outbound: &[
        (0x02, 0),
        (0x0F, 0),
        (0x24, 10),
        (0xA0, 11),
        (0xA1, 11),
        (0xA2, 11),
        (0xAB, 11),
    ],
};

/// Correlation slot shared by every command: the panel acknowledges in order.
const ACK_SLOT: u32 = 0;

#[derive(Debug, Clone, Default)]
pub struct PowermaxProtocol;

impl PowermaxProtocol {
    pub fn new() -> Self {
        Self
    }
}

impl Protocol for PowermaxProtocol {
    fn name(&self) -> &'static str {
        "powermax"
    }

    fn codec_config(&self) -> CodecConfig {
        CodecConfig {
            framing: Framing::Tabled(LENGTHS),
            byte_order: Endian::Big,
            integrity: Integrity::Additive,
            encryption: Encryption::None,
        }
    }

    fn negotiation(&self) -> Option<NegotiationScheme> {
        None
    }

    fn descriptor(&self, code: u32, direction: Direction) -> Option<&'static MessageDescriptor> {
        match direction {
            Direction::Inbound => lookup(RECEIVE, code),
            Direction::Outbound => lookup(SEND, code),
        }
    }

    fn fallback(&self) -> &'static MessageDescriptor {
        &UNKNOWN
    }

    fn build(&self, cmd: u32, params: &Params, _session: &Session) -> Result<Frame> {
        let payload = match params {
            Params::Raw(bytes) => bytes.clone(),
            Params::None => SendType::from_code(cmd)
                .ok_or(SessionError::UnknownCommandType(cmd))?
                .template()
                .to_vec(),
            Params::Json(_) => return Err(SessionError::InvalidPayload),
        };
        Ok(Frame::new(cmd, payload))
    }

    fn open(&self, frame: Frame, _session: &Session) -> Result<Frame> {
        Ok(frame)
    }

    fn heartbeat(&self, _session: &Session) -> (u32, Params) {
        SendType::Status.request()
    }

    fn status_request(&self) -> Option<(u32, Params)> {
        Some(SendType::Status.request())
    }

    fn ack_for(&self, _inbound: &Frame) -> Option<Frame> {
        Some(Frame::new(SendType::Ack.code(), Vec::new()))
    }

    fn is_ack(&self, frame: &Frame) -> bool {
        frame.cmd == ReceiveType::Ack as u32
    }

    fn correlation_out(&self, _frame: &Frame) -> u32 {
        ACK_SLOT
    }

    fn correlation_in(&self, frame: &Frame) -> Option<u32> {
        self.is_ack(frame).then_some(ACK_SLOT)
    }
}
