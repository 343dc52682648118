//! Tuya local protocol.
//! Command table, protocol versions, payload shaping per version and
//! data-point extraction from device reports.

use crate::codec::{CodecConfig, Encryption, Endian, Frame, Framing, Integrity};
use crate::crypto::SessionCipher;
use crate::error::{Result, SessionError};
use crate::negotiator::{KeyWrap, NegotiationScheme};
use crate::protocol::{
    Direction, MessageDescriptor, Outcome, Params, Protocol, StateUpdate, handle_ignore,
    handle_raw, lookup,
};
use crate::session::Session;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::debug;
use md5::{Digest, Md5};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

define_command_type! {
    /// Tuya LAN command codes.
    CommandType {
        ApConfig = 0x01,
        Active = 0x02,
        SessKeyNegStart = 0x03,
        SessKeyNegResp = 0x04,
        SessKeyNegFinish = 0x05,
        Unbind = 0x06,
        Control = 0x07,
        Status = 0x08,
        HeartBeat = 0x09,
        DpQuery = 0x0a,
        QueryWifi = 0x0b,
        TokenBind = 0x0c,
        ControlNew = 0x0d,
        EnableWifi = 0x0e,
        WifiInfo = 0x0f,
        DpQueryNew = 0x10,
        SceneExecute = 0x11,
        UpdateDps = 0x12,
        UdpNew = 0x13,
        ApConfigNew = 0x14,
        LanExportAppConfig = 0x22,
        LanPublishAppConfig = 0x23,
        ReqDevInfo = 0x25,
        LanExtStream = 0x40,
        LanGwActive = 0xfa,
        LanSubDevRequest = 0xfb,
        LanDeleteSubDev = 0xfc,
        LanReportSubDev = 0xfd,
        LanScene = 0xfe,
        LanPublishCloudConfig = 0xff,
    }
}

define_version! {
    V3_1 = ("3.1", 3.1),
    V3_3 = ("3.3", 3.3),
    V3_4 = ("3.4", 3.4),
    V3_5 = ("3.5", 3.5),
}

/// Commands sent without the `<version>` + 12 zero byte header.
const NO_PROTOCOL_HEADER_CMDS: &[u32] = &[
    CommandType::DpQuery as u32,
    CommandType::DpQueryNew as u32,
    CommandType::UpdateDps as u32,
    CommandType::HeartBeat as u32,
    CommandType::SessKeyNegStart as u32,
    CommandType::SessKeyNegResp as u32,
    CommandType::SessKeyNegFinish as u32,
    CommandType::LanExtStream as u32,
];

/// Replies that answer an outbound command with the same sequence number.
const REPLY_CMDS: &[u32] = &[
    CommandType::Control as u32,
    CommandType::ControlNew as u32,
    CommandType::DpQuery as u32,
    CommandType::DpQueryNew as u32,
    CommandType::HeartBeat as u32,
    CommandType::UpdateDps as u32,
    CommandType::LanExtStream as u32,
];

const VERSION_HEADER_LEN: usize = 15;
const V31_SIGNATURE_LEN: usize = 16;

const KEY_CID: &str = "cid";
const KEY_DPS: &str = "dps";
const KEY_T: &str = "t";
const KEY_DATA: &str = "data";
const KEY_PROTOCOL: &str = "protocol";
const KEY_CTYPE: &str = "ctype";
const KEY_GW_ID: &str = "gwId";
const KEY_DEV_ID: &str = "devId";
const KEY_UID: &str = "uid";
const KEY_REQ_TYPE: &str = "reqType";

macro_rules! descriptor {
    ($cmd:ident, ack = $ack:literal, handshake = $hs:literal, $handler:path) => {
        MessageDescriptor {
            code: CommandType::$cmd as u32,
            name: stringify!($cmd),
            payload_len: 0,
            ack_required: $ack,
            handshake: $hs,
            handler: $handler,
        }
    };
}

/// Tuya messages are symmetric: the same table serves both directions.
/// `ack_required` marks commands the device answers with a reply of the same
/// sequence number; the controller itself never acknowledges.
static DESCRIPTORS: &[MessageDescriptor] = &[
    descriptor!(SessKeyNegStart, ack = false, handshake = true, handle_ignore),
    descriptor!(SessKeyNegResp, ack = false, handshake = true, handle_ignore),
    descriptor!(SessKeyNegFinish, ack = false, handshake = true, handle_ignore),
    descriptor!(Control, ack = true, handshake = false, handle_dps),
    descriptor!(Status, ack = false, handshake = false, handle_dps),
    descriptor!(HeartBeat, ack = true, handshake = false, handle_ignore),
    descriptor!(DpQuery, ack = true, handshake = false, handle_dps),
    descriptor!(ControlNew, ack = true, handshake = false, handle_dps),
    descriptor!(DpQueryNew, ack = true, handshake = false, handle_dps),
    descriptor!(UpdateDps, ack = true, handshake = false, handle_dps),
    descriptor!(LanExtStream, ack = true, handshake = false, handle_dps),
    descriptor!(QueryWifi, ack = false, handshake = false, handle_raw),
    descriptor!(ReqDevInfo, ack = false, handshake = false, handle_raw),
    descriptor!(LanReportSubDev, ack = false, handshake = false, handle_raw),
];

static UNKNOWN: MessageDescriptor = MessageDescriptor {
    code: 0,
    name: "Unknown",
    payload_len: 0,
    ack_required: false,
    handshake: false,
    handler: handle_ignore,
};

/// Turns a device report into data-point updates.
fn handle_dps(frame: &Frame) -> Result<Outcome> {
    if frame.payload.is_empty() {
        return Ok(Outcome::default());
    }
    let value: Value = serde_json::from_slice(&frame.payload)?;
    Ok(Outcome::updates(extract_points(&value)))
}

/// Extracts `dps` entries from a flat (`{"dps": ..}`) or nested
/// (`{"data": {"dps": ..}}`) report, carrying the sub-device id when present.
pub fn extract_points(value: &Value) -> Vec<StateUpdate> {
    let scope = value.get(KEY_DATA).filter(|d| d.is_object()).unwrap_or(value);
    let cid = scope
        .get(KEY_CID)
        .or_else(|| value.get(KEY_CID))
        .and_then(Value::as_str)
        .map(String::from);

    let Some(dps) = scope.get(KEY_DPS).and_then(Value::as_object) else {
        return Vec::new();
    };
    dps.iter()
        .map(|(id, value)| StateUpdate::Point {
            cid: cid.clone(),
            id: id.clone(),
            value: value.clone(),
        })
        .collect()
}

/// Parameters that set data points on the device itself.
pub fn set_dps(dps: Value) -> Params {
    Params::Json(serde_json::json!({ KEY_DPS: dps }))
}

/// Parameters that set data points on a gateway sub-device.
pub fn set_sub_device_dps(cid: &str, dps: Value) -> Params {
    Params::Json(serde_json::json!({ KEY_CID: cid, KEY_DPS: dps }))
}

/// Asks a gateway which sub-devices are online.
pub fn sub_discover() -> (u32, Params) {
    (
        CommandType::LanExtStream as u32,
        Params::Json(serde_json::json!({
            "cids": [],
            KEY_REQ_TYPE: "subdev_online_stat_query",
        })),
    )
}

#[derive(Debug, Default)]
struct Request {
    data: Option<Value>,
    cid: Option<String>,
    req_type: Option<String>,
}

impl Request {
    fn from_params(params: &Params) -> Self {
        let Params::Json(value) = params else {
            return Self::default();
        };
        let Some(map) = value.as_object() else {
            return Self {
                data: Some(value.clone()),
                ..Self::default()
            };
        };
        let mut map = map.clone();
        let req_type = map
            .remove(KEY_REQ_TYPE)
            .and_then(|v| v.as_str().map(String::from));
        if map.contains_key(KEY_DPS) {
            Self {
                cid: map
                    .remove(KEY_CID)
                    .and_then(|v| v.as_str().map(String::from)),
                data: map.remove(KEY_DPS),
                req_type,
            }
        } else {
            Self {
                data: (!map.is_empty()).then_some(Value::Object(map)),
                cid: None,
                req_type,
            }
        }
    }
}

/// Tuya device protocol for one version.
#[derive(Debug, Clone)]
pub struct TuyaProtocol {
    version: Version,
}

impl TuyaProtocol {
    pub fn new(version: Version) -> Self {
        Self { version }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }

    /// Picks the wire command and builds the JSON body.
    fn generate_payload(&self, command: CommandType, request: Request, device_id: &str) -> (u32, Value) {
        let version_val = self.version.val();
        let t = Self::timestamp();

        if command == CommandType::HeartBeat {
            return (
                command.code(),
                serde_json::json!({ KEY_GW_ID: device_id, KEY_DEV_ID: device_id }),
            );
        }

        let cmd = if version_val >= 3.4 {
            match command {
                CommandType::Control => CommandType::ControlNew,
                CommandType::DpQuery => CommandType::DpQueryNew,
                other => other,
            }
        } else {
            command
        };

        let mut payload = serde_json::Map::new();
        let cid = request.cid.as_deref();
        if let Some(c) = cid {
            payload.insert(KEY_CID.into(), c.into());
        }

        let nested = version_val >= 3.4
            && matches!(cmd, CommandType::ControlNew | CommandType::LanExtStream);

        if nested {
            payload.insert(KEY_PROTOCOL.into(), 5.into());
            payload.insert(KEY_T.into(), t.into());

            let mut data = serde_json::Map::new();
            if let Some(c) = cid {
                data.insert(KEY_CID.into(), c.into());
                data.insert(KEY_CTYPE.into(), 0.into());
            }
            if let Some(d) = request.data {
                match (cmd, d) {
                    (CommandType::LanExtStream, Value::Object(obj)) => data.extend(obj),
                    (_, d) => {
                        data.insert(KEY_DPS.into(), d);
                    }
                }
            }
            payload.insert(KEY_DATA.into(), Value::Object(data));
        } else {
            payload.insert(KEY_GW_ID.into(), device_id.into());
            payload.insert(KEY_DEV_ID.into(), cid.unwrap_or(device_id).into());
            payload.insert(KEY_UID.into(), device_id.into());
            payload.insert(KEY_T.into(), t.to_string().into());
            if let Some(d) = request.data {
                if cmd == CommandType::LanExtStream {
                    if let Value::Object(obj) = d {
                        payload.extend(obj);
                    }
                } else {
                    payload.insert(KEY_DPS.into(), d);
                }
            }
        }

        if let Some(rt) = request.req_type {
            payload.insert(KEY_REQ_TYPE.into(), rt.into());
        }

        (cmd.code(), Value::Object(payload))
    }

    fn add_version_header(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(VERSION_HEADER_LEN + payload.len());
        out.extend_from_slice(self.version.as_bytes());
        out.extend_from_slice(&[0u8; 12]);
        out.extend_from_slice(payload);
        out
    }

    fn has_version_header(&self, payload: &[u8]) -> bool {
        payload.len() >= VERSION_HEADER_LEN && &payload[..3] == self.version.as_bytes()
    }

    /// v3.1 control payloads are encrypted, base64 encoded and signed with MD5.
    fn sign_v31(&self, body: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        let encrypted = SessionCipher::new(key)?.encrypt_ecb(body, true)?;
        let encoded = BASE64.encode(encrypted);

        let mut hasher = Md5::new();
        hasher.update(b"data=");
        hasher.update(encoded.as_bytes());
        hasher.update(b"||lpv=");
        hasher.update(self.version.as_bytes());
        hasher.update(b"||");
        hasher.update(key);
        let digest = hex::encode(hasher.finalize());

        let mut out = self.version.as_bytes().to_vec();
        out.extend_from_slice(&digest.as_bytes()[8..24]);
        out.extend_from_slice(encoded.as_bytes());
        Ok(out)
    }

    /// Applies the version specific wrapping the codec does not do itself.
    fn seal(&self, cmd: u32, body: Vec<u8>, key: &[u8]) -> Result<Vec<u8>> {
        let use_header = !NO_PROTOCOL_HEADER_CMDS.contains(&cmd);
        match self.version {
            Version::V3_4 | Version::V3_5 => Ok(if use_header {
                self.add_version_header(&body)
            } else {
                body
            }),
            Version::V3_3 => {
                let encrypted = SessionCipher::new(key)?.encrypt_ecb(&body, true)?;
                Ok(if use_header {
                    self.add_version_header(&encrypted)
                } else {
                    encrypted
                })
            }
            Version::V3_1 if cmd == CommandType::Control as u32 => self.sign_v31(&body, key),
            Version::V3_1 => Ok(body),
        }
    }
}

impl Protocol for TuyaProtocol {
    fn name(&self) -> &'static str {
        "tuya"
    }

    fn codec_config(&self) -> CodecConfig {
        let (framing, integrity, encryption) = match self.version {
            Version::V3_1 | Version::V3_3 => (Framing::Classic, Integrity::Crc32, Encryption::None),
            Version::V3_4 => (Framing::Classic, Integrity::HmacSha256, Encryption::AesEcb),
            Version::V3_5 => (Framing::Sealed, Integrity::HmacSha256, Encryption::None),
        };
        CodecConfig {
            framing,
            byte_order: Endian::Big,
            integrity,
            encryption,
        }
    }

    fn negotiation(&self) -> Option<NegotiationScheme> {
        let key_wrap = match self.version {
            Version::V3_4 => KeyWrap::Ecb,
            Version::V3_5 => KeyWrap::Gcm,
            Version::V3_1 | Version::V3_3 => return None,
        };
        Some(NegotiationScheme {
            start: CommandType::SessKeyNegStart as u32,
            response: CommandType::SessKeyNegResp as u32,
            finish: CommandType::SessKeyNegFinish as u32,
            key_wrap,
        })
    }

    fn descriptor(&self, code: u32, _direction: Direction) -> Option<&'static MessageDescriptor> {
        lookup(DESCRIPTORS, code)
    }

    fn fallback(&self) -> &'static MessageDescriptor {
        &UNKNOWN
    }

    fn build(&self, cmd: u32, params: &Params, session: &Session) -> Result<Frame> {
        let command = CommandType::from_u32(cmd).ok_or(SessionError::UnknownCommandType(cmd))?;
        let (wire_cmd, body) = match params {
            Params::Raw(bytes) => (cmd, bytes.clone()),
            _ => {
                let request = Request::from_params(params);
                let (wire_cmd, value) = self.generate_payload(command, request, session.device_id());
                debug!(
                    "Building {} for {}: {}",
                    command.name(),
                    session.device_id(),
                    value
                );
                (wire_cmd, serde_json::to_vec(&value)?)
            }
        };
        let payload = self.seal(wire_cmd, body, session.session_key())?;
        Ok(Frame::new(wire_cmd, payload))
    }

    fn open(&self, mut frame: Frame, session: &Session) -> Result<Frame> {
        if frame.payload.is_empty() {
            return Ok(frame);
        }
        let mut payload = std::mem::take(&mut frame.payload);
        match self.version {
            Version::V3_4 | Version::V3_5 => {
                if self.has_version_header(&payload) {
                    payload.drain(..VERSION_HEADER_LEN);
                }
            }
            Version::V3_3 => {
                if self.has_version_header(&payload) {
                    payload.drain(..VERSION_HEADER_LEN);
                }
                if !payload.is_empty() {
                    let cipher = SessionCipher::new(session.session_key())?;
                    payload = match cipher.decrypt_ecb(&payload) {
                        Ok(mut decrypted) => {
                            if self.has_version_header(&decrypted) {
                                decrypted.drain(..VERSION_HEADER_LEN);
                            }
                            decrypted
                        }
                        // Some firmwares answer in clear text.
                        Err(_) if payload[0] == b'{' => payload,
                        Err(e) => return Err(e),
                    };
                }
            }
            Version::V3_1 => {
                if payload.starts_with(self.version.as_bytes()) {
                    let start = self.version.as_bytes().len() + V31_SIGNATURE_LEN;
                    let encoded = payload.get(start..).ok_or(SessionError::InvalidPayload)?;
                    let encrypted = BASE64
                        .decode(encoded)
                        .map_err(|_| SessionError::InvalidPayload)?;
                    payload = SessionCipher::new(session.session_key())?.decrypt_ecb(&encrypted)?;
                }
            }
        }
        debug!(
            "Opened payload from {}: {}",
            session.device_id(),
            String::from_utf8_lossy(&payload)
        );
        frame.payload = payload;
        Ok(frame)
    }

    fn heartbeat(&self, _session: &Session) -> (u32, Params) {
        (CommandType::HeartBeat as u32, Params::None)
    }

    fn status_request(&self) -> Option<(u32, Params)> {
        Some((CommandType::DpQuery as u32, Params::None))
    }

    fn ack_for(&self, _inbound: &Frame) -> Option<Frame> {
        None
    }

    fn is_ack(&self, _frame: &Frame) -> bool {
        // Every inbound frame on the controller side is a reply or a report.
        true
    }

    fn correlation_out(&self, frame: &Frame) -> u32 {
        frame.seqno
    }

    fn correlation_in(&self, frame: &Frame) -> Option<u32> {
        REPLY_CMDS.contains(&frame.cmd).then_some(frame.seqno)
    }
}
