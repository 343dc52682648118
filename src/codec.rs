//! Wire framing.
//! Packs and unpacks frames for the classic (55AA), sealed (6699), compact and
//! tabled (0x0D .. 0x0A) layouts, and provides a streaming decoder that
//! resynchronises on the frame prefix.

use crate::crypto::{self, GCM_IV_LEN, GCM_TAG_LEN, HMAC_LEN, SessionCipher};
use crate::error::{Result, SessionError};
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use bytes::{Buf, BytesMut};
use crc::{CRC_32_ISO_HDLC, Crc};
use log::{debug, trace};
use tokio_util::codec::{Decoder, Encoder};

pub const PREFIX_55AA: u32 = 0x000055AA;
pub const PREFIX_6699: u32 = 0x00006699;
pub const SUFFIX_55AA: u32 = 0x0000AA55;
pub const SUFFIX_6699: u32 = 0x00009966;
pub const COMPACT_PREAMBLE: u8 = 0x0D;
pub const COMPACT_POSTAMBLE: u8 = 0x0A;

/// Upper bound for a single frame in every framing. Larger frames are refused
/// by `pack` and treated as noise by the stream decoder.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const CLASSIC_HEADER_LEN: usize = 16;
const SEALED_HEADER_LEN: usize = 18;
const COMPACT_HEADER_LEN: usize = 4;
const TABLED_HEADER_LEN: usize = 2;
const MARKER_LEN: usize = 4;
const RETCODE_LEN: usize = 4;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Byte order of the integer fields (markers, sequence, command, length, CRC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

impl Endian {
    fn write_u32(self, buf: &mut Vec<u8>, value: u32) -> Result<()> {
        match self {
            Endian::Big => buf.write_u32::<BigEndian>(value)?,
            Endian::Little => buf.write_u32::<LittleEndian>(value)?,
        }
        Ok(())
    }

    fn write_u16(self, buf: &mut Vec<u8>, value: u16) -> Result<()> {
        match self {
            Endian::Big => buf.write_u16::<BigEndian>(value)?,
            Endian::Little => buf.write_u16::<LittleEndian>(value)?,
        }
        Ok(())
    }

    fn read_u32(self, data: &[u8]) -> u32 {
        match self {
            Endian::Big => BigEndian::read_u32(data),
            Endian::Little => LittleEndian::read_u32(data),
        }
    }

    fn read_u16(self, data: &[u8]) -> u16 {
        match self {
            Endian::Big => BigEndian::read_u16(data),
            Endian::Little => LittleEndian::read_u16(data),
        }
    }

    fn marker(self, value: u32) -> [u8; 4] {
        match self {
            Endian::Big => value.to_be_bytes(),
            Endian::Little => value.to_le_bytes(),
        }
    }
}

/// Frame layout on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `55AA | seqno | cmd | len | [retcode] payload | integrity | AA55`
    Classic,
    /// `6699 | 0u16 | seqno | cmd | len | IV ciphertext tag | 9966`, AES-GCM sealed.
    Sealed,
    /// `0D | type u8 | len u16 | payload | integrity | 0A`
    Compact,
    /// `0D | type u8 | payload | integrity | 0A`, payload length looked up by type.
    Tabled(LengthTable),
}

/// Fixed payload lengths per message type for [`Framing::Tabled`].
///
/// Types missing from a table have a variable length. Their frame ends at the
/// first postamble whose integrity check passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthTable {
    /// Types the controller receives.
    pub inbound: &'static [(u8, usize)],
    /// Types the controller sends.
    pub outbound: &'static [(u8, usize)],
}

impl LengthTable {
    fn find(table: &[(u8, usize)], cmd: u8) -> Option<usize> {
        table.iter().find(|(code, _)| *code == cmd).map(|(_, len)| *len)
    }
}

/// Integrity check appended to classic and compact frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    Crc32,
    HmacSha256,
    /// `0xFF - sum % 0xFF` over type, length and payload (0 when the sum is a multiple).
    Additive,
}

impl Integrity {
    fn len(self) -> usize {
        match self {
            Integrity::Crc32 => 4,
            Integrity::HmacSha256 => HMAC_LEN,
            Integrity::Additive => 1,
        }
    }
}

/// Payload encryption applied by the codec itself. Sealed framing always uses GCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    None,
    AesEcb,
}

/// Which side of the link this codec runs on.
///
/// Device replies may carry a return code in front of the payload. Only the
/// controller looks for one; the device never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controller,
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    pub framing: Framing,
    pub byte_order: Endian,
    pub integrity: Integrity,
    pub encryption: Encryption,
}

impl CodecConfig {
    pub fn validate(&self) -> Result<()> {
        if self.framing == Framing::Sealed && self.encryption != Encryption::None {
            return Err(SessionError::Config(
                "sealed framing carries its own encryption".into(),
            ));
        }
        Ok(())
    }
}

/// One unit on the wire, after integrity checks and decryption.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// Sequence number (0 for framings without one)
    pub seqno: u32,
    /// Command or message type code
    pub cmd: u32,
    /// Return code of device replies
    pub retcode: Option<u32>,
    /// Plain payload
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new<P: Into<Vec<u8>>>(cmd: u32, payload: P) -> Self {
        Self {
            cmd,
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_seqno(mut self, seqno: u32) -> Self {
        self.seqno = seqno;
        self
    }

    pub fn with_retcode(mut self, retcode: u32) -> Self {
        self.retcode = Some(retcode);
        self
    }
}

/// Encodes and decodes frames with the key currently installed for the session.
pub struct FrameCodec {
    config: CodecConfig,
    role: Role,
    key: Vec<u8>,
}

impl FrameCodec {
    pub fn new<K: Into<Vec<u8>>>(config: CodecConfig, role: Role, key: K) -> Self {
        Self {
            config,
            role,
            key: key.into(),
        }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Replaces the key used for integrity and encryption (after negotiation).
    pub fn set_key<K: Into<Vec<u8>>>(&mut self, key: K) {
        self.key = key.into();
    }

    /// Packs a frame into its wire representation.
    pub fn pack(&self, frame: &Frame) -> Result<Vec<u8>> {
        let data = match self.config.framing {
            Framing::Classic => self.pack_classic(frame)?,
            Framing::Sealed => self.pack_sealed(frame)?,
            Framing::Compact => self.pack_compact(frame)?,
            Framing::Tabled(table) => self.pack_tabled(frame, table)?,
        };
        if data.len() > MAX_FRAME_LEN {
            return Err(SessionError::FrameLengthMismatch {
                declared: data.len(),
                actual: MAX_FRAME_LEN,
            });
        }
        trace!(
            "Packed frame cmd=0x{:02X} seqno={} ({} bytes)",
            frame.cmd,
            frame.seqno,
            data.len()
        );
        Ok(data)
    }

    /// Unpacks exactly one frame. The buffer must hold the whole frame and nothing else.
    pub fn unpack(&self, data: &[u8]) -> Result<Frame> {
        match self.config.framing {
            Framing::Classic => self.unpack_classic(data),
            Framing::Sealed => self.unpack_sealed(data),
            Framing::Compact => self.unpack_compact(data),
            Framing::Tabled(table) => self.unpack_tabled(data, table),
        }
    }

    // -------------------------------------------------------------------------
    // Classic (55AA)
    // -------------------------------------------------------------------------

    fn pack_classic(&self, frame: &Frame) -> Result<Vec<u8>> {
        let order = self.config.byte_order;
        let body = self.build_body(frame)?;
        let trailer_len = self.config.integrity.len() + MARKER_LEN;

        let mut data = Vec::with_capacity(CLASSIC_HEADER_LEN + body.len() + trailer_len);
        order.write_u32(&mut data, PREFIX_55AA)?;
        order.write_u32(&mut data, frame.seqno)?;
        order.write_u32(&mut data, frame.cmd)?;
        order.write_u32(&mut data, (body.len() + trailer_len) as u32)?;
        data.extend_from_slice(&body);

        let tag = self.integrity_tag(&data)?;
        data.extend_from_slice(&tag);
        order.write_u32(&mut data, SUFFIX_55AA)?;
        Ok(data)
    }

    fn unpack_classic(&self, data: &[u8]) -> Result<Frame> {
        let order = self.config.byte_order;
        if data.len() < CLASSIC_HEADER_LEN || order.read_u32(&data[..4]) != PREFIX_55AA {
            return Err(SessionError::InvalidHeader);
        }
        let seqno = order.read_u32(&data[4..8]);
        let cmd = order.read_u32(&data[8..12]);
        let declared = order.read_u32(&data[12..16]) as usize;
        let total = CLASSIC_HEADER_LEN + declared;
        check_length(total, data.len())?;

        let trailer_len = self.config.integrity.len() + MARKER_LEN;
        if declared < trailer_len {
            return Err(SessionError::FrameLengthMismatch {
                declared,
                actual: trailer_len,
            });
        }
        if order.read_u32(&data[total - MARKER_LEN..]) != SUFFIX_55AA {
            return Err(SessionError::InvalidHeader);
        }

        let body_end = total - trailer_len;
        self.verify_integrity(&data[..body_end], &data[body_end..total - MARKER_LEN])?;
        self.parse_body(seqno, cmd, &data[CLASSIC_HEADER_LEN..body_end])
    }

    // -------------------------------------------------------------------------
    // Sealed (6699)
    // -------------------------------------------------------------------------

    fn pack_sealed(&self, frame: &Frame) -> Result<Vec<u8>> {
        let order = self.config.byte_order;
        let mut raw = Vec::with_capacity(RETCODE_LEN + frame.payload.len());
        if let Some(rc) = frame.retcode {
            order.write_u32(&mut raw, rc)?;
        }
        raw.extend_from_slice(&frame.payload);

        let mut header = Vec::with_capacity(SEALED_HEADER_LEN);
        order.write_u32(&mut header, PREFIX_6699)?;
        order.write_u16(&mut header, 0)?;
        order.write_u32(&mut header, frame.seqno)?;
        order.write_u32(&mut header, frame.cmd)?;
        order.write_u32(&mut header, (GCM_IV_LEN + raw.len() + GCM_TAG_LEN) as u32)?;

        let iv = crypto::random_bytes::<GCM_IV_LEN>();
        let sealed = self.cipher()?.encrypt_gcm(&raw, &iv, &header[4..])?;

        let mut data = header;
        data.extend_from_slice(&sealed);
        order.write_u32(&mut data, SUFFIX_6699)?;
        Ok(data)
    }

    fn unpack_sealed(&self, data: &[u8]) -> Result<Frame> {
        let order = self.config.byte_order;
        if data.len() < SEALED_HEADER_LEN || order.read_u32(&data[..4]) != PREFIX_6699 {
            return Err(SessionError::InvalidHeader);
        }
        let seqno = order.read_u32(&data[6..10]);
        let cmd = order.read_u32(&data[10..14]);
        let declared = order.read_u32(&data[14..18]) as usize;
        let total = SEALED_HEADER_LEN + declared + MARKER_LEN;
        check_length(total, data.len())?;

        if declared < GCM_IV_LEN + GCM_TAG_LEN {
            return Err(SessionError::FrameLengthMismatch {
                declared,
                actual: GCM_IV_LEN + GCM_TAG_LEN,
            });
        }
        if order.read_u32(&data[total - MARKER_LEN..]) != SUFFIX_6699 {
            return Err(SessionError::InvalidHeader);
        }

        let sealed = &data[SEALED_HEADER_LEN..total - MARKER_LEN];
        let (iv, ciphertext) = sealed.split_at(GCM_IV_LEN);
        let mut payload = self
            .cipher()?
            .decrypt_gcm(ciphertext, iv, &data[4..SEALED_HEADER_LEN])?;

        let mut retcode = None;
        if self.has_retcode(&payload) {
            retcode = Some(order.read_u32(&payload[..RETCODE_LEN]));
            payload.drain(..RETCODE_LEN);
        }

        Ok(Frame {
            seqno,
            cmd,
            retcode,
            payload,
        })
    }

    // -------------------------------------------------------------------------
    // Compact (0D .. 0A)
    // -------------------------------------------------------------------------

    fn pack_compact(&self, frame: &Frame) -> Result<Vec<u8>> {
        let cmd = u8::try_from(frame.cmd).map_err(|_| SessionError::UnknownCommandType(frame.cmd))?;
        let payload = self.encrypt_payload(&frame.payload)?;
        let len = u16::try_from(payload.len()).map_err(|_| SessionError::InvalidPayload)?;

        let mut data = Vec::with_capacity(COMPACT_HEADER_LEN + payload.len() + 6);
        data.push(COMPACT_PREAMBLE);
        data.push(cmd);
        self.config.byte_order.write_u16(&mut data, len)?;
        data.extend_from_slice(&payload);

        let tag = self.integrity_tag(&data[1..])?;
        data.extend_from_slice(&tag);
        data.push(COMPACT_POSTAMBLE);
        Ok(data)
    }

    fn unpack_compact(&self, data: &[u8]) -> Result<Frame> {
        if data.len() < COMPACT_HEADER_LEN || data[0] != COMPACT_PREAMBLE {
            return Err(SessionError::InvalidHeader);
        }
        let cmd = data[1] as u32;
        let declared = self.config.byte_order.read_u16(&data[2..4]) as usize;
        let ilen = self.config.integrity.len();
        let total = COMPACT_HEADER_LEN + declared + ilen + 1;
        check_length(total, data.len())?;

        if data[total - 1] != COMPACT_POSTAMBLE {
            return Err(SessionError::InvalidHeader);
        }
        let body_end = COMPACT_HEADER_LEN + declared;
        self.verify_integrity(&data[1..body_end], &data[body_end..total - 1])?;

        Ok(Frame {
            seqno: 0,
            cmd,
            retcode: None,
            payload: self.decrypt_payload(&data[COMPACT_HEADER_LEN..body_end])?,
        })
    }

    // -------------------------------------------------------------------------
    // Tabled (0D .. 0A, no length field)
    // -------------------------------------------------------------------------

    /// Lengths of the frames this codec sends and receives.
    fn lengths(&self, table: LengthTable) -> (&'static [(u8, usize)], &'static [(u8, usize)]) {
        match self.role {
            Role::Controller => (table.outbound, table.inbound),
            Role::Device => (table.inbound, table.outbound),
        }
    }

    fn pack_tabled(&self, frame: &Frame, table: LengthTable) -> Result<Vec<u8>> {
        let cmd = u8::try_from(frame.cmd).map_err(|_| SessionError::UnknownCommandType(frame.cmd))?;
        let payload = self.encrypt_payload(&frame.payload)?;
        let (outgoing, _) = self.lengths(table);
        if let Some(expected) =
            LengthTable::find(outgoing, cmd).filter(|&len| len != payload.len())
        {
            return Err(SessionError::FrameLengthMismatch {
                declared: expected,
                actual: payload.len(),
            });
        }

        let mut data = Vec::with_capacity(TABLED_HEADER_LEN + payload.len() + 6);
        data.push(COMPACT_PREAMBLE);
        data.push(cmd);
        data.extend_from_slice(&payload);

        let tag = self.integrity_tag(&data[1..])?;
        data.extend_from_slice(&tag);
        data.push(COMPACT_POSTAMBLE);
        Ok(data)
    }

    fn unpack_tabled(&self, data: &[u8], table: LengthTable) -> Result<Frame> {
        let ilen = self.config.integrity.len();
        if data.len() < TABLED_HEADER_LEN + ilen + 1 || data[0] != COMPACT_PREAMBLE {
            return Err(SessionError::InvalidHeader);
        }
        if data[data.len() - 1] != COMPACT_POSTAMBLE {
            return Err(SessionError::InvalidHeader);
        }
        let cmd = data[1];
        let body_end = data.len() - 1 - ilen;
        let (_, incoming) = self.lengths(table);
        if let Some(expected) = LengthTable::find(incoming, cmd) {
            check_length(TABLED_HEADER_LEN + expected + ilen + 1, data.len())?;
        }
        self.verify_integrity(&data[1..body_end], &data[body_end..data.len() - 1])?;

        Ok(Frame {
            seqno: 0,
            cmd: cmd as u32,
            retcode: None,
            payload: self.decrypt_payload(&data[TABLED_HEADER_LEN..body_end])?,
        })
    }

    /// End of a variable-length tabled frame: the first postamble preceded by
    /// a valid integrity tag.
    fn scan_tabled(&self, src: &[u8]) -> Option<usize> {
        let ilen = self.config.integrity.len();
        (TABLED_HEADER_LEN + ilen..src.len().min(MAX_FRAME_LEN))
            .filter(|&end| src[end] == COMPACT_POSTAMBLE)
            .find(|&end| {
                self.verify_integrity(&src[1..end - ilen], &src[end - ilen..end])
                    .is_ok()
            })
            .map(|end| end + 1)
    }

    // -------------------------------------------------------------------------
    // Shared helpers
    // -------------------------------------------------------------------------

    fn cipher(&self) -> Result<SessionCipher> {
        SessionCipher::new(&self.key)
    }

    fn build_body(&self, frame: &Frame) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(RETCODE_LEN + frame.payload.len() + 16);
        if let Some(rc) = frame.retcode {
            self.config.byte_order.write_u32(&mut body, rc)?;
        }
        body.extend_from_slice(&self.encrypt_payload(&frame.payload)?);
        Ok(body)
    }

    fn parse_body(&self, seqno: u32, cmd: u32, body: &[u8]) -> Result<Frame> {
        let mut start = 0;
        let mut retcode = None;
        if self.has_retcode(body) {
            retcode = Some(self.config.byte_order.read_u32(&body[..RETCODE_LEN]));
            start = RETCODE_LEN;
        }
        Ok(Frame {
            seqno,
            cmd,
            retcode,
            payload: self.decrypt_payload(&body[start..])?,
        })
    }

    /// Whether an inbound body opens with a return code.
    ///
    /// Replies carry one, pushed reports often do not. An ECB body is block
    /// aligned, so only one split can be valid. Otherwise a body starting with
    /// JSON or a version header has no return code.
    fn has_retcode(&self, body: &[u8]) -> bool {
        if self.role != Role::Controller || body.len() < RETCODE_LEN {
            return false;
        }
        if self.config.encryption == Encryption::AesEcb {
            return (body.len() - RETCODE_LEN).is_multiple_of(16);
        }
        body[0] != b'{' && (body[0] == 0 || (body.len() > RETCODE_LEN && body[0] != b'3'))
    }

    fn encrypt_payload(&self, payload: &[u8]) -> Result<Vec<u8>> {
        match self.config.encryption {
            Encryption::AesEcb if !payload.is_empty() => self.cipher()?.encrypt_ecb(payload, true),
            _ => Ok(payload.to_vec()),
        }
    }

    fn decrypt_payload(&self, payload: &[u8]) -> Result<Vec<u8>> {
        match self.config.encryption {
            Encryption::AesEcb if !payload.is_empty() => self.cipher()?.decrypt_ecb(payload),
            _ => Ok(payload.to_vec()),
        }
    }

    fn integrity_tag(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut tag = Vec::with_capacity(self.config.integrity.len());
        match self.config.integrity {
            Integrity::Crc32 => self.config.byte_order.write_u32(&mut tag, CRC32.checksum(data))?,
            Integrity::HmacSha256 => tag.extend_from_slice(&crypto::hmac_sha256(&self.key, data)?),
            Integrity::Additive => tag.push(additive_checksum(data)),
        }
        Ok(tag)
    }

    fn verify_integrity(&self, data: &[u8], tag: &[u8]) -> Result<()> {
        let valid = match self.config.integrity {
            Integrity::Crc32 => self.config.byte_order.read_u32(tag) == CRC32.checksum(data),
            Integrity::HmacSha256 => crypto::verify_hmac_sha256(&self.key, data, tag),
            Integrity::Additive => tag.first() == Some(&additive_checksum(data)),
        };
        if valid {
            Ok(())
        } else {
            Err(SessionError::ChecksumInvalid)
        }
    }

    // -------------------------------------------------------------------------
    // Stream framing
    // -------------------------------------------------------------------------

    fn prefix(&self) -> Vec<u8> {
        let order = self.config.byte_order;
        match self.config.framing {
            Framing::Classic => order.marker(PREFIX_55AA).to_vec(),
            Framing::Sealed => order.marker(PREFIX_6699).to_vec(),
            Framing::Compact | Framing::Tabled(_) => vec![COMPACT_PREAMBLE],
        }
    }

    fn header_len(&self) -> usize {
        match self.config.framing {
            Framing::Classic => CLASSIC_HEADER_LEN,
            Framing::Sealed => SEALED_HEADER_LEN,
            Framing::Compact => COMPACT_HEADER_LEN,
            Framing::Tabled(_) => TABLED_HEADER_LEN,
        }
    }

    /// Total length of the frame at the start of `src`, which holds at least a
    /// header. `None` until a variable-length tabled frame is complete.
    fn total_len(&self, src: &[u8]) -> Option<usize> {
        let order = self.config.byte_order;
        let ilen = self.config.integrity.len();
        match self.config.framing {
            Framing::Classic => Some(CLASSIC_HEADER_LEN + order.read_u32(&src[12..16]) as usize),
            Framing::Sealed => {
                Some(SEALED_HEADER_LEN + order.read_u32(&src[14..18]) as usize + MARKER_LEN)
            }
            Framing::Compact => {
                Some(COMPACT_HEADER_LEN + order.read_u16(&src[2..4]) as usize + ilen + 1)
            }
            Framing::Tabled(table) => match LengthTable::find(self.lengths(table).1, src[1]) {
                Some(len) => Some(TABLED_HEADER_LEN + len + ilen + 1),
                None => self.scan_tabled(src),
            },
        }
    }

    fn has_suffix(&self, frame: &[u8]) -> bool {
        let order = self.config.byte_order;
        let tail = |n: usize| &frame[frame.len() - n..];
        match self.config.framing {
            Framing::Classic => tail(MARKER_LEN) == order.marker(SUFFIX_55AA),
            Framing::Sealed => tail(MARKER_LEN) == order.marker(SUFFIX_6699),
            Framing::Compact | Framing::Tabled(_) => tail(1) == [COMPACT_POSTAMBLE],
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Result<Frame>;
    type Error = SessionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let prefix = self.prefix();

        // Skip anything in front of the next prefix, keeping a partial prefix at the tail.
        match src.windows(prefix.len()).position(|w| w == prefix.as_slice()) {
            Some(0) => {}
            Some(pos) => {
                debug!("Skipping {} bytes of noise before frame prefix", pos);
                src.advance(pos);
            }
            None => {
                let keep = prefix.len().saturating_sub(1).min(src.len());
                src.advance(src.len() - keep);
                return Ok(None);
            }
        }

        let header_len = self.header_len();
        if src.len() < header_len {
            return Ok(None);
        }

        let Some(total) = self.total_len(src) else {
            if src.len() < MAX_FRAME_LEN {
                return Ok(None);
            }
            src.advance(1);
            return Ok(Some(Err(SessionError::FrameLengthMismatch {
                declared: MAX_FRAME_LEN + 1,
                actual: MAX_FRAME_LEN,
            })));
        };
        if total > MAX_FRAME_LEN {
            src.advance(1);
            return Ok(Some(Err(SessionError::FrameLengthMismatch {
                declared: total,
                actual: MAX_FRAME_LEN,
            })));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        if total <= header_len || !self.has_suffix(&src[..total]) {
            // The declared length does not land on a frame boundary.
            let actual = src.len();
            src.advance(1);
            return Ok(Some(Err(SessionError::FrameLengthMismatch {
                declared: total,
                actual,
            })));
        }

        let packet = src.split_to(total);
        debug!("Received frame (hex): {}", hex::encode(&packet));
        Ok(Some(self.unpack(&packet)))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(buf)? {
            Some(item) => Ok(Some(item)),
            None => {
                if !buf.is_empty() {
                    debug!("Discarding {} trailing bytes at end of stream", buf.len());
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = SessionError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        let packed = self.pack(&item)?;
        debug!("Sending frame (hex): {}", hex::encode(&packed));
        dst.extend_from_slice(&packed);
        Ok(())
    }
}

/// Additive checksum used by compact frames.
pub fn additive_checksum(data: &[u8]) -> u8 {
    let sum: u32 = data.iter().map(|&b| b as u32).sum();
    let rem = (sum % 0xFF) as u8;
    if rem == 0 { 0 } else { 0xFF - rem }
}

fn check_length(declared: usize, actual: usize) -> Result<()> {
    if declared != actual {
        return Err(SessionError::FrameLengthMismatch { declared, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"0123456789abcdef";

    fn config(framing: Framing, integrity: Integrity, encryption: Encryption) -> CodecConfig {
        CodecConfig {
            framing,
            byte_order: Endian::Big,
            integrity,
            encryption,
        }
    }

    fn pair(cfg: CodecConfig) -> (FrameCodec, FrameCodec) {
        (
            FrameCodec::new(cfg, Role::Controller, KEY),
            FrameCodec::new(cfg, Role::Device, KEY),
        )
    }

    #[test]
    fn classic_crc_layout() {
        let (controller, _) = pair(config(Framing::Classic, Integrity::Crc32, Encryption::None));
        let packed = controller
            .pack(&Frame::new(0x09, b"{}".to_vec()).with_seqno(7))
            .unwrap();
        assert_eq!(&packed[..4], &[0x00, 0x00, 0x55, 0xAA]);
        assert_eq!(BigEndian::read_u32(&packed[4..8]), 7);
        assert_eq!(BigEndian::read_u32(&packed[8..12]), 0x09);
        // payload + crc + suffix
        assert_eq!(BigEndian::read_u32(&packed[12..16]), 2 + 4 + 4);
        assert_eq!(&packed[packed.len() - 4..], &[0x00, 0x00, 0xAA, 0x55]);
    }

    #[test]
    fn classic_hmac_ecb_roundtrip_with_retcode() {
        let (controller, device) =
            pair(config(Framing::Classic, Integrity::HmacSha256, Encryption::AesEcb));
        let reply = Frame::new(0x10, br#"{"dps":{"1":true}}"#.to_vec())
            .with_seqno(3)
            .with_retcode(0);
        let decoded = controller.unpack(&device.pack(&reply).unwrap()).unwrap();
        assert_eq!(decoded, reply);

        let request = Frame::new(0x0d, b"hello".to_vec()).with_seqno(4);
        let decoded = device.unpack(&controller.pack(&request).unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn sealed_roundtrip_and_tamper() {
        let (controller, device) =
            pair(config(Framing::Sealed, Integrity::HmacSha256, Encryption::None));
        let frame = Frame::new(0x08, b"state".to_vec()).with_seqno(11).with_retcode(0);
        let mut packed = device.pack(&frame).unwrap();
        assert_eq!(controller.unpack(&packed).unwrap(), frame);

        let idx = packed.len() - 6;
        packed[idx] ^= 0x01;
        assert_eq!(controller.unpack(&packed), Err(SessionError::ChecksumInvalid));
    }

    #[test]
    fn compact_layout_and_checksum() {
        let (controller, device) =
            pair(config(Framing::Compact, Integrity::Additive, Encryption::None));
        let frame = Frame::new(0xA2, vec![0x00; 11]);
        let packed = controller.pack(&frame).unwrap();
        assert_eq!(packed[0], COMPACT_PREAMBLE);
        assert_eq!(packed[1], 0xA2);
        assert_eq!(BigEndian::read_u16(&packed[2..4]), 11);
        assert_eq!(*packed.last().unwrap(), COMPACT_POSTAMBLE);
        assert_eq!(device.unpack(&packed).unwrap(), frame);
    }

    #[test]
    fn compact_rejects_wide_command() {
        let (controller, _) = pair(config(Framing::Compact, Integrity::Additive, Encryption::None));
        assert_eq!(
            controller.pack(&Frame::new(0x1FF, vec![])),
            Err(SessionError::UnknownCommandType(0x1FF))
        );
    }

    #[test]
    fn little_endian_fields() {
        let cfg = CodecConfig {
            byte_order: Endian::Little,
            ..config(Framing::Compact, Integrity::Crc32, Encryption::None)
        };
        let (controller, device) = pair(cfg);
        let frame = Frame::new(0x33, vec![1, 2, 3]);
        let packed = controller.pack(&frame).unwrap();
        assert_eq!(&packed[2..4], &[3, 0]);
        assert_eq!(device.unpack(&packed).unwrap(), frame);
    }

    #[test]
    fn length_mismatch_is_reported() {
        let (controller, device) = pair(config(Framing::Classic, Integrity::Crc32, Encryption::None));
        let mut packed = controller.pack(&Frame::new(0x07, b"abc".to_vec())).unwrap();
        packed[15] += 5;
        assert!(matches!(
            device.unpack(&packed),
            Err(SessionError::FrameLengthMismatch { .. })
        ));

        let packed = controller.pack(&Frame::new(0x07, b"abc".to_vec())).unwrap();
        assert!(matches!(
            device.unpack(&packed[..packed.len() - 2]),
            Err(SessionError::FrameLengthMismatch { .. })
        ));
    }

    #[test]
    fn tampered_checksum_is_rejected() {
        for (framing, integrity) in [
            (Framing::Classic, Integrity::Crc32),
            (Framing::Classic, Integrity::HmacSha256),
            (Framing::Compact, Integrity::Additive),
        ] {
            let (controller, device) = pair(config(framing, integrity, Encryption::None));
            let mut packed = controller.pack(&Frame::new(0x0A, b"xyz".to_vec())).unwrap();
            let idx = packed.len() - 5;
            packed[idx] ^= 0xFF;
            assert_eq!(device.unpack(&packed), Err(SessionError::ChecksumInvalid));
        }
    }

    #[test]
    fn additive_checksum_matches_panel_rule() {
        assert_eq!(additive_checksum(&[]), 0);
        assert_eq!(additive_checksum(&[0x01]), 0xFE);
        assert_eq!(additive_checksum(&[0xFF]), 0);
    }

    #[test]
    fn stream_decoder_resyncs_after_noise_and_split_delivery() {
        let (controller, mut device) =
            pair(config(Framing::Classic, Integrity::Crc32, Encryption::None));
        let first = controller.pack(&Frame::new(0x07, b"one".to_vec())).unwrap();
        let second = controller.pack(&Frame::new(0x08, b"two".to_vec())).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xDE, 0xAD, 0x00]);
        buf.extend_from_slice(&first[..10]);
        assert!(device.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&first[10..]);
        buf.extend_from_slice(&second);
        let one = device.decode(&mut buf).unwrap().unwrap().unwrap();
        let two = device.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(one.payload, b"one");
        assert_eq!(two.cmd, 0x08);
        assert!(buf.is_empty());
    }

    #[test]
    fn stream_decoder_reports_bad_frames_and_continues() {
        let (controller, mut device) =
            pair(config(Framing::Compact, Integrity::Additive, Encryption::None));
        let mut corrupt = controller.pack(&Frame::new(0xA5, vec![1, 2, 3])).unwrap();
        let idx = corrupt.len() - 2;
        corrupt[idx] ^= 0x0F;
        let good = controller.pack(&Frame::new(0x02, vec![])).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&corrupt);
        buf.extend_from_slice(&good);

        assert_eq!(
            device.decode(&mut buf).unwrap(),
            Some(Err(SessionError::ChecksumInvalid))
        );
        assert_eq!(
            device.decode(&mut buf).unwrap(),
            Some(Ok(Frame::new(0x02, vec![])))
        );
    }

    #[test]
    fn controller_reads_retcode_only_when_present() {
        let status = br#"{"dps":{"1":true}}"#.to_vec();
        let mut versioned = b"3.5".to_vec();
        versioned.extend_from_slice(&[0; 12]);
        versioned.extend_from_slice(&status);

        for cfg in [
            config(Framing::Classic, Integrity::Crc32, Encryption::None),
            config(Framing::Classic, Integrity::HmacSha256, Encryption::AesEcb),
            config(Framing::Sealed, Integrity::HmacSha256, Encryption::None),
        ] {
            let (controller, device) = pair(cfg);
            for payload in [status.clone(), versioned.clone()] {
                let push = Frame::new(0x08, payload).with_seqno(1);
                let decoded = controller.unpack(&device.pack(&push).unwrap()).unwrap();
                assert_eq!(decoded, push, "{:?}", cfg);

                let reply = push.with_retcode(0);
                let decoded = controller.unpack(&device.pack(&reply).unwrap()).unwrap();
                assert_eq!(decoded, reply, "{:?}", cfg);
            }
            // A bare return code.
            let ack = Frame::new(0x07, Vec::new()).with_retcode(1);
            assert_eq!(controller.unpack(&device.pack(&ack).unwrap()).unwrap(), ack);
        }
    }

    const PANEL_LENGTHS: LengthTable = LengthTable {
        inbound: &[(0x02, 0), (0xA5, 11)],
        outbound: &[(0x02, 0), (0xA2, 11)],
    };

    #[test]
    fn tabled_frames_carry_no_length_field() {
        let (controller, mut device) = pair(config(
            Framing::Tabled(PANEL_LENGTHS),
            Integrity::Additive,
            Encryption::None,
        ));
        let request = Frame::new(0xA2, vec![0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x43]);
        let packed = controller.pack(&request).unwrap();
        assert_eq!(packed.len(), 2 + 11 + 1 + 1);
        assert_eq!(&packed[..2], &[COMPACT_PREAMBLE, 0xA2]);
        assert_eq!(packed[13], additive_checksum(&packed[1..13]));

        let ack = controller.pack(&Frame::new(0x02, Vec::new())).unwrap();
        assert_eq!(ack, vec![0x0D, 0x02, 0xFD, 0x0A]);

        let mut buf = BytesMut::from(&packed[..7]);
        assert!(device.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&packed[7..]);
        buf.extend_from_slice(&ack);
        assert_eq!(device.decode(&mut buf).unwrap(), Some(Ok(request)));
        assert_eq!(
            device.decode(&mut buf).unwrap(),
            Some(Ok(Frame::new(0x02, Vec::new())))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn tabled_variable_type_ends_at_valid_postamble() {
        let (mut controller, device) = pair(config(
            Framing::Tabled(PANEL_LENGTHS),
            Integrity::Additive,
            Encryption::None,
        ));
        // The payload holds a postamble byte that is not the end of the frame.
        let item = Frame::new(0x3F, vec![0x01, COMPACT_POSTAMBLE, 0x05]);
        let packed = device.pack(&item).unwrap();
        assert_eq!(packed, vec![0x0D, 0x3F, 0x01, 0x0A, 0x05, 0xB0, 0x0A]);

        let mut buf = BytesMut::from(&packed[..4]);
        assert!(controller.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&packed[4..]);
        assert_eq!(controller.decode(&mut buf).unwrap(), Some(Ok(item)));
        assert!(buf.is_empty());
    }

    #[test]
    fn tabled_length_must_match_table() {
        let (controller, device) = pair(config(
            Framing::Tabled(PANEL_LENGTHS),
            Integrity::Additive,
            Encryption::None,
        ));
        assert_eq!(
            controller.pack(&Frame::new(0xA2, vec![1, 2, 3])),
            Err(SessionError::FrameLengthMismatch { declared: 11, actual: 3 })
        );
        // A short status frame from the panel is framed with the wrong length.
        let mut short = vec![COMPACT_PREAMBLE, 0xA5, 1, 2];
        short.push(additive_checksum(&short[1..]));
        short.push(COMPACT_POSTAMBLE);
        assert!(matches!(
            controller.unpack(&short),
            Err(SessionError::FrameLengthMismatch { .. })
        ));
        assert!(device.unpack(&short).is_ok());
    }

    #[test]
    fn pack_refuses_frames_the_decoder_would_drop() {
        let (controller, mut device) =
            pair(config(Framing::Compact, Integrity::Additive, Encryption::None));
        let largest = MAX_FRAME_LEN - COMPACT_HEADER_LEN - 2;
        let frame = Frame::new(0x33, vec![0x11; largest]);
        let packed = controller.pack(&frame).unwrap();
        assert_eq!(packed.len(), MAX_FRAME_LEN);
        let mut buf = BytesMut::from(&packed[..]);
        assert_eq!(device.decode(&mut buf).unwrap(), Some(Ok(frame)));

        assert!(matches!(
            controller.pack(&Frame::new(0x33, vec![0x11; largest + 1])),
            Err(SessionError::FrameLengthMismatch { .. })
        ));

        let (controller, _) = pair(config(Framing::Classic, Integrity::Crc32, Encryption::None));
        let largest = MAX_FRAME_LEN - CLASSIC_HEADER_LEN - 4 - MARKER_LEN;
        assert!(controller.pack(&Frame::new(0x07, vec![0; largest])).is_ok());
        assert!(matches!(
            controller.pack(&Frame::new(0x07, vec![0; largest + 1])),
            Err(SessionError::FrameLengthMismatch { .. })
        ));
    }

    #[test]
    fn stream_decoder_flags_missing_suffix() {
        let (controller, mut device) =
            pair(config(Framing::Classic, Integrity::Crc32, Encryption::None));
        let mut packed = controller.pack(&Frame::new(0x07, b"abcdef".to_vec())).unwrap();
        // Declare two bytes fewer than were sent.
        packed[15] -= 2;
        let mut buf = BytesMut::from(&packed[..]);
        assert!(matches!(
            device.decode(&mut buf).unwrap(),
            Some(Err(SessionError::FrameLengthMismatch { .. }))
        ));
    }
}
