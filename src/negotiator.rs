//! Session key negotiation.
//!
//! A sans-IO state machine: it consumes handshake frames and produces the
//! frames to send back, leaving transport and timing to the caller.
//!
//! ```text
//! controller                          device
//!   start ── nonce_c ───────────────▶
//!         ◀── nonce_d ‖ HMAC(psk, nonce_c)
//!   ── HMAC(psk, nonce_d) ──────────▶
//!   key = AES(psk, nonce_c ⊕ nonce_d) on both sides
//! ```

use crate::codec::{Frame, Role};
use crate::crypto::{self, HMAC_LEN, SessionCipher};
use crate::error::{Result, SessionError};
use crate::session::Session;
use log::{debug, warn};

pub const NONCE_LEN: usize = 16;

/// How the derived secret is wrapped with the pre-shared key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyWrap {
    /// AES-ECB over the XOR of both nonces.
    Ecb,
    /// AES-GCM with the first 12 bytes of the controller nonce as IV; the
    /// key is the first 16 ciphertext bytes.
    Gcm,
}

/// Command codes and key wrapping of a nonce exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationScheme {
    pub start: u32,
    pub response: u32,
    pub finish: u32,
    pub key_wrap: KeyWrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    HandshakeSent,
    KeyDerived,
    Ready,
    Failed,
}

pub struct Negotiator {
    scheme: Option<NegotiationScheme>,
    role: Role,
    psk: Vec<u8>,
    state: NegotiationState,
    own_nonce: [u8; NONCE_LEN],
    controller_nonce: Option<[u8; NONCE_LEN]>,
    device_nonce: Option<[u8; NONCE_LEN]>,
    derived: Option<Vec<u8>>,
}

impl Negotiator {
    pub fn new<K: Into<Vec<u8>>>(scheme: Option<NegotiationScheme>, role: Role, psk: K) -> Self {
        Self {
            scheme,
            role,
            psk: psk.into(),
            state: NegotiationState::Idle,
            own_nonce: crypto::random_bytes::<NONCE_LEN>(),
            controller_nonce: None,
            device_nonce: None,
            derived: None,
        }
    }

    /// Replaces the random nonce, for reproducible exchanges.
    pub fn with_nonce(mut self, nonce: [u8; NONCE_LEN]) -> Self {
        self.own_nonce = nonce;
        self
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, NegotiationState::KeyDerived | NegotiationState::Ready)
    }

    /// The derived session key, once both nonces are known.
    pub fn session_key(&self) -> Option<&[u8]> {
        self.derived.as_deref()
    }

    /// Begins the exchange.
    ///
    /// A controller returns its opening frame. Without a scheme the
    /// negotiator is immediately `Ready` and nothing is sent. A device just
    /// waits for the controller.
    pub fn start(&mut self) -> Result<Option<Frame>> {
        if self.state != NegotiationState::Idle {
            return Err(self.fail("negotiation already started"));
        }
        let Some(scheme) = self.scheme else {
            self.state = NegotiationState::Ready;
            return Ok(None);
        };
        match self.role {
            Role::Controller => {
                self.controller_nonce = Some(self.own_nonce);
                self.state = NegotiationState::HandshakeSent;
                debug!("Sending negotiation nonce");
                Ok(Some(Frame::new(scheme.start, self.own_nonce.to_vec())))
            }
            Role::Device => Ok(None),
        }
    }

    /// Feeds one handshake frame and returns the frame to answer with, if any.
    pub fn on_frame(&mut self, frame: &Frame) -> Result<Option<Frame>> {
        let Some(scheme) = self.scheme else {
            return Err(self.fail("no negotiation in progress"));
        };
        match (self.role, self.state) {
            (Role::Controller, NegotiationState::HandshakeSent) if frame.cmd == scheme.response => {
                self.on_response(scheme, frame).map(Some)
            }
            (Role::Device, NegotiationState::Idle) if frame.cmd == scheme.start => {
                self.on_start(scheme, frame).map(Some)
            }
            (Role::Device, NegotiationState::HandshakeSent) if frame.cmd == scheme.finish => {
                self.on_finish(scheme, frame).map(|_| None)
            }
            (_, state) => Err(self.fail(&format!(
                "unexpected frame 0x{:02X} in state {:?}",
                frame.cmd, state
            ))),
        }
    }

    /// Installs the derived key into the session.
    pub fn complete(&mut self, session: &mut Session) -> Result<()> {
        match self.state {
            NegotiationState::Ready => Ok(()),
            NegotiationState::KeyDerived => {
                let key = self
                    .derived
                    .clone()
                    .ok_or_else(|| self.fail("key missing"))?;
                session.install_key(key, self.own_nonce.to_vec());
                self.state = NegotiationState::Ready;
                debug!("Session key installed for {}", session.device_id());
                Ok(())
            }
            state => Err(self.fail(&format!("cannot complete in state {:?}", state))),
        }
    }

    /// Marks the exchange as failed; it is never resumed.
    pub fn fail(&mut self, reason: &str) -> SessionError {
        warn!("Negotiation failed: {}", reason);
        self.state = NegotiationState::Failed;
        self.derived = None;
        SessionError::NegotiationFailed(reason.to_string())
    }

    fn on_response(&mut self, scheme: NegotiationScheme, frame: &Frame) -> Result<Frame> {
        if frame.payload.len() < NONCE_LEN + HMAC_LEN {
            return Err(self.fail("short negotiation response"));
        }
        let device_nonce: [u8; NONCE_LEN] = frame.payload[..NONCE_LEN]
            .try_into()
            .map_err(|_| SessionError::InvalidPayload)?;
        let proof = &frame.payload[NONCE_LEN..NONCE_LEN + HMAC_LEN];
        if !crypto::verify_hmac_sha256(&self.psk, &self.own_nonce, proof) {
            return Err(self.fail("device proof mismatch (check key)"));
        }
        let answer = crypto::hmac_sha256(&self.psk, &device_nonce)?;
        self.device_nonce = Some(device_nonce);
        self.derive(scheme)?;
        Ok(Frame::new(scheme.finish, answer.to_vec()))
    }

    fn on_start(&mut self, scheme: NegotiationScheme, frame: &Frame) -> Result<Frame> {
        let controller_nonce: [u8; NONCE_LEN] = frame
            .payload
            .get(..NONCE_LEN)
            .and_then(|n| n.try_into().ok())
            .ok_or_else(|| self.fail("short negotiation nonce"))?;
        let proof = crypto::hmac_sha256(&self.psk, &controller_nonce)?;
        self.controller_nonce = Some(controller_nonce);
        self.device_nonce = Some(self.own_nonce);
        self.state = NegotiationState::HandshakeSent;

        let mut payload = self.own_nonce.to_vec();
        payload.extend_from_slice(&proof);
        Ok(Frame::new(scheme.response, payload).with_retcode(0))
    }

    fn on_finish(&mut self, scheme: NegotiationScheme, frame: &Frame) -> Result<()> {
        let proof = frame.payload.get(..HMAC_LEN).unwrap_or(&frame.payload);
        if !crypto::verify_hmac_sha256(&self.psk, &self.own_nonce, proof) {
            return Err(self.fail("controller proof mismatch"));
        }
        self.derive(scheme)
    }

    fn derive(&mut self, scheme: NegotiationScheme) -> Result<()> {
        let (Some(controller), Some(device)) = (self.controller_nonce, self.device_nonce) else {
            return Err(self.fail("nonces missing"));
        };
        let mixed: Vec<u8> = controller.iter().zip(device.iter()).map(|(a, b)| a ^ b).collect();
        let cipher = SessionCipher::new(&self.psk)?;
        let key = match scheme.key_wrap {
            KeyWrap::Ecb => cipher.encrypt_ecb(&mixed, false)?,
            KeyWrap::Gcm => {
                let sealed = cipher.encrypt_gcm(&mixed, &controller[..12], &[])?;
                sealed[12..28].to_vec()
            }
        };
        self.derived = Some(key);
        self.state = NegotiationState::KeyDerived;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PSK: &[u8] = b"0123456789abcdef";

    fn scheme(key_wrap: KeyWrap) -> Option<NegotiationScheme> {
        Some(NegotiationScheme {
            start: 0x03,
            response: 0x04,
            finish: 0x05,
            key_wrap,
        })
    }

    fn exchange(key_wrap: KeyWrap) -> (Negotiator, Negotiator) {
        let mut controller = Negotiator::new(scheme(key_wrap), Role::Controller, PSK);
        let mut device = Negotiator::new(scheme(key_wrap), Role::Device, PSK);

        assert_eq!(device.start().unwrap(), None);
        let hello = controller.start().unwrap().unwrap();
        assert_eq!(controller.state(), NegotiationState::HandshakeSent);

        let response = device.on_frame(&hello).unwrap().unwrap();
        assert_eq!(response.retcode, Some(0));
        let finish = controller.on_frame(&response).unwrap().unwrap();
        assert_eq!(controller.state(), NegotiationState::KeyDerived);

        assert_eq!(device.on_frame(&finish).unwrap(), None);
        assert_eq!(device.state(), NegotiationState::KeyDerived);
        (controller, device)
    }

    #[test]
    fn both_sides_derive_the_same_key() {
        for wrap in [KeyWrap::Ecb, KeyWrap::Gcm] {
            let (controller, device) = exchange(wrap);
            let key = controller.session_key().unwrap();
            assert_eq!(key.len(), 16);
            assert_eq!(Some(key), device.session_key());
            assert_ne!(key, PSK);
        }
    }

    #[test]
    fn complete_installs_key() {
        let (mut controller, _) = exchange(KeyWrap::Ecb);
        let mut session = Session::new("dev", "3.4", PSK.to_vec());
        controller.complete(&mut session).unwrap();
        assert_eq!(controller.state(), NegotiationState::Ready);
        assert_eq!(Some(session.session_key()), controller.session_key());
        assert!(session.is_negotiated());
    }

    #[test]
    fn ecb_key_matches_known_derivation() {
        let mut controller = Negotiator::new(scheme(KeyWrap::Ecb), Role::Controller, PSK)
            .with_nonce([0x11; 16]);
        let mut device =
            Negotiator::new(scheme(KeyWrap::Ecb), Role::Device, PSK).with_nonce([0x22; 16]);
        let hello = controller.start().unwrap().unwrap();
        let response = device.on_frame(&hello).unwrap().unwrap();
        controller.on_frame(&response).unwrap();

        let expected = SessionCipher::new(PSK)
            .unwrap()
            .encrypt_ecb(&[0x33; 16], false)
            .unwrap();
        assert_eq!(controller.session_key(), Some(expected.as_slice()));
    }

    #[test]
    fn wrong_key_fails() {
        let mut controller = Negotiator::new(scheme(KeyWrap::Ecb), Role::Controller, PSK);
        let mut device = Negotiator::new(scheme(KeyWrap::Ecb), Role::Device, b"fedcba9876543210");
        let hello = controller.start().unwrap().unwrap();
        let response = device.on_frame(&hello).unwrap().unwrap();
        assert!(matches!(
            controller.on_frame(&response),
            Err(SessionError::NegotiationFailed(_))
        ));
        assert_eq!(controller.state(), NegotiationState::Failed);
        assert!(controller.session_key().is_none());
    }

    #[test]
    fn unexpected_frame_fails() {
        let mut controller = Negotiator::new(scheme(KeyWrap::Gcm), Role::Controller, PSK);
        controller.start().unwrap();
        assert!(controller.on_frame(&Frame::new(0x08, Vec::new())).is_err());
        assert_eq!(controller.state(), NegotiationState::Failed);
    }

    #[test]
    fn without_scheme_ready_immediately() {
        let mut negotiator = Negotiator::new(None, Role::Controller, PSK);
        assert_eq!(negotiator.start().unwrap(), None);
        assert_eq!(negotiator.state(), NegotiationState::Ready);
        let mut session = Session::new("dev", "3.3", PSK.to_vec());
        negotiator.complete(&mut session).unwrap();
        assert_eq!(session.session_key(), PSK);
        assert!(!session.is_negotiated());
    }
}
