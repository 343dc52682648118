//! Per-device session state: identity, negotiated key material and link state.

use std::fmt;

/// Connection lifecycle of a single session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Negotiating,
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Ties a logical device identity to the key material of its current connection.
///
/// The session key starts out as the pre-shared device key and is replaced
/// at most once per connection by the negotiator. [`Session::reset`] restores
/// the initial state when the transport goes away.
#[derive(Clone)]
pub struct Session {
    device_id: String,
    protocol_version: String,
    pre_shared_key: Vec<u8>,
    session_key: Vec<u8>,
    session_random: Option<Vec<u8>>,
    state: ConnectionState,
}

impl Session {
    pub fn new<I, V, K>(device_id: I, protocol_version: V, pre_shared_key: K) -> Self
    where
        I: Into<String>,
        V: Into<String>,
        K: Into<Vec<u8>>,
    {
        let key = pre_shared_key.into();
        Self {
            device_id: device_id.into(),
            protocol_version: protocol_version.into(),
            session_key: key.clone(),
            pre_shared_key: key,
            session_random: None,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    pub fn pre_shared_key(&self) -> &[u8] {
        &self.pre_shared_key
    }

    pub fn session_key(&self) -> &[u8] {
        &self.session_key
    }

    pub fn session_random(&self) -> Option<&[u8]> {
        self.session_random.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// True once a negotiated key has replaced the pre-shared key.
    pub fn is_negotiated(&self) -> bool {
        self.session_random.is_some()
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub(crate) fn install_key(&mut self, key: Vec<u8>, random: Vec<u8>) {
        self.session_key = key;
        self.session_random = Some(random);
    }

    /// Drops negotiated material and returns to `Disconnected`.
    pub(crate) fn reset(&mut self) {
        self.session_key = self.pre_shared_key.clone();
        self.session_random = None;
        self.state = ConnectionState::Disconnected;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("device_id", &self.device_id)
            .field("protocol_version", &self.protocol_version)
            .field("negotiated", &self.is_negotiated())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_restores_pre_shared_key() {
        let mut session = Session::new("dev", "3.4", b"0123456789abcdef".to_vec());
        assert_eq!(session.session_key(), b"0123456789abcdef");
        session.install_key(vec![1; 16], vec![2; 16]);
        session.set_state(ConnectionState::Ready);
        assert!(session.is_negotiated());
        assert_eq!(session.session_key(), &[1; 16]);

        session.reset();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.session_key(), b"0123456789abcdef");
        assert!(session.session_random().is_none());
    }

    #[test]
    fn debug_hides_keys() {
        let session = Session::new("dev", "3.3", b"secretsecret1234".to_vec());
        let rendered = format!("{:?}", session);
        assert!(!rendered.contains("secret"));
    }
}
