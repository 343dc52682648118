//! Error types and result definitions for the linkwire crate.
//! Groups failures by how the session reacts to them: transport errors
//! reconnect, malformed frames are dropped, command failures reach the caller.

use thiserror::Error;

/// Represents all possible errors that can occur while running a device session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Standard IO error (network, reset, write timeout, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Invalid or inconsistent session configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport could not be established
    #[error("Socket connection failed")]
    ConnectionFailed,

    /// The frame header or prefix was invalid
    #[error("Invalid header")]
    InvalidHeader,

    /// Declared frame length does not match the bytes received
    #[error("Frame length mismatch (declared {declared}, actual {actual})")]
    FrameLengthMismatch { declared: usize, actual: usize },

    /// CRC, additive checksum, HMAC or GCM tag verification failed
    #[error("Checksum invalid")]
    ChecksumInvalid,

    /// Failed to encrypt a frame payload
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Failed to decrypt a frame payload (wrong key or version)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// The payload was structurally valid but its contents were unexpected
    #[error("Invalid payload")]
    InvalidPayload,

    /// Handshake did not complete within the configured window
    #[error("Negotiation timed out")]
    NegotiationTimeout,

    /// Handshake was rejected or produced inconsistent key material
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// No acknowledgment received after all retries
    #[error("Command 0x{code:02X} timed out after {attempts} attempts")]
    CommandTimeout { code: u32, attempts: u32 },

    /// A non-handshake command was issued before the session was ready
    #[error("Session not ready")]
    NotReady,

    /// The command code is not known to the protocol
    #[error("Unknown command type 0x{0:02X}")]
    UnknownCommandType(u32),

    /// Device is currently unreachable or disconnected
    #[error("Device offline")]
    Offline,

    /// The session was disposed while the command was pending
    #[error("Cancelled")]
    Cancelled,

    /// Device ID already exists in manager
    #[error("Device ID '{0}' already exists")]
    DuplicateDevice(String),

    /// Device ID not found in manager
    #[error("Device ID '{0}' not found")]
    DeviceNotFound(String),
}

/// A specialized Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Json(err.to_string())
    }
}

impl SessionError {
    pub fn code(&self) -> u32 {
        match self {
            SessionError::Io(_) => ERR_CONNECT,
            SessionError::Json(_) => ERR_JSON,
            SessionError::Config(_) => ERR_PARAMS,
            SessionError::ConnectionFailed => ERR_CONNECT,
            SessionError::InvalidHeader => ERR_PAYLOAD,
            SessionError::FrameLengthMismatch { .. } => ERR_PAYLOAD,
            SessionError::ChecksumInvalid => ERR_KEY_OR_VER,
            SessionError::EncryptionFailed => ERR_KEY_OR_VER,
            SessionError::DecryptionFailed => ERR_KEY_OR_VER,
            SessionError::InvalidPayload => ERR_PAYLOAD,
            SessionError::NegotiationTimeout => ERR_TIMEOUT,
            SessionError::NegotiationFailed(_) => ERR_KEY_OR_VER,
            SessionError::CommandTimeout { .. } => ERR_TIMEOUT,
            SessionError::NotReady => ERR_STATE,
            SessionError::UnknownCommandType(_) => ERR_FUNCTION,
            SessionError::Offline => ERR_OFFLINE,
            SessionError::Cancelled => ERR_CANCELLED,
            SessionError::DuplicateDevice(_) => ERR_DUPLICATE,
            SessionError::DeviceNotFound(_) => ERR_NOT_FOUND,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            ERR_JSON => SessionError::Json("Generic JSON error".to_string()),
            ERR_CONNECT => SessionError::ConnectionFailed,
            ERR_TIMEOUT => SessionError::NegotiationTimeout,
            ERR_PAYLOAD => SessionError::InvalidPayload,
            ERR_OFFLINE => SessionError::Offline,
            ERR_STATE => SessionError::NotReady,
            ERR_KEY_OR_VER => SessionError::ChecksumInvalid,
            ERR_DUPLICATE => SessionError::DuplicateDevice("Unknown ID".to_string()),
            ERR_CANCELLED => SessionError::Cancelled,
            _ => SessionError::Io(format!("Unknown error code: {}", code)),
        }
    }

    /// Errors that mean the transport is unusable and must be re-established.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SessionError::Io(_) | SessionError::ConnectionFailed | SessionError::Offline
        )
    }

    /// Errors caused by a single bad frame; the connection survives them.
    pub fn is_malformed_frame(&self) -> bool {
        matches!(
            self,
            SessionError::Json(_)
                | SessionError::FrameLengthMismatch { .. }
                | SessionError::ChecksumInvalid
                | SessionError::InvalidHeader
                | SessionError::DecryptionFailed
                | SessionError::InvalidPayload
        )
    }

    /// Handshake failures force a fresh connection with a fresh nonce.
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            SessionError::NegotiationTimeout | SessionError::NegotiationFailed(_)
        )
    }
}

define_error_codes! {
    ERR_JSON = 900 => "Invalid JSON Payload",
    ERR_CONNECT = 901 => "Network Error: Unable to Connect",
    ERR_TIMEOUT = 902 => "Timeout Waiting for Device",
    ERR_PAYLOAD = 904 => "Unexpected Payload from Device",
    ERR_OFFLINE = 905 => "Network Error: Device Unreachable",
    ERR_STATE = 906 => "Session Not Ready",
    ERR_FUNCTION = 907 => "Function Not Supported by Device",
    ERR_PARAMS = 912 => "Invalid Session Parameters",
    ERR_KEY_OR_VER = 914 => "Check device key or version",
    ERR_DUPLICATE = 915 => "Device ID already exists",
    ERR_NOT_FOUND = 916 => "Device ID not found",
    ERR_CANCELLED = 917 => "Command cancelled",
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_messages() {
        assert_eq!(SessionError::Offline.code(), ERR_OFFLINE);
        assert_eq!(
            get_error_message(ERR_KEY_OR_VER),
            "Check device key or version"
        );
        assert_eq!(get_error_message(12345), "Unknown Error");
        assert_eq!(SessionError::from_code(ERR_CANCELLED), SessionError::Cancelled);
    }

    #[test]
    fn classification() {
        assert!(SessionError::ChecksumInvalid.is_malformed_frame());
        assert!(SessionError::Json("trailing comma".into()).is_malformed_frame());
        assert!(!SessionError::NotReady.is_malformed_frame());
        assert!(!SessionError::ChecksumInvalid.is_transport());
        assert!(SessionError::Io("reset".into()).is_transport());
        assert!(SessionError::NegotiationTimeout.is_negotiation());
        let err = SessionError::CommandTimeout { code: 0xA2, attempts: 4 };
        assert_eq!(err.to_string(), "Command 0xA2 timed out after 4 attempts");
    }
}
