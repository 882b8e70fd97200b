//! Error types and result definitions for the pdubridge crate.
//! Covers decode, session, transport and configuration failures with numeric codes.

use thiserror::Error;

/// Represents all possible errors raised while talking to a PDU.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PduError {
    /// Standard IO error (socket, file)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// A frame or response body could not be parsed
    #[error("Decode error: {0}")]
    Decode(String),

    /// The device rejected our credentials or session
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Timeout, refused connection or an unexpected HTTP status
    #[error("Network error: {0}")]
    Network(String),

    /// No live connection or session exists for the device
    #[error("Device '{0}' is unreachable")]
    DeviceUnreachable(String),

    /// Handshake or command response shape entirely unexpected
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Outlet index outside 1..=outlet_count
    #[error("Device '{device_id}' has no outlet {index}")]
    InvalidOutlet { device_id: String, index: usize },

    /// Missing or invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request timed out
    #[error("Timeout waiting for device")]
    Timeout,

    /// Device ID already exists in the registry
    #[error("Device ID '{0}' already exists")]
    DuplicateDevice(String),

    /// Device ID not found in the registry
    #[error("Device ID '{0}' not found")]
    DeviceNotFound(String),
}

/// A specialized Result type for PDU operations.
pub type Result<T> = std::result::Result<T, PduError>;

impl From<std::io::Error> for PduError {
    fn from(err: std::io::Error) -> Self {
        PduError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PduError {
    fn from(err: serde_json::Error) -> Self {
        PduError::Json(err.to_string())
    }
}

impl From<serde_yaml::Error> for PduError {
    fn from(err: serde_yaml::Error) -> Self {
        PduError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for PduError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PduError::Timeout
        } else {
            PduError::Network(err.to_string())
        }
    }
}

impl PduError {
    pub fn code(&self) -> u32 {
        match self {
            PduError::Io(_) => ERR_CONNECT,
            PduError::Json(_) => ERR_PAYLOAD,
            PduError::Decode(_) => ERR_PAYLOAD,
            PduError::AuthFailed(_) => ERR_AUTH,
            PduError::Network(_) => ERR_CONNECT,
            PduError::DeviceUnreachable(_) => ERR_OFFLINE,
            PduError::ProtocolViolation(_) => ERR_PROTOCOL,
            PduError::InvalidOutlet { .. } => ERR_RANGE,
            PduError::Config(_) => ERR_CONFIG,
            PduError::Timeout => ERR_TIMEOUT,
            PduError::DuplicateDevice(_) => ERR_DUPLICATE,
            PduError::DeviceNotFound(_) => ERR_OFFLINE,
        }
    }

    /// Whether the failure is worth retrying on the next scheduled attempt.
    /// Configuration and range errors never heal by themselves.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            PduError::Config(_) | PduError::InvalidOutlet { .. } | PduError::DuplicateDevice(_)
        )
    }

    pub fn message(&self) -> &'static str {
        get_error_message(self.code())
    }
}

define_error_codes! {
    ERR_SUCCESS = 0 => "Connection Successful",
    ERR_CONNECT = 901 => "Network Error: Unable to Connect",
    ERR_TIMEOUT = 902 => "Timeout Waiting for Device",
    ERR_RANGE = 903 => "Specified Value Out of Range",
    ERR_PAYLOAD = 904 => "Unexpected Payload from Device",
    ERR_OFFLINE = 905 => "Network Error: Device Unreachable",
    ERR_AUTH = 906 => "Login Rejected by Device",
    ERR_PROTOCOL = 907 => "Device Violated Protocol",
    ERR_CONFIG = 908 => "Invalid Configuration",
    ERR_DUPLICATE = 915 => "Device ID already exists",
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_messages() {
        assert_eq!(PduError::Timeout.code(), ERR_TIMEOUT);
        assert_eq!(
            PduError::DeviceUnreachable("x".into()).message(),
            "Network Error: Device Unreachable"
        );
        assert_eq!(get_error_message(ERR_SUCCESS), "Connection Successful");
        assert_eq!(get_error_message(12345), "Unknown Error");
    }

    #[test]
    fn transient_classification() {
        assert!(PduError::Network("refused".into()).is_transient());
        assert!(PduError::AuthFailed("401".into()).is_transient());
        assert!(!PduError::Config("bad".into()).is_transient());
        assert!(
            !PduError::InvalidOutlet {
                device_id: "a".into(),
                index: 99
            }
            .is_transient()
        );
    }

    #[test]
    fn io_errors_convert() {
        let err: PduError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(err, PduError::Io("boom".into()));
    }
}
