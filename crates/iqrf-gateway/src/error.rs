//! Error types for IQRF gateway operations
//!
//! Covers transport initialization, sending, frame decoding, and
//! conversion between DPA packets and outside-world requests.

use thiserror::Error;

/// Main error type for IQRF gateway operations
#[derive(Error, Debug)]
pub enum IqrfError {
    // ===== Initialization Errors =====
    /// Port or device node not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Port or device open failed
    #[error("Failed to open port {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    /// UDP socket bind failed
    #[error("Failed to bind {addr}: {reason}")]
    BindFailed {
        /// Local address
        addr: String,
        /// Failure reason
        reason: String,
    },

    /// Transport compiled without the feature it needs
    #[error("Transport '{transport}' requires the '{feature}' feature")]
    FeatureDisabled {
        /// Transport name
        transport: &'static str,
        /// Cargo feature name
        feature: &'static str,
    },

    // ===== Send Errors =====
    /// Write to the physical medium failed
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Device answered the send with a refusal
    #[error("Device refused data: {0}")]
    DeviceRefused(String),

    /// SPI device never became ready for communication
    #[error("SPI device not ready after {attempts} attempts")]
    SendTimeout {
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Transport used before `start` or after `destroy`
    #[error("Transport '{0}' is not started")]
    NotStarted(&'static str),

    // ===== Frame Decode Errors =====
    /// Frame is not enclosed by the expected delimiters
    #[error("Invalid frame delimiter")]
    InvalidDelimiter,

    /// Escape byte followed by an unexpected value
    #[error("Invalid escape sequence: 0x7D 0x{0:02X}")]
    InvalidEscape(u8),

    /// Frame checksum does not match
    #[error("Checksum mismatch: expected 0x{expected:04X}, got 0x{got:04X}")]
    ChecksumMismatch {
        /// Computed checksum
        expected: u16,
        /// Received checksum
        got: u16,
    },

    /// Frame shorter than its fixed parts
    #[error("Truncated frame: {got} bytes, need at least {need}")]
    Truncated {
        /// Received length
        got: usize,
        /// Minimal length
        need: usize,
    },

    /// Length field disagrees with the frame or exceeds the medium
    #[error("Invalid length: {0}")]
    InvalidLength(String),

    /// Gateway header carries unexpected values
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    // ===== Conversion Errors =====
    /// Request could not be parsed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Numeric field outside of its wire range
    #[error("Value out of range: {field}={value} (max {max})")]
    ValueOutOfRange {
        /// Field name
        field: &'static str,
        /// Supplied value
        value: u64,
        /// Maximal allowed value
        max: u64,
    },

    /// Declared size disagrees with the payload
    #[error("Size mismatch: declared {declared}, actual {actual}")]
    SizeMismatch {
        /// Declared size
        declared: usize,
        /// Actual payload size
        actual: usize,
    },

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// Internal channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IqrfError {
    /// Errors raised while starting a transport
    pub fn is_init_error(&self) -> bool {
        matches!(
            self,
            IqrfError::PortNotFound(_)
                | IqrfError::PortOpenFailed { .. }
                | IqrfError::BindFailed { .. }
                | IqrfError::FeatureDisabled { .. }
        )
    }

    /// Errors raised while sending a packet
    pub fn is_send_error(&self) -> bool {
        matches!(
            self,
            IqrfError::WriteFailed(_)
                | IqrfError::DeviceRefused(_)
                | IqrfError::SendTimeout { .. }
                | IqrfError::NotStarted(_)
        )
    }

    /// Check if this is a frame error (bad data from device)
    pub fn is_frame_error(&self) -> bool {
        matches!(
            self,
            IqrfError::InvalidDelimiter
                | IqrfError::InvalidEscape(_)
                | IqrfError::ChecksumMismatch { .. }
                | IqrfError::Truncated { .. }
                | IqrfError::InvalidLength(_)
                | IqrfError::InvalidHeader(_)
        )
    }

    /// Check if this error is recoverable/retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            IqrfError::WriteFailed(_)
                | IqrfError::DeviceRefused(_)
                | IqrfError::SendTimeout { .. }
                | IqrfError::Io(_)
        )
    }

    /// Get an error code for logging/metrics
    pub fn error_code(&self) -> &'static str {
        match self {
            IqrfError::PortNotFound(_) => "PORT_NOT_FOUND",
            IqrfError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            IqrfError::BindFailed { .. } => "BIND_FAILED",
            IqrfError::FeatureDisabled { .. } => "FEATURE_DISABLED",
            IqrfError::WriteFailed(_) => "WRITE_FAILED",
            IqrfError::DeviceRefused(_) => "DEVICE_REFUSED",
            IqrfError::SendTimeout { .. } => "SEND_TIMEOUT",
            IqrfError::NotStarted(_) => "NOT_STARTED",
            IqrfError::InvalidDelimiter => "INVALID_DELIMITER",
            IqrfError::InvalidEscape(_) => "INVALID_ESCAPE",
            IqrfError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            IqrfError::Truncated { .. } => "TRUNCATED",
            IqrfError::InvalidLength(_) => "INVALID_LENGTH",
            IqrfError::InvalidHeader(_) => "INVALID_HEADER",
            IqrfError::InvalidRequest(_) => "INVALID_REQUEST",
            IqrfError::ValueOutOfRange { .. } => "VALUE_OUT_OF_RANGE",
            IqrfError::SizeMismatch { .. } => "SIZE_MISMATCH",
            IqrfError::InvalidConfig(_) => "INVALID_CONFIG",
            IqrfError::ChannelClosed => "CHANNEL_CLOSED",
            IqrfError::Internal(_) => "INTERNAL_ERROR",
            IqrfError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for IQRF gateway operations
pub type Result<T> = std::result::Result<T, IqrfError>;

impl From<serde_json::Error> for IqrfError {
    fn from(err: serde_json::Error) -> Self {
        IqrfError::InvalidRequest(err.to_string())
    }
}

// Conversion from serialport error (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<serialport::Error> for IqrfError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::NoDevice => IqrfError::PortNotFound(err.description),
            serialport::ErrorKind::Io(kind) => {
                IqrfError::Io(std::io::Error::new(kind, err.description))
            }
            _ => IqrfError::PortOpenFailed {
                port: String::new(),
                reason: err.description,
            },
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for IqrfError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        IqrfError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = IqrfError::PortNotFound("/dev/ttyS0".to_string());
        assert_eq!(err.error_code(), "PORT_NOT_FOUND");
        assert_eq!(
            IqrfError::SendTimeout { attempts: 3 }.error_code(),
            "SEND_TIMEOUT"
        );
    }

    #[test]
    fn test_taxonomy() {
        assert!(IqrfError::BindFailed {
            addr: "0.0.0.0:55000".into(),
            reason: "in use".into()
        }
        .is_init_error());
        assert!(IqrfError::SendTimeout { attempts: 3 }.is_send_error());
        assert!(IqrfError::InvalidEscape(0x11).is_frame_error());
        assert!(!IqrfError::InvalidDelimiter.is_send_error());
    }

    #[test]
    fn test_is_retriable() {
        assert!(IqrfError::WriteFailed("broken pipe".into()).is_retriable());
        assert!(!IqrfError::InvalidDelimiter.is_retriable());
        assert!(!IqrfError::NotStarted("serial").is_retriable());
    }

    #[test]
    fn test_checksum_message() {
        let err = IqrfError::ChecksumMismatch {
            expected: 0x0B,
            got: 0x0C,
        };
        assert!(err.to_string().contains("0x000B"));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: IqrfError = json_err.into();
        assert_eq!(err.error_code(), "INVALID_REQUEST");
    }
}
