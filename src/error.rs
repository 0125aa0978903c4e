//! Error handling for the Modbus stack.
//!
//! All failure modes of the stack funnel into [`ModbusError`]: transport
//! failures (I/O, connection, lifecycle), framing failures (checksums,
//! malformed frames, the response-wait verdicts), timeouts and protocol
//! exceptions received from or synthesized for the wire.
//!
//! The Display strings of the lifecycle and wait-mode variants carry the
//! protocol wording that client code matches on: `Timeout …`,
//! `Invalid response`, `Insufficient data length`, `Port is destroyed`,
//! `Port is not open`.

use thiserror::Error;

/// Result type alias for Modbus operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Comprehensive Modbus error types
///
/// Covers all error conditions that can occur during Modbus communication,
/// from transport-level issues to protocol violations and data validation
/// failures.
#[derive(Error, Debug, Clone)]
pub enum ModbusError {
    /// I/O related errors (network, serial)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment and maintenance errors
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Operation attempted on a transport that is not open
    #[error("Port is not open")]
    NotOpen,

    /// Operation attempted on a destroyed transport; destruction is permanent
    #[error("Port is destroyed")]
    Destroyed,

    /// Operation exceeded its configured time limit
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// A response frame failed a pre-check and cannot belong to the
    /// pending request
    #[error("Invalid response")]
    InvalidResponse,

    /// A frame is shorter than the pre-checks require. Recoverable while
    /// the RTU framer is accumulating; terminal for the self-delimiting
    /// variants.
    #[error("Insufficient data length")]
    InsufficientData,

    /// RTU checksum validation failure
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// ASCII checksum validation failure
    #[error("LRC validation failed: expected={expected:02X}, actual={actual:02X}")]
    LrcMismatch { expected: u8, actual: u8 },

    /// Message frame format violations
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Modbus exception response received from or destined for the wire
    ///
    /// `function` is the original (unflagged) function code, `code` one of
    /// the nine standard exception codes.
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Unsupported or malformed function code
    #[error("Invalid function code: {code}")]
    InvalidFunction { code: u8 },

    /// Address range validation failure
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Data format and validation errors
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Client or server configuration issues
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Library internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid address error
    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create an LRC mismatch error
    pub fn lrc_mismatch(expected: u8, actual: u8) -> Self {
        Self::LrcMismatch { expected, actual }
    }

    /// Create a Modbus exception error
    ///
    /// Maps the standard exception codes to human-readable messages.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Server Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Server Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception {
            function,
            code,
            message,
        }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::InsufficientData => true,
            Self::Exception { code, .. } => {
                // Acknowledge, Busy
                matches!(code, 0x05 | 0x06)
            }
            _ => false,
        }
    }

    /// Check if the error is a network/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Connection { .. }
                | Self::NotOpen
                | Self::Destroyed
                | Self::Timeout { .. }
        )
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidResponse
                | Self::InsufficientData
                | Self::CrcMismatch { .. }
                | Self::LrcMismatch { .. }
                | Self::Frame { .. }
                | Self::Exception { .. }
                | Self::InvalidFunction { .. }
        )
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}
