//! # Charge Bus Error Handling
//!
//! Every fallible operation in the crate returns [`BusResult`]. The error enum is
//! shared by the serial links (BMU frame protocol and Modbus RTU), the CAN transport
//! and the configuration loader, so poll loops can classify failures without caring
//! which bus produced them.
//!
//! ## Error Categories
//!
//! ### Link Errors
//! - **I/O Errors**: serial port or socket failures
//! - **Connection Errors**: port/interface could not be opened or was lost
//! - **Not Connected**: the link is faulted and still inside its reconnect backoff
//! - **Timeout Errors**: a read or write did not complete in time
//!
//! ### Framing Errors
//! - **Frame Errors**: bad start/end markers, short frames, wrong command byte
//! - **CRC Errors**: Modbus CRC16 trailer mismatch
//! - **Protocol Errors**: echo mismatch (slave, function, byte count, start, quantity)
//! - **Exception Responses**: Modbus exception codes returned by a slave
//!
//! ### Caller Errors
//! - **Configuration Errors**: bad register quantity, unreadable config file
//! - **Invalid Data / Invalid State**: values outside a charger's limits, watchdog misuse
//!
//! Only configuration errors are meant to reach the application as hard failures.
//! Everything else is counted by the poll services and retried on the next cycle.
//!
//! ```rust,ignore
//! use voltage_chargebus::{BusError, ErrorCategory};
//!
//! match poller.client().poll(&request).await {
//!     Ok(Some(reading)) => println!("{:.2} V", reading.voltage_v.unwrap_or_default()),
//!     Ok(None) => println!("no response"),
//!     Err(e) if e.category() == ErrorCategory::FrameMismatch => println!("resync: {}", e),
//!     Err(e) => println!("bus error: {}", e),
//! }
//! ```

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Result type alias for every bus operation
pub type BusResult<T> = Result<T, BusError>;

/// Errors produced by the charge bus links
///
/// Each variant carries enough context to be logged on its own; the poll services
/// only keep the rendered message and the [`ErrorCategory`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    /// Low-level I/O failure on a serial port or CAN socket
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Link could not be opened, or was lost during an operation
    ///
    /// # Examples
    /// - Serial device node missing or busy
    /// - CAN interface does not exist
    /// - Peer closed the stream
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Link is faulted and the reconnect backoff has not elapsed yet
    #[error("Link not connected: {link}")]
    NotConnected { link: String },

    /// A read or write exceeded its configured timeout
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Malformed custom-protocol frame
    ///
    /// # Examples
    /// - Missing `AF FA` header or `AF A0` footer
    /// - Frame shorter than the minimum length
    /// - Unexpected command byte in a BMU response
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Response does not echo the request
    ///
    /// # Examples
    /// - Modbus slave address or function code differs from the request
    /// - Byte count does not match the requested quantity
    /// - Write response echoes a different start address
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Modbus CRC16 trailer mismatch
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Modbus exception response
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Value outside the range a device accepts
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Operation not allowed in the current state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Bad caller input or configuration; never retried
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Library internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Failure buckets kept by the poll services
///
/// The buckets mirror the counters shown to an operator: a lost link, a timeout,
/// a device that stayed silent, a garbled frame, or anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ErrorCategory {
    LostConnection,
    Timeout,
    NoResponse,
    FrameMismatch,
    Other,
}

impl ErrorCategory {
    /// Human-readable label used in logs and statistics
    pub fn label(&self) -> &'static str {
        match self {
            Self::LostConnection => "Lost connection",
            Self::Timeout => "Timeout",
            Self::NoResponse => "No response",
            Self::FrameMismatch => "Frame mismatch",
            Self::Other => "Other error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl BusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    ///
    /// # Arguments
    ///
    /// * `message` - Descriptive error message
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a not-connected error for the named link
    pub fn not_connected<S: Into<String>>(link: S) -> Self {
        Self::NotConnected { link: link.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create a CRC mismatch error
    ///
    /// # Arguments
    ///
    /// * `expected` - CRC computed over the received frame
    /// * `actual` - CRC carried in the frame trailer
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a Modbus exception error with the standard description for `code`
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception { function, code, message }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (the next poll may succeed)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use voltage_chargebus::BusError;
    ///
    /// assert!(BusError::timeout("bmu read", 2000).is_recoverable());
    /// assert!(!BusError::configuration("quantity 0").is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. }
            | Self::Connection { .. }
            | Self::NotConnected { .. }
            | Self::Timeout { .. }
            | Self::Frame { .. }
            | Self::Protocol { .. }
            | Self::CrcMismatch { .. } => true,
            Self::Exception { code, .. } => matches!(code, 0x05 | 0x06),
            _ => false,
        }
    }

    /// Check if the error comes from the physical link rather than the payload
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::NotConnected { .. } | Self::Timeout { .. }
        )
    }

    /// Check if the error is a framing or protocol violation
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Frame { .. } | Self::Protocol { .. } | Self::CrcMismatch { .. } | Self::Exception { .. }
        )
    }

    /// Bucket used by the poll services' error statistics
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } | Self::NotConnected { .. } => ErrorCategory::LostConnection,
            Self::Io { message } if message.contains("closed") => ErrorCategory::LostConnection,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Frame { .. } | Self::Protocol { .. } | Self::CrcMismatch { .. } => {
                ErrorCategory::FrameMismatch
            }
            _ => ErrorCategory::Other,
        }
    }
}

/// Convert from std::io::Error
///
/// Timed-out and would-block reads map to `Timeout`, everything else to `Io`.
impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::timeout(err.to_string(), 0)
            }
            _ => Self::io(err.to_string()),
        }
    }
}

/// Convert from tokio timeout errors
impl From<tokio::time::error::Elapsed> for BusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_data(format!("JSON error: {}", err))
    }
}

impl From<toml::de::Error> for BusError {
    fn from(err: toml::de::Error) -> Self {
        Self::configuration(format!("TOML error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = BusError::timeout("read_registers", 500);
        assert!(err.is_recoverable());
        assert!(err.is_transport_error());

        let err = BusError::exception(0x03, 0x02);
        assert!(!err.is_recoverable());
        assert!(err.is_protocol_error());

        let err = BusError::configuration("register quantity 0");
        assert!(!err.is_recoverable());
        assert!(!err.is_transport_error());
    }

    #[test]
    fn test_error_display() {
        let err = BusError::crc_mismatch(0x1234, 0x5678);
        let msg = format!("{}", err);
        assert!(msg.contains("CRC validation failed"));
        assert!(msg.contains("1234"));
        assert!(msg.contains("5678"));
    }

    #[test]
    fn test_error_category() {
        assert_eq!(BusError::not_connected("COM3").category(), ErrorCategory::LostConnection);
        assert_eq!(BusError::io("port closed").category(), ErrorCategory::LostConnection);
        assert_eq!(BusError::timeout("read", 10).category(), ErrorCategory::Timeout);
        assert_eq!(BusError::frame("bad footer").category(), ErrorCategory::FrameMismatch);
        assert_eq!(BusError::crc_mismatch(1, 2).category(), ErrorCategory::FrameMismatch);
        assert_eq!(BusError::invalid_data("x").category(), ErrorCategory::Other);
        assert_eq!(ErrorCategory::FrameMismatch.to_string(), "Frame mismatch");
    }

    #[test]
    fn test_io_conversion() {
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "no data");
        assert!(matches!(BusError::from(timed_out), BusError::Timeout { .. }));

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "busy");
        assert!(matches!(BusError::from(denied), BusError::Io { .. }));
    }
}
