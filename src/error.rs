//! # Testbed Error Handling
//!
//! Error types covering every failure surface of the test bench: socket
//! binding, Modbus framing and protocol violations, register addressing,
//! and configuration persistence.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O Errors**: socket read/write failures
//! - **Connection Errors**: connect/accept problems
//! - **Timeout Errors**: operation timeouts with context
//! - **Bind Errors**: address in use, insufficient privilege (ports <1024)
//!
//! ### Protocol Errors
//! - **Protocol Errors**: Modbus specification violations
//! - **Frame Errors**: MBAP/PDU parsing failures
//! - **Exception Responses**: standard Modbus exception codes
//!
//! ### Data Errors
//! - **Invalid Function**: unsupported function codes
//! - **Out Of Range**: register address/count beyond the store's capacity
//! - **Invalid Data**: value format and validation errors
//!
//! ### System Errors
//! - **Configuration Errors**: malformed persisted config, invalid fields,
//!   duplicate bindings
//! - **Internal Errors**: library internal errors (should not occur in
//!   normal operation)
//!
//! Errors report whether they are worth retrying:
//!
//! ```rust
//! use modbus_testbed::{TestbedError, TestbedResult};
//!
//! fn handle(result: TestbedResult<Vec<u16>>) {
//!     match result {
//!         Ok(data) => println!("read {:?}", data),
//!         Err(error) if error.is_recoverable() => println!("retryable: {}", error),
//!         Err(error) => println!("fatal: {}", error),
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for testbed operations
pub type TestbedResult<T> = Result<T, TestbedError>;

/// Error type covering transport, protocol, register-store and
/// configuration failures.
///
/// Each variant carries enough context to diagnose the failure without a
/// debugger; the server layer maps store errors onto Modbus exception
/// responses, the manager layer surfaces lifecycle errors to the log.
#[derive(Error, Debug, Clone)]
pub enum TestbedError {
    /// I/O related errors (socket read/write, file access)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment and maintenance errors
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Failure to bind a listening socket
    ///
    /// Raised when the configured address is already in use or the
    /// process lacks the privilege to bind it (ports below 1024 on
    /// non-elevated processes).
    #[error("Bind error on {addr}: {message}")]
    Bind { addr: String, message: String },

    /// Operation exceeded its timeout
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// General Modbus protocol violations
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Unsupported or malformed function code
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Register span outside the store's allocated space
    ///
    /// Raised for `count == 0` and for `address + count` beyond the
    /// capacity of the addressed block. The operation is never partially
    /// applied.
    #[error("Out of range: start={start}, count={count}, capacity={capacity}")]
    OutOfRange { start: u16, count: u16, capacity: u16 },

    /// Data format and validation errors
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Modbus exception response received from a server
    #[error("Modbus exception: function=0x{function:02X}, code=0x{code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Frame parsing errors (MBAP header, PDU structure)
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Configuration errors
    ///
    /// Malformed persisted configuration, out-of-range field values, or a
    /// requested binding that collides with another server.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TestbedError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new bind error for the given address
    pub fn bind<A: Into<String>, S: Into<String>>(addr: A, message: S) -> Self {
        Self::Bind { addr: addr.into(), message: message.into() }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an out-of-range error
    pub fn out_of_range(start: u16, count: u16, capacity: u16) -> Self {
        Self::OutOfRange { start, count, capacity }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a Modbus exception error
    ///
    /// Maps standard exception codes to human-readable messages.
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

        Self::Exception { function, code, message }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
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
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. } | Self::Bind { .. }
        )
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::InvalidFunction { .. }
                | Self::Exception { .. }
                | Self::Frame { .. }
        )
    }
}

/// Convert from std::io::Error, preserving the original message.
impl From<std::io::Error> for TestbedError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from tokio timeout errors.
impl From<tokio::time::error::Elapsed> for TestbedError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

/// Convert from serde JSON errors (configuration parsing).
impl From<serde_json::Error> for TestbedError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = TestbedError::timeout("read_registers", 5000);
        assert!(err.is_recoverable());
        assert!(err.is_transport_error());

        let err = TestbedError::exception(0x03, 0x02);
        assert!(!err.is_recoverable());
        assert!(err.is_protocol_error());

        let err = TestbedError::bind("127.0.0.1:502", "permission denied");
        assert!(err.is_transport_error());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = TestbedError::out_of_range(9990, 20, 10000);
        let msg = format!("{}", err);
        assert!(msg.contains("start=9990"));
        assert!(msg.contains("count=20"));
        assert!(msg.contains("capacity=10000"));
    }

    #[test]
    fn test_exception_messages() {
        let err = TestbedError::exception(0x03, 0x0B);
        let msg = format!("{}", err);
        assert!(msg.contains("Gateway Target Device Failed to Respond"));
    }
}
