//! # Modbus Testbed - Configurable Modbus TCP Test Servers
//!
//! A test bench that simulates two Modbus TCP devices — a battery and a
//! master controller — each bound to its own configurable endpoint and
//! unit id, serving a seedable register store. Configuration persists to a
//! JSON file and can be re-applied at runtime: a running server is stopped
//! and restarted on its new endpoint in one sequenced operation.
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Client | Server |
//! |------|----------|--------|--------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modbus_testbed::{ConfigStore, ServerManager, ServerName};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load (or create) the persisted configuration
//!     let store = ConfigStore::default();
//!     let config = store.load()?;
//!
//!     // Start both simulated devices
//!     let mut manager = ServerManager::new(config);
//!     manager.start(ServerName::Battery).await?;
//!     manager.start(ServerName::Master).await?;
//!
//!     // Servers are now reachable over Modbus TCP...
//!     manager.stop_all().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐      ┌──────────────────────────────┐
//! │  Config Store   │─────►│        Server Manager        │
//! │  (JSON file)    │      │  Battery ── Master lifecycle │
//! └─────────────────┘      └──────────────┬───────────────┘
//!                                         │
//!                          ┌──────────────┴───────────────┐
//!                          │     Modbus TCP Server ×2     │
//!                          └──────────────┬───────────────┘
//!                                         │
//! ┌─────────────────┐      ┌──────────────┴───────────────┐
//! │  Panel / Client │◄────►│        Register Store        │
//! │  (Modbus TCP)   │      │  coils · discrete · hr · ir  │
//! └─────────────────┘      └──────────────────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus protocol definitions and message handling
pub mod protocol;

/// Register storage served by the test servers
pub mod store;

/// Modbus TCP server implementation
pub mod server;

/// Lifecycle management for the named test servers
pub mod manager;

/// Configuration persistence
pub mod config;

/// Modbus TCP client
pub mod client;

/// Interactive panel support operations
pub mod panel;

/// Callback logging for embedding frontends
pub mod logging;

// Re-export main types for convenience
pub use error::{TestbedError, TestbedResult};
pub use protocol::{ModbusFunction, ModbusException, ModbusRequest, ModbusResponse, RegisterKind, UnitId};
pub use store::{RegisterStore, RegisterStoreStats, RegisterValue, DEFAULT_STORE_CAPACITY};
pub use server::{ModbusServer, ModbusTcpServer, ModbusTcpServerConfig, ServerStats};
pub use manager::{ServerManager, ServerName, ServerStatus};
pub use config::{AppConfig, ConfigStore, InitialRegisters, ServerConfig};
pub use client::ModbusTcpClient;
pub use logging::{CallbackLogger, LogCallback, LogLevel};

/// Default timeout for operations (5 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Maximum number of coils that can be read/written in a single request
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of registers that can be read/written in a single request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Modbus Testbed v{} - configurable Modbus TCP test servers", VERSION)
}
