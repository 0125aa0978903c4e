//! # Voltage Modbus Stack - Full Modbus Protocol Stack
//!
//! **Author:** Evan Liu <evan.liu@voltageenergy.com>
//! **License:** MIT
//!
//! A complete Modbus protocol stack in pure Rust, usable as client (master)
//! or server (slave) over serial, TCP or UDP transports, speaking any of the
//! RTU, ASCII or MBAP framing variants.
//!
//! ## Features
//!
//! - **All three framings**: RTU (CRC-16, 3.5T inter-frame silence), ASCII
//!   (hex text, LRC) and MBAP over TCP/UDP
//! - **Client and server**: request/response correlation with timeouts on
//!   the client, callback-driven unit models on the server
//! - **Async**: built on Tokio, no blocking I/O anywhere
//! - **Pluggable transports**: an abstract byte-duplex contract plus TCP,
//!   UDP, serial and in-memory implementations
//!
//! ## Supported Function Codes
//!
//! | Code  | Function                        | Client | Server |
//! |-------|---------------------------------|--------|--------|
//! | 0x01  | Read Coils                      | ✅     | ✅     |
//! | 0x02  | Read Discrete Inputs            | ✅     | ✅     |
//! | 0x03  | Read Holding Registers          | ✅     | ✅     |
//! | 0x04  | Read Input Registers            | ✅     | ✅     |
//! | 0x05  | Write Single Coil               | ✅     | ✅     |
//! | 0x06  | Write Single Register           | ✅     | ✅     |
//! | 0x0F  | Write Multiple Coils            | ✅     | ✅     |
//! | 0x10  | Write Multiple Registers        | ✅     | ✅     |
//! | 0x11  | Report Server ID                | ✅     | ✅     |
//! | 0x16  | Mask Write Register             | ✅     | ✅     |
//! | 0x17  | Read/Write Multiple Registers   | ✅     | ✅     |
//! | 0x2B/0x0E | Read Device Identification  | ✅     | ✅     |
//!
//! ## Quick Start
//!
//! ### Client
//!
//! ```rust,no_run
//! use voltage_modbus_stack::{ModbusClient, TcpTransport};
//!
//! #[tokio::main]
//! async fn main() -> voltage_modbus_stack::ModbusResult<()> {
//!     let transport = TcpTransport::from_address("127.0.0.1:502")?;
//!     let mut client = ModbusClient::tcp(transport);
//!     client.open().await?;
//!
//!     let values = client.read_holding_registers(1, 0x0000, 10).await?;
//!     println!("registers: {values:?}");
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Server
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_modbus_stack::{ModbusRegisterBank, ModbusServer, TcpServerTransport};
//!
//! #[tokio::main]
//! async fn main() -> voltage_modbus_stack::ModbusResult<()> {
//!     let bank = Arc::new(ModbusRegisterBank::new());
//!     let transport = TcpServerTransport::from_address("127.0.0.1:502")?;
//!     let mut server = ModbusServer::tcp(transport);
//!     server.add(bank.model(1))?;
//!
//!     server.open().await?;
//!     server.serve().await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      ┌──────────────┐
//! │    Client    │      │    Server    │   role layer
//! └──────┬───────┘      └──────┬───────┘
//!        │                     │
//! ┌──────┴───────┐      ┌──────┴───────┐
//! │    Framer    │      │    Framer    │   RTU / ASCII / MBAP
//! └──────┬───────┘      └──────┬───────┘
//!        │                     │
//! ┌──────┴───────┐      ┌──────┴───────┐
//! │  Transport   │◄────►│  Transport   │   serial / TCP / UDP
//! └──────────────┘      └──────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Protocol definitions: function codes, exceptions, decoded frames
pub mod protocol;

/// Application-layer framers for RTU, ASCII and MBAP
pub mod codec;

/// Byte-duplex transport contract and implementations
pub mod transport;

/// Server-side unit models and their callbacks
pub mod model;

/// Thread-safe register storage for server applications
pub mod register_bank;

/// Modbus client (master) implementation
pub mod client;

/// Modbus server (slave) implementation
pub mod server;

/// Pluggable packet/frame trace logging
pub mod logging;

/// Validation and formatting helpers
pub mod utils;

// Re-export main types for convenience
pub use client::{DeviceIdCode, DeviceIdentification, ModbusClient};
pub use codec::ascii::AsciiFramer;
pub use codec::rtu::{FrameGap, RtuFramer};
pub use codec::tcp::MbapFramer;
pub use codec::{Check, Framer, FramerEvent, PreCheck};
pub use error::{ModbusError, ModbusResult};
pub use logging::{CallbackLogger, LogCallback, LogLevel};
pub use model::{AddressRanges, RangeList, ServerIdentity, ServerModel};
pub use protocol::{Adu, ModbusException, ModbusFunction, BROADCAST_UNIT};
pub use register_bank::ModbusRegisterBank;
pub use server::{ModbusServer, ModelRegistry};
pub use transport::memory::MemoryTransport;
pub use transport::serial::{SerialConfig, SerialTransport};
pub use transport::tcp::{TcpServerTransport, TcpTransport};
pub use transport::udp::UdpTransport;
pub use transport::{ModbusTransport, ReplyHandle, TransportEvent, TransportKind};

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Modbus UDP default port
pub const DEFAULT_UDP_PORT: u16 = 502;

/// Default timeout for client requests (1 second)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1000;

/// Maximum PDU size (function code + data) in standard Modbus
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum number of coils that can be read in a single request
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of registers that can be read in a single request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum number of coils that can be written in a single request
pub const MAX_WRITE_COILS_PER_REQUEST: u16 = 1968;

/// Maximum number of registers that can be written in a single request
pub const MAX_WRITE_REGISTERS_PER_REQUEST: u16 = 123;

/// Maximum write quantity of a read/write multiple registers request
pub const MAX_RW_WRITE_REGISTERS_PER_REQUEST: u16 = 121;

/// Maximum Modbus RTU frame size
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Maximum Modbus TCP frame size (MBAP header + PDU)
pub const MAX_TCP_FRAME_SIZE: usize = 260;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
