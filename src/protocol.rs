/// Modbus protocol definitions and data structures
///
/// This module contains the core Modbus protocol definitions, including
/// register kinds, function codes, exception codes, and request/response
/// structures shared by the server and the client.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use crate::error::{TestbedError, TestbedResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus value type (16-bit register value)
pub type ModbusValue = u16;

/// Modbus unit identifier (0-247)
pub type UnitId = u8;

/// The four addressable Modbus data classes
///
/// Coils and holding registers are read/write; discrete inputs and input
/// registers are read-only over the wire and written only through the
/// store's seeding back door.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    /// Coils - 1 bit each, read/write
    Coil,
    /// Discrete inputs - 1 bit each, read-only
    DiscreteInput,
    /// Holding registers - 16 bits each, read/write
    Holding,
    /// Input registers - 16 bits each, read-only
    Input,
}

impl RegisterKind {
    /// Base of the conventional human-readable numbering scheme
    /// (coils 00001, discrete inputs 10001, input registers 30001,
    /// holding registers 40001).
    pub fn human_base(self) -> u32 {
        match self {
            RegisterKind::Coil => 1,
            RegisterKind::DiscreteInput => 10001,
            RegisterKind::Input => 30001,
            RegisterKind::Holding => 40001,
        }
    }

    /// Check if this kind holds single bits (as opposed to 16-bit words)
    pub fn is_bit(self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::DiscreteInput)
    }

    /// Check if this kind accepts writes through Modbus function codes
    pub fn is_writable(self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::Holding)
    }

    /// Translate a human-readable register number into a zero-based offset
    ///
    /// Returns `None` for numbers below the kind's base.
    pub fn human_to_offset(self, address: u32) -> Option<u16> {
        let base = self.human_base();
        if address < base {
            return None;
        }
        u16::try_from(address - base).ok()
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterKind::Coil => "coils",
            RegisterKind::DiscreteInput => "discrete",
            RegisterKind::Holding => "holding",
            RegisterKind::Input => "input",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for RegisterKind {
    type Err = TestbedError;

    fn from_str(s: &str) -> TestbedResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coil" | "coils" => Ok(RegisterKind::Coil),
            "discrete" | "discrete_input" | "discrete_inputs" => Ok(RegisterKind::DiscreteInput),
            "holding" | "holding_register" | "holding_registers" => Ok(RegisterKind::Holding),
            "input" | "input_register" | "input_registers" => Ok(RegisterKind::Input),
            other => Err(TestbedError::invalid_data(format!(
                "Unsupported register type: {}",
                other
            ))),
        }
    }
}

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> TestbedResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(TestbedError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is a read function
    pub fn is_read_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::ReadCoils
                | ModbusFunction::ReadDiscreteInputs
                | ModbusFunction::ReadHoldingRegisters
                | ModbusFunction::ReadInputRegisters
        )
    }

    /// Check if this is a write function
    pub fn is_write_function(self) -> bool {
        matches!(
            self,
            ModbusFunction::WriteSingleCoil
                | ModbusFunction::WriteSingleRegister
                | ModbusFunction::WriteMultipleCoils
                | ModbusFunction::WriteMultipleRegisters
        )
    }

    /// The register kind a read function addresses
    pub fn register_kind(self) -> Option<RegisterKind> {
        match self {
            ModbusFunction::ReadCoils => Some(RegisterKind::Coil),
            ModbusFunction::ReadDiscreteInputs => Some(RegisterKind::DiscreteInput),
            ModbusFunction::ReadHoldingRegisters => Some(RegisterKind::Holding),
            ModbusFunction::ReadInputRegisters => Some(RegisterKind::Input),
            ModbusFunction::WriteSingleCoil | ModbusFunction::WriteMultipleCoils => {
                Some(RegisterKind::Coil)
            }
            ModbusFunction::WriteSingleRegister | ModbusFunction::WriteMultipleRegisters => {
                Some(RegisterKind::Holding)
            }
        }
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "The function code received in the query is not an allowable action for the server",
            ModbusException::IllegalDataAddress => "The data address received in the query is not an allowable address for the server",
            ModbusException::IllegalDataValue => "A value contained in the query data field is not an allowable value for server",
            ModbusException::ServerDeviceFailure => "An unrecoverable error occurred while the server was attempting to perform the requested action",
            ModbusException::Acknowledge => "The server has accepted the request and is processing it, but a long duration of time will be required to do so",
            ModbusException::ServerDeviceBusy => "The server is engaged in processing a long-duration program command",
            ModbusException::MemoryParityError => "The server attempted to read record file, but detected a parity error in the memory",
            ModbusException::GatewayPathUnavailable => "Gateway was unable to allocate an internal communication path",
            ModbusException::GatewayTargetDeviceFailedToRespond => "No response was obtained from the target device",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Modbus request structure
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusRequest {
    pub unit_id: UnitId,
    pub function: ModbusFunction,
    pub address: ModbusAddress,
    pub quantity: u16,
    pub data: Vec<u8>,
}

impl ModbusRequest {
    /// Create a new read request
    pub fn new_read(
        unit_id: UnitId,
        function: ModbusFunction,
        address: ModbusAddress,
        quantity: u16,
    ) -> Self {
        Self {
            unit_id,
            function,
            address,
            quantity,
            data: Vec::new(),
        }
    }

    /// Create a new write request
    pub fn new_write(
        unit_id: UnitId,
        function: ModbusFunction,
        address: ModbusAddress,
        quantity: u16,
        data: Vec<u8>,
    ) -> Self {
        Self {
            unit_id,
            function,
            address,
            quantity,
            data,
        }
    }

    /// Validate the request before it goes on the wire
    pub fn validate(&self) -> TestbedResult<()> {
        if self.unit_id > 247 {
            return Err(TestbedError::invalid_data(format!(
                "Invalid unit ID: {} (must be 0-247)",
                self.unit_id
            )));
        }

        if self.quantity == 0 {
            return Err(TestbedError::invalid_data("Quantity cannot be zero".to_string()));
        }

        match self.function {
            ModbusFunction::ReadCoils
            | ModbusFunction::ReadDiscreteInputs
            | ModbusFunction::WriteMultipleCoils => {
                if self.quantity > crate::MAX_COILS_PER_REQUEST {
                    return Err(TestbedError::invalid_data(format!(
                        "Too many coils requested: {}",
                        self.quantity
                    )));
                }
            }
            ModbusFunction::ReadHoldingRegisters
            | ModbusFunction::ReadInputRegisters
            | ModbusFunction::WriteMultipleRegisters => {
                if self.quantity > crate::MAX_REGISTERS_PER_REQUEST {
                    return Err(TestbedError::invalid_data(format!(
                        "Too many registers requested: {}",
                        self.quantity
                    )));
                }
            }
            _ => {}
        }

        Ok(())
    }
}

/// Modbus response structure
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusResponse {
    pub unit_id: UnitId,
    pub function: ModbusFunction,
    pub data: Vec<u8>,
    pub exception: Option<ModbusException>,
}

impl ModbusResponse {
    /// Create a successful response
    pub fn new_success(unit_id: UnitId, function: ModbusFunction, data: Vec<u8>) -> Self {
        Self {
            unit_id,
            function,
            data,
            exception: None,
        }
    }

    /// Create an exception response
    pub fn new_exception(unit_id: UnitId, function: ModbusFunction, exception_code: u8) -> Self {
        let exception = ModbusException::from_u8(exception_code);
        Self {
            unit_id,
            function,
            data: Vec::new(),
            exception,
        }
    }

    /// Check if this is an exception response
    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }

    /// Get exception error if present
    pub fn get_exception(&self) -> Option<TestbedError> {
        self.exception
            .map(|exc| TestbedError::exception(self.function.to_u8(), exc.to_u8()))
    }

    /// Parse response data as registers (u16 values)
    pub fn parse_registers(&self) -> TestbedResult<Vec<u16>> {
        if let Some(err) = self.get_exception() {
            return Err(err);
        }

        if self.data.is_empty() {
            return Err(TestbedError::frame("Empty response data"));
        }

        let byte_count = self.data[0] as usize;
        if self.data.len() < 1 + byte_count {
            return Err(TestbedError::frame("Incomplete register data"));
        }

        if byte_count % 2 != 0 {
            return Err(TestbedError::frame("Invalid register data length"));
        }

        let mut registers = Vec::new();
        for i in (1..1 + byte_count).step_by(2) {
            let value = u16::from_be_bytes([self.data[i], self.data[i + 1]]);
            registers.push(value);
        }

        Ok(registers)
    }

    /// Parse response data as bits (bool values)
    pub fn parse_bits(&self) -> TestbedResult<Vec<bool>> {
        if let Some(err) = self.get_exception() {
            return Err(err);
        }

        if self.data.is_empty() {
            return Err(TestbedError::frame("Empty response data"));
        }

        let byte_count = self.data[0] as usize;
        if self.data.len() < 1 + byte_count {
            return Err(TestbedError::frame("Incomplete bit data"));
        }

        let mut bits = Vec::new();
        for i in 1..1 + byte_count {
            let byte_value = self.data[i];
            for bit_pos in 0..8 {
                bits.push((byte_value & (1 << bit_pos)) != 0);
            }
        }

        Ok(bits)
    }
}

/// Data conversion utilities
pub mod data_utils {
    use super::*;

    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian)
    pub fn bytes_to_registers(bytes: &[u8]) -> TestbedResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(TestbedError::invalid_data(
                "Byte array length must be even".to_string(),
            ));
        }

        let mut registers = Vec::new();
        for chunk in bytes.chunks(2) {
            let value = u16::from_be_bytes([chunk[0], chunk[1]]);
            registers.push(value);
        }
        Ok(registers)
    }

    /// Pack boolean values into bytes
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let byte_count = (bits.len() + 7) / 8;
        let mut bytes = vec![0u8; byte_count];

        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                let byte_index = i / 8;
                let bit_index = i % 8;
                bytes[byte_index] |= 1 << bit_index;
            }
        }

        bytes
    }

    /// Unpack bytes into boolean values
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        let mut bits = Vec::with_capacity(bit_count);

        for i in 0..bit_count {
            let byte_index = i / 8;
            let bit_index = i % 8;

            if byte_index < bytes.len() {
                let bit_value = (bytes[byte_index] & (1 << bit_index)) != 0;
                bits.push(bit_value);
            } else {
                bits.push(false);
            }
        }

        bits
    }
}
