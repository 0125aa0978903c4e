/// Modbus protocol definitions and data structures
///
/// This module contains the core Modbus protocol definitions: function
/// codes, exception codes, the decoded application data unit and the data
/// conversion helpers shared by client and server.
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus unit identifier. 0 is broadcast, 1-247 address individual
/// servers, 248-255 are reserved but accepted by the decoders.
pub type UnitId = u8;

/// Broadcast unit address: every server processes the request, none responds
pub const BROADCAST_UNIT: UnitId = 0;

/// Exception responses carry the request function code with this bit set
pub const EXCEPTION_FLAG: u8 = 0x80;

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
    /// Report Server ID (0x11)
    ReportServerId = 0x11,
    /// Mask Write Register (0x16)
    MaskWriteRegister = 0x16,
    /// Read/Write Multiple Registers (0x17)
    ReadWriteMultipleRegisters = 0x17,
    /// Encapsulated Interface Transport (0x2B), MEI type 0x0E carries
    /// Read Device Identification
    EncapsulatedInterface = 0x2B,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            0x11 => Ok(ModbusFunction::ReportServerId),
            0x16 => Ok(ModbusFunction::MaskWriteRegister),
            0x17 => Ok(ModbusFunction::ReadWriteMultipleRegisters),
            0x2B => Ok(ModbusFunction::EncapsulatedInterface),
            _ => Err(ModbusError::invalid_function(value)),
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
                | ModbusFunction::MaskWriteRegister
        )
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
            ModbusFunction::ReportServerId => "Report Server ID",
            ModbusFunction::MaskWriteRegister => "Mask Write Register",
            ModbusFunction::ReadWriteMultipleRegisters => "Read/Write Multiple Registers",
            ModbusFunction::EncapsulatedInterface => "Read Device Identification",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
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
            ModbusException::IllegalFunction => "The function code is not an allowable action for the server",
            ModbusException::IllegalDataAddress => "The data address is not an allowable address for the server",
            ModbusException::IllegalDataValue => "A value in the query data field is not allowable for the server",
            ModbusException::ServerDeviceFailure => "An unrecoverable error occurred while performing the requested action",
            ModbusException::Acknowledge => "The request was accepted but will take a long time to process",
            ModbusException::ServerDeviceBusy => "The server is engaged in processing a long-duration command",
            ModbusException::MemoryParityError => "A parity error was detected in record memory",
            ModbusException::GatewayPathUnavailable => "The gateway was unable to allocate an internal communication path",
            ModbusException::GatewayTargetDeviceFailedToRespond => "No response was obtained from the target device",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

impl From<ModbusException> for ModbusError {
    /// Lets model callbacks reject with a bare exception code; the server
    /// re-stamps the function code of the offending request.
    fn from(exception: ModbusException) -> Self {
        ModbusError::exception(0, exception.to_u8())
    }
}

/// Decoded application data unit
///
/// The logical frame shared by all three framing variants: optional MBAP
/// transaction id, unit address, function code and the raw PDU payload
/// following the function code. `raw` keeps the original wire bytes the
/// frame was decoded from (or is empty for locally built requests).
///
/// An `Adu` is immutable once emitted by a framer; consumers only read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adu {
    /// Transaction identifier, present only on MBAP frames
    pub transaction_id: Option<u16>,
    /// Unit (slave) address; 0 is broadcast
    pub unit_id: UnitId,
    /// Function code as transmitted, including a possible exception flag
    pub function: u8,
    /// PDU payload following the function code
    pub data: Bytes,
    /// Original wire bytes this frame was decoded from
    pub raw: Bytes,
}

impl Adu {
    /// Build an outbound request frame; the framer fills in the framing
    /// envelope (and the transaction id where the variant carries one).
    pub fn request(unit_id: UnitId, function: u8, data: Vec<u8>) -> Self {
        Self {
            transaction_id: None,
            unit_id,
            function,
            data: Bytes::from(data),
            raw: Bytes::new(),
        }
    }

    /// Check whether this frame is an exception response
    pub fn is_exception(&self) -> bool {
        self.function & EXCEPTION_FLAG != 0
    }

    /// Exception code carried by an exception response
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.data.first().copied()
        } else {
            None
        }
    }
}

/// Wire data conversions: big-endian register serialization and the
/// LSB-first bit packing used by the coil-oriented function codes.
pub mod data_utils {
    use super::*;

    /// Serialize registers big-endian, two bytes per register.
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        registers
            .iter()
            .flat_map(|value| value.to_be_bytes())
            .collect()
    }

    /// Parse big-endian register values out of a byte slice.
    pub fn bytes_to_registers(bytes: &[u8]) -> ModbusResult<Vec<u16>> {
        let pairs = bytes.chunks_exact(2);
        if !pairs.remainder().is_empty() {
            return Err(ModbusError::invalid_data("register data has odd length"));
        }
        Ok(pairs
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Pack bit values into bytes. Within each byte the first bit lands
    /// in the least significant position, as the coil responses require.
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        bits.chunks(8)
            .map(|chunk| {
                chunk
                    .iter()
                    .rev()
                    .fold(0u8, |byte, &bit| (byte << 1) | u8::from(bit))
            })
            .collect()
    }

    /// Expand packed bytes back into bit values, LSB-first, padding with
    /// `false` when the input carries fewer than `bit_count` bits.
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        bytes
            .iter()
            .flat_map(|&byte| (0..8).map(move |bit| byte & (1 << bit) != 0))
            .chain(std::iter::repeat(false))
            .take(bit_count)
            .collect()
    }

    /// Split a 32-bit value into its high/low register pair.
    pub fn u32_to_registers(value: u32) -> [u16; 2] {
        let [b3, b2, b1, b0] = value.to_be_bytes();
        [u16::from_be_bytes([b3, b2]), u16::from_be_bytes([b1, b0])]
    }

    /// Combine a high/low register pair into a 32-bit value.
    pub fn registers_to_u32(registers: &[u16]) -> ModbusResult<u32> {
        match registers {
            [high, low, ..] => Ok((u32::from(*high) << 16) | u32::from(*low)),
            _ => Err(ModbusError::invalid_data("u32 needs a register pair")),
        }
    }

    /// IEEE 754 single-precision value as a register pair.
    pub fn f32_to_registers(value: f32) -> [u16; 2] {
        u32_to_registers(value.to_bits())
    }

    /// Register pair as an IEEE 754 single-precision value.
    pub fn registers_to_f32(registers: &[u16]) -> ModbusResult<f32> {
        registers_to_u32(registers).map(f32::from_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_conversion() {
        assert_eq!(
            ModbusFunction::from_u8(0x03).unwrap(),
            ModbusFunction::ReadHoldingRegisters
        );
        assert_eq!(ModbusFunction::ReadHoldingRegisters.to_u8(), 0x03);
        assert_eq!(ModbusFunction::from_u8(0x2B).unwrap(), ModbusFunction::EncapsulatedInterface);
        assert_eq!(ModbusFunction::from_u8(0x16).unwrap(), ModbusFunction::MaskWriteRegister);

        assert!(ModbusFunction::from_u8(0xFF).is_err());
        assert!(ModbusFunction::from_u8(0x07).is_err());
    }

    #[test]
    fn test_exception_conversion() {
        assert_eq!(
            ModbusException::from_u8(0x02).unwrap(),
            ModbusException::IllegalDataAddress
        );
        assert_eq!(ModbusException::IllegalDataAddress.to_u8(), 0x02);
        assert!(ModbusException::from_u8(0x07).is_none());
    }

    #[test]
    fn test_adu_exception_helpers() {
        let normal = Adu::request(17, 0x03, vec![0x00, 0x6B, 0x00, 0x03]);
        assert!(!normal.is_exception());
        assert_eq!(normal.exception_code(), None);

        let exception = Adu::request(17, 0x83, vec![0x01]);
        assert!(exception.is_exception());
        assert_eq!(exception.exception_code(), Some(0x01));
    }

    #[test]
    fn test_data_utils() {
        let registers = vec![0x1234, 0x5678];
        let bytes = data_utils::registers_to_bytes(&registers);
        assert_eq!(bytes, vec![0x12, 0x34, 0x56, 0x78]);

        let back_to_registers = data_utils::bytes_to_registers(&bytes).unwrap();
        assert_eq!(back_to_registers, registers);

        let bits = vec![true, false, true, true, false, false, false, false];
        let packed = data_utils::pack_bits(&bits);
        assert_eq!(packed, vec![0b0000_1101]);
        let unpacked = data_utils::unpack_bits(&packed, bits.len());
        assert_eq!(unpacked, bits);
    }

    #[test]
    fn test_bit_packing_is_lsb_first() {
        // 0xCD = 1100_1101: bit 0 first gives 1,0,1,1,0,0,1,1
        let bits = data_utils::unpack_bits(&[0xCD], 8);
        assert_eq!(
            bits,
            vec![true, false, true, true, false, false, true, true]
        );
    }

    #[test]
    fn test_float_conversion() {
        let registers = data_utils::f32_to_registers(123.45);
        let value = data_utils::registers_to_f32(&registers).unwrap();
        assert!((value - 123.45).abs() < f32::EPSILON);
    }
}
