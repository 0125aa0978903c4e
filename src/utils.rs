/// Validation and formatting helpers shared by client and server
use crate::error::{ModbusError, ModbusResult};

/// Request parameter validation
pub mod validation {
    use super::*;

    /// Validate a bit count for read operations (1-2000)
    pub fn validate_bit_count(count: u16) -> ModbusResult<()> {
        if count == 0 || count > crate::MAX_COILS_PER_REQUEST {
            return Err(ModbusError::invalid_data(format!(
                "Invalid coil count: {} (must be 1-{})",
                count,
                crate::MAX_COILS_PER_REQUEST
            )));
        }
        Ok(())
    }

    /// Validate a register count for read operations (1-125)
    pub fn validate_register_count(count: u16) -> ModbusResult<()> {
        if count == 0 || count > crate::MAX_REGISTERS_PER_REQUEST {
            return Err(ModbusError::invalid_data(format!(
                "Invalid register count: {} (must be 1-{})",
                count,
                crate::MAX_REGISTERS_PER_REQUEST
            )));
        }
        Ok(())
    }

    /// Validate a coil count for multi-write operations (1-1968)
    pub fn validate_write_bit_count(count: usize) -> ModbusResult<()> {
        if count == 0 || count > crate::MAX_WRITE_COILS_PER_REQUEST as usize {
            return Err(ModbusError::invalid_data(format!(
                "Invalid write coil count: {} (must be 1-{})",
                count,
                crate::MAX_WRITE_COILS_PER_REQUEST
            )));
        }
        Ok(())
    }

    /// Validate a register count for multi-write operations (1-123)
    pub fn validate_write_register_count(count: usize) -> ModbusResult<()> {
        if count == 0 || count > crate::MAX_WRITE_REGISTERS_PER_REQUEST as usize {
            return Err(ModbusError::invalid_data(format!(
                "Invalid write register count: {} (must be 1-{})",
                count,
                crate::MAX_WRITE_REGISTERS_PER_REQUEST
            )));
        }
        Ok(())
    }

    /// Validate the write count of a read/write multiple request (1-121)
    pub fn validate_rw_write_count(count: usize) -> ModbusResult<()> {
        if count == 0 || count > crate::MAX_RW_WRITE_REGISTERS_PER_REQUEST as usize {
            return Err(ModbusError::invalid_data(format!(
                "Invalid write register count: {} (must be 1-{})",
                count,
                crate::MAX_RW_WRITE_REGISTERS_PER_REQUEST
            )));
        }
        Ok(())
    }

    /// Validate that an address span stays within the 16-bit space
    pub fn validate_span(start: u16, count: u16) -> ModbusResult<()> {
        if count == 0 {
            return Err(ModbusError::invalid_address(start, count));
        }
        if (start as u32 + count as u32) > 65536 {
            return Err(ModbusError::invalid_address(start, count));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    /// Format byte array as hex string
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format register values as hex
    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers
            .iter()
            .map(|r| format!("{:04X}", r))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
