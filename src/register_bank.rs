/// Modbus register bank for server-side data storage
///
/// Thread-safe storage for the four Modbus data spaces. All spaces share
/// one access discipline, so the accessors are thin wrappers over three
/// generic span helpers; [`ModbusRegisterBank::model`] wires the bank
/// into a [`ServerModel`]'s callbacks.
use std::sync::{Arc, RwLock};

use crate::error::{ModbusError, ModbusResult};
use crate::model::ServerModel;

/// Default register bank size
const DEFAULT_SPACE_SIZE: usize = 10000;

/// Copy a span out of one data space, rejecting reads past its end.
fn read_span<T: Copy>(space: &RwLock<Vec<T>>, address: u16, quantity: u16) -> ModbusResult<Vec<T>> {
    let values = space.read().unwrap();
    let start = address as usize;
    let end = start + quantity as usize;
    values
        .get(start..end)
        .map(<[T]>::to_vec)
        .ok_or_else(|| ModbusError::invalid_address(address, quantity))
}

/// Overwrite a span of one data space, rejecting writes past its end.
fn write_span<T: Copy>(space: &RwLock<Vec<T>>, address: u16, data: &[T]) -> ModbusResult<()> {
    let mut values = space.write().unwrap();
    let start = address as usize;
    let end = start + data.len();
    let slots = values
        .get_mut(start..end)
        .ok_or_else(|| ModbusError::invalid_address(address, data.len() as u16))?;
    slots.copy_from_slice(data);
    Ok(())
}

/// Overwrite one element of one data space.
fn write_one<T: Copy>(space: &RwLock<Vec<T>>, address: u16, value: T) -> ModbusResult<()> {
    let mut values = space.write().unwrap();
    let slot = values
        .get_mut(address as usize)
        .ok_or_else(|| ModbusError::invalid_address(address, 1))?;
    *slot = value;
    Ok(())
}

/// Thread-safe register bank for Modbus data
#[derive(Debug)]
pub struct ModbusRegisterBank {
    coils: RwLock<Vec<bool>>,
    discrete_inputs: RwLock<Vec<bool>>,
    holding_registers: RwLock<Vec<u16>>,
    input_registers: RwLock<Vec<u16>>,
}

impl ModbusRegisterBank {
    /// Create a new register bank with default sizes; all values start
    /// cleared
    pub fn new() -> Self {
        Self::with_sizes(
            DEFAULT_SPACE_SIZE,
            DEFAULT_SPACE_SIZE,
            DEFAULT_SPACE_SIZE,
            DEFAULT_SPACE_SIZE,
        )
    }

    /// Create a new register bank with custom sizes
    pub fn with_sizes(
        coils_size: usize,
        discrete_inputs_size: usize,
        holding_registers_size: usize,
        input_registers_size: usize,
    ) -> Self {
        Self {
            coils: RwLock::new(vec![false; coils_size]),
            discrete_inputs: RwLock::new(vec![false; discrete_inputs_size]),
            holding_registers: RwLock::new(vec![0u16; holding_registers_size]),
            input_registers: RwLock::new(vec![0u16; input_registers_size]),
        }
    }

    /// Read coils
    pub fn read_coils(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        read_span(&self.coils, address, quantity)
    }

    /// Write single coil
    pub fn write_single_coil(&self, address: u16, value: bool) -> ModbusResult<()> {
        write_one(&self.coils, address, value)
    }

    /// Write multiple coils
    pub fn write_multiple_coils(&self, address: u16, values: &[bool]) -> ModbusResult<()> {
        write_span(&self.coils, address, values)
    }

    /// Read discrete inputs
    pub fn read_discrete_inputs(&self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        read_span(&self.discrete_inputs, address, quantity)
    }

    /// Read holding registers
    pub fn read_holding_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        read_span(&self.holding_registers, address, quantity)
    }

    /// Write single holding register
    pub fn write_single_register(&self, address: u16, value: u16) -> ModbusResult<()> {
        write_one(&self.holding_registers, address, value)
    }

    /// Write multiple holding registers
    pub fn write_multiple_registers(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        write_span(&self.holding_registers, address, values)
    }

    /// Read input registers
    pub fn read_input_registers(&self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        read_span(&self.input_registers, address, quantity)
    }

    /// Set input register value (host-driven, e.g. sensor simulation)
    pub fn set_input_register(&self, address: u16, value: u16) -> ModbusResult<()> {
        write_one(&self.input_registers, address, value)
    }

    /// Set discrete input value (host-driven)
    pub fn set_discrete_input(&self, address: u16, value: bool) -> ModbusResult<()> {
        write_one(&self.discrete_inputs, address, value)
    }

    /// Build a [`ServerModel`] whose read and write callbacks are backed
    /// by this bank.
    ///
    /// The mask-write and multi-write operations are intentionally left
    /// unwired: the server emulates them through the single-element
    /// callbacks, so a bank-backed model exercises the same paths a
    /// minimal user model would.
    pub fn model(self: Arc<Self>, unit_id: u8) -> ServerModel {
        let bank = self;
        let b = bank.clone();
        let model = ServerModel::new(unit_id).on_read_coils(move |address, quantity| {
            let b = b.clone();
            async move { b.read_coils(address, quantity) }
        });

        let b = bank.clone();
        let model = model.on_read_discrete_inputs(move |address, quantity| {
            let b = b.clone();
            async move { b.read_discrete_inputs(address, quantity) }
        });

        let b = bank.clone();
        let model = model.on_read_holding_registers(move |address, quantity| {
            let b = b.clone();
            async move { b.read_holding_registers(address, quantity) }
        });

        let b = bank.clone();
        let model = model.on_read_input_registers(move |address, quantity| {
            let b = b.clone();
            async move { b.read_input_registers(address, quantity) }
        });

        let b = bank.clone();
        let model = model.on_write_single_coil(move |address, value| {
            let b = b.clone();
            async move { b.write_single_coil(address, value) }
        });

        let b = bank.clone();
        let model = model.on_write_single_register(move |address, value| {
            let b = b.clone();
            async move { b.write_single_register(address, value) }
        });

        model
    }
}

impl Default for ModbusRegisterBank {
    fn default() -> Self {
        Self::new()
    }
}
