/// Function-code handlers
///
/// Every handler follows the same contract: verify the PDU grammar
/// (malformed requests are dropped without a response), verify the model
/// implements the operation (ILLEGAL_FUNCTION), verify count and value
/// bounds (ILLEGAL_DATA_VALUE), verify the permitted address ranges
/// (ILLEGAL_DATA_ADDRESS), then invoke the model callbacks and encode the
/// response. Callback rejections map to exception codes through
/// [`exception_for`].
use futures::future::join_all;
use log::debug;
use std::collections::BTreeMap;

use crate::error::ModbusResult;
use crate::model::{
    exception_for, MaskWriteFn, ReadRegistersFn, ServerModel, WriteBitFn, WriteBitsFn,
    WriteRegisterFn, WriteRegistersFn,
};
use crate::protocol::{data_utils, Adu, ModbusException, ModbusFunction, EXCEPTION_FLAG};

/// Largest value length a device-identification object may carry
const MAX_OBJECT_LEN: usize = 245;

/// Outcome of one handler evaluation
enum Reply {
    /// Normal response payload
    Normal(Vec<u8>),
    /// Exception response with this code
    Except(ModbusException),
    /// Malformed request; no response at all
    Drop,
}

/// Which bit-addressed data space a request touches
#[derive(Clone, Copy)]
enum BitSpace {
    Coils,
    DiscreteInputs,
}

/// Which register-addressed data space a request touches
#[derive(Clone, Copy)]
enum RegisterSpace {
    Holding,
    Input,
}

/// Strategy for a multi-coil write: the dedicated callback, or emulation
/// through per-element single writes
enum BitWriter {
    Multi(WriteBitsFn),
    PerElement(WriteBitFn),
}

enum RegisterWriter {
    Multi(WriteRegistersFn),
    PerElement(WriteRegisterFn),
}

/// Strategy for mask-write: the dedicated callback, or a read-modify-write
/// through the holding-register callbacks
enum MaskWriter {
    Direct(MaskWriteFn),
    ReadModifyWrite(ReadRegistersFn, WriteRegisterFn),
}

/// Evaluate one request against one model.
///
/// Returns the response function code and payload, or `None` when no
/// response must be sent. The caller decides whether the response ever
/// reaches the wire (it never does for broadcasts).
pub(crate) async fn handle_function(model: ServerModel, adu: Adu) -> Option<(u8, Vec<u8>)> {
    // The interceptor short-circuits the function-code dispatch.
    if let Some(interceptor) = model.interceptor.clone() {
        match interceptor(adu.function, adu.data.to_vec()).await {
            Ok(Some(payload)) => return Some((adu.function, payload)),
            Ok(None) => {}
            Err(err) => return Some(exception(adu.function, exception_for(&err))),
        }
    }

    let data = adu.data.as_ref();
    let reply = match ModbusFunction::from_u8(adu.function) {
        Ok(ModbusFunction::ReadCoils) => read_bits(&model, data, BitSpace::Coils).await,
        Ok(ModbusFunction::ReadDiscreteInputs) => {
            read_bits(&model, data, BitSpace::DiscreteInputs).await
        }
        Ok(ModbusFunction::ReadHoldingRegisters) => {
            read_registers(&model, data, RegisterSpace::Holding).await
        }
        Ok(ModbusFunction::ReadInputRegisters) => {
            read_registers(&model, data, RegisterSpace::Input).await
        }
        Ok(ModbusFunction::WriteSingleCoil) => write_single_coil(&model, data).await,
        Ok(ModbusFunction::WriteSingleRegister) => write_single_register(&model, data).await,
        Ok(ModbusFunction::WriteMultipleCoils) => write_multiple_coils(&model, data).await,
        Ok(ModbusFunction::WriteMultipleRegisters) => write_multiple_registers(&model, data).await,
        Ok(ModbusFunction::ReportServerId) => report_server_id(&model, data).await,
        Ok(ModbusFunction::MaskWriteRegister) => mask_write_register(&model, data).await,
        Ok(ModbusFunction::ReadWriteMultipleRegisters) => {
            read_write_registers(&model, data).await
        }
        Ok(ModbusFunction::EncapsulatedInterface) => device_identification(&model, data).await,
        Err(_) => Reply::Except(ModbusException::IllegalFunction),
    };

    match reply {
        Reply::Normal(payload) => Some((adu.function, payload)),
        Reply::Except(code) => Some(exception(adu.function, code)),
        Reply::Drop => {
            debug!(
                "dropping malformed request: unit={} function=0x{:02X}",
                adu.unit_id, adu.function
            );
            None
        }
    }
}

fn exception(function: u8, code: ModbusException) -> (u8, Vec<u8>) {
    (function | EXCEPTION_FLAG, vec![code.to_u8()])
}

fn first_error(results: Vec<ModbusResult<()>>) -> ModbusResult<()> {
    for result in results {
        result?;
    }
    Ok(())
}

/// FC 0x01 / 0x02
async fn read_bits(model: &ServerModel, data: &[u8], space: BitSpace) -> Reply {
    if data.len() != 4 {
        return Reply::Drop;
    }
    let address = u16::from_be_bytes([data[0], data[1]]);
    let count = u16::from_be_bytes([data[2], data[3]]);

    let callback = match space {
        BitSpace::Coils => model.read_coils.clone(),
        BitSpace::DiscreteInputs => model.read_discrete_inputs.clone(),
    };
    let Some(callback) = callback else {
        return Reply::Except(ModbusException::IllegalFunction);
    };
    if count == 0 || count > 2000 {
        return Reply::Except(ModbusException::IllegalDataValue);
    }
    let permitted = match space {
        BitSpace::Coils => model.address_ranges.permits_coils(address, count),
        BitSpace::DiscreteInputs => model.address_ranges.permits_discrete_inputs(address, count),
    };
    if !permitted {
        return Reply::Except(ModbusException::IllegalDataAddress);
    }

    match callback(address, count).await {
        Err(err) => Reply::Except(exception_for(&err)),
        Ok(mut bits) => {
            bits.resize(count as usize, false);
            let packed = data_utils::pack_bits(&bits);
            let mut payload = Vec::with_capacity(1 + packed.len());
            payload.push(packed.len() as u8);
            payload.extend_from_slice(&packed);
            Reply::Normal(payload)
        }
    }
}

/// FC 0x03 / 0x04
async fn read_registers(model: &ServerModel, data: &[u8], space: RegisterSpace) -> Reply {
    if data.len() != 4 {
        return Reply::Drop;
    }
    let address = u16::from_be_bytes([data[0], data[1]]);
    let count = u16::from_be_bytes([data[2], data[3]]);

    let callback = match space {
        RegisterSpace::Holding => model.read_holding_registers.clone(),
        RegisterSpace::Input => model.read_input_registers.clone(),
    };
    let Some(callback) = callback else {
        return Reply::Except(ModbusException::IllegalFunction);
    };
    if count == 0 || count > 125 {
        return Reply::Except(ModbusException::IllegalDataValue);
    }
    let permitted = match space {
        RegisterSpace::Holding => model.address_ranges.permits_holding_registers(address, count),
        RegisterSpace::Input => model.address_ranges.permits_input_registers(address, count),
    };
    if !permitted {
        return Reply::Except(ModbusException::IllegalDataAddress);
    }

    match callback(address, count).await {
        Err(err) => Reply::Except(exception_for(&err)),
        Ok(mut registers) => {
            registers.resize(count as usize, 0);
            let mut payload = Vec::with_capacity(1 + registers.len() * 2);
            payload.push((registers.len() * 2) as u8);
            payload.extend_from_slice(&data_utils::registers_to_bytes(&registers));
            Reply::Normal(payload)
        }
    }
}

/// FC 0x05
async fn write_single_coil(model: &ServerModel, data: &[u8]) -> Reply {
    if data.len() != 4 {
        return Reply::Drop;
    }
    let address = u16::from_be_bytes([data[0], data[1]]);
    let value = u16::from_be_bytes([data[2], data[3]]);

    let Some(callback) = model.write_single_coil.clone() else {
        return Reply::Except(ModbusException::IllegalFunction);
    };
    if value != 0x0000 && value != 0xFF00 {
        return Reply::Except(ModbusException::IllegalDataValue);
    }
    if !model.address_ranges.permits_coils(address, 1) {
        return Reply::Except(ModbusException::IllegalDataAddress);
    }

    match callback(address, value == 0xFF00).await {
        Err(err) => Reply::Except(exception_for(&err)),
        Ok(()) => Reply::Normal(data.to_vec()),
    }
}

/// FC 0x06
async fn write_single_register(model: &ServerModel, data: &[u8]) -> Reply {
    if data.len() != 4 {
        return Reply::Drop;
    }
    let address = u16::from_be_bytes([data[0], data[1]]);
    let value = u16::from_be_bytes([data[2], data[3]]);

    let Some(callback) = model.write_single_register.clone() else {
        return Reply::Except(ModbusException::IllegalFunction);
    };
    if !model.address_ranges.permits_holding_registers(address, 1) {
        return Reply::Except(ModbusException::IllegalDataAddress);
    }

    match callback(address, value).await {
        Err(err) => Reply::Except(exception_for(&err)),
        Ok(()) => Reply::Normal(data.to_vec()),
    }
}

/// FC 0x0F
async fn write_multiple_coils(model: &ServerModel, data: &[u8]) -> Reply {
    if data.len() < 5 {
        return Reply::Drop;
    }
    let address = u16::from_be_bytes([data[0], data[1]]);
    let count = u16::from_be_bytes([data[2], data[3]]);
    let byte_count = data[4] as usize;
    if data.len() != 5 + byte_count {
        return Reply::Drop;
    }

    let writer = if let Some(multi) = model.write_multiple_coils.clone() {
        BitWriter::Multi(multi)
    } else if let Some(single) = model.write_single_coil.clone() {
        BitWriter::PerElement(single)
    } else {
        return Reply::Except(ModbusException::IllegalFunction);
    };
    if count == 0 || count > 1968 || byte_count != (count as usize + 7) / 8 {
        return Reply::Except(ModbusException::IllegalDataValue);
    }
    if !model.address_ranges.permits_coils(address, count) {
        return Reply::Except(ModbusException::IllegalDataAddress);
    }

    let bits = data_utils::unpack_bits(&data[5..], count as usize);
    let result = match writer {
        BitWriter::Multi(multi) => multi(address, bits).await,
        BitWriter::PerElement(single) => {
            // Element writes run concurrently; the first failure in
            // request order fails the whole operation.
            let writes: Vec<_> = bits
                .iter()
                .enumerate()
                .map(|(offset, &bit)| single(address.wrapping_add(offset as u16), bit))
                .collect();
            first_error(join_all(writes).await)
        }
    };
    match result {
        Err(err) => Reply::Except(exception_for(&err)),
        Ok(()) => Reply::Normal(data[..4].to_vec()),
    }
}

/// FC 0x10
async fn write_multiple_registers(model: &ServerModel, data: &[u8]) -> Reply {
    if data.len() < 5 {
        return Reply::Drop;
    }
    let address = u16::from_be_bytes([data[0], data[1]]);
    let count = u16::from_be_bytes([data[2], data[3]]);
    let byte_count = data[4] as usize;
    if data.len() != 5 + byte_count {
        return Reply::Drop;
    }

    let writer = if let Some(multi) = model.write_multiple_registers.clone() {
        RegisterWriter::Multi(multi)
    } else if let Some(single) = model.write_single_register.clone() {
        RegisterWriter::PerElement(single)
    } else {
        return Reply::Except(ModbusException::IllegalFunction);
    };
    if count == 0 || count > 123 || byte_count != count as usize * 2 {
        return Reply::Except(ModbusException::IllegalDataValue);
    }
    if !model.address_ranges.permits_holding_registers(address, count) {
        return Reply::Except(ModbusException::IllegalDataAddress);
    }

    let Ok(values) = data_utils::bytes_to_registers(&data[5..]) else {
        return Reply::Drop;
    };
    let result = write_register_span(writer, address, values).await;
    match result {
        Err(err) => Reply::Except(exception_for(&err)),
        Ok(()) => Reply::Normal(data[..4].to_vec()),
    }
}

async fn write_register_span(
    writer: RegisterWriter,
    address: u16,
    values: Vec<u16>,
) -> ModbusResult<()> {
    match writer {
        RegisterWriter::Multi(multi) => multi(address, values).await,
        RegisterWriter::PerElement(single) => {
            let writes: Vec<_> = values
                .iter()
                .enumerate()
                .map(|(offset, &value)| single(address.wrapping_add(offset as u16), value))
                .collect();
            first_error(join_all(writes).await)
        }
    }
}

/// FC 0x11
async fn report_server_id(model: &ServerModel, data: &[u8]) -> Reply {
    if !data.is_empty() {
        return Reply::Drop;
    }
    let Some(callback) = model.report_server_id.clone() else {
        return Reply::Except(ModbusException::IllegalFunction);
    };

    match callback().await {
        Err(err) => Reply::Except(exception_for(&err)),
        Ok(identity) => {
            let byte_count = 2 + identity.additional.len();
            if byte_count > u8::MAX as usize {
                return Reply::Except(ModbusException::ServerDeviceFailure);
            }
            let mut payload = Vec::with_capacity(1 + byte_count);
            payload.push(byte_count as u8);
            payload.push(identity.server_id);
            payload.push(if identity.running { 0xFF } else { 0x00 });
            payload.extend_from_slice(&identity.additional);
            Reply::Normal(payload)
        }
    }
}

/// FC 0x16
async fn mask_write_register(model: &ServerModel, data: &[u8]) -> Reply {
    if data.len() != 6 {
        return Reply::Drop;
    }
    let address = u16::from_be_bytes([data[0], data[1]]);
    let and_mask = u16::from_be_bytes([data[2], data[3]]);
    let or_mask = u16::from_be_bytes([data[4], data[5]]);

    let writer = if let Some(direct) = model.mask_write_register.clone() {
        MaskWriter::Direct(direct)
    } else if let (Some(read), Some(write)) = (
        model.read_holding_registers.clone(),
        model.write_single_register.clone(),
    ) {
        MaskWriter::ReadModifyWrite(read, write)
    } else {
        return Reply::Except(ModbusException::IllegalFunction);
    };
    if !model.address_ranges.permits_holding_registers(address, 1) {
        return Reply::Except(ModbusException::IllegalDataAddress);
    }

    let result = match writer {
        MaskWriter::Direct(direct) => direct(address, and_mask, or_mask).await,
        MaskWriter::ReadModifyWrite(read, write) => match read(address, 1).await {
            Err(err) => Err(err),
            Ok(values) => {
                let current = values.first().copied().unwrap_or(0);
                let updated = (current & and_mask) | (or_mask & !and_mask);
                write(address, updated).await
            }
        },
    };
    match result {
        Err(err) => Reply::Except(exception_for(&err)),
        Ok(()) => Reply::Normal(data.to_vec()),
    }
}

/// FC 0x17: write first, then read back
async fn read_write_registers(model: &ServerModel, data: &[u8]) -> Reply {
    if data.len() < 9 {
        return Reply::Drop;
    }
    let read_address = u16::from_be_bytes([data[0], data[1]]);
    let read_count = u16::from_be_bytes([data[2], data[3]]);
    let write_address = u16::from_be_bytes([data[4], data[5]]);
    let write_count = u16::from_be_bytes([data[6], data[7]]);
    let byte_count = data[8] as usize;
    if data.len() != 9 + byte_count {
        return Reply::Drop;
    }

    let Some(read) = model.read_holding_registers.clone() else {
        return Reply::Except(ModbusException::IllegalFunction);
    };
    let writer = if let Some(multi) = model.write_multiple_registers.clone() {
        RegisterWriter::Multi(multi)
    } else if let Some(single) = model.write_single_register.clone() {
        RegisterWriter::PerElement(single)
    } else {
        return Reply::Except(ModbusException::IllegalFunction);
    };
    if read_count == 0
        || read_count > 125
        || write_count == 0
        || write_count > 121
        || byte_count != write_count as usize * 2
    {
        return Reply::Except(ModbusException::IllegalDataValue);
    }
    if !model
        .address_ranges
        .permits_holding_registers(read_address, read_count)
        || !model
            .address_ranges
            .permits_holding_registers(write_address, write_count)
    {
        return Reply::Except(ModbusException::IllegalDataAddress);
    }

    let Ok(values) = data_utils::bytes_to_registers(&data[9..]) else {
        return Reply::Drop;
    };
    if let Err(err) = write_register_span(writer, write_address, values).await {
        return Reply::Except(exception_for(&err));
    }
    match read(read_address, read_count).await {
        Err(err) => Reply::Except(exception_for(&err)),
        Ok(mut registers) => {
            registers.resize(read_count as usize, 0);
            let mut payload = Vec::with_capacity(1 + registers.len() * 2);
            payload.push((registers.len() * 2) as u8);
            payload.extend_from_slice(&data_utils::registers_to_bytes(&registers));
            Reply::Normal(payload)
        }
    }
}

/// FC 0x2B / MEI 0x0E: Read Device Identification
async fn device_identification(model: &ServerModel, data: &[u8]) -> Reply {
    if data.len() != 3 {
        return Reply::Drop;
    }
    if data[0] != 0x0E {
        // Another encapsulated interface; not provided here.
        return Reply::Except(ModbusException::IllegalFunction);
    }
    let read_code = data[1];
    let requested = data[2];

    let Some(callback) = model.read_device_identification.clone() else {
        return Reply::Except(ModbusException::IllegalFunction);
    };
    if !(0x01..=0x04).contains(&read_code) {
        return Reply::Except(ModbusException::IllegalDataValue);
    }

    let supplied = match callback().await {
        Err(err) => return Reply::Except(exception_for(&err)),
        Ok(map) => map,
    };

    // The three basic objects always exist.
    let mut objects: BTreeMap<u8, String> = BTreeMap::new();
    for id in 0x00..=0x02u8 {
        objects.insert(id, "null".to_string());
    }
    objects.extend(supplied);

    let reserved = |id: u8| (0x07..=0x7F).contains(&id);
    let mut object_id = requested;
    match read_code {
        0x01 => {
            if object_id > 0x02 || reserved(object_id) {
                object_id = 0x00;
            }
        }
        0x02 => {
            if object_id >= 0x80 || reserved(object_id) {
                object_id = 0x00;
            }
        }
        0x03 => {
            if reserved(object_id) {
                object_id = 0x00;
            }
        }
        _ => {
            // Individual access to a reserved id is an addressing error.
            if reserved(object_id) {
                return Reply::Except(ModbusException::IllegalDataAddress);
            }
        }
    }
    if !objects.contains_key(&object_id) {
        if read_code == 0x04 {
            return Reply::Except(ModbusException::IllegalDataAddress);
        }
        object_id = 0x00;
    }

    let conformity = match objects.keys().max() {
        Some(&id) if id > 0x80 => 0x83,
        Some(&id) if id > 0x02 => 0x82,
        _ => 0x81,
    };

    // Pack ascending ids into the 253-byte frame budget; the first id
    // that no longer fits becomes the continuation point.
    let mut running_len = 10usize;
    let mut last_id = 0u8;
    let mut chosen: Vec<u8> = Vec::new();
    for (&id, value) in &objects {
        if id < object_id {
            continue;
        }
        let value_len = value.len();
        if value_len > MAX_OBJECT_LEN {
            return Reply::Except(ModbusException::ServerDeviceFailure);
        }
        if value_len + 2 <= 253 - running_len {
            chosen.push(id);
            running_len += 2 + value_len;
            if read_code == 0x04 {
                break;
            }
        } else {
            last_id = id;
            break;
        }
    }

    let mut payload = vec![
        0x0E,
        read_code,
        conformity,
        if last_id == 0 { 0x00 } else { 0xFF },
        last_id,
        chosen.len() as u8,
    ];
    for id in &chosen {
        let value = &objects[id];
        payload.push(*id);
        payload.push(value.len() as u8);
        payload.extend_from_slice(value.as_bytes());
    }
    Reply::Normal(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModbusError;
    use crate::model::{AddressRanges, RangeList, ServerIdentity};
    use crate::register_bank::ModbusRegisterBank;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn request(unit_id: u8, function: u8, data: &[u8]) -> Adu {
        Adu::request(unit_id, function, data.to_vec())
    }

    async fn run(model: ServerModel, function: u8, data: &[u8]) -> Option<(u8, Vec<u8>)> {
        handle_function(model, request(0x11, function, data)).await
    }

    #[tokio::test]
    async fn test_unimplemented_function_synthesizes_illegal_function() {
        let model = ServerModel::new(0x11).on_read_coils(|_, _| async { Ok(vec![true]) });
        let response = run(model, 0x03, &[0x00, 0x00, 0x00, 0x01]).await.unwrap();
        assert_eq!(response, (0x83, vec![0x01]));
    }

    #[tokio::test]
    async fn test_unknown_function_synthesizes_illegal_function() {
        let model = ServerModel::new(0x11);
        let response = run(model, 0x07, &[]).await.unwrap();
        assert_eq!(response, (0x87, vec![0x01]));
    }

    #[tokio::test]
    async fn test_malformed_grammar_is_dropped() {
        let model = ServerModel::new(0x11).on_read_coils(|_, _| async { Ok(vec![true]) });
        assert!(run(model.clone(), 0x01, &[0x00, 0x00, 0x00]).await.is_none());
        assert!(run(model, 0x01, &[0x00, 0x00, 0x00, 0x01, 0xFF])
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_read_coils_packs_bits() {
        let pattern = data_utils::unpack_bits(&[0xCD, 0x6B, 0x05], 19);
        let model = ServerModel::new(0x0B).on_read_coils(move |_, quantity| {
            let pattern = pattern.clone();
            async move { Ok(pattern[..quantity as usize].to_vec()) }
        });
        let (function, payload) = run(model, 0x01, &[0x00, 0x13, 0x00, 0x13]).await.unwrap();
        assert_eq!(function, 0x01);
        assert_eq!(payload, vec![0x03, 0xCD, 0x6B, 0x05]);
    }

    #[tokio::test]
    async fn test_count_bounds_are_illegal_data_value() {
        let model = ServerModel::new(0x11)
            .on_read_holding_registers(|_, quantity| async move { Ok(vec![0; quantity as usize]) });
        let response = run(model.clone(), 0x03, &[0x00, 0x00, 0x00, 0xC8])
            .await
            .unwrap();
        assert_eq!(response, (0x83, vec![0x03]));
        let response = run(model, 0x03, &[0x00, 0x00, 0x00, 0x00]).await.unwrap();
        assert_eq!(response, (0x83, vec![0x03]));
    }

    #[tokio::test]
    async fn test_address_range_enforcement() {
        let ranges = AddressRanges {
            holding_registers: Some(RangeList::single(0, 9).unwrap()),
            ..Default::default()
        };
        let model = ServerModel::new(0x11)
            .on_read_holding_registers(|_, quantity| async move { Ok(vec![0; quantity as usize]) })
            .with_address_ranges(ranges);

        let ok = run(model.clone(), 0x03, &[0x00, 0x00, 0x00, 0x0A])
            .await
            .unwrap();
        assert_eq!(ok.0, 0x03);

        let out_of_range = run(model, 0x03, &[0x00, 0x05, 0x00, 0x0A]).await.unwrap();
        assert_eq!(out_of_range, (0x83, vec![0x02]));
    }

    #[tokio::test]
    async fn test_write_single_coil_value_domain() {
        let model = ServerModel::new(0x11).on_write_single_coil(|_, _| async { Ok(()) });
        let echo = run(model.clone(), 0x05, &[0x00, 0x01, 0xFF, 0x00])
            .await
            .unwrap();
        assert_eq!(echo, (0x05, vec![0x00, 0x01, 0xFF, 0x00]));

        let bad = run(model, 0x05, &[0x00, 0x01, 0x12, 0x34]).await.unwrap();
        assert_eq!(bad, (0x85, vec![0x03]));
    }

    #[tokio::test]
    async fn test_multi_register_write_emulated_per_element() {
        let bank = Arc::new(ModbusRegisterBank::new());
        let model = bank.clone().model(0x11);
        assert!(model.write_multiple_registers.is_none());

        let (function, payload) = run(
            model,
            0x10,
            &[0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02],
        )
        .await
        .unwrap();
        assert_eq!(function, 0x10);
        assert_eq!(payload, vec![0x00, 0x01, 0x00, 0x02]);
        assert_eq!(
            bank.read_holding_registers(1, 2).unwrap(),
            vec![0x000A, 0x0102]
        );
    }

    #[tokio::test]
    async fn test_multi_coil_write_emulated_per_element() {
        let bank = Arc::new(ModbusRegisterBank::new());
        let model = bank.clone().model(0x11);

        let (function, payload) = run(model, 0x0F, &[0x00, 0x10, 0x00, 0x03, 0x01, 0b0000_0101])
            .await
            .unwrap();
        assert_eq!(function, 0x0F);
        assert_eq!(payload, vec![0x00, 0x10, 0x00, 0x03]);
        assert_eq!(bank.read_coils(16, 3).unwrap(), vec![true, false, true]);
    }

    #[tokio::test]
    async fn test_emulated_write_fails_with_first_error() {
        let model = ServerModel::new(0x11).on_write_single_register(|address, _| async move {
            if address >= 2 {
                Err(ModbusError::invalid_address(address, 1))
            } else {
                Ok(())
            }
        });
        let response = run(
            model,
            0x10,
            &[0x00, 0x00, 0x00, 0x03, 0x06, 0x00, 0x01, 0x00, 0x02, 0x00, 0x03],
        )
        .await
        .unwrap();
        assert_eq!(response, (0x90, vec![0x02]));
    }

    #[tokio::test]
    async fn test_mask_write_fallback_matches_primary() {
        // Standard mask-write example: current 0x12, AND 0xF2, OR 0x25.
        let bank = Arc::new(ModbusRegisterBank::new());
        bank.write_single_register(4, 0x0012).unwrap();
        let fallback_model = bank.clone().model(0x11);

        let data = [0x00, 0x04, 0x00, 0xF2, 0x00, 0x25];
        let echo = run(fallback_model, 0x16, &data).await.unwrap();
        assert_eq!(echo, (0x16, data.to_vec()));
        assert_eq!(bank.read_holding_registers(4, 1).unwrap(), vec![0x0017]);

        // The dedicated callback path computes the same value.
        let direct_bank = Arc::new(ModbusRegisterBank::new());
        direct_bank.write_single_register(4, 0x0012).unwrap();
        let b = direct_bank.clone();
        let direct_model =
            ServerModel::new(0x11).on_mask_write_register(move |address, and_mask, or_mask| {
                let b = b.clone();
                async move {
                    let current = b.read_holding_registers(address, 1)?[0];
                    b.write_single_register(address, (current & and_mask) | (or_mask & !and_mask))
                }
            });
        run(direct_model, 0x16, &data).await.unwrap();
        assert_eq!(
            direct_bank.read_holding_registers(4, 1).unwrap(),
            bank.read_holding_registers(4, 1).unwrap()
        );
    }

    #[tokio::test]
    async fn test_mask_write_uses_full_width_complement() {
        // High mask bits must survive the complement.
        let bank = Arc::new(ModbusRegisterBank::new());
        bank.write_single_register(0, 0xABCD).unwrap();
        let model = bank.clone().model(0x11);

        // AND 0x00FF keeps the low byte, OR 0x4000 sets bit 14.
        run(model, 0x16, &[0x00, 0x00, 0x00, 0xFF, 0x40, 0x00])
            .await
            .unwrap();
        assert_eq!(bank.read_holding_registers(0, 1).unwrap(), vec![0x40CD]);
    }

    #[tokio::test]
    async fn test_read_write_registers_writes_before_reading() {
        let bank = Arc::new(ModbusRegisterBank::new());
        let model = bank.clone().model(0x11);

        // Read 2 from 0x0010, write [0xBEEF] to 0x0010: the read sees the
        // freshly written value.
        let (function, payload) = run(
            model,
            0x17,
            &[0x00, 0x10, 0x00, 0x02, 0x00, 0x10, 0x00, 0x01, 0x02, 0xBE, 0xEF],
        )
        .await
        .unwrap();
        assert_eq!(function, 0x17);
        assert_eq!(payload, vec![0x04, 0xBE, 0xEF, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_report_server_id_payload() {
        let model = ServerModel::new(0x11).on_report_server_id(|| async {
            Ok(ServerIdentity {
                server_id: 0x42,
                running: true,
                additional: vec![0xDE, 0xAD],
            })
        });
        let (function, payload) = run(model, 0x11, &[]).await.unwrap();
        assert_eq!(function, 0x11);
        assert_eq!(payload, vec![0x04, 0x42, 0xFF, 0xDE, 0xAD]);
    }

    #[tokio::test]
    async fn test_device_identification_basic_defaults() {
        let model =
            ServerModel::new(0x11).on_read_device_identification(|| async { Ok(HashMap::new()) });
        let (function, payload) = run(model, 0x2B, &[0x0E, 0x01, 0x00]).await.unwrap();
        assert_eq!(function, 0x2B);
        let mut expected = vec![0x0E, 0x01, 0x81, 0x00, 0x00, 0x03];
        for id in 0..3u8 {
            expected.push(id);
            expected.push(4);
            expected.extend_from_slice(b"null");
        }
        assert_eq!(payload, expected);
    }

    #[tokio::test]
    async fn test_device_identification_individual_access() {
        let model = ServerModel::new(0x11).on_read_device_identification(|| async {
            Ok(HashMap::from([(0x01u8, "voltage".to_string())]))
        });
        let (_, payload) = run(model.clone(), 0x2B, &[0x0E, 0x04, 0x01]).await.unwrap();
        assert_eq!(payload[5], 1); // exactly one object
        assert_eq!(payload[6], 0x01);
        assert_eq!(&payload[8..], b"voltage");

        // Reserved ids are an addressing error for individual access.
        let response = run(model.clone(), 0x2B, &[0x0E, 0x04, 0x10]).await.unwrap();
        assert_eq!(response, (0xAB, vec![0x02]));

        // Absent ids too.
        let response = run(model, 0x2B, &[0x0E, 0x04, 0x05]).await.unwrap();
        assert_eq!(response, (0xAB, vec![0x02]));
    }

    #[tokio::test]
    async fn test_device_identification_invalid_read_code() {
        let model =
            ServerModel::new(0x11).on_read_device_identification(|| async { Ok(HashMap::new()) });
        let response = run(model, 0x2B, &[0x0E, 0x05, 0x00]).await.unwrap();
        assert_eq!(response, (0xAB, vec![0x03]));
    }

    #[tokio::test]
    async fn test_device_identification_continuation() {
        // Three large extended objects exceed the frame budget; the
        // response must flag more-follows and name the resume id.
        let model = ServerModel::new(0x11).on_read_device_identification(|| async {
            Ok(HashMap::from([
                (0x03u8, "a".repeat(100)),
                (0x04u8, "b".repeat(100)),
                (0x05u8, "c".repeat(100)),
            ]))
        });
        let (_, payload) = run(model.clone(), 0x2B, &[0x0E, 0x03, 0x00]).await.unwrap();
        assert_eq!(payload[2], 0x82); // conformity: extended ids present
        assert_eq!(payload[3], 0xFF); // more follows
        assert_eq!(payload[4], 0x05); // resume here
        assert_eq!(payload[5], 5); // 0x00..0x04 made it in

        // Resuming from the continuation id returns the tail.
        let (_, payload) = run(model, 0x2B, &[0x0E, 0x03, 0x05]).await.unwrap();
        assert_eq!(payload[3], 0x00);
        assert_eq!(payload[4], 0x00);
        assert_eq!(payload[5], 1);
        assert_eq!(payload[6], 0x05);
    }

    #[tokio::test]
    async fn test_device_identification_oversized_object() {
        let model = ServerModel::new(0x11).on_read_device_identification(|| async {
            Ok(HashMap::from([(0x03u8, "x".repeat(246))]))
        });
        let response = run(model, 0x2B, &[0x0E, 0x02, 0x00]).await.unwrap();
        assert_eq!(response, (0xAB, vec![0x04]));
    }

    #[tokio::test]
    async fn test_interceptor_short_circuits_dispatch() {
        let model = ServerModel::new(0x11)
            .on_intercept(|function, _| async move {
                if function == 0x03 {
                    Ok(Some(vec![0x02, 0xAA, 0xBB]))
                } else {
                    Ok(None)
                }
            })
            .on_read_coils(|_, _| async { Ok(vec![true]) });

        // Intercepted: the handler never runs.
        let response = run(model.clone(), 0x03, &[0x00, 0x00, 0x00, 0x01])
            .await
            .unwrap();
        assert_eq!(response, (0x03, vec![0x02, 0xAA, 0xBB]));

        // Not intercepted: falls through to the coil handler.
        let response = run(model, 0x01, &[0x00, 0x00, 0x00, 0x01]).await.unwrap();
        assert_eq!(response.0, 0x01);
    }

    #[tokio::test]
    async fn test_interceptor_error_becomes_exception() {
        let model = ServerModel::new(0x11)
            .on_intercept(|_, _| async { Err(ModbusException::ServerDeviceBusy.into()) });
        let response = run(model, 0x03, &[0x00, 0x00, 0x00, 0x01]).await.unwrap();
        assert_eq!(response, (0x83, vec![0x06]));
    }

    #[tokio::test]
    async fn test_callback_rejection_maps_to_exception() {
        let model = ServerModel::new(0x11)
            .on_read_holding_registers(|address, quantity| async move {
                Err(ModbusError::invalid_address(address, quantity))
            });
        let response = run(model, 0x03, &[0x00, 0x00, 0x00, 0x01]).await.unwrap();
        assert_eq!(response, (0x83, vec![0x02]));
    }
}
