/// High-level Modbus client (master)
///
/// One method per supported function code. Each request is encoded by the
/// configured framer, written to the transport, and correlated with its
/// response through the framer's response-wait mode: an ordered list of
/// pre-checks describes the only acceptable reply, which lets the RTU
/// variant distinguish "need more bytes" from "invalid response".
///
/// Broadcast requests (unit 0) complete as soon as the write flushes; no
/// response-wait is started and the method returns its neutral value.
///
/// A `&mut self` receiver keeps the single outstanding request invariant:
/// a second concurrent request on one client is unrepresentable.
use std::collections::BTreeMap;
use std::time::Duration;

use log::debug;
use tokio::time::{sleep_until, Instant};

use crate::codec::ascii::AsciiFramer;
use crate::codec::rtu::{FrameGap, RtuFramer};
use crate::codec::tcp::MbapFramer;
use crate::codec::{Check, Framer, FramerEvent, PreCheck};
use crate::error::{ModbusError, ModbusResult};
use crate::logging::CallbackLogger;
use crate::model::ServerIdentity;
use crate::protocol::{data_utils, Adu, ModbusFunction, BROADCAST_UNIT, EXCEPTION_FLAG};
use crate::transport::{ModbusTransport, TransportEvent};
use crate::utils::validation;

/// Default timeout for client requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);

/// Read Device Identification read codes (FC 0x2B / MEI 0x0E)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceIdCode {
    /// Basic object stream (0x00-0x02)
    Basic = 0x01,
    /// Regular object stream
    Regular = 0x02,
    /// Extended object stream
    Extended = 0x03,
    /// Individual object access
    Individual = 0x04,
}

/// Decoded Read Device Identification response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentification {
    pub conformity_level: u8,
    /// More objects exist than fit into this response
    pub more_follows: bool,
    /// Object id to resume from when `more_follows` is set
    pub next_object_id: u8,
    pub objects: BTreeMap<u8, String>,
}

/// Generic Modbus client over any transport and framing variant
pub struct ModbusClient<T: ModbusTransport> {
    transport: T,
    framer: Box<dyn Framer>,
    request_timeout: Duration,
    logger: CallbackLogger,
}

impl<T: ModbusTransport> ModbusClient<T> {
    /// Create a client with an explicit framer
    pub fn new(transport: T, framer: Box<dyn Framer>) -> Self {
        Self {
            transport,
            framer,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            logger: CallbackLogger::disabled(),
        }
    }

    /// RTU framing; the 3.5T gap is derived from the transport kind
    pub fn rtu(transport: T) -> Self {
        let kind = transport.kind();
        Self::new(transport, Box::new(RtuFramer::new(kind)))
    }

    /// RTU framing with an explicit inter-frame gap override
    pub fn rtu_with_gap(transport: T, gap: FrameGap) -> Self {
        let kind = transport.kind();
        Self::new(transport, Box::new(RtuFramer::with_gap(gap, kind)))
    }

    /// ASCII framing
    pub fn ascii(transport: T) -> Self {
        Self::new(transport, Box::new(AsciiFramer::new()))
    }

    /// MBAP framing for TCP or UDP transports
    pub fn tcp(transport: T) -> Self {
        Self::new(transport, Box::new(MbapFramer::new()))
    }

    /// Override the per-request timeout (default 1000 ms)
    pub fn set_request_timeout(&mut self, timeout: Duration) {
        self.request_timeout = timeout;
    }

    /// Route TX/RX packet traces into a host-supplied logger
    pub fn set_logger(&mut self, logger: CallbackLogger) {
        self.logger = logger;
    }

    pub async fn open(&mut self) -> ModbusResult<()> {
        self.transport.open().await
    }

    pub async fn close(&mut self) -> ModbusResult<()> {
        self.framer.reset();
        self.transport.close().await
    }

    pub async fn destroy(&mut self) -> ModbusResult<()> {
        self.framer.reset();
        self.transport.destroy().await
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn is_destroyed(&self) -> bool {
        self.transport.is_destroyed()
    }

    /// Read coils (function code 0x01)
    pub async fn read_coils(
        &mut self,
        unit_id: u8,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        validation::validate_bit_count(quantity)?;
        validation::validate_span(address, quantity)?;
        self.read_bits(unit_id, ModbusFunction::ReadCoils, address, quantity)
            .await
    }

    /// Read discrete inputs (function code 0x02)
    pub async fn read_discrete_inputs(
        &mut self,
        unit_id: u8,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        validation::validate_bit_count(quantity)?;
        validation::validate_span(address, quantity)?;
        self.read_bits(unit_id, ModbusFunction::ReadDiscreteInputs, address, quantity)
            .await
    }

    /// Read holding registers (function code 0x03)
    pub async fn read_holding_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        validation::validate_register_count(quantity)?;
        validation::validate_span(address, quantity)?;
        self.read_registers(unit_id, ModbusFunction::ReadHoldingRegisters, address, quantity)
            .await
    }

    /// Read input registers (function code 0x04)
    pub async fn read_input_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        validation::validate_register_count(quantity)?;
        validation::validate_span(address, quantity)?;
        self.read_registers(unit_id, ModbusFunction::ReadInputRegisters, address, quantity)
            .await
    }

    /// Write single coil (function code 0x05)
    pub async fn write_single_coil(
        &mut self,
        unit_id: u8,
        address: u16,
        value: bool,
    ) -> ModbusResult<()> {
        let function = ModbusFunction::WriteSingleCoil.to_u8();
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&address.to_be_bytes());
        data.extend_from_slice(if value { &[0xFF, 0x00] } else { &[0x00, 0x00] });

        let checks = vec![
            head_check(unit_id, function),
            exact_len(4),
            echo_prefix(data.clone()),
        ];
        self.transact(Adu::request(unit_id, function, data), checks)
            .await?;
        Ok(())
    }

    /// Write single register (function code 0x06)
    pub async fn write_single_register(
        &mut self,
        unit_id: u8,
        address: u16,
        value: u16,
    ) -> ModbusResult<()> {
        let function = ModbusFunction::WriteSingleRegister.to_u8();
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&address.to_be_bytes());
        data.extend_from_slice(&value.to_be_bytes());

        let checks = vec![
            head_check(unit_id, function),
            exact_len(4),
            echo_prefix(data.clone()),
        ];
        self.transact(Adu::request(unit_id, function, data), checks)
            .await?;
        Ok(())
    }

    /// Write multiple coils (function code 0x0F)
    pub async fn write_multiple_coils(
        &mut self,
        unit_id: u8,
        address: u16,
        values: &[bool],
    ) -> ModbusResult<()> {
        validation::validate_write_bit_count(values.len())?;
        validation::validate_span(address, values.len() as u16)?;

        let function = ModbusFunction::WriteMultipleCoils.to_u8();
        let packed = data_utils::pack_bits(values);
        let mut data = Vec::with_capacity(5 + packed.len());
        data.extend_from_slice(&address.to_be_bytes());
        data.extend_from_slice(&(values.len() as u16).to_be_bytes());
        data.push(packed.len() as u8);
        data.extend_from_slice(&packed);

        let checks = vec![
            head_check(unit_id, function),
            exact_len(4),
            echo_prefix(data[..4].to_vec()),
        ];
        self.transact(Adu::request(unit_id, function, data), checks)
            .await?;
        Ok(())
    }

    /// Write multiple registers (function code 0x10)
    pub async fn write_multiple_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        validation::validate_write_register_count(values.len())?;
        validation::validate_span(address, values.len() as u16)?;

        let function = ModbusFunction::WriteMultipleRegisters.to_u8();
        let bytes = data_utils::registers_to_bytes(values);
        let mut data = Vec::with_capacity(5 + bytes.len());
        data.extend_from_slice(&address.to_be_bytes());
        data.extend_from_slice(&(values.len() as u16).to_be_bytes());
        data.push(bytes.len() as u8);
        data.extend_from_slice(&bytes);

        let checks = vec![
            head_check(unit_id, function),
            exact_len(4),
            echo_prefix(data[..4].to_vec()),
        ];
        self.transact(Adu::request(unit_id, function, data), checks)
            .await?;
        Ok(())
    }

    /// Report server ID (function code 0x11)
    pub async fn report_server_id(&mut self, unit_id: u8) -> ModbusResult<ServerIdentity> {
        let function = ModbusFunction::ReportServerId.to_u8();
        let checks = vec![
            head_check(unit_id, function),
            Box::new(|adu: &Adu| {
                let Some(&byte_count) = adu.data.first() else {
                    return Check::Pending;
                };
                // server id + run indicator at minimum
                if byte_count < 2 {
                    return Check::Fail;
                }
                Check::DataLen(1 + byte_count as usize)
            }) as PreCheck,
        ];
        let Some(adu) = self
            .transact(Adu::request(unit_id, function, Vec::new()), checks)
            .await?
        else {
            return Ok(ServerIdentity::default());
        };
        Ok(ServerIdentity {
            server_id: adu.data[1],
            running: adu.data[2] == 0xFF,
            additional: adu.data[3..].to_vec(),
        })
    }

    /// Mask write register (function code 0x16)
    pub async fn mask_write_register(
        &mut self,
        unit_id: u8,
        address: u16,
        and_mask: u16,
        or_mask: u16,
    ) -> ModbusResult<()> {
        let function = ModbusFunction::MaskWriteRegister.to_u8();
        let mut data = Vec::with_capacity(6);
        data.extend_from_slice(&address.to_be_bytes());
        data.extend_from_slice(&and_mask.to_be_bytes());
        data.extend_from_slice(&or_mask.to_be_bytes());

        let checks = vec![
            head_check(unit_id, function),
            exact_len(6),
            echo_prefix(data.clone()),
        ];
        self.transact(Adu::request(unit_id, function, data), checks)
            .await?;
        Ok(())
    }

    /// Read/write multiple registers (function code 0x17). The write is
    /// performed before the read on the server; the returned registers
    /// are the post-write read.
    pub async fn read_write_multiple_registers(
        &mut self,
        unit_id: u8,
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        values: &[u16],
    ) -> ModbusResult<Vec<u16>> {
        validation::validate_register_count(read_quantity)?;
        validation::validate_rw_write_count(values.len())?;
        validation::validate_span(read_address, read_quantity)?;
        validation::validate_span(write_address, values.len() as u16)?;

        let function = ModbusFunction::ReadWriteMultipleRegisters.to_u8();
        let bytes = data_utils::registers_to_bytes(values);
        let mut data = Vec::with_capacity(9 + bytes.len());
        data.extend_from_slice(&read_address.to_be_bytes());
        data.extend_from_slice(&read_quantity.to_be_bytes());
        data.extend_from_slice(&write_address.to_be_bytes());
        data.extend_from_slice(&(values.len() as u16).to_be_bytes());
        data.push(bytes.len() as u8);
        data.extend_from_slice(&bytes);

        let expected = 1 + read_quantity as usize * 2;
        let checks = vec![
            head_check(unit_id, function),
            exact_len(expected),
            byte_count((read_quantity * 2) as u8),
        ];
        let Some(adu) = self
            .transact(Adu::request(unit_id, function, data), checks)
            .await?
        else {
            return Ok(Vec::new());
        };
        data_utils::bytes_to_registers(&adu.data[1..])
    }

    /// Read device identification (function code 0x2B, MEI type 0x0E)
    pub async fn read_device_identification(
        &mut self,
        unit_id: u8,
        read_code: DeviceIdCode,
        object_id: u8,
    ) -> ModbusResult<DeviceIdentification> {
        let function = ModbusFunction::EncapsulatedInterface.to_u8();
        let data = vec![0x0E, read_code as u8, object_id];

        let checks = vec![head_check(unit_id, function), object_walk(read_code as u8)];
        let Some(adu) = self
            .transact(Adu::request(unit_id, function, data), checks)
            .await?
        else {
            return Ok(DeviceIdentification::default());
        };

        let d = &adu.data;
        let mut objects = BTreeMap::new();
        let count = d[5] as usize;
        let mut pos = 6;
        for _ in 0..count {
            let id = d[pos];
            let len = d[pos + 1] as usize;
            let value = String::from_utf8_lossy(&d[pos + 2..pos + 2 + len]).into_owned();
            objects.insert(id, value);
            pos += 2 + len;
        }
        Ok(DeviceIdentification {
            conformity_level: d[2],
            more_follows: d[3] == 0xFF,
            next_object_id: d[4],
            objects,
        })
    }

    async fn read_bits(
        &mut self,
        unit_id: u8,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        let function = function.to_u8();
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&address.to_be_bytes());
        data.extend_from_slice(&quantity.to_be_bytes());

        let expected_bytes = (quantity as usize + 7) / 8;
        let checks = vec![
            head_check(unit_id, function),
            exact_len(1 + expected_bytes),
            byte_count(expected_bytes as u8),
        ];
        let Some(adu) = self
            .transact(Adu::request(unit_id, function, data), checks)
            .await?
        else {
            return Ok(Vec::new());
        };
        Ok(data_utils::unpack_bits(&adu.data[1..], quantity as usize))
    }

    async fn read_registers(
        &mut self,
        unit_id: u8,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        let function = function.to_u8();
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&address.to_be_bytes());
        data.extend_from_slice(&quantity.to_be_bytes());

        let checks = vec![
            head_check(unit_id, function),
            exact_len(1 + quantity as usize * 2),
            byte_count((quantity * 2) as u8),
        ];
        let Some(adu) = self
            .transact(Adu::request(unit_id, function, data), checks)
            .await?
        else {
            return Ok(Vec::new());
        };
        data_utils::bytes_to_registers(&adu.data[1..])
    }

    /// Issue one request. Returns `None` for broadcasts, which complete
    /// once the write has flushed.
    async fn transact(
        &mut self,
        request: Adu,
        checks: Vec<PreCheck>,
    ) -> ModbusResult<Option<Adu>> {
        let function = request.function;
        let frame = self.framer.encode(&request);
        self.logger.log_packet("TX", &frame);

        if request.unit_id == BROADCAST_UNIT {
            self.transport.write(frame).await?;
            debug!("broadcast function 0x{function:02X} written, no response awaited");
            return Ok(None);
        }

        self.framer.start_wait(checks)?;
        if let Err(err) = self.transport.write(frame).await {
            self.framer.stop_wait();
            return Err(err);
        }

        let deadline = Instant::now() + self.request_timeout;
        loop {
            let event = tokio::select! {
                event = self.transport.recv() => event,
                _ = sleep_until(deadline) => {
                    self.framer.stop_wait();
                    return Err(ModbusError::timeout(
                        format!("function 0x{function:02X}"),
                        self.request_timeout.as_millis() as u64,
                    ));
                }
            };
            match event {
                TransportEvent::Data { bytes, .. } => {
                    self.logger.log_packet("RX", &bytes);
                    for framed in self.framer.accept(&bytes) {
                        match framed {
                            FramerEvent::WaitComplete(adu) => {
                                self.framer.stop_wait();
                                self.logger.log_frame("RX", &adu);
                                if adu.is_exception() {
                                    let code = adu.exception_code().unwrap_or(0);
                                    return Err(ModbusError::exception(function, code));
                                }
                                return Ok(Some(adu));
                            }
                            FramerEvent::WaitFailed(err) => {
                                self.framer.stop_wait();
                                return Err(err);
                            }
                            FramerEvent::Frame(adu) => {
                                debug!("ignoring unsolicited frame from unit {}", adu.unit_id);
                            }
                        }
                    }
                }
                TransportEvent::Error(err) => {
                    self.framer.stop_wait();
                    return Err(err);
                }
                TransportEvent::Closed => {
                    self.framer.stop_wait();
                    self.framer.reset();
                    return Err(ModbusError::connection(
                        "connection closed while waiting for response",
                    ));
                }
            }
        }
    }
}

/// Head pre-check shared by every request: the response must come from
/// the addressed unit with the request's function code. An exception
/// frame (function | 0x80) is accepted once its single code byte is
/// present; the caller surfaces it as [`ModbusError::Exception`].
fn head_check(unit_id: u8, function: u8) -> PreCheck {
    Box::new(move |adu: &Adu| {
        if adu.unit_id != unit_id {
            return Check::Fail;
        }
        if adu.function == function {
            return Check::Pass;
        }
        if adu.function == function | EXCEPTION_FLAG {
            return match adu.data.len() {
                0 => Check::Pending,
                1 => Check::Accept,
                _ => Check::Fail,
            };
        }
        Check::Fail
    })
}

/// The PDU payload must be exactly this long
fn exact_len(expected: usize) -> PreCheck {
    Box::new(move |_| Check::DataLen(expected))
}

/// The first payload byte must carry this byte count
fn byte_count(expected: u8) -> PreCheck {
    Box::new(move |adu: &Adu| match adu.data.first() {
        None => Check::Pending,
        Some(&count) if count == expected => Check::Pass,
        Some(_) => Check::Fail,
    })
}

/// The payload must start with these bytes (echoed request)
fn echo_prefix(expected: Vec<u8>) -> PreCheck {
    Box::new(move |adu: &Adu| {
        if adu.data.len() < expected.len() {
            return Check::Pending;
        }
        if adu.data[..expected.len()] == expected[..] {
            Check::Pass
        } else {
            Check::Fail
        }
    })
}

/// Walk a device-identification object list and assert the cumulative
/// response length once the whole list is visible.
fn object_walk(read_code: u8) -> PreCheck {
    Box::new(move |adu: &Adu| {
        let d = &adu.data;
        if d.len() < 6 {
            return Check::Pending;
        }
        if d[0] != 0x0E || d[1] != read_code {
            return Check::Fail;
        }
        let count = d[5] as usize;
        let mut pos = 6;
        for _ in 0..count {
            if d.len() < pos + 2 {
                return Check::Pending;
            }
            pos += 2 + d[pos + 1] as usize;
        }
        Check::DataLen(pos)
    })
}
