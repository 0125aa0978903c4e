/// Server-side unit models
///
/// A [`ServerModel`] is a logical device: a unit address plus optional
/// asynchronous callbacks for each operation the device supports, plus
/// optional permitted address ranges per data space. All callbacks return
/// boxed futures; a synchronous data source just wraps its result in a
/// ready future through the builder-style setters.
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::ModbusException;

pub type ReadBitsFn =
    Arc<dyn Fn(u16, u16) -> BoxFuture<'static, ModbusResult<Vec<bool>>> + Send + Sync>;
pub type ReadRegistersFn =
    Arc<dyn Fn(u16, u16) -> BoxFuture<'static, ModbusResult<Vec<u16>>> + Send + Sync>;
pub type WriteBitFn =
    Arc<dyn Fn(u16, bool) -> BoxFuture<'static, ModbusResult<()>> + Send + Sync>;
pub type WriteBitsFn =
    Arc<dyn Fn(u16, Vec<bool>) -> BoxFuture<'static, ModbusResult<()>> + Send + Sync>;
pub type WriteRegisterFn =
    Arc<dyn Fn(u16, u16) -> BoxFuture<'static, ModbusResult<()>> + Send + Sync>;
pub type WriteRegistersFn =
    Arc<dyn Fn(u16, Vec<u16>) -> BoxFuture<'static, ModbusResult<()>> + Send + Sync>;
pub type MaskWriteFn =
    Arc<dyn Fn(u16, u16, u16) -> BoxFuture<'static, ModbusResult<()>> + Send + Sync>;
pub type ServerIdFn =
    Arc<dyn Fn() -> BoxFuture<'static, ModbusResult<ServerIdentity>> + Send + Sync>;
pub type DeviceIdFn =
    Arc<dyn Fn() -> BoxFuture<'static, ModbusResult<HashMap<u8, String>>> + Send + Sync>;
pub type InterceptorFn =
    Arc<dyn Fn(u8, Vec<u8>) -> BoxFuture<'static, ModbusResult<Option<Vec<u8>>>> + Send + Sync>;

/// Payload of a Report Server ID (0x11) response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerIdentity {
    pub server_id: u8,
    /// Encoded on the wire as 0xFF (running) / 0x00 (stopped)
    pub running: bool,
    pub additional: Vec<u8>,
}

/// Permitted address interval(s) for one data space
///
/// Either a single `[lo, hi]` interval with `lo < hi` or a list of such
/// intervals. A request span is permitted when one interval contains it
/// entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeList(Vec<(u16, u16)>);

impl RangeList {
    /// A single permitted interval
    pub fn single(lo: u16, hi: u16) -> ModbusResult<Self> {
        Self::list([(lo, hi)])
    }

    /// A list of permitted intervals
    pub fn list<I: IntoIterator<Item = (u16, u16)>>(ranges: I) -> ModbusResult<Self> {
        let ranges: Vec<_> = ranges.into_iter().collect();
        for &(lo, hi) in &ranges {
            if lo >= hi {
                return Err(ModbusError::configuration(format!(
                    "invalid address range [{lo}, {hi}]"
                )));
            }
        }
        Ok(Self(ranges))
    }

    /// True when one interval contains the whole span
    pub fn permits(&self, start: u16, count: u16) -> bool {
        if count == 0 {
            return false;
        }
        let end = start as u32 + count as u32 - 1;
        self.0
            .iter()
            .any(|&(lo, hi)| start >= lo && end <= hi as u32)
    }
}

/// Permitted address ranges per data space; an absent entry accepts all
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressRanges {
    pub coils: Option<RangeList>,
    pub discrete_inputs: Option<RangeList>,
    pub holding_registers: Option<RangeList>,
    pub input_registers: Option<RangeList>,
}

impl AddressRanges {
    fn permitted(range: &Option<RangeList>, start: u16, count: u16) -> bool {
        range.as_ref().map_or(true, |r| r.permits(start, count))
    }

    pub fn permits_coils(&self, start: u16, count: u16) -> bool {
        Self::permitted(&self.coils, start, count)
    }

    pub fn permits_discrete_inputs(&self, start: u16, count: u16) -> bool {
        Self::permitted(&self.discrete_inputs, start, count)
    }

    pub fn permits_holding_registers(&self, start: u16, count: u16) -> bool {
        Self::permitted(&self.holding_registers, start, count)
    }

    pub fn permits_input_registers(&self, start: u16, count: u16) -> bool {
        Self::permitted(&self.input_registers, start, count)
    }
}

/// A logical server device identified by its unit address
///
/// Built with the `on_*` setters, each of which accepts an async closure
/// (or a sync closure returning a ready future):
///
/// ```rust
/// use voltage_modbus_stack::ServerModel;
///
/// let model = ServerModel::new(1)
///     .on_read_holding_registers(|address, quantity| async move {
///         Ok((0..quantity).map(|i| address.wrapping_add(i)).collect())
///     });
/// ```
#[derive(Clone)]
pub struct ServerModel {
    pub(crate) unit_id: u8,
    pub(crate) interceptor: Option<InterceptorFn>,
    pub(crate) read_coils: Option<ReadBitsFn>,
    pub(crate) read_discrete_inputs: Option<ReadBitsFn>,
    pub(crate) read_holding_registers: Option<ReadRegistersFn>,
    pub(crate) read_input_registers: Option<ReadRegistersFn>,
    pub(crate) write_single_coil: Option<WriteBitFn>,
    pub(crate) write_multiple_coils: Option<WriteBitsFn>,
    pub(crate) write_single_register: Option<WriteRegisterFn>,
    pub(crate) write_multiple_registers: Option<WriteRegistersFn>,
    pub(crate) mask_write_register: Option<MaskWriteFn>,
    pub(crate) report_server_id: Option<ServerIdFn>,
    pub(crate) read_device_identification: Option<DeviceIdFn>,
    pub(crate) address_ranges: AddressRanges,
}

impl ServerModel {
    pub fn new(unit_id: u8) -> Self {
        Self {
            unit_id,
            interceptor: None,
            read_coils: None,
            read_discrete_inputs: None,
            read_holding_registers: None,
            read_input_registers: None,
            write_single_coil: None,
            write_multiple_coils: None,
            write_single_register: None,
            write_multiple_registers: None,
            mask_write_register: None,
            report_server_id: None,
            read_device_identification: None,
            address_ranges: AddressRanges::default(),
        }
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    /// Runs before the function-code dispatch. Returning `Some(payload)`
    /// answers the request directly with the incoming function code;
    /// `None` falls through to the regular handler.
    pub fn on_intercept<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u8, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ModbusResult<Option<Vec<u8>>>> + Send + 'static,
    {
        self.interceptor = Some(Arc::new(
            move |function, data| -> BoxFuture<'static, ModbusResult<Option<Vec<u8>>>> {
                Box::pin(f(function, data))
            },
        ));
        self
    }

    pub fn on_read_coils<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u16, u16) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ModbusResult<Vec<bool>>> + Send + 'static,
    {
        self.read_coils = Some(Arc::new(
            move |address, quantity| -> BoxFuture<'static, ModbusResult<Vec<bool>>> {
                Box::pin(f(address, quantity))
            },
        ));
        self
    }

    pub fn on_read_discrete_inputs<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u16, u16) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ModbusResult<Vec<bool>>> + Send + 'static,
    {
        self.read_discrete_inputs = Some(Arc::new(
            move |address, quantity| -> BoxFuture<'static, ModbusResult<Vec<bool>>> {
                Box::pin(f(address, quantity))
            },
        ));
        self
    }

    pub fn on_read_holding_registers<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u16, u16) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ModbusResult<Vec<u16>>> + Send + 'static,
    {
        self.read_holding_registers = Some(Arc::new(
            move |address, quantity| -> BoxFuture<'static, ModbusResult<Vec<u16>>> {
                Box::pin(f(address, quantity))
            },
        ));
        self
    }

    pub fn on_read_input_registers<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u16, u16) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ModbusResult<Vec<u16>>> + Send + 'static,
    {
        self.read_input_registers = Some(Arc::new(
            move |address, quantity| -> BoxFuture<'static, ModbusResult<Vec<u16>>> {
                Box::pin(f(address, quantity))
            },
        ));
        self
    }

    pub fn on_write_single_coil<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u16, bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ModbusResult<()>> + Send + 'static,
    {
        self.write_single_coil = Some(Arc::new(
            move |address, value| -> BoxFuture<'static, ModbusResult<()>> {
                Box::pin(f(address, value))
            },
        ));
        self
    }

    pub fn on_write_multiple_coils<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u16, Vec<bool>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ModbusResult<()>> + Send + 'static,
    {
        self.write_multiple_coils = Some(Arc::new(
            move |address, values| -> BoxFuture<'static, ModbusResult<()>> {
                Box::pin(f(address, values))
            },
        ));
        self
    }

    pub fn on_write_single_register<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u16, u16) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ModbusResult<()>> + Send + 'static,
    {
        self.write_single_register = Some(Arc::new(
            move |address, value| -> BoxFuture<'static, ModbusResult<()>> {
                Box::pin(f(address, value))
            },
        ));
        self
    }

    pub fn on_write_multiple_registers<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u16, Vec<u16>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ModbusResult<()>> + Send + 'static,
    {
        self.write_multiple_registers = Some(Arc::new(
            move |address, values| -> BoxFuture<'static, ModbusResult<()>> {
                Box::pin(f(address, values))
            },
        ));
        self
    }

    pub fn on_mask_write_register<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u16, u16, u16) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ModbusResult<()>> + Send + 'static,
    {
        self.mask_write_register = Some(Arc::new(
            move |address, and_mask, or_mask| -> BoxFuture<'static, ModbusResult<()>> {
                Box::pin(f(address, and_mask, or_mask))
            },
        ));
        self
    }

    pub fn on_report_server_id<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ModbusResult<ServerIdentity>> + Send + 'static,
    {
        self.report_server_id = Some(Arc::new(
            move || -> BoxFuture<'static, ModbusResult<ServerIdentity>> { Box::pin(f()) },
        ));
        self
    }

    /// The returned map's values are the identification object strings;
    /// the mandatory objects 0x00-0x02 are seeded by the server when
    /// absent.
    pub fn on_read_device_identification<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ModbusResult<HashMap<u8, String>>> + Send + 'static,
    {
        self.read_device_identification = Some(Arc::new(
            move || -> BoxFuture<'static, ModbusResult<HashMap<u8, String>>> { Box::pin(f()) },
        ));
        self
    }

    pub fn with_address_ranges(mut self, ranges: AddressRanges) -> Self {
        self.address_ranges = ranges;
        self
    }
}

impl Default for ServerModel {
    /// The default unit address is 1
    fn default() -> Self {
        Self::new(1)
    }
}

impl fmt::Debug for ServerModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerModel")
            .field("unit_id", &self.unit_id)
            .field("interceptor", &self.interceptor.is_some())
            .field("read_coils", &self.read_coils.is_some())
            .field("read_discrete_inputs", &self.read_discrete_inputs.is_some())
            .field(
                "read_holding_registers",
                &self.read_holding_registers.is_some(),
            )
            .field("read_input_registers", &self.read_input_registers.is_some())
            .field("write_single_coil", &self.write_single_coil.is_some())
            .field("write_multiple_coils", &self.write_multiple_coils.is_some())
            .field("write_single_register", &self.write_single_register.is_some())
            .field(
                "write_multiple_registers",
                &self.write_multiple_registers.is_some(),
            )
            .field("mask_write_register", &self.mask_write_register.is_some())
            .field("report_server_id", &self.report_server_id.is_some())
            .field(
                "read_device_identification",
                &self.read_device_identification.is_some(),
            )
            .field("address_ranges", &self.address_ranges)
            .finish()
    }
}

/// Map a callback rejection onto the exception code sent on the wire.
pub(crate) fn exception_for(err: &ModbusError) -> ModbusException {
    match err {
        ModbusError::Exception { code, .. } => {
            ModbusException::from_u8(*code).unwrap_or(ModbusException::ServerDeviceFailure)
        }
        ModbusError::InvalidAddress { .. } => ModbusException::IllegalDataAddress,
        ModbusError::InvalidData { .. } => ModbusException::IllegalDataValue,
        _ => ModbusException::ServerDeviceFailure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_list_validation() {
        assert!(RangeList::single(10, 20).is_ok());
        assert!(RangeList::single(20, 10).is_err());
        assert!(RangeList::single(5, 5).is_err());
    }

    #[test]
    fn test_range_permits_whole_span_only() {
        let range = RangeList::single(100, 199).unwrap();
        assert!(range.permits(100, 100));
        assert!(range.permits(150, 10));
        assert!(!range.permits(150, 100));
        assert!(!range.permits(99, 2));
        assert!(!range.permits(150, 0));
    }

    #[test]
    fn test_range_list_any_interval() {
        let ranges = RangeList::list([(0, 9), (100, 109)]).unwrap();
        assert!(ranges.permits(0, 10));
        assert!(ranges.permits(105, 5));
        // Spanning two intervals is not permitted.
        assert!(!ranges.permits(5, 100));
    }

    #[test]
    fn test_absent_ranges_accept_everything() {
        let ranges = AddressRanges::default();
        assert!(ranges.permits_coils(0, 2000));
        assert!(ranges.permits_holding_registers(65000, 125));
    }

    #[test]
    fn test_default_unit_is_one() {
        assert_eq!(ServerModel::default().unit_id(), 1);
    }

    #[test]
    fn test_builder_records_callbacks() {
        let model = ServerModel::new(5)
            .on_read_coils(|_, quantity| async move { Ok(vec![true; quantity as usize]) })
            .on_write_single_coil(|_, _| async { Ok(()) });
        assert!(model.read_coils.is_some());
        assert!(model.write_single_coil.is_some());
        assert!(model.read_holding_registers.is_none());
    }

    #[test]
    fn test_exception_mapping() {
        assert_eq!(
            exception_for(&ModbusError::exception(0x03, 0x02)),
            ModbusException::IllegalDataAddress
        );
        assert_eq!(
            exception_for(&ModbusError::invalid_address(0, 10)),
            ModbusException::IllegalDataAddress
        );
        assert_eq!(
            exception_for(&ModbusError::invalid_data("bad value")),
            ModbusException::IllegalDataValue
        );
        assert_eq!(
            exception_for(&ModbusError::io("broken pipe")),
            ModbusException::ServerDeviceFailure
        );
        assert_eq!(
            exception_for(&ModbusException::ServerDeviceBusy.into()),
            ModbusException::ServerDeviceBusy
        );
    }
}
