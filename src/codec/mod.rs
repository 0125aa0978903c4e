//! Application-layer framing for the three Modbus variants
//!
//! A framer sits between a byte-duplex transport and a role (client or
//! server). It reconstructs complete application data units from inbound
//! byte bursts, validates their checksums and encodes outbound frames.
//!
//! The client additionally puts its framer into *response-wait mode*: an
//! ordered list of [`PreCheck`] predicates describes the one response the
//! client is prepared to accept, and the framer reports exactly one
//! [`FramerEvent::WaitComplete`] or [`FramerEvent::WaitFailed`] for it.
//! Outside of wait mode, complete frames are reported as
//! [`FramerEvent::Frame`] for the server to dispatch.

pub mod ascii;
pub mod rtu;
pub mod tcp;

use std::time::Duration;

use bytes::Bytes;
use crc::{Crc, CRC_16_MODBUS};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::Adu;

/// CRC calculator for RTU
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Compute the Modbus RTU CRC-16 (polynomial 0xA001 reflected, initial
/// value 0xFFFF). Serialized little-endian on the wire.
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Compute the Modbus ASCII LRC: two's complement of the low 8 bits of the
/// byte sum over the unpacked frame.
pub fn lrc(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |sum, &byte| sum.wrapping_add(byte))
        .wrapping_neg()
}

/// Outcome of a single response pre-check predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    /// The predicate holds; evaluate the next one
    Pass,
    /// The frame is conclusively complete; skip the remaining predicates
    /// and go straight to checksum verification
    Accept,
    /// The frame cannot belong to the pending request
    Fail,
    /// The PDU payload must be exactly this many bytes long. Fewer bytes
    /// mean the frame is still incomplete, more mean it is not ours.
    DataLen(usize),
    /// Not decidable yet; more bytes are needed
    Pending,
}

/// A response pre-check predicate, run against the tentatively decoded frame
pub type PreCheck = Box<dyn Fn(&Adu) -> Check + Send>;

/// Aggregate verdict of the pre-check pipeline over one decode attempt
#[derive(Debug)]
pub(crate) enum CheckResult {
    /// Every predicate passed (or one accepted outright)
    Passed,
    /// The frame is shorter than the predicates require
    Insufficient,
    /// The frame is invalid for the pending request
    Rejected(ModbusError),
}

/// Fold the ordered pre-checks over a tentative frame.
pub(crate) fn run_pre_checks(checks: &[PreCheck], adu: &Adu) -> CheckResult {
    for check in checks {
        match check(adu) {
            Check::Pass => continue,
            Check::Accept => return CheckResult::Passed,
            Check::Fail => return CheckResult::Rejected(ModbusError::InvalidResponse),
            Check::DataLen(expected) => {
                if adu.data.len() < expected {
                    return CheckResult::Insufficient;
                }
                if adu.data.len() > expected {
                    return CheckResult::Rejected(ModbusError::InvalidResponse);
                }
            }
            Check::Pending => return CheckResult::Insufficient,
        }
    }
    CheckResult::Passed
}

/// Events produced by a framer while consuming inbound bytes
#[derive(Debug)]
pub enum FramerEvent {
    /// A complete, checksum-valid frame decoded outside response-wait mode
    Frame(Adu),
    /// The pending response-wait resolved with this frame
    WaitComplete(Adu),
    /// The pending response-wait failed; the wait is over
    WaitFailed(ModbusError),
}

/// Common contract of the RTU, ASCII and MBAP framers
pub trait Framer: Send {
    /// Encode an outbound ADU into wire bytes. Always succeeds; the MBAP
    /// framer assigns a transaction id when the ADU carries none.
    fn encode(&mut self, adu: &Adu) -> Bytes;

    /// Enter response-wait mode. Only one wait may be active at a time.
    fn start_wait(&mut self, checks: Vec<PreCheck>) -> ModbusResult<()>;

    /// Leave response-wait mode without resolving it; any buffered bytes
    /// belonging to the wait are discarded.
    fn stop_wait(&mut self);

    /// Whether a response-wait is currently active
    fn is_waiting(&self) -> bool;

    /// Feed one inbound byte burst and collect the resulting events.
    fn accept(&mut self, burst: &[u8]) -> Vec<FramerEvent>;

    /// The inter-frame quiet period elapsed. Only meaningful for RTU in
    /// server mode; the other variants never arm a timer.
    fn silence_elapsed(&mut self) -> Vec<FramerEvent> {
        Vec::new()
    }

    /// Quiet interval the consumer must observe after a burst before
    /// calling [`Framer::silence_elapsed`], when the variant uses one.
    /// `Some(Duration::ZERO)` means frames are attempted per burst.
    fn silence_interval(&self) -> Option<Duration> {
        None
    }

    /// Drop all buffered state and leave wait mode; called when the
    /// transport closes.
    fn reset(&mut self);
}
