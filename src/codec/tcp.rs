/// Modbus MBAP (TCP/UDP) framing
///
/// Wire format: `[transaction(2 BE) | protocol=0x0000 | length(2 BE) |
/// unit | function | data...]` with `length = data.len() + 2`. The header
/// self-delimits the frame and the transport is trusted for integrity, so
/// the framer is stateless per burst: every inbound burst must carry one
/// complete frame.
use bytes::{BufMut, Bytes, BytesMut};
use log::warn;

use crate::codec::{run_pre_checks, CheckResult, Framer, FramerEvent, PreCheck};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::Adu;

/// Transaction + protocol + length fields
pub const MBAP_HEADER_LEN: usize = 6;

/// Header plus unit and function bytes
const MIN_FRAME_LEN: usize = 8;

/// MBAP framer: header codec plus the client transaction counter
pub struct MbapFramer {
    next_transaction: u16,
    checks: Option<Vec<PreCheck>>,
}

impl MbapFramer {
    pub fn new() -> Self {
        Self {
            next_transaction: 0,
            checks: None,
        }
    }

    /// Advance the transaction counter: modulo 256, skipping 0.
    fn advance_transaction(&mut self) -> u16 {
        self.next_transaction = (self.next_transaction + 1) % 256;
        if self.next_transaction == 0 {
            self.next_transaction = 1;
        }
        self.next_transaction
    }

    fn frame(burst: &[u8]) -> ModbusResult<Adu> {
        if burst.len() < MIN_FRAME_LEN {
            return Err(ModbusError::InsufficientData);
        }
        let protocol = u16::from_be_bytes([burst[2], burst[3]]);
        if protocol != 0 {
            return Err(ModbusError::frame("invalid MBAP protocol identifier"));
        }
        let length = u16::from_be_bytes([burst[4], burst[5]]) as usize;
        if length + MBAP_HEADER_LEN != burst.len() {
            return Err(ModbusError::frame("MBAP length field does not match frame"));
        }
        let raw = Bytes::copy_from_slice(burst);
        Ok(Adu {
            transaction_id: Some(u16::from_be_bytes([burst[0], burst[1]])),
            unit_id: burst[6],
            function: burst[7],
            data: raw.slice(8..),
            raw,
        })
    }
}

impl Default for MbapFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer for MbapFramer {
    fn encode(&mut self, adu: &Adu) -> Bytes {
        let transaction = adu
            .transaction_id
            .unwrap_or_else(|| self.advance_transaction());
        let mut out = BytesMut::with_capacity(MBAP_HEADER_LEN + 2 + adu.data.len());
        out.put_u16(transaction);
        out.put_u16(0x0000);
        out.put_u16((adu.data.len() + 2) as u16);
        out.put_u8(adu.unit_id);
        out.put_u8(adu.function);
        out.put_slice(&adu.data);
        out.freeze()
    }

    fn start_wait(&mut self, checks: Vec<PreCheck>) -> ModbusResult<()> {
        if self.checks.is_some() {
            return Err(ModbusError::internal("response wait already active"));
        }
        self.checks = Some(checks);
        Ok(())
    }

    fn stop_wait(&mut self) {
        self.checks = None;
    }

    fn is_waiting(&self) -> bool {
        self.checks.is_some()
    }

    fn accept(&mut self, burst: &[u8]) -> Vec<FramerEvent> {
        if self.checks.is_some() {
            // Self-delimiting framing: one attempt per burst, terminal
            // either way.
            let event = match Self::frame(burst) {
                Err(err) => FramerEvent::WaitFailed(err),
                Ok(adu) => match run_pre_checks(self.checks.as_deref().unwrap_or(&[]), &adu) {
                    CheckResult::Insufficient => {
                        FramerEvent::WaitFailed(ModbusError::InsufficientData)
                    }
                    CheckResult::Rejected(err) => FramerEvent::WaitFailed(err),
                    CheckResult::Passed => FramerEvent::WaitComplete(adu),
                },
            };
            self.checks = None;
            vec![event]
        } else {
            match Self::frame(burst) {
                Ok(adu) => vec![FramerEvent::Frame(adu)],
                Err(err) => {
                    warn!("discarding MBAP frame: {err}");
                    Vec::new()
                }
            }
        }
    }

    fn reset(&mut self) {
        self.checks = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Check;

    #[test]
    fn test_encode_assigns_transaction() {
        let mut framer = MbapFramer::new();
        let adu = Adu::request(0x11, 0x03, vec![0x00, 0x6B, 0x00, 0x03]);
        let frame = framer.encode(&adu);
        assert_eq!(
            frame.as_ref(),
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]
        );

        // A caller-supplied transaction id is used verbatim.
        let mut echoed = Adu::request(0x11, 0x03, vec![0x00]);
        echoed.transaction_id = Some(0xABCD);
        let frame = framer.encode(&echoed);
        assert_eq!(&frame[0..2], &[0xAB, 0xCD]);
    }

    #[test]
    fn test_transaction_counter_wraps_and_skips_zero() {
        let mut framer = MbapFramer::new();
        framer.next_transaction = 254;
        assert_eq!(framer.advance_transaction(), 255);
        assert_eq!(framer.advance_transaction(), 1);
        assert_eq!(framer.advance_transaction(), 2);
    }

    #[test]
    fn test_frame_broadcast_write_multiple_registers() {
        let mut framer = MbapFramer::new();
        let burst = [
            0x00, 0x07, 0x00, 0x00, 0x00, 0x0B, 0x00, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00,
            0x0A, 0x01, 0x02,
        ];
        let events = framer.accept(&burst);
        assert_eq!(events.len(), 1);
        match &events[0] {
            FramerEvent::Frame(adu) => {
                assert_eq!(adu.transaction_id, Some(0x0007));
                assert_eq!(adu.unit_id, 0x00);
                assert_eq!(adu.function, 0x10);
                assert_eq!(
                    adu.data.as_ref(),
                    &[0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_bursts_are_dropped() {
        let mut framer = MbapFramer::new();
        // Too short
        assert!(framer.accept(&[0x00, 0x01, 0x00]).is_empty());
        // Non-zero protocol identifier
        assert!(framer
            .accept(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x02, 0x11, 0x03])
            .is_empty());
        // Length field disagrees with the burst
        assert!(framer
            .accept(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03])
            .is_empty());
    }

    #[test]
    fn test_wait_is_terminal_per_burst() {
        let mut framer = MbapFramer::new();
        framer
            .start_wait(vec![Box::new(|_| Check::DataLen(64))])
            .unwrap();
        let events = framer.accept(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x11, 0x03, 0x02]);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            FramerEvent::WaitFailed(ModbusError::InsufficientData)
        ));
        assert!(!framer.is_waiting());
    }

    #[test]
    fn test_wait_complete() {
        let mut framer = MbapFramer::new();
        framer
            .start_wait(vec![Box::new(|adu: &Adu| {
                if adu.unit_id == 0x11 && adu.function == 0x03 {
                    Check::Pass
                } else {
                    Check::Fail
                }
            })])
            .unwrap();
        let events = framer.accept(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x05, 0x11, 0x03, 0x02, 0xAB,
            0xCD]);
        assert_eq!(events.len(), 1);
        match &events[0] {
            FramerEvent::WaitComplete(adu) => {
                assert_eq!(adu.data.as_ref(), &[0x02, 0xAB, 0xCD]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
