/// Modbus RTU framing
///
/// Wire format: `[unit | function | data... | CRC16-LE]`. Frames carry no
/// length field; on a serial line they are delimited by 3.5 character
/// times of silence. While the client is waiting for a response the frame
/// end is resolved by the pre-checks instead: the whole accumulated buffer
/// is decoded tentatively and an exact-length pre-check decides whether it
/// is complete, still short, or not ours.
use std::str::FromStr;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use log::warn;

use crate::codec::{crc16, run_pre_checks, CheckResult, Framer, FramerEvent, PreCheck};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::Adu;
use crate::transport::TransportKind;

/// Smallest decodable RTU frame: unit + function + CRC16
const MIN_FRAME_LEN: usize = 4;

/// Largest legal RTU frame
const MAX_FRAME_LEN: usize = 256;

/// Inter-frame silence configuration for RTU
///
/// The default derives 3.5T from the serial transport's baud rate:
/// `48 bits / baud` milliseconds, or the fixed 1.75 ms (rounded up to
/// 2 ms) above 19200 baud. Network transports get a zero gap, meaning
/// each burst is framed as it arrives.
///
/// Overrides parse from the strings `"<N>bit"` (bit budget for the
/// formula) and `"<N>ms"` (literal milliseconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameGap {
    /// 3.5T from the transport's baud rate with the default 48-bit budget
    Auto,
    /// 3.5T formula with this many bits instead of 48
    Bits(u32),
    /// Fixed interval in milliseconds
    Millis(u64),
}

impl FrameGap {
    const DEFAULT_BITS: u32 = 48;

    /// Resolve the quiet interval for a transport.
    pub fn interval(&self, kind: TransportKind) -> Duration {
        let baud_rate = match kind {
            TransportKind::Serial { baud_rate } => baud_rate,
            TransportKind::Net => return Duration::ZERO,
        };
        match *self {
            FrameGap::Millis(ms) => Duration::from_millis(ms),
            FrameGap::Auto | FrameGap::Bits(_) => {
                if baud_rate > 19_200 {
                    // Serial line spec fixes 1.75 ms above 19200 baud;
                    // round up to a whole millisecond.
                    return Duration::from_millis(2);
                }
                let bits = match *self {
                    FrameGap::Bits(bits) => bits,
                    _ => Self::DEFAULT_BITS,
                };
                let millis = (u64::from(bits) * 1000).div_ceil(u64::from(baud_rate.max(1)));
                Duration::from_millis(millis)
            }
        }
    }
}

impl FromStr for FrameGap {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(value) = s.strip_suffix("bit") {
            return value
                .parse::<u32>()
                .map(FrameGap::Bits)
                .map_err(|_| ModbusError::configuration(format!("invalid frame gap: {s}")));
        }
        if let Some(value) = s.strip_suffix("ms") {
            return value
                .parse::<u64>()
                .map(FrameGap::Millis)
                .map_err(|_| ModbusError::configuration(format!("invalid frame gap: {s}")));
        }
        Err(ModbusError::configuration(format!("invalid frame gap: {s}")))
    }
}

/// RTU framer: byte accumulator plus the 3.5T quiet interval
pub struct RtuFramer {
    buf: BytesMut,
    checks: Option<Vec<PreCheck>>,
    silence: Duration,
}

impl RtuFramer {
    /// Create a framer with the 3.5T gap derived from the transport kind
    pub fn new(kind: TransportKind) -> Self {
        Self::with_gap(FrameGap::Auto, kind)
    }

    /// Create a framer with an explicit gap configuration
    pub fn with_gap(gap: FrameGap, kind: TransportKind) -> Self {
        Self {
            buf: BytesMut::new(),
            checks: None,
            silence: gap.interval(kind),
        }
    }

    /// Decode the whole accumulated buffer as one candidate frame.
    /// The CRC is not verified here; wait mode verifies it only after the
    /// pre-checks have settled the frame boundary.
    fn tentative(&self) -> Option<Adu> {
        if self.buf.len() < MIN_FRAME_LEN {
            return None;
        }
        let raw = Bytes::copy_from_slice(&self.buf);
        let body_len = raw.len() - 2;
        Some(Adu {
            transaction_id: None,
            unit_id: raw[0],
            function: raw[1],
            data: raw.slice(2..body_len),
            raw,
        })
    }

    fn verify_crc(adu: &Adu) -> ModbusResult<()> {
        let raw = &adu.raw;
        let body_len = raw.len() - 2;
        let actual = u16::from_le_bytes([raw[body_len], raw[body_len + 1]]);
        let expected = crc16(&raw[..body_len]);
        if expected == actual {
            Ok(())
        } else {
            Err(ModbusError::crc_mismatch(expected, actual))
        }
    }
}

impl Framer for RtuFramer {
    fn encode(&mut self, adu: &Adu) -> Bytes {
        let mut out = BytesMut::with_capacity(adu.data.len() + 4);
        out.put_u8(adu.unit_id);
        out.put_u8(adu.function);
        out.put_slice(&adu.data);
        let crc = crc16(&out);
        out.put_u16_le(crc);
        out.freeze()
    }

    fn start_wait(&mut self, checks: Vec<PreCheck>) -> ModbusResult<()> {
        if self.checks.is_some() {
            return Err(ModbusError::internal("response wait already active"));
        }
        self.buf.clear();
        self.checks = Some(checks);
        Ok(())
    }

    fn stop_wait(&mut self) {
        if self.checks.take().is_some() {
            self.buf.clear();
        }
    }

    fn is_waiting(&self) -> bool {
        self.checks.is_some()
    }

    fn accept(&mut self, burst: &[u8]) -> Vec<FramerEvent> {
        self.buf.extend_from_slice(burst);

        if self.checks.is_some() {
            if self.buf.len() > MAX_FRAME_LEN {
                self.stop_wait();
                return vec![FramerEvent::WaitFailed(ModbusError::frame(
                    "response exceeds maximum RTU frame size",
                ))];
            }
            let Some(adu) = self.tentative() else {
                return Vec::new();
            };
            let verdict = run_pre_checks(self.checks.as_deref().unwrap_or(&[]), &adu);
            match verdict {
                // Under-read is recoverable here: keep the buffer and
                // retry on the next burst.
                CheckResult::Insufficient => Vec::new(),
                CheckResult::Rejected(err) => {
                    self.stop_wait();
                    vec![FramerEvent::WaitFailed(err)]
                }
                CheckResult::Passed => {
                    let event = match Self::verify_crc(&adu) {
                        Ok(()) => FramerEvent::WaitComplete(adu),
                        Err(err) => FramerEvent::WaitFailed(err),
                    };
                    self.stop_wait();
                    vec![event]
                }
            }
        } else if self.silence.is_zero() {
            // No quiet interval to observe; frame each burst as delivered.
            self.silence_elapsed()
        } else {
            // The consumer restarts the 3.5T timer after every burst and
            // calls silence_elapsed on expiry.
            Vec::new()
        }
    }

    fn silence_elapsed(&mut self) -> Vec<FramerEvent> {
        if self.checks.is_some() || self.buf.is_empty() {
            return Vec::new();
        }
        let candidate = self.tentative();
        self.buf.clear();
        let Some(adu) = candidate else {
            return Vec::new();
        };
        match Self::verify_crc(&adu) {
            Ok(()) => vec![FramerEvent::Frame(adu)],
            Err(err) => {
                warn!("discarding RTU frame: {err}");
                Vec::new()
            }
        }
    }

    fn silence_interval(&self) -> Option<Duration> {
        if self.checks.is_some() {
            None
        } else {
            Some(self.silence)
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.checks = None;
    }
}
