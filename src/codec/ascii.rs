/// Modbus ASCII framing
///
/// Wire format: `":" HEX(unit) HEX(function) HEX(data...) HEX(LRC) CR LF`,
/// with every frame byte transmitted as two uppercase hex characters. The
/// decoder is a three-state scanner over the inbound byte stream; a ':'
/// restarts reception at any point, so a corrupted line never poisons the
/// next frame.
use bytes::Bytes;
use log::warn;

use crate::codec::{lrc, run_pre_checks, CheckResult, Framer, FramerEvent, PreCheck};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::Adu;

const FRAME_START: u8 = b':';
const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Scanner states of the ASCII decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Discarding bytes until a ':' arrives
    Idle,
    /// Accumulating hex characters of the current frame
    Reception,
    /// CR seen, expecting the terminating LF
    WaitingEnd,
}

/// ASCII framer: three-state scanner plus a hex-character accumulator
pub struct AsciiFramer {
    state: ScanState,
    chars: Vec<u8>,
    checks: Option<Vec<PreCheck>>,
}

impl AsciiFramer {
    pub fn new() -> Self {
        Self {
            state: ScanState::Idle,
            chars: Vec::new(),
            checks: None,
        }
    }

    /// Pair up the accumulated hex characters into frame bytes.
    fn unhex(chars: &[u8]) -> ModbusResult<Vec<u8>> {
        if chars.len() % 2 != 0 {
            return Err(ModbusError::frame("odd number of hex characters"));
        }
        let mut bytes = Vec::with_capacity(chars.len() / 2);
        for pair in chars.chunks(2) {
            bytes.push((hex_value(pair[0])? << 4) | hex_value(pair[1])?);
        }
        Ok(bytes)
    }

    /// Rebuild the original line for the frame's raw buffer.
    fn line(chars: &[u8]) -> Bytes {
        let mut raw = Vec::with_capacity(chars.len() + 3);
        raw.push(FRAME_START);
        raw.extend_from_slice(chars);
        raw.push(CR);
        raw.push(LF);
        Bytes::from(raw)
    }

    /// Decode a finished line into a candidate frame plus its wire LRC.
    /// The LRC is not verified here; wait mode verifies it only after the
    /// pre-checks pass.
    fn decode(chars: &[u8]) -> ModbusResult<(Adu, u8)> {
        let bytes = Self::unhex(chars)?;
        if bytes.len() < 3 {
            return Err(ModbusError::frame("ASCII frame too short"));
        }
        let body_len = bytes.len() - 1;
        let wire_lrc = bytes[body_len];
        let adu = Adu {
            transaction_id: None,
            unit_id: bytes[0],
            function: bytes[1],
            data: Bytes::copy_from_slice(&bytes[2..body_len]),
            raw: Self::line(chars),
        };
        Ok((adu, wire_lrc))
    }

    fn verify_lrc(adu: &Adu, wire_lrc: u8) -> ModbusResult<()> {
        let mut body = Vec::with_capacity(adu.data.len() + 2);
        body.push(adu.unit_id);
        body.push(adu.function);
        body.extend_from_slice(&adu.data);
        let expected = lrc(&body);
        if expected == wire_lrc {
            Ok(())
        } else {
            Err(ModbusError::lrc_mismatch(expected, wire_lrc))
        }
    }

    /// A complete line (':' .. CRLF) has been scanned; turn it into events.
    fn finish(&mut self, chars: &[u8]) -> Option<FramerEvent> {
        let decoded = Self::decode(chars);
        if self.checks.is_some() {
            // Each decode attempt is terminal here: the line is
            // self-delimiting, so there is nothing more to wait for.
            let event = match decoded {
                Err(err) => FramerEvent::WaitFailed(err),
                Ok((adu, wire_lrc)) => {
                    match run_pre_checks(self.checks.as_deref().unwrap_or(&[]), &adu) {
                        CheckResult::Insufficient => {
                            FramerEvent::WaitFailed(ModbusError::InsufficientData)
                        }
                        CheckResult::Rejected(err) => FramerEvent::WaitFailed(err),
                        CheckResult::Passed => match Self::verify_lrc(&adu, wire_lrc) {
                            Ok(()) => FramerEvent::WaitComplete(adu),
                            Err(err) => FramerEvent::WaitFailed(err),
                        },
                    }
                }
            };
            self.checks = None;
            Some(event)
        } else {
            match decoded {
                Ok((adu, wire_lrc)) => match Self::verify_lrc(&adu, wire_lrc) {
                    Ok(()) => Some(FramerEvent::Frame(adu)),
                    Err(err) => {
                        warn!("discarding ASCII frame: {err}");
                        None
                    }
                },
                Err(err) => {
                    warn!("discarding ASCII line: {err}");
                    None
                }
            }
        }
    }
}

impl Default for AsciiFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer for AsciiFramer {
    fn encode(&mut self, adu: &Adu) -> Bytes {
        let mut body = Vec::with_capacity(adu.data.len() + 2);
        body.push(adu.unit_id);
        body.push(adu.function);
        body.extend_from_slice(&adu.data);
        let checksum = lrc(&body);

        let mut out = Vec::with_capacity(body.len() * 2 + 5);
        out.push(FRAME_START);
        for &byte in body.iter().chain(std::iter::once(&checksum)) {
            out.push(hex_char(byte >> 4));
            out.push(hex_char(byte & 0x0F));
        }
        out.push(CR);
        out.push(LF);
        Bytes::from(out)
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
        let mut events = Vec::new();
        for &byte in burst {
            match self.state {
                ScanState::Idle => {
                    if byte == FRAME_START {
                        self.state = ScanState::Reception;
                        self.chars.clear();
                    }
                }
                ScanState::Reception => match byte {
                    // A new ':' restarts the frame.
                    FRAME_START => self.chars.clear(),
                    CR => self.state = ScanState::WaitingEnd,
                    _ => self.chars.push(byte),
                },
                ScanState::WaitingEnd => match byte {
                    FRAME_START => {
                        self.chars.clear();
                        self.state = ScanState::Reception;
                    }
                    LF => {
                        let chars = std::mem::take(&mut self.chars);
                        self.state = ScanState::Idle;
                        if let Some(event) = self.finish(&chars) {
                            events.push(event);
                        }
                    }
                    _ => {
                        self.chars.clear();
                        self.state = ScanState::Idle;
                    }
                },
            }
        }
        events
    }

    fn reset(&mut self) {
        self.state = ScanState::Idle;
        self.chars.clear();
        self.checks = None;
    }
}

fn hex_value(c: u8) -> ModbusResult<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(ModbusError::frame(format!("invalid hex character: 0x{c:02X}"))),
    }
}

fn hex_char(nibble: u8) -> u8 {
    match nibble {
        0..=9 => nibble + b'0',
        _ => nibble - 10 + b'A',
    }
}
