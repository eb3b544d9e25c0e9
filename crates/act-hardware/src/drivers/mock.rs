//! In-memory actuator and port opener for tests and dry runs.
//!
//! [`SimulatedActuator`] speaks the same Modbus-RTU subset as the real controller:
//! it answers register reads with CRC-valid frames, echoes coil writes, acknowledges
//! register writes, and moves its position toward the commanded target by a fixed
//! step every time the position block is read. [`MockPortOpener`] maps endpoint
//! names to simulated devices so discovery can be exercised without hardware.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use act_core::serial::DynSerial;
use act_core::{ActError, ActResult};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::discovery::PortOpener;
use crate::drivers::modbus_frame::{
    append_crc, read_holding_response, validate_crc, FN_READ_HOLDING, FN_WRITE_COIL,
    FN_WRITE_COILS, FN_WRITE_REGISTERS, RAW_PER_UNIT, RELATIVE_MOVE_REGISTER,
};

/// Register block holding the live position.
pub const POSITION_REGISTER: u16 = 0x9000;

const TRIGGER_REGISTER: u16 = 0x9100;
const ABSOLUTE_TARGET_REGISTER: u16 = 0x0412;
const ABSOLUTE_SPEED_REGISTER: u16 = 0x0411;
const START_COIL: u16 = 0x001A;
const RESET_COIL: u16 = 0x0045;
const MAX_RAW: i32 = 0xFFFF;

/// How the simulated device answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimBehavior {
    /// Well-formed replies
    #[default]
    Responsive,
    /// Accepts writes, never replies
    Mute,
    /// Register reads come back with a broken CRC trailer
    CorruptCrc,
    /// Position reads come back CRC-valid but with a two-byte payload
    ShortPayload,
}

#[derive(Debug)]
struct SimState {
    behavior: SimBehavior,
    position_raw: i32,
    target_raw: i32,
    step_raw: i32,
    speed: u16,
    pending_relative: Option<i32>,
    pending_absolute: Option<i32>,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    frames: Vec<Vec<u8>>,
    position_reads: usize,
    resets: usize,
    unplugged: bool,
    read_fault: bool,
    read_waker: Option<Waker>,
}

enum FrameScan {
    Incomplete,
    Complete(usize),
    Unknown,
}

fn scan_frame(buf: &[u8]) -> FrameScan {
    if buf.len() < 2 {
        return FrameScan::Incomplete;
    }
    let len = match buf[1] {
        FN_READ_HOLDING | FN_WRITE_COIL => 8,
        FN_WRITE_REGISTERS | FN_WRITE_COILS => {
            if buf.len() < 7 {
                return FrameScan::Incomplete;
            }
            7 + usize::from(buf[6]) + 2
        }
        _ => return FrameScan::Unknown,
    };
    if buf.len() >= len {
        FrameScan::Complete(len)
    } else {
        FrameScan::Incomplete
    }
}

fn word(frame: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([frame[offset], frame[offset + 1]])
}

impl SimState {
    fn process_inbox(&mut self) {
        loop {
            match scan_frame(&self.inbox) {
                FrameScan::Incomplete => break,
                FrameScan::Unknown => {
                    self.inbox.clear();
                    break;
                }
                FrameScan::Complete(len) => {
                    let frame: Vec<u8> = self.inbox.drain(..len).collect();
                    self.handle_frame(frame);
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Vec<u8>) {
        self.frames.push(frame.clone());
        if !validate_crc(&frame) {
            return;
        }

        match frame[1] {
            FN_READ_HOLDING => {
                let register = word(&frame, 2);
                let count = usize::from(word(&frame, 4));
                let mut payload = vec![0u8; (count * 2).min(250)];
                if register == POSITION_REGISTER && self.behavior == SimBehavior::ShortPayload {
                    payload.truncate(2);
                }
                if register == POSITION_REGISTER {
                    self.position_reads += 1;
                    self.advance();
                    if payload.len() >= 4 {
                        let reported = self.position_raw.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
                        payload[2..4].copy_from_slice(&reported.to_be_bytes());
                    }
                }
                let mut response = read_holding_response(&payload);
                if self.behavior == SimBehavior::CorruptCrc {
                    if let Some(last) = response.last_mut() {
                        *last ^= 0xFF;
                    }
                }
                self.reply(&response);
            }
            FN_WRITE_COIL => {
                let coil = word(&frame, 2);
                let on = frame[4] == 0xFF;
                if on && coil == START_COIL {
                    if let Some(target) = self.pending_absolute.take() {
                        self.target_raw = target;
                    }
                }
                if on && coil == RESET_COIL {
                    self.resets += 1;
                    self.target_raw = self.position_raw;
                }
                self.reply(&frame);
            }
            FN_WRITE_REGISTERS => {
                let register = word(&frame, 2);
                match register {
                    RELATIVE_MOVE_REGISTER if frame.len() >= 15 => {
                        self.speed = word(&frame, 9);
                        self.pending_relative =
                            Some(i32::from_be_bytes([frame[11], frame[12], frame[13], frame[14]]));
                    }
                    TRIGGER_REGISTER => {
                        if let Some(delta) = self.pending_relative.take() {
                            self.target_raw = (self.position_raw + delta).clamp(0, MAX_RAW);
                        }
                    }
                    ABSOLUTE_SPEED_REGISTER => self.speed = word(&frame, 7),
                    ABSOLUTE_TARGET_REGISTER if frame.len() >= 11 => {
                        self.pending_absolute = Some(i32::from(word(&frame, 9)));
                    }
                    _ => {}
                }
                self.acknowledge_write(&frame);
            }
            FN_WRITE_COILS => self.acknowledge_write(&frame),
            _ => {}
        }
    }

    fn acknowledge_write(&mut self, frame: &[u8]) {
        let mut ack = frame[..6].to_vec();
        append_crc(&mut ack);
        self.reply(&ack);
    }

    fn advance(&mut self) {
        let gap = self.target_raw - self.position_raw;
        let step = gap.clamp(-self.step_raw, self.step_raw);
        self.position_raw += step;
    }

    fn reply(&mut self, bytes: &[u8]) {
        if self.behavior == SimBehavior::Mute {
            return;
        }
        self.outbox.extend(bytes.iter().copied());
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }
}

/// A simulated actuator. Clones share the same device state.
#[derive(Debug, Clone)]
pub struct SimulatedActuator {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedActuator {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedActuator {
    /// Responsive device at position 0 that moves one external unit per position read.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                behavior: SimBehavior::Responsive,
                position_raw: 0,
                target_raw: 0,
                step_raw: RAW_PER_UNIT,
                speed: 0,
                pending_relative: None,
                pending_absolute: None,
                inbox: Vec::new(),
                outbox: VecDeque::new(),
                frames: Vec::new(),
                position_reads: 0,
                resets: 0,
                unplugged: false,
                read_fault: false,
                read_waker: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start at `position` external units.
    pub fn with_position(self, position: i32) -> Self {
        {
            let mut state = self.lock();
            state.position_raw = position * RAW_PER_UNIT;
            state.target_raw = state.position_raw;
        }
        self
    }

    /// Move `step_raw` device units per position read. Zero stalls the axis.
    pub fn with_step(self, step_raw: i32) -> Self {
        self.lock().step_raw = step_raw.max(0);
        self
    }

    /// Set the reply behavior.
    pub fn with_behavior(self, behavior: SimBehavior) -> Self {
        self.set_behavior(behavior);
        self
    }

    /// Change the reply behavior on a live device.
    pub fn set_behavior(&self, behavior: SimBehavior) {
        self.lock().behavior = behavior;
    }

    /// Simulate the adapter being unplugged: writes fail, reads see end-of-file.
    pub fn unplug(&self) {
        let mut state = self.lock();
        state.unplugged = true;
        if let Some(waker) = state.read_waker.take() {
            waker.wake();
        }
    }

    /// Fail the next read on the port with an I/O error. Writes are unaffected.
    pub fn fail_next_read(&self) {
        let mut state = self.lock();
        state.read_fault = true;
        if let Some(waker) = state.read_waker.take() {
            waker.wake();
        }
    }

    /// Current position in external units, rounded toward zero.
    pub fn position(&self) -> i32 {
        self.lock().position_raw / RAW_PER_UNIT
    }

    /// Current position in device units.
    pub fn position_raw(&self) -> i32 {
        self.lock().position_raw
    }

    /// Commanded target in device units.
    pub fn target_raw(&self) -> i32 {
        self.lock().target_raw
    }

    /// Last speed written by a move command.
    pub fn speed(&self) -> u16 {
        self.lock().speed
    }

    /// Every frame received so far, in order, including ones with a bad CRC.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.lock().frames.clone()
    }

    /// Number of reads of the position block.
    pub fn position_reads(&self) -> usize {
        self.lock().position_reads
    }

    /// Number of reset coil writes.
    pub fn resets(&self) -> usize {
        self.lock().resets
    }

    /// A port connected to this device.
    pub fn port(&self) -> SimulatedPort {
        SimulatedPort {
            device: self.clone(),
        }
    }
}

/// Byte-stream side of a [`SimulatedActuator`].
#[derive(Debug)]
pub struct SimulatedPort {
    device: SimulatedActuator,
}

impl AsyncRead for SimulatedPort {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.device.lock();
        if std::mem::take(&mut state.read_fault) {
            return Poll::Ready(Err(io::Error::other("simulated framing error")));
        }
        if !state.outbox.is_empty() {
            let to_read = std::cmp::min(buf.remaining(), state.outbox.len());
            let chunk: Vec<u8> = state.outbox.drain(..to_read).collect();
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        if state.unplugged {
            return Poll::Ready(Ok(()));
        }
        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for SimulatedPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.device.lock();
        if state.unplugged {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated adapter unplugged",
            )));
        }
        state.inbox.extend_from_slice(buf);
        state.process_inbox();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Port opener backed by a map of simulated devices.
///
/// Opening an unknown endpoint fails with `NotFound`, like a missing device node.
/// Clones share the open log.
#[derive(Debug, Clone, Default)]
pub struct MockPortOpener {
    devices: HashMap<String, SimulatedActuator>,
    opened: Arc<Mutex<Vec<String>>>,
}

impl MockPortOpener {
    /// Opener with no devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `device` at `endpoint`.
    pub fn with_device(mut self, endpoint: impl Into<String>, device: SimulatedActuator) -> Self {
        self.devices.insert(endpoint.into(), device);
        self
    }

    /// Endpoints passed to `open`, in call order, including failed ones.
    pub fn open_log(&self) -> Vec<String> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl PortOpener for MockPortOpener {
    async fn open(&self, endpoint: &str, _baud_rate: u32) -> ActResult<DynSerial> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(endpoint.to_string());

        match self.devices.get(endpoint) {
            Some(device) => Ok(Box::new(device.port())),
            None => Err(ActError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such device: {endpoint}"),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::modbus_frame::{
        absolute_speed_frame, absolute_target_frame, encode_hex, read_holding_request,
        relative_move_frame,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn read_frame(port: &mut SimulatedPort, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        port.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn answers_position_probe() {
        let device = SimulatedActuator::new().with_position(3);
        let mut port = device.port();

        port.write_all(&read_holding_request(POSITION_REGISTER, 0x10)).await.unwrap();
        let response = read_frame(&mut port, 3 + 32 + 2).await;

        assert!(validate_crc(&response));
        assert_eq!(response[2], 32);
        assert_eq!(i16::from_be_bytes([response[5], response[6]]), 300);
        assert_eq!(device.position_reads(), 1);
    }

    #[tokio::test]
    async fn short_payload_keeps_valid_crc() {
        let device = SimulatedActuator::new()
            .with_position(3)
            .with_behavior(SimBehavior::ShortPayload);
        let mut port = device.port();

        port.write_all(&read_holding_request(POSITION_REGISTER, 0x10)).await.unwrap();
        let response = read_frame(&mut port, 3 + 2 + 2).await;

        assert!(validate_crc(&response));
        assert_eq!(response[2], 2);
    }

    #[tokio::test]
    async fn read_fault_hits_one_read() {
        let device = SimulatedActuator::new();
        let mut port = device.port();
        device.fail_next_read();

        let mut buf = [0u8; 8];
        assert!(port.read(&mut buf).await.is_err());
        port.write_all(&encode_hex("01 05 00 1a 00 00 ec 0d")).await.unwrap();
        assert_eq!(read_frame(&mut port, 8).await, encode_hex("01 05 00 1a 00 00 ec 0d"));
    }

    #[tokio::test]
    async fn relative_move_applies_on_trigger() {
        let device = SimulatedActuator::new().with_position(2);
        let mut port = device.port();

        port.write_all(&relative_move_frame(10, 3)).await.unwrap();
        assert_eq!(device.target_raw(), 200);
        port.write_all(&encode_hex("01 10 91 00 00 01 02 01 00 27 09")).await.unwrap();
        assert_eq!(device.target_raw(), 500);
        assert_eq!(device.speed(), 10);

        // Register-write acks: addr, fn, register, quantity, CRC.
        let ack = read_frame(&mut port, 8).await;
        assert_eq!(&ack[..2], &[0x01, 0x10]);
        assert!(validate_crc(&ack));
    }

    #[tokio::test]
    async fn relative_move_cannot_go_below_origin() {
        let device = SimulatedActuator::new().with_position(2);
        let mut port = device.port();
        port.write_all(&relative_move_frame(10, -5)).await.unwrap();
        port.write_all(&encode_hex("01 10 91 00 00 01 02 01 00 27 09")).await.unwrap();
        assert_eq!(device.target_raw(), 0);
    }

    #[tokio::test]
    async fn absolute_move_starts_on_start_coil() {
        let device = SimulatedActuator::new();
        let mut port = device.port();

        port.write_all(&absolute_speed_frame(7)).await.unwrap();
        port.write_all(&absolute_target_frame(800)).await.unwrap();
        assert_eq!(device.target_raw(), 0);

        port.write_all(&encode_hex("01 05 00 1a ff 00 ad fd")).await.unwrap();
        assert_eq!(device.target_raw(), 800);
        assert_eq!(device.speed(), 7);
    }

    #[tokio::test]
    async fn position_steps_toward_target_per_read() {
        let device = SimulatedActuator::new().with_step(50);
        let mut port = device.port();
        port.write_all(&absolute_target_frame(120)).await.unwrap();
        port.write_all(&encode_hex("01 05 00 1a ff 00 ad fd")).await.unwrap();

        let probe = read_holding_request(POSITION_REGISTER, 0x10);
        for expected in [50, 100, 120, 120] {
            port.write_all(&probe).await.unwrap();
            assert_eq!(device.position_raw(), expected);
        }
    }

    #[tokio::test]
    async fn corrupt_behavior_breaks_crc() {
        let device = SimulatedActuator::new().with_behavior(SimBehavior::CorruptCrc);
        let mut port = device.port();
        port.write_all(&read_holding_request(POSITION_REGISTER, 0x10)).await.unwrap();
        let response = read_frame(&mut port, 37).await;
        assert!(!validate_crc(&response));
    }

    #[tokio::test]
    async fn unplugged_device_fails_writes() {
        let device = SimulatedActuator::new();
        let mut port = device.port();
        device.unplug();
        assert!(port.write_all(&[0x01]).await.is_err());
        let mut buf = [0u8; 1];
        assert_eq!(port.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn opener_logs_every_attempt() {
        let opener = MockPortOpener::new().with_device("/dev/ttyUSB1", SimulatedActuator::new());

        assert!(opener.open("/dev/ttyUSB0", 38400).await.is_err());
        assert!(opener.open("/dev/ttyUSB1", 38400).await.is_ok());
        assert_eq!(opener.open_log(), vec!["/dev/ttyUSB0", "/dev/ttyUSB1"]);
    }
}
