//! Modbus-RTU frame codec for the actuator.
//!
//! Pure encode/decode/CRC logic plus the two-stage response read. Frames on this
//! link are `address + function + payload + CRC16`, with the CRC trailer sent low
//! byte first.
//!
//! # CRC
//!
//! CRC-16/MODBUS: reflected polynomial 0xA001 (0x8005 normal form), initial value
//! 0xFFFF, no final XOR. The `crc` crate's table-free implementation is used; the
//! frames are short and the link runs at 38400 baud.
//!
//! # Response layout
//!
//! ```text
//! +------+------+-----------+----------------------+---------+---------+
//! | addr | func | byteCount | payload (byteCount)  | CRC lo  | CRC hi  |
//! +------+------+-----------+----------------------+---------+---------+
//! ```

use act_core::serial::read_exact_until;
use act_core::{ActError, ActResult};
use crc::{Crc, NoTable, CRC_16_MODBUS};
use tokio::io::AsyncRead;
use tokio::time::Instant;

/// Fixed unit address of the actuator.
pub const UNIT_ADDRESS: u8 = 0x01;

/// Read holding registers.
pub const FN_READ_HOLDING: u8 = 0x03;
/// Write single coil.
pub const FN_WRITE_COIL: u8 = 0x05;
/// Write multiple coils.
pub const FN_WRITE_COILS: u8 = 0x0F;
/// Write multiple registers.
pub const FN_WRITE_REGISTERS: u8 = 0x10;

/// Length of a response header (address, function, byte count).
pub const RESPONSE_HEADER_LEN: usize = 3;

/// Length of the CRC trailer.
pub const CRC_LEN: usize = 2;

/// Device raw units per external position unit.
pub const RAW_PER_UNIT: i32 = 100;

const MODBUS_CRC: Crc<u16, NoTable> = Crc::<u16, NoTable>::new(&CRC_16_MODBUS);

/// Parse a hex literal such as `"01 03 00 0e 00 08 25 cf"` into bytes.
///
/// Whitespace is ignored and any other non-hex character is skipped. Nibbles are
/// paired in order of appearance; a trailing unpaired nibble is dropped.
pub fn encode_hex(literal: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(literal.len() / 2);
    let mut high: Option<u8> = None;

    for c in literal.chars() {
        let Some(nibble) = c.to_digit(16) else {
            continue;
        };
        let nibble = nibble as u8;
        match high.take() {
            None => high = Some(nibble),
            Some(h) => out.push((h << 4) | nibble),
        }
    }

    out
}

/// Compute the CRC-16/MODBUS checksum of `data`.
pub fn compute_crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Append the CRC trailer to `frame`, low byte first.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = compute_crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Check a frame's CRC trailer against the rest of the frame.
///
/// Frames shorter than 4 bytes are never valid.
pub fn validate_crc(frame: &[u8]) -> bool {
    check_crc(frame).is_ok()
}

/// Like [`validate_crc`] but reports both values on mismatch.
pub fn check_crc(frame: &[u8]) -> ActResult<()> {
    if frame.len() < 4 {
        return Err(ActError::MalformedResponse(format!(
            "frame of {} bytes is too short to carry a checksum",
            frame.len()
        )));
    }

    let (body, trailer) = frame.split_at(frame.len() - CRC_LEN);
    let computed = compute_crc16(body);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);

    if computed == received {
        Ok(())
    } else {
        Err(ActError::ChecksumMismatch { computed, received })
    }
}

/// Round a signed device raw value to external units, half away from zero.
pub fn raw_to_external(raw: i16) -> i32 {
    let raw = i32::from(raw);
    if raw >= 0 {
        (raw + RAW_PER_UNIT / 2) / RAW_PER_UNIT
    } else {
        (raw - RAW_PER_UNIT / 2) / RAW_PER_UNIT
    }
}

/// A response read off the wire: header, `byteCount` payload bytes, CRC trailer.
///
/// Construction guarantees `len == 3 + byteCount + 2`. The CRC is not checked on
/// construction; call [`ResponseFrame::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    bytes: Vec<u8>,
}

impl ResponseFrame {
    /// Wrap raw bytes, checking only the length invariant.
    pub fn from_bytes(bytes: Vec<u8>) -> ActResult<Self> {
        if bytes.len() < RESPONSE_HEADER_LEN + CRC_LEN {
            return Err(ActError::MalformedResponse(format!(
                "response of {} bytes is shorter than header and checksum",
                bytes.len()
            )));
        }
        let byte_count = usize::from(bytes[2]);
        let expected = RESPONSE_HEADER_LEN + byte_count + CRC_LEN;
        if bytes.len() != expected {
            return Err(ActError::MalformedResponse(format!(
                "byte count {} implies {} bytes, got {}",
                byte_count,
                expected,
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    /// Unit address.
    pub fn address(&self) -> u8 {
        self.bytes[0]
    }

    /// Function code.
    pub fn function(&self) -> u8 {
        self.bytes[1]
    }

    /// Declared payload length.
    pub fn byte_count(&self) -> u8 {
        self.bytes[2]
    }

    /// Payload bytes, excluding header and CRC.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[RESPONSE_HEADER_LEN..self.bytes.len() - CRC_LEN]
    }

    /// The full frame as received.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Total frame length.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Never true; a frame always carries header and CRC.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Check the CRC trailer.
    pub fn verify(&self) -> ActResult<()> {
        check_crc(&self.bytes)
    }

    /// Signed 16-bit big-endian value at absolute frame offset `offset`.
    ///
    /// Returns `None` unless both bytes lie inside the payload.
    pub fn i16_be_at(&self, offset: usize) -> Option<i16> {
        let payload_end = self.bytes.len() - CRC_LEN;
        if offset < RESPONSE_HEADER_LEN || offset + 2 > payload_end {
            return None;
        }
        Some(i16::from_be_bytes([self.bytes[offset], self.bytes[offset + 1]]))
    }
}

/// Read one response: exactly 3 header bytes, then `byteCount + 2` more.
///
/// Both stages share `deadline`. A short read on either stage is
/// [`ActError::ShortRead`] with the counts of the whole frame.
pub async fn parse_response<R: AsyncRead + Unpin + ?Sized>(
    port: &mut R,
    deadline: Instant,
) -> ActResult<ResponseFrame> {
    let mut header = [0u8; RESPONSE_HEADER_LEN];
    read_exact_until(port, &mut header, deadline).await?;

    let tail_len = usize::from(header[2]) + CRC_LEN;
    let mut bytes = Vec::with_capacity(RESPONSE_HEADER_LEN + tail_len);
    bytes.extend_from_slice(&header);
    bytes.resize(RESPONSE_HEADER_LEN + tail_len, 0);

    read_exact_until(port, &mut bytes[RESPONSE_HEADER_LEN..], deadline)
        .await
        .map_err(|e| match e {
            ActError::ShortRead { received, .. } => ActError::ShortRead {
                expected: RESPONSE_HEADER_LEN + tail_len,
                received: RESPONSE_HEADER_LEN + received,
            },
            other => other,
        })?;

    ResponseFrame::from_bytes(bytes)
}

/// Build a read-holding-registers request with CRC.
pub fn read_holding_request(register: u16, count: u16) -> Vec<u8> {
    let mut frame = vec![UNIT_ADDRESS, FN_READ_HOLDING];
    frame.extend_from_slice(&register.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    append_crc(&mut frame);
    frame
}

/// Build a read-holding-registers response carrying `payload`, with CRC.
pub fn read_holding_response(payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![UNIT_ADDRESS, FN_READ_HOLDING, payload.len() as u8];
    frame.extend_from_slice(payload);
    append_crc(&mut frame);
    frame
}

/// Register block written by a relative move.
pub const RELATIVE_MOVE_REGISTER: u16 = 0x9102;

/// Build the relative-move parameter block.
///
/// The displacement field is a 32-bit big-endian signed count of device units, so
/// positive deltas carry `00 00` in the high word and negative deltas `FF FF`.
pub fn relative_move_frame(speed: u16, delta: i32) -> Vec<u8> {
    let displacement = delta.saturating_mul(RAW_PER_UNIT);
    let mut frame = vec![UNIT_ADDRESS, FN_WRITE_REGISTERS];
    frame.extend_from_slice(&RELATIVE_MOVE_REGISTER.to_be_bytes());
    // 0x10 registers, 0x20 bytes
    frame.extend_from_slice(&[0x00, 0x10, 0x20]);
    // mode word
    frame.extend_from_slice(&[0x00, 0x02]);
    frame.extend_from_slice(&speed.to_be_bytes());
    frame.extend_from_slice(&displacement.to_be_bytes());
    // acceleration, deceleration
    frame.extend_from_slice(&[0x03, 0xE8, 0x03, 0xE8]);
    frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x64]);
    frame.extend_from_slice(&[0x00; 11]);
    frame.push(0x32);
    append_crc(&mut frame);
    frame
}

/// Build the absolute-move speed write (register 0x0411).
pub fn absolute_speed_frame(speed: u16) -> Vec<u8> {
    let mut frame = vec![UNIT_ADDRESS, FN_WRITE_REGISTERS, 0x04, 0x11, 0x00, 0x01, 0x02];
    frame.extend_from_slice(&speed.to_be_bytes());
    append_crc(&mut frame);
    frame
}

/// Build the absolute-move target write (registers 0x0412..0x0413).
pub fn absolute_target_frame(target_raw: u16) -> Vec<u8> {
    let mut frame = vec![
        UNIT_ADDRESS,
        FN_WRITE_REGISTERS,
        0x04,
        0x12,
        0x00,
        0x02,
        0x04,
        0x00,
        0x00,
    ];
    frame.extend_from_slice(&target_raw.to_be_bytes());
    append_crc(&mut frame);
    frame
}
