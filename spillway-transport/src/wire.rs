//! Wire format for frames exchanged by the TCP fabric.
//!
//! Frame format: `[length:4][checksum:4][sequence:8][op:4][flags:4][payload:N]`
//!
//! - **length**: total frame size including header (little-endian u32)
//! - **checksum**: CRC32C of everything after the checksum field
//! - **sequence**: call sequence number, echoed by the response
//! - **op**: [`OpId`] of the operation
//! - **flags**: [`FrameFlags`] bits
//! - **payload**: request body or response output
//!
//! A request payload is `[input_len:4][input][bulk]`; the bulk bytes, when
//! present, follow the input and the [`FrameFlags::BULK`] bit is set.

use spillway_core::OpId;

/// Header size: 4 (length) + 4 (checksum) + 8 (sequence) + 4 (op) + 4 (flags).
pub const HEADER_SIZE: usize = 24;

/// Maximum payload size (64 MiB).
///
/// Frames larger than this are rejected before any allocation.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the frame.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// The frame was corrupted in flight.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the header.
        expected: u32,
        /// Checksum computed over the received bytes.
        actual: u32,
    },

    /// Payload exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("frame too large: {size} bytes (max {MAX_PAYLOAD_SIZE})")]
    PacketTooLarge {
        /// Payload size in bytes.
        size: usize,
    },

    /// Length field, or an inner length, is inconsistent.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The offending length value.
        length: u32,
    },
}

/// Bit flags carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(pub u32);

impl FrameFlags {
    /// The frame answers a request.
    pub const RESPONSE: FrameFlags = FrameFlags(1);
    /// The request failed; the payload is a UTF-8 reason.
    pub const FAILED: FrameFlags = FrameFlags(2);
    /// The request payload carries bulk bytes after the input.
    pub const BULK: FrameFlags = FrameFlags(4);

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    pub const fn with(self, other: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | other.0)
    }
}

/// Fixed-size header fields preceding the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame size including header.
    pub length: u32,
    /// CRC32C over sequence, op, flags and payload.
    pub checksum: u32,
    /// Call sequence number.
    pub sequence: u64,
    /// Operation identifier.
    pub op: OpId,
    /// Frame flags.
    pub flags: FrameFlags,
}

impl FrameHeader {
    fn serialize_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        buf[8..16].copy_from_slice(&self.sequence.to_le_bytes());
        buf[16..20].copy_from_slice(&self.op.0.to_le_bytes());
        buf[20..24].copy_from_slice(&self.flags.0.to_le_bytes());
    }

    /// Parse a header from the first [`HEADER_SIZE`] bytes of `buf`.
    pub fn deserialize(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::InsufficientData {
                needed: HEADER_SIZE,
                have: buf.len(),
            });
        }

        Ok(Self {
            length: read_u32(&buf[0..4]),
            checksum: read_u32(&buf[4..8]),
            sequence: u64::from_le_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
            op: OpId(read_u32(&buf[16..20])),
            flags: FrameFlags(read_u32(&buf[20..24])),
        })
    }

    /// Payload length announced by the header.
    pub fn payload_len(&self) -> Result<usize, WireError> {
        let length = self.length as usize;
        if length < HEADER_SIZE {
            return Err(WireError::InvalidLength {
                length: self.length,
            });
        }
        let payload = length - HEADER_SIZE;
        if payload > MAX_PAYLOAD_SIZE {
            return Err(WireError::PacketTooLarge { size: payload });
        }
        Ok(payload)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Call sequence number.
    pub sequence: u64,
    /// Operation identifier.
    pub op: OpId,
    /// Frame flags.
    pub flags: FrameFlags,
    /// Frame payload.
    pub payload: Vec<u8>,
}

/// Serialize a frame.
///
/// # Errors
///
/// Returns `PacketTooLarge` if the payload exceeds [`MAX_PAYLOAD_SIZE`].
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, WireError> {
    if frame.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(WireError::PacketTooLarge {
            size: frame.payload.len(),
        });
    }

    let total_length = HEADER_SIZE + frame.payload.len();
    let mut data = vec![0u8; total_length];

    let mut header = FrameHeader {
        length: total_length as u32,
        checksum: 0,
        sequence: frame.sequence,
        op: frame.op,
        flags: frame.flags,
    };
    header.serialize_into(&mut data[..HEADER_SIZE]);
    data[HEADER_SIZE..].copy_from_slice(&frame.payload);

    header.checksum = crc32c::crc32c(&data[8..]);
    data[4..8].copy_from_slice(&header.checksum.to_le_bytes());

    Ok(data)
}

/// Decode a complete frame, validating length and checksum.
pub fn decode_frame(data: &[u8]) -> Result<Frame, WireError> {
    let header = FrameHeader::deserialize(data)?;
    let expected_len = HEADER_SIZE + header.payload_len()?;
    if data.len() < expected_len {
        return Err(WireError::InsufficientData {
            needed: expected_len,
            have: data.len(),
        });
    }

    let computed = crc32c::crc32c(&data[8..expected_len]);
    if computed != header.checksum {
        return Err(WireError::ChecksumMismatch {
            expected: header.checksum,
            actual: computed,
        });
    }

    Ok(Frame {
        sequence: header.sequence,
        op: header.op,
        flags: header.flags,
        payload: data[HEADER_SIZE..expected_len].to_vec(),
    })
}

/// Build a request payload from an input and optional bulk bytes.
pub fn request_payload(input: &[u8], bulk: Option<&[u8]>) -> Vec<u8> {
    let bulk_len = bulk.map_or(0, <[u8]>::len);
    let mut payload = Vec::with_capacity(4 + input.len() + bulk_len);
    payload.extend_from_slice(&(input.len() as u32).to_le_bytes());
    payload.extend_from_slice(input);
    if let Some(bulk) = bulk {
        payload.extend_from_slice(bulk);
    }
    payload
}

/// Split a request payload into input and bulk bytes.
pub fn split_request(payload: &[u8]) -> Result<(&[u8], &[u8]), WireError> {
    if payload.len() < 4 {
        return Err(WireError::InsufficientData {
            needed: 4,
            have: payload.len(),
        });
    }
    let input_len = read_u32(&payload[0..4]);
    let rest = &payload[4..];
    if input_len as usize > rest.len() {
        return Err(WireError::InvalidLength { length: input_len });
    }
    Ok(rest.split_at(input_len as usize))
}
