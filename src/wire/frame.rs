//! Length-prefixed frame codec for the replication transport.
//!
//! Every RPC message travels as one frame. The framing is symmetric between
//! the two peers: either side may send requests and responses on the same
//! connection.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Protocol magic bytes: b"SWGR"
pub const PROTOCOL_MAGIC: [u8; 4] = [0x53, 0x57, 0x47, 0x52];

/// Current protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 14;

/// Maximum payload size (a full NAT state snapshot can be large)
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Frame layout:
/// ```text
/// Offset | Size | Field
/// -------|------|-------------
///   0    |  4   | Magic bytes (b"SWGR")
///   4    |  1   | Protocol version
///   5    |  1   | Reserved (padding)
///   6    |  4   | Payload length
///  10    |  4   | CRC32 checksum
///  14    |  ?   | Payload (bincode-encoded message)
/// ```
#[derive(Error, Debug)]
pub enum FrameError {
    /// Magic bytes did not match
    #[error("invalid magic bytes: expected {expected:02x?}, got {actual:02x?}")]
    InvalidMagic {
        /// Expected magic bytes
        expected: [u8; 4],
        /// Observed magic bytes
        actual: [u8; 4],
    },

    /// Unsupported protocol version
    #[error("unsupported protocol version {version}, supported {supported}")]
    UnsupportedVersion {
        /// Observed version
        version: u8,
        /// Version this implementation speaks
        supported: u8,
    },

    /// Payload exceeds the maximum size
    #[error("payload too large: {actual} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Observed payload length
        actual: u32,
        /// Maximum allowed payload length
        max: u32,
    },

    /// Checksum verification failed
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the frame
        expected: u32,
        /// Checksum computed over the received bytes
        actual: u32,
    },
}

/// Result type for framing operations
pub type FrameResult<T> = std::result::Result<T, FrameError>;

/// Encode a payload into a single frame.
pub fn encode_frame(payload: &[u8]) -> FrameResult<Bytes> {
    let payload_len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge { actual: payload_len, max: MAX_PAYLOAD_SIZE });
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_slice(&PROTOCOL_MAGIC);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(0); // reserved
    buf.put_u32(payload_len);

    let checksum = checksum(&buf[..], payload);
    buf.put_u32(checksum);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Streaming frame decoder.
///
/// Feed raw bytes with [`extend`](FrameDecoder::extend) and drain complete
/// payloads with [`try_decode`](FrameDecoder::try_decode). Incomplete frames
/// stay buffered until the remaining bytes arrive.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create a new decoder.
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: BytesMut::with_capacity(16 * 1024) }
    }

    /// Append received bytes to the decode buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next complete frame payload.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn try_decode(&mut self) -> FrameResult<Option<Bytes>> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&self.buffer[0..4]);
        if magic != PROTOCOL_MAGIC {
            return Err(FrameError::InvalidMagic { expected: PROTOCOL_MAGIC, actual: magic });
        }

        let version = self.buffer[4];
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion { version, supported: PROTOCOL_VERSION });
        }

        let payload_len =
            u32::from_be_bytes([self.buffer[6], self.buffer[7], self.buffer[8], self.buffer[9]]);
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge { actual: payload_len, max: MAX_PAYLOAD_SIZE });
        }

        let total = FRAME_HEADER_SIZE + payload_len as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let expected_checksum = u32::from_be_bytes([
            self.buffer[10],
            self.buffer[11],
            self.buffer[12],
            self.buffer[13],
        ]);

        let mut frame = self.buffer.split_to(total);
        let header = frame.split_to(FRAME_HEADER_SIZE);
        let payload = frame.freeze();

        let actual_checksum = checksum(&header[..10], &payload);
        if actual_checksum != expected_checksum {
            return Err(FrameError::ChecksumMismatch {
                expected: expected_checksum,
                actual: actual_checksum,
            });
        }

        Ok(Some(payload))
    }

    /// Number of buffered, not yet decoded bytes.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// CRC32 over the header (without the checksum field) and the payload.
fn checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    hasher.finalize()
}
