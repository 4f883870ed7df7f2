//! Wire-format definitions for protocol frames.
//!
//! Every datagram exchanged between sockets carries exactly one [`Frame`].
//! This module:
//! - Defines the on-wire binary layout (header fields, flags, payload).
//! - Serialises a [`Frame`] into a byte buffer ready for transmission.
//! - Deserialises a raw byte slice back into a [`Frame`], returning a
//!   [`PacketError`] for malformed or truncated input.
//!
//! No I/O happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Magic     |    Version    |     Type      |     Flags     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Destination Local Id                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Source Local Id                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Sequence Number                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Payload Length         |           Checksum            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload ...                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 24 bytes.  Only DATA and MESSAGE
//! frames may carry a payload.

use thiserror::Error;

/// First byte of every frame.
pub const MAGIC: u8 = 0x4d;

/// Wire version understood by this implementation.
pub const VERSION: u8 = 1;

/// Fixed header size.
pub const HEADER_LEN: usize = 24;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// Values for [`Frame::flags`].
pub mod flags {
    /// DATA: this frame closes the sender's direction (consumes one sequence number).
    pub const END: u8 = 0b0000_0001;
    /// ACK: `seq` names a message id being acknowledged.
    pub const MESSAGE: u8 = 0b0000_0010;
    /// MESSAGE: best-effort, must not be acknowledged.
    pub const UNRELIABLE: u8 = 0b0000_0100;

    pub(super) const ALL: u8 = END | MESSAGE | UNRELIABLE;
}

// Header field offsets.
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 1;
const OFF_TYPE: usize = 2;
const OFF_FLAGS: usize = 3;
const OFF_DST: usize = 4;
const OFF_SRC: usize = 8;
const OFF_SEQ: usize = 12;
const OFF_ACK: usize = 16;
const OFF_PAYLOAD_LEN: usize = 20;
const OFF_CHECKSUM: usize = 22;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Data = 1,
    Ack = 2,
    Message = 3,
    Destroy = 4,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Data,
            2 => Self::Ack,
            3 => Self::Message,
            4 => Self::Destroy,
            _ => return None,
        })
    }

    /// Whether frames of this type may carry payload bytes.
    pub fn carries_payload(self) -> bool {
        matches!(self, Self::Data | Self::Message)
    }
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub flags: u8,
    /// Local id of the receiving stream.
    pub dst: u32,
    /// Local id of the sending stream.
    pub src: u32,
    /// DATA: sequence number.  MESSAGE and message ACKs: message id.
    pub seq: u32,
    /// Cumulative acknowledgement: next sequence number the sender expects.
    pub ack: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// A frame of `kind` with zeroed header fields and no payload.
    pub fn new(kind: FrameType, dst: u32, src: u32) -> Self {
        Self {
            kind,
            flags: 0,
            dst,
            src,
            seq: 0,
            ack: 0,
            payload: Vec::new(),
        }
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Serialise this frame into a newly allocated byte vector.
    ///
    /// Fails if the payload cannot be described by the length field or the
    /// frame type does not allow a payload.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(payload_len));
        }
        if payload_len > 0 && !self.kind.carries_payload() {
            return Err(PacketError::UnexpectedPayload(self.kind));
        }

        let mut buf = vec![0u8; HEADER_LEN + payload_len];
        buf[OFF_MAGIC] = MAGIC;
        buf[OFF_VERSION] = VERSION;
        buf[OFF_TYPE] = self.kind as u8;
        buf[OFF_FLAGS] = self.flags;
        buf[OFF_DST..OFF_DST + 4].copy_from_slice(&self.dst.to_be_bytes());
        buf[OFF_SRC..OFF_SRC + 4].copy_from_slice(&self.src.to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.ack.to_be_bytes());
        buf[OFF_PAYLOAD_LEN..OFF_PAYLOAD_LEN + 2]
            .copy_from_slice(&(payload_len as u16).to_be_bytes());
        // Checksum field stays zero while the checksum is computed.
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        let checksum = internet_checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&checksum.to_be_bytes());

        Ok(buf)
    }

    /// Parse a [`Frame`] from a raw datagram.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort(buf.len()));
        }
        if buf[OFF_MAGIC] != MAGIC {
            return Err(PacketError::BadMagic(buf[OFF_MAGIC]));
        }
        if buf[OFF_VERSION] != VERSION {
            return Err(PacketError::UnsupportedVersion(buf[OFF_VERSION]));
        }
        let kind = FrameType::from_u8(buf[OFF_TYPE])
            .ok_or(PacketError::UnknownType(buf[OFF_TYPE]))?;
        let flags = buf[OFF_FLAGS];
        if flags & !flags::ALL != 0 {
            return Err(PacketError::UnknownFlags(flags));
        }

        let payload_len = usize::from(read_u16(buf, OFF_PAYLOAD_LEN));
        if buf.len() != HEADER_LEN + payload_len {
            return Err(PacketError::LengthMismatch {
                declared: payload_len,
                actual: buf.len() - HEADER_LEN,
            });
        }

        // The checksum was computed with its own field zeroed.
        let checksum = read_u16(buf, OFF_CHECKSUM);
        let mut scratch = buf.to_vec();
        scratch[OFF_CHECKSUM..OFF_CHECKSUM + 2].fill(0);
        if internet_checksum(&scratch) != checksum {
            return Err(PacketError::ChecksumFailed);
        }

        if payload_len > 0 && !kind.carries_payload() {
            return Err(PacketError::UnexpectedPayload(kind));
        }

        Ok(Self {
            kind,
            flags,
            dst: read_u32(buf, OFF_DST),
            src: read_u32(buf, OFF_SRC),
            seq: read_u32(buf, OFF_SEQ),
            ack: read_u32(buf, OFF_ACK),
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Why a datagram could not be decoded, or a frame encoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("buffer of {0} bytes is too short to contain a header")]
    BufferTooShort(usize),
    #[error("bad magic byte {0:#04x}")]
    BadMagic(u8),
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown frame type {0}")]
    UnknownType(u8),
    #[error("unknown flag bits {0:#010b}")]
    UnknownFlags(u8),
    #[error("payload_len field says {declared} bytes but {actual} remain")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("checksum verification failed")]
    ChecksumFailed,
    #[error("{0:?} frames cannot carry a payload")]
    UnexpectedPayload(FrameType),
    #[error("payload of {0} bytes does not fit in one frame")]
    PayloadTooLarge(usize),
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// RFC 1071 ones'-complement sum of `data`, complemented.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
        // Fold early so very large payloads cannot overflow.
        if sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
    }
    // Odd trailing byte, padded with a zero byte on the right.
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}
