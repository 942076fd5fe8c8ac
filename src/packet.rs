//! uTP Header Encoding/Decoding (BEP 29)
//!
//! A uTP datagram is a 20-byte fixed header, a chain of extension blocks
//! and the payload. Each extension block is `[next_type, len, data..]`; the
//! first extension type lives in byte 1 of the fixed header and a type of 0
//! terminates the chain.

use thiserror::Error;

use crate::selective_ack::SelectiveAckBitmask;

/// Fixed uTP header size
pub const HEADER_SIZE: usize = 20;

/// Out-of-order packets a connection will buffer ahead of `ack_nr + 1`
pub const MAX_UNACKED_INBOUND: usize = 256;

/// Largest selective ack we ever attach (one bit per reorder slot, padded to 4 bytes)
pub const MAX_SELECTIVE_ACK_LEN: usize = (MAX_UNACKED_INBOUND.div_ceil(8) + 3) / 4 * 4;

/// Fixed header, one extension block header and the largest selective ack
pub const MAX_HEADER_SIZE: usize = HEADER_SIZE + 2 + MAX_SELECTIVE_ACK_LEN;

/// Datagram size we never exceed when sending
pub const MIN_MTU: usize = 1438;

/// Maximum payload size per packet
pub const MAX_PAYLOAD_SIZE: usize = MIN_MTU - MAX_HEADER_SIZE;

/// Receive buffer size for the socket reader
pub const MAX_RECV_SIZE: usize = 0x2000;

/// uTP protocol version
pub const UTP_VERSION: u8 = 1;

/// Extension type byte that terminates the chain
pub const EXTENSION_NONE: u8 = 0;

/// Extension type byte of the selective ack extension
pub const EXTENSION_SELECTIVE_ACK: u8 = 1;

/// Header decoding/encoding failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    #[error("unsupported uTP version: {0}")]
    UnsupportedVersion(u8),

    #[error("invalid packet type: {0}")]
    InvalidType(u8),

    #[error("extension {ext_type} runs past the end of the packet")]
    TruncatedExtension { ext_type: u8 },

    #[error("selective ack length {0} is not a positive multiple of 4")]
    InvalidSelectiveAck(usize),

    #[error("extension data of {0} bytes does not fit a length byte")]
    ExtensionTooLong(usize),

    #[error("header needs {needed} bytes, limit is {limit}")]
    TooLarge { needed: usize, limit: usize },
}

/// Packet type values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Regular data packet
    Data = 0,
    /// Connection teardown
    Fin = 1,
    /// Acknowledgment (no payload)
    State = 2,
    /// Connection reset
    Reset = 3,
    /// Connection initiation
    Syn = 4,
}

impl PacketType {
    /// Types that consume a sequence number and are retransmitted until acked
    pub fn is_reliable(self) -> bool {
        matches!(self, Self::Syn | Self::Data | Self::Fin)
    }
}

impl TryFrom<u8> for PacketType {
    type Error = HeaderError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::Fin),
            2 => Ok(Self::State),
            3 => Ok(Self::Reset),
            4 => Ok(Self::Syn),
            _ => Err(HeaderError::InvalidType(value)),
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data => write!(f, "ST_DATA"),
            Self::Fin => write!(f, "ST_FIN"),
            Self::State => write!(f, "ST_STATE"),
            Self::Reset => write!(f, "ST_RESET"),
            Self::Syn => write!(f, "ST_SYN"),
        }
    }
}

/// One extension block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub ext_type: u8,
    pub data: Vec<u8>,
}

impl Extension {
    pub fn selective_ack(bitmask: SelectiveAckBitmask) -> Self {
        Self {
            ext_type: EXTENSION_SELECTIVE_ACK,
            data: bitmask.into_bytes(),
        }
    }
}

/// uTP packet header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub packet_type: PacketType,

    pub version: u8,

    /// Connection ID (the receiver's recv_id, or recv_id - 1 on a SYN)
    pub conn_id: u16,

    /// Microsecond timestamp
    pub timestamp: u32,

    /// Our timestamp minus the peer's last timestamp
    pub timestamp_diff: u32,

    /// Receive window size (in bytes)
    pub wnd_size: u32,

    pub seq_nr: u16,

    /// Cumulative ack: every seq_nr up to and including this one arrived
    pub ack_nr: u16,

    pub extensions: Vec<Extension>,
}

impl Header {
    pub fn new(packet_type: PacketType, conn_id: u16, seq_nr: u16, ack_nr: u16) -> Self {
        Self {
            packet_type,
            version: UTP_VERSION,
            conn_id,
            timestamp: 0,
            timestamp_diff: 0,
            wnd_size: 0,
            seq_nr,
            ack_nr,
            extensions: Vec::new(),
        }
    }

    pub fn with_window(mut self, wnd_size: u32) -> Self {
        self.wnd_size = wnd_size;
        self
    }

    pub fn with_timestamps(mut self, timestamp: u32, timestamp_diff: u32) -> Self {
        self.timestamp = timestamp;
        self.timestamp_diff = timestamp_diff;
        self
    }

    pub fn with_selective_ack(mut self, bitmask: SelectiveAckBitmask) -> Self {
        self.extensions.push(Extension::selective_ack(bitmask));
        self
    }

    /// First selective ack extension, if any
    pub fn selective_ack(&self) -> Option<SelectiveAckBitmask> {
        self.extensions
            .iter()
            .find(|ext| ext.ext_type == EXTENSION_SELECTIVE_ACK)
            .map(|ext| SelectiveAckBitmask::from_bytes(ext.data.clone()))
    }

    /// Bytes `marshal` will write
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE
            + self
                .extensions
                .iter()
                .map(|ext| 2 + ext.data.len())
                .sum::<usize>()
    }

    /// Serialize into `buf`, returning the number of bytes written.
    ///
    /// The encoded header may never exceed [`MAX_HEADER_SIZE`]; payload
    /// slicing downstream relies on that bound.
    pub fn marshal(&self, buf: &mut [u8]) -> Result<usize, HeaderError> {
        let needed = self.encoded_len();
        if needed > MAX_HEADER_SIZE {
            return Err(HeaderError::TooLarge {
                needed,
                limit: MAX_HEADER_SIZE,
            });
        }
        if needed > buf.len() {
            return Err(HeaderError::TooLarge {
                needed,
                limit: buf.len(),
            });
        }

        let first_ext = self
            .extensions
            .first()
            .map_or(EXTENSION_NONE, |ext| ext.ext_type);

        // Byte 0: type (4 bits) | version (4 bits)
        buf[0] = (self.packet_type as u8) << 4 | (self.version & 0x0F);
        buf[1] = first_ext;
        buf[2..4].copy_from_slice(&self.conn_id.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.timestamp_diff.to_be_bytes());
        buf[12..16].copy_from_slice(&self.wnd_size.to_be_bytes());
        buf[16..18].copy_from_slice(&self.seq_nr.to_be_bytes());
        buf[18..20].copy_from_slice(&self.ack_nr.to_be_bytes());

        let mut offset = HEADER_SIZE;
        for (i, ext) in self.extensions.iter().enumerate() {
            let len = u8::try_from(ext.data.len())
                .map_err(|_| HeaderError::ExtensionTooLong(ext.data.len()))?;
            buf[offset] = self
                .extensions
                .get(i + 1)
                .map_or(EXTENSION_NONE, |next| next.ext_type);
            buf[offset + 1] = len;
            offset += 2;
            buf[offset..offset + ext.data.len()].copy_from_slice(&ext.data);
            offset += ext.data.len();
        }

        Ok(offset)
    }

    /// Parse a header, returning it and the offset where the payload starts.
    pub fn unmarshal(data: &[u8]) -> Result<(Self, usize), HeaderError> {
        if data.len() < HEADER_SIZE {
            return Err(HeaderError::TooShort(data.len()));
        }

        let packet_type = PacketType::try_from(data[0] >> 4)?;
        let version = data[0] & 0x0F;
        if version != UTP_VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }

        let mut header = Self {
            packet_type,
            version,
            conn_id: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            timestamp_diff: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            wnd_size: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            seq_nr: u16::from_be_bytes([data[16], data[17]]),
            ack_nr: u16::from_be_bytes([data[18], data[19]]),
            extensions: Vec::new(),
        };

        let mut offset = HEADER_SIZE;
        let mut ext_type = data[1];
        while ext_type != EXTENSION_NONE {
            if offset + 2 > data.len() {
                return Err(HeaderError::TruncatedExtension { ext_type });
            }
            let next = data[offset];
            let len = data[offset + 1] as usize;
            offset += 2;

            if offset + len > data.len() {
                return Err(HeaderError::TruncatedExtension { ext_type });
            }
            if ext_type == EXTENSION_SELECTIVE_ACK && (len == 0 || len % 4 != 0) {
                return Err(HeaderError::InvalidSelectiveAck(len));
            }

            header.extensions.push(Extension {
                ext_type,
                data: data[offset..offset + len].to_vec(),
            });
            offset += len;
            ext_type = next;
        }

        Ok((header, offset))
    }
}

/// `a` precedes `b` in 16-bit sequence space
pub fn seq_less(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) < 0
}

/// Current wall clock in microseconds, truncated to 32 bits
pub fn timestamp_us() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (duration.as_micros() & 0xFFFF_FFFF) as u32
}
