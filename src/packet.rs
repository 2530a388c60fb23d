//! Packet header codec.
//!
//! Translates between datagram bytes and typed [`Header`] records without
//! touching connection state; rules that depend on the connection (version
//! pinning, CID ownership) live in [`Header::validate`] so the parser stays
//! pure. Packet numbers travel truncated and are widened against the largest
//! number previously received.

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::coding::{BufExt, BufMutExt, CodingError};
use crate::{ConnectionId, MAX_CID_LEN, VERSION};

pub(crate) const LONG_FORM: u8 = 0x80;
pub(crate) const FIXED_BIT: u8 = 0x40;
pub(crate) const SPIN_BIT: u8 = 0x20;
/// Short-header bits 4-2: reserved, must be clear.
const SHORT_RESERVED: u8 = 0b0001_1100;
const LONG_TYPE_MASK: u8 = 0b0011_0000;
const PN_LEN_MASK: u8 = 0b0000_0011;

/// Everything that can go wrong between raw bytes and a processed packet.
///
/// Each variant is counted separately by the operator-visible telemetry;
/// none of them terminates the connection.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ParseError {
    #[error("packet type byte matches no known form")]
    InvalidPacketType,
    #[error("unsupported QUIC version")]
    InvalidVersion,
    #[error("connection ID length exceeds 20 bytes")]
    InvalidCidLength,
    #[error("claimed header extends beyond the buffer")]
    InvalidPacketSize,
    #[error("buffer too short for the declared packet number length")]
    InvalidPacketNumberLen,
    #[error("destination CID does not match the connection")]
    ConnectionIdMismatch,
    #[error("initial token length missing or malformed")]
    InvalidToken,
    #[error("frame type not in the recognized set")]
    InvalidFrameType,
    #[error("encoding not in the supported subset")]
    Unsupported,
}

impl ParseError {
    pub const KINDS: usize = 9;

    /// Stable index for per-kind counters.
    pub fn index(self) -> usize {
        match self {
            Self::InvalidPacketType => 0,
            Self::InvalidVersion => 1,
            Self::InvalidCidLength => 2,
            Self::InvalidPacketSize => 3,
            Self::InvalidPacketNumberLen => 4,
            Self::ConnectionIdMismatch => 5,
            Self::InvalidToken => 6,
            Self::InvalidFrameType => 7,
            Self::Unsupported => 8,
        }
    }

    /// Inverse of [`Self::index`], for rendering counter tables.
    pub fn from_index(i: usize) -> Option<Self> {
        Some(match i {
            0 => Self::InvalidPacketType,
            1 => Self::InvalidVersion,
            2 => Self::InvalidCidLength,
            3 => Self::InvalidPacketSize,
            4 => Self::InvalidPacketNumberLen,
            5 => Self::ConnectionIdMismatch,
            6 => Self::InvalidToken,
            7 => Self::InvalidFrameType,
            8 => Self::Unsupported,
            _ => return None,
        })
    }
}

/// Long-header packet types, bits 5-4 of the first byte.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LongType {
    Initial = 0,
    ZeroRtt = 1,
    Handshake = 2,
    Retry = 3,
}

impl LongType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::Initial,
            1 => Self::ZeroRtt,
            2 => Self::Handshake,
            _ => Self::Retry,
        }
    }
}

/// A truncated packet number as it appears on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    /// Choose the shortest encoding that lets the receiver recover `pn`
    /// given that everything up to `largest_acked` is unambiguous.
    pub fn new(pn: u64, largest_acked: u64) -> Self {
        let range = (pn - largest_acked) * 2;
        if range < 1 << 8 {
            Self::U8(pn as u8)
        } else if range < 1 << 16 {
            Self::U16(pn as u16)
        } else if range < 1 << 24 {
            Self::U24(pn as u32)
        } else {
            Self::U32(pn as u32)
        }
    }

    pub fn len(self) -> usize {
        match self {
            Self::U8(_) => 1,
            Self::U16(_) => 2,
            Self::U24(_) => 3,
            Self::U32(_) => 4,
        }
    }

    /// The two low bits of the first header byte: length minus one.
    pub fn tag(self) -> u8 {
        self.len() as u8 - 1
    }

    pub fn encode<B: BufMut>(self, buf: &mut B) {
        match self {
            Self::U8(x) => buf.put_u8(x),
            Self::U16(x) => buf.put_u16(x),
            Self::U24(x) => {
                buf.put_u8((x >> 16) as u8);
                buf.put_u16(x as u16);
            }
            Self::U32(x) => buf.put_u32(x),
        }
    }

    pub fn decode<B: Buf>(len: usize, buf: &mut B) -> Result<Self, ParseError> {
        if buf.remaining() < len {
            return Err(ParseError::InvalidPacketNumberLen);
        }
        Ok(match len {
            1 => Self::U8(buf.get_u8()),
            2 => Self::U16(buf.get_u16()),
            3 => {
                let hi = buf.get_u8() as u32;
                let lo = buf.get_u16() as u32;
                Self::U24(hi << 16 | lo)
            }
            _ => Self::U32(buf.get_u32()),
        })
    }

    fn truncated(self) -> u64 {
        match self {
            Self::U8(x) => x as u64,
            Self::U16(x) => x as u64,
            Self::U24(x) => x as u64,
            Self::U32(x) => x as u64,
        }
    }

    /// Widen to a full packet number near `expected` (RFC 9000 appendix A
    /// reconstruction).
    pub fn expand(self, expected: u64) -> u64 {
        let truncated = self.truncated();
        let nbits = self.len() as u64 * 8;
        let win = 1u64 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        let candidate = (expected & !mask) | truncated;
        if candidate + hwin <= expected {
            candidate + win
        } else if candidate > expected + hwin && candidate >= win {
            candidate - win
        } else {
            candidate
        }
    }
}

/// A fully parsed header.
///
/// Retry packets are represented as `Long { ty: Retry, .. }`; this proxy
/// recognizes them only to drop them.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Header {
    Initial {
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        version: u32,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        number: PacketNumber,
    },
    Short {
        spin: bool,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
}

impl Header {
    pub fn dst_cid(&self) -> &ConnectionId {
        match self {
            Self::Initial { dst_cid, .. } => dst_cid,
            Self::Long { dst_cid, .. } => dst_cid,
            Self::Short { dst_cid, .. } => dst_cid,
        }
    }

    pub fn src_cid(&self) -> Option<&ConnectionId> {
        match self {
            Self::Initial { src_cid, .. } => Some(src_cid),
            Self::Long { src_cid, .. } => Some(src_cid),
            Self::Short { .. } => None,
        }
    }

    pub fn number(&self) -> PacketNumber {
        match self {
            Self::Initial { number, .. } => *number,
            Self::Long { number, .. } => *number,
            Self::Short { number, .. } => *number,
        }
    }

    pub fn version(&self) -> Option<u32> {
        match self {
            Self::Initial { version, .. } => Some(*version),
            Self::Long { version, .. } => Some(*version),
            Self::Short { .. } => None,
        }
    }

    pub fn is_initial(&self) -> bool {
        matches!(self, Self::Initial { .. })
    }

    pub fn is_short(&self) -> bool {
        matches!(self, Self::Short { .. })
    }

    /// Connection-dependent checks, run after parsing and before frame
    /// processing. `initial_cid` is the client-chosen destination CID that
    /// remains routable until the peer adopts ours.
    pub fn validate(
        &self,
        local_cid: &ConnectionId,
        initial_cid: Option<&ConnectionId>,
    ) -> Result<(), ParseError> {
        if let Some(version) = self.version() {
            if version != VERSION {
                return Err(ParseError::InvalidVersion);
            }
        }
        let dcid = self.dst_cid();
        if dcid == local_cid || initial_cid == Some(dcid) {
            Ok(())
        } else {
            Err(ParseError::ConnectionIdMismatch)
        }
    }

    /// Serialize the header, including the length field for long forms.
    /// `payload_len` is the sealed payload that will follow (tag included).
    pub fn encode(&self, payload_len: usize, buf: &mut Vec<u8>) {
        match self {
            Self::Initial {
                version,
                dst_cid,
                src_cid,
                token,
                number,
            } => {
                buf.put_u8(LONG_FORM | FIXED_BIT | number.tag());
                buf.put_u32(*version);
                dst_cid.encode(buf);
                src_cid.encode(buf);
                buf.put_len1(token.len() as u64);
                buf.put_slice(token);
                buf.put_len1((number.len() + payload_len) as u64);
                number.encode(buf);
            }
            Self::Long {
                ty,
                version,
                dst_cid,
                src_cid,
                number,
            } => {
                buf.put_u8(LONG_FORM | FIXED_BIT | ((*ty as u8) << 4) | number.tag());
                buf.put_u32(*version);
                dst_cid.encode(buf);
                src_cid.encode(buf);
                buf.put_len1((number.len() + payload_len) as u64);
                number.encode(buf);
            }
            Self::Short {
                spin,
                dst_cid,
                number,
            } => {
                buf.put_u8(FIXED_BIT | if *spin { SPIN_BIT } else { 0 } | number.tag());
                buf.put_slice(dst_cid);
                number.encode(buf);
            }
        }
    }
}

/// A parsed packet: typed header plus its (still sealed) payload.
///
/// For long headers the payload is bounded by the claimed length field and
/// trailing datagram padding is discarded; for short headers it runs to the
/// end of the datagram.
#[derive(Debug)]
pub struct PlainPacket {
    pub header: Header,
    /// Bytes the header occupies at the front of the datagram; the sealed
    /// payload's associated data is exactly this prefix.
    pub header_len: usize,
    pub payload: Bytes,
}

/// Parse one packet from the front of a datagram.
///
/// `local_cid_len` supplies the short-header CID width, which the wire
/// does not carry.
pub fn decode(datagram: &Bytes, local_cid_len: usize) -> Result<PlainPacket, ParseError> {
    let mut buf = datagram.clone();
    let first = buf
        .get_u8_checked()
        .map_err(|_| ParseError::InvalidPacketSize)?;

    if first & LONG_FORM == 0 {
        if first & FIXED_BIT == 0 || first & SHORT_RESERVED != 0 {
            return Err(ParseError::InvalidPacketType);
        }
        if buf.remaining() < local_cid_len {
            return Err(ParseError::InvalidPacketSize);
        }
        let dst_cid = ConnectionId::new(&buf.split_to(local_cid_len));
        let pn_len = (first & PN_LEN_MASK) as usize + 1;
        let number = PacketNumber::decode(pn_len, &mut buf)?;
        return Ok(PlainPacket {
            header: Header::Short {
                spin: first & SPIN_BIT != 0,
                dst_cid,
                number,
            },
            header_len: datagram.len() - buf.remaining(),
            payload: buf,
        });
    }

    if first & FIXED_BIT == 0 {
        return Err(ParseError::InvalidPacketType);
    }
    let version = buf
        .get_u32_checked()
        .map_err(|_| ParseError::InvalidPacketSize)?;
    let dst_cid = decode_cid(&mut buf)?;
    let src_cid = decode_cid(&mut buf)?;
    let ty = LongType::from_bits((first & LONG_TYPE_MASK) >> 4);

    let token = if ty == LongType::Initial {
        let token_len = buf.get_len1().map_err(|_| ParseError::InvalidToken)?;
        if buf.remaining() < token_len as usize {
            return Err(ParseError::InvalidToken);
        }
        buf.split_to(token_len as usize)
    } else {
        Bytes::new()
    };

    let length = buf.get_len1().map_err(|e| match e {
        CodingError::Oversized => ParseError::Unsupported,
        CodingError::UnexpectedEnd => ParseError::InvalidPacketSize,
    })? as usize;
    let pn_len = (first & PN_LEN_MASK) as usize + 1;
    if length < pn_len {
        return Err(ParseError::InvalidPacketNumberLen);
    }
    let number = PacketNumber::decode(pn_len, &mut buf)?;
    let header_len = datagram.len() - buf.remaining();
    let payload_len = length - pn_len;
    if buf.remaining() < payload_len {
        return Err(ParseError::InvalidPacketSize);
    }
    let payload = buf.split_to(payload_len);

    let header = match ty {
        LongType::Initial => Header::Initial {
            version,
            dst_cid,
            src_cid,
            token,
            number,
        },
        ty => Header::Long {
            ty,
            version,
            dst_cid,
            src_cid,
            number,
        },
    };
    Ok(PlainPacket {
        header,
        header_len,
        payload,
    })
}

fn decode_cid(buf: &mut Bytes) -> Result<ConnectionId, ParseError> {
    let len = buf
        .get_u8_checked()
        .map_err(|_| ParseError::InvalidPacketSize)? as usize;
    if len > MAX_CID_LEN {
        return Err(ParseError::InvalidCidLength);
    }
    if buf.remaining() < len {
        return Err(ParseError::InvalidPacketSize);
    }
    Ok(ConnectionId::new(&buf.split_to(len)))
}

/// Peek the destination CID without a full parse, for datagram routing.
pub fn dst_cid_of(datagram: &[u8], local_cid_len: usize) -> Option<ConnectionId> {
    let first = *datagram.first()?;
    if first & LONG_FORM == 0 {
        let cid = datagram.get(1..1 + local_cid_len)?;
        return Some(ConnectionId::new(cid));
    }
    let dcil = *datagram.get(5)? as usize;
    if dcil > MAX_CID_LEN {
        return None;
    }
    datagram.get(6..6 + dcil).map(ConnectionId::new)
}
