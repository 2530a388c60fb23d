//! Frame codec.
//!
//! [`Iter`] lazily yields typed [`Frame`]s from a decrypted packet payload.
//! An unrecognized type byte ends iteration with an error: frame lengths are
//! not self-describing, so nothing after an unknown frame can be trusted.
//! Encoding is per-variant; [`Frame::encode`] dispatches.

use std::fmt;
use std::ops::RangeInclusive;

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tinyvec::TinyVec;

use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};
use crate::streams::StreamId;

/// A QUIC frame type byte.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct FrameType(pub u8);

impl FrameType {
    fn stream(self) -> Option<StreamInfo> {
        if (0x08..=0x0f).contains(&self.0) {
            Some(StreamInfo(self.0))
        } else {
            None
        }
    }
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl FrameType {
            $(pub const $name: FrameType = FrameType($val);)*
        }

        impl fmt::Debug for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if (0x08..=0x0f).contains(&x) => f.write_str("STREAM"),
                    x => write!(f, "Type({x:02x})"),
                }
            }
        }
    }
}

frame_types! {
    PADDING = 0x00,
    PING = 0x01,
    ACK = 0x02,
    ACK_ECN = 0x03,
    RESET_STREAM = 0x04,
    CRYPTO = 0x06,
    CONNECTION_CLOSE = 0x1c,
    HANDSHAKE_DONE = 0x1e,
}

/// STREAM type-byte flag accessors; the low three bits are FIN, LEN, OFF.
#[derive(Debug, Copy, Clone)]
struct StreamInfo(u8);

impl StreamInfo {
    fn fin(self) -> bool {
        self.0 & 0x01 != 0
    }
    fn len(self) -> bool {
        self.0 & 0x02 != 0
    }
    fn off(self) -> bool {
        self.0 & 0x04 != 0
    }
}

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameError {
    #[error("unrecognized frame type {0:#04x}")]
    InvalidType(u8),
    #[error("frame truncated")]
    UnexpectedEnd,
    #[error("frame fields are inconsistent")]
    Malformed,
}

impl From<UnexpectedEnd> for FrameError {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream(ResetStream),
    Crypto(Crypto),
    Stream(StreamFrame),
    Close(ConnectionClose),
    HandshakeDone,
}

impl Frame {
    pub fn ty(&self) -> FrameType {
        match self {
            Self::Padding => FrameType::PADDING,
            Self::Ping => FrameType::PING,
            Self::Ack(_) => FrameType::ACK,
            Self::ResetStream(_) => FrameType::RESET_STREAM,
            Self::Crypto(_) => FrameType::CRYPTO,
            Self::Stream(x) => FrameType(0x08 | 0x02 | if x.offset.is_some() { 0x04 } else { 0 } | if x.fin { 0x01 } else { 0 }),
            Self::Close(_) => FrameType::CONNECTION_CLOSE,
            Self::HandshakeDone => FrameType::HANDSHAKE_DONE,
        }
    }

    /// Whether receipt of this frame obliges the peer to acknowledge.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Self::Padding | Self::Ack(_) | Self::Close(_))
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Padding => buf.put_u8(FrameType::PADDING.0),
            Self::Ping => buf.put_u8(FrameType::PING.0),
            Self::Ack(x) => x.encode(buf),
            Self::ResetStream(x) => x.encode(buf),
            Self::Crypto(x) => x.encode(buf),
            Self::Stream(x) => x.encode(buf),
            Self::Close(x) => x.encode(buf),
            Self::HandshakeDone => buf.put_u8(FrameType::HANDSHAKE_DONE.0),
        }
    }
}

/// One additional ACK block: `gap` unseen packets, then `len + 1` seen.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct AckRange {
    pub gap: u8,
    pub len: u8,
}

/// An acknowledgment of one or more packet-number ranges, highest first.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Ack {
    pub largest: u64,
    pub delay: u16,
    /// Packets acknowledged contiguously below `largest`.
    pub first_range: u8,
    pub additional: TinyVec<[AckRange; 4]>,
}

impl Ack {
    /// Acknowledge exactly one packet number.
    pub fn single(largest: u64) -> Self {
        Self {
            largest,
            delay: 0,
            first_range: 0,
            additional: TinyVec::default(),
        }
    }

    /// Iterate the acknowledged ranges in descending packet-number order.
    /// Yields nothing past the point where a range would underflow zero.
    pub fn ranges(&self) -> impl Iterator<Item = RangeInclusive<u64>> + '_ {
        let mut smallest = self.largest.checked_sub(self.first_range as u64);
        let first = smallest.map(|s| s..=self.largest);
        let rest = self.additional.iter().scan((), move |_, block| {
            let prev = smallest?;
            let largest = prev.checked_sub(block.gap as u64 + 2)?;
            let start = largest.checked_sub(block.len as u64)?;
            smallest = Some(start);
            Some(start..=largest)
        });
        first.into_iter().chain(rest)
    }

    /// Whether every encoded range is representable; parsing rejects ACKs
    /// that are not.
    fn well_formed(&self) -> bool {
        self.ranges().count() == self.additional.len() + 1
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        debug_assert!(self.largest <= u32::MAX as u64);
        buf.put_u8(FrameType::ACK.0);
        buf.put_u32(self.largest as u32);
        buf.put_u16(self.delay);
        buf.put_u8(self.additional.len() as u8);
        buf.put_u8(self.first_range);
        for block in &self.additional {
            buf.put_u8(block.gap);
            buf.put_u8(block.len);
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ResetStream {
    pub id: StreamId,
    pub error_code: u16,
    pub final_size: u64,
}

impl ResetStream {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(FrameType::RESET_STREAM.0);
        self.id.encode(buf);
        buf.put_u16(self.error_code);
        buf.put_u64(self.final_size);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Crypto {
    pub offset: u64,
    pub data: Bytes,
}

impl Crypto {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(FrameType::CRYPTO.0);
        buf.put_len1(self.offset);
        buf.put_len1(self.data.len() as u64);
        buf.put_slice(&self.data);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StreamFrame {
    pub id: StreamId,
    /// Byte offset of `data` within the stream; absent means zero on the
    /// wire (the OFF bit is written only when non-zero would be lost).
    pub offset: Option<u64>,
    pub fin: bool,
    pub data: Bytes,
}

impl StreamFrame {
    /// The offset this frame's data starts at.
    pub fn start(&self) -> u64 {
        self.offset.unwrap_or(0)
    }

    /// Encoding always carries the LEN bit; the parser additionally accepts
    /// unbounded frames that run to the end of the payload.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        debug_assert!(self.data.len() <= u16::MAX as usize);
        let mut ty = 0x08 | 0x02;
        if self.offset.is_some() {
            ty |= 0x04;
        }
        if self.fin {
            ty |= 0x01;
        }
        buf.put_u8(ty);
        self.id.encode(buf);
        if let Some(offset) = self.offset {
            buf.put_u64(offset);
        }
        buf.put_u16(self.data.len() as u16);
        buf.put_slice(&self.data);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionClose {
    pub error_code: u16,
    pub reason: Bytes,
}

impl ConnectionClose {
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        debug_assert!(self.reason.len() <= crate::coding::MAX_LEN1 as usize);
        buf.put_u8(FrameType::CONNECTION_CLOSE.0);
        buf.put_u16(self.error_code);
        buf.put_len1(self.reason.len() as u64);
        buf.put_slice(&self.reason);
    }
}

/// Lazy frame parser over one packet payload.
pub struct Iter {
    bytes: Bytes,
}

impl Iter {
    pub fn new(payload: Bytes) -> Self {
        Self { bytes: payload }
    }

    fn take_len1(&mut self) -> Result<Bytes, FrameError> {
        let len = self
            .bytes
            .get_len1()
            .map_err(|_| FrameError::UnexpectedEnd)?;
        if len > self.bytes.remaining() as u64 {
            return Err(FrameError::UnexpectedEnd);
        }
        Ok(self.bytes.split_to(len as usize))
    }

    fn try_next(&mut self) -> Result<Frame, FrameError> {
        let ty = FrameType(self.bytes.get_u8_checked()?);
        Ok(match ty {
            FrameType::PADDING => Frame::Padding,
            FrameType::PING => Frame::Ping,
            FrameType::ACK | FrameType::ACK_ECN => {
                let largest = self.bytes.get_u32_checked()? as u64;
                let delay = self.bytes.get_u16_checked()?;
                let count = self.bytes.get_u8_checked()?;
                let first_range = self.bytes.get_u8_checked()?;
                let mut additional = TinyVec::default();
                for _ in 0..count {
                    additional.push(AckRange {
                        gap: self.bytes.get_u8_checked()?,
                        len: self.bytes.get_u8_checked()?,
                    });
                }
                let ack = Ack {
                    largest,
                    delay,
                    first_range,
                    additional,
                };
                if !ack.well_formed() {
                    return Err(FrameError::Malformed);
                }
                Frame::Ack(ack)
            }
            FrameType::RESET_STREAM => Frame::ResetStream(ResetStream {
                id: StreamId::decode(&mut self.bytes)?,
                error_code: self.bytes.get_u16_checked()?,
                final_size: self.bytes.get_u64_checked()?,
            }),
            FrameType::CRYPTO => {
                let offset = self
                    .bytes
                    .get_len1()
                    .map_err(|_| FrameError::UnexpectedEnd)?;
                Frame::Crypto(Crypto {
                    offset,
                    data: self.take_len1()?,
                })
            }
            FrameType::CONNECTION_CLOSE => Frame::Close(ConnectionClose {
                error_code: self.bytes.get_u16_checked()?,
                reason: self.take_len1()?,
            }),
            FrameType::HANDSHAKE_DONE => Frame::HandshakeDone,
            _ => {
                if let Some(info) = ty.stream() {
                    let id = StreamId::decode(&mut self.bytes)?;
                    let offset = if info.off() {
                        Some(self.bytes.get_u64_checked()?)
                    } else {
                        None
                    };
                    let data = if info.len() {
                        let len = self.bytes.get_u16_checked()? as usize;
                        if len > self.bytes.remaining() {
                            return Err(FrameError::UnexpectedEnd);
                        }
                        self.bytes.split_to(len)
                    } else {
                        std::mem::take(&mut self.bytes)
                    };
                    Frame::Stream(StreamFrame {
                        id,
                        offset,
                        fin: info.fin(),
                        data,
                    })
                } else {
                    return Err(FrameError::InvalidType(ty.0));
                }
            }
        })
    }
}

impl Iterator for Iter {
    type Item = Result<Frame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.bytes.has_remaining() {
            return None;
        }
        match self.try_next() {
            Ok(frame) => Some(Ok(frame)),
            Err(e) => {
                // Nothing after a corrupt frame can be framed reliably.
                self.bytes.clear();
                Some(Err(e))
            }
        }
    }
}
