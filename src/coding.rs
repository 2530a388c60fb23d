//! Buffer access primitives shared by the wire codec.
//!
//! Integers on the wire use fixed widths with one exception: length fields
//! (token length, long-header length, frame lengths) are restricted
//! single-byte varints covering 0-63. Multi-byte varint tags are recognized
//! and rejected rather than misread.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// The buffer ended before the field it was supposed to contain.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("unexpected end of buffer")]
pub struct UnexpectedEnd;

/// Length-field decoding errors: the restricted single-byte form either
/// ended early or carried a multi-byte varint tag.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CodingError {
    UnexpectedEnd,
    Oversized,
}

impl From<UnexpectedEnd> for CodingError {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

pub type Result<T> = std::result::Result<T, CodingError>;

/// Mask of the two varint tag bits; a set bit means a longer encoding.
const VARINT_TAG: u8 = 0b1100_0000;

/// Largest value the restricted length form can carry.
pub const MAX_LEN1: u64 = 63;

pub trait BufExt {
    /// Checked fixed-width reads. `bytes` errors with a panic on underrun,
    /// so every read goes through these.
    fn get_u8_checked(&mut self) -> std::result::Result<u8, UnexpectedEnd>;
    fn get_u16_checked(&mut self) -> std::result::Result<u16, UnexpectedEnd>;
    fn get_u32_checked(&mut self) -> std::result::Result<u32, UnexpectedEnd>;
    fn get_u32_le_checked(&mut self) -> std::result::Result<u32, UnexpectedEnd>;
    fn get_u64_checked(&mut self) -> std::result::Result<u64, UnexpectedEnd>;
    /// Read a restricted single-byte length (0-63).
    fn get_len1(&mut self) -> Result<u64>;
}

impl<B: Buf> BufExt for B {
    fn get_u8_checked(&mut self) -> std::result::Result<u8, UnexpectedEnd> {
        if self.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_u8())
    }

    fn get_u16_checked(&mut self) -> std::result::Result<u16, UnexpectedEnd> {
        if self.remaining() < 2 {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_u16())
    }

    fn get_u32_checked(&mut self) -> std::result::Result<u32, UnexpectedEnd> {
        if self.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_u32())
    }

    fn get_u32_le_checked(&mut self) -> std::result::Result<u32, UnexpectedEnd> {
        if self.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_u32_le())
    }

    fn get_u64_checked(&mut self) -> std::result::Result<u64, UnexpectedEnd> {
        if self.remaining() < 8 {
            return Err(UnexpectedEnd);
        }
        Ok(self.get_u64())
    }

    fn get_len1(&mut self) -> Result<u64> {
        let byte = self.get_u8_checked()?;
        if byte & VARINT_TAG != 0 {
            return Err(CodingError::Oversized);
        }
        Ok(byte as u64)
    }
}

pub trait BufMutExt {
    /// Write a restricted single-byte length.
    ///
    /// PANICS: if `x` exceeds [`MAX_LEN1`]; callers size their payloads so
    /// this cannot happen on any send path.
    fn put_len1(&mut self, x: u64);
}

impl<B: BufMut> BufMutExt for B {
    fn put_len1(&mut self, x: u64) {
        debug_assert!(x <= MAX_LEN1, "length {x} exceeds single-byte form");
        self.put_u8((x & MAX_LEN1) as u8);
    }
}
