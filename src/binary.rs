//! Little-endian binary reader/writer extension traits over `bytes::{Buf, BufMut}`.
//!
//! Only the fixed-width integer operations the wire format (`SPEC_FULL.md` §6)
//! actually uses are exposed; there is no varint support here, unlike a
//! general-purpose game-protocol codec.

use bytes::{Buf, BufMut};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BinaryError {
    #[error("not enough bytes in buffer: needed {needed}, remaining {remaining}")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("invalid data encountered: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, BinaryError>;

macro_rules! check_remaining {
    ($buf:expr, $len:expr) => {
        let needed = $len;
        let remaining = $buf.remaining();
        if remaining < needed {
            return Err(BinaryError::UnexpectedEof { needed, remaining });
        }
    };
}

pub trait BinaryReader: Buf {
    #[inline]
    fn read_u8(&mut self) -> Result<u8> {
        check_remaining!(self, 1);
        Ok(self.get_u8())
    }

    #[inline]
    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    #[inline]
    fn read_u16_le(&mut self) -> Result<u16> {
        check_remaining!(self, 2);
        Ok(self.get_u16_le())
    }

    #[inline]
    fn read_i32_le(&mut self) -> Result<i32> {
        check_remaining!(self, 4);
        Ok(self.get_i32_le())
    }

    #[inline]
    fn read_u32_le(&mut self) -> Result<u32> {
        check_remaining!(self, 4);
        Ok(self.get_u32_le())
    }
}

impl<T: Buf> BinaryReader for T {}

pub trait BinaryWriter: BufMut {
    #[inline]
    fn write_u8(&mut self, value: u8) {
        self.put_u8(value);
    }

    #[inline]
    fn write_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    #[inline]
    fn write_u16_le(&mut self, value: u16) {
        self.put_u16_le(value);
    }

    #[inline]
    fn write_i32_le(&mut self, value: i32) {
        self.put_i32_le(value);
    }

    #[inline]
    fn write_u32_le(&mut self, value: u32) {
        self.put_u32_le(value);
    }
}

impl<T: BufMut> BinaryWriter for T {}
