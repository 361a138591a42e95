//! Process-image value codec.
//!
//! Converts between the raw bytes of the domain buffer and the `i64` values
//! exposed to callers. Widths 1, 8, 16 and 32 have dedicated paths; any
//! other width below 32 bits is a bit field over the bytes it spans.
//!
//! All accesses are bounds-checked and never panic: an offset that lies
//! outside the buffer yields [`CodecError::OutOfBounds`].

use crate::entry::RuntimeEntry;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Byte/bit location of one object inside the domain buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PdoEntryOffset {
    /// Byte offset from the start of the domain buffer.
    pub byte: usize,
    /// Bit offset inside that byte (0..8).
    pub bit: u8,
}

impl PdoEntryOffset {
    /// Offset at `byte`, bit 0.
    pub const fn at_byte(byte: usize) -> Self {
        Self { byte, bit: 0 }
    }
}

/// How the bytes of one entry are interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueFormat {
    /// Width in bits.
    pub bit_len: u8,
    /// Two's complement.
    pub signed: bool,
    /// Swap byte order of 16 and 32-bit values.
    pub swap_endian: bool,
}

impl From<&RuntimeEntry> for ValueFormat {
    fn from(entry: &RuntimeEntry) -> Self {
        Self {
            bit_len: entry.bit_len,
            signed: entry.signed,
            swap_endian: entry.swap_endian,
        }
    }
}

/// Codec failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The entry does not fit in the buffer.
    #[error("Entry at byte {byte} exceeds domain size {len}")]
    OutOfBounds {
        /// First byte of the entry.
        byte: usize,
        /// Buffer length.
        len: usize,
    },

    /// Zero-width or wider-than-32-bit entry.
    #[error("Unsupported entry width: {0} bits")]
    UnsupportedWidth(u8),
}

/// Number of buffer bytes an entry touches, starting at its byte offset.
pub const fn span_bytes(offset: PdoEntryOffset, bit_len: u8) -> usize {
    match bit_len {
        1 | 8 => 1,
        16 => 2,
        32 => 4,
        n => (offset.bit as usize + n as usize).div_ceil(8),
    }
}

fn window<const N: usize>(data: &[u8], byte: usize) -> Result<[u8; N], CodecError> {
    data.get(byte..byte + N)
        .and_then(|s| s.try_into().ok())
        .ok_or(CodecError::OutOfBounds { byte, len: data.len() })
}

fn window_mut<const N: usize>(data: &mut [u8], byte: usize) -> Result<&mut [u8], CodecError> {
    let len = data.len();
    data.get_mut(byte..byte + N)
        .ok_or(CodecError::OutOfBounds { byte, len })
}

/// Little-endian load of the `span` bytes at `byte`.
fn load_span(data: &[u8], byte: usize, span: usize) -> Result<u64, CodecError> {
    let bytes = data
        .get(byte..byte + span)
        .ok_or(CodecError::OutOfBounds { byte, len: data.len() })?;
    let mut buf = [0u8; 8];
    buf[..span].copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}

fn width_mask(bits: u8) -> u32 {
    if bits >= 32 { u32::MAX } else { (1u32 << bits) - 1 }
}

fn sign_extend(raw: u32, bits: u8) -> i64 {
    let shift = 32 - u32::from(bits);
    i64::from(((raw << shift) as i32) >> shift)
}

/// Decode the value of one entry.
///
/// - 1 bit: unsigned bit at `offset.bit`
/// - 8 bit: one byte, sign-extended if `signed`
/// - 16/32 bit: little-endian, byte-swapped if `swap_endian`, then
///   sign-extended if `signed`
/// - other widths: bit field spanning up to five little-endian bytes,
///   `swap_endian` does not apply
pub fn decode(data: &[u8], offset: PdoEntryOffset, format: ValueFormat) -> Result<i64, CodecError> {
    let byte = offset.byte;
    match format.bit_len {
        0 => Err(CodecError::UnsupportedWidth(0)),
        1 => {
            let [b] = window::<1>(data, byte)?;
            Ok(i64::from((b >> (offset.bit & 7)) & 1))
        }
        8 => {
            let [b] = window::<1>(data, byte)?;
            Ok(if format.signed { i64::from(b as i8) } else { i64::from(b) })
        }
        16 => {
            let mut v = u16::from_le_bytes(window::<2>(data, byte)?);
            if format.swap_endian {
                v = v.swap_bytes();
            }
            Ok(if format.signed { i64::from(v as i16) } else { i64::from(v) })
        }
        32 => {
            let mut v = u32::from_le_bytes(window::<4>(data, byte)?);
            if format.swap_endian {
                v = v.swap_bytes();
            }
            Ok(if format.signed { i64::from(v as i32) } else { i64::from(v) })
        }
        n if n < 32 => {
            let word = load_span(data, byte, span_bytes(offset, n))?;
            let v = ((word >> (offset.bit & 7)) as u32) & width_mask(n);
            Ok(if format.signed { sign_extend(v, n) } else { i64::from(v) })
        }
        n => Err(CodecError::UnsupportedWidth(n)),
    }
}

/// Encode `value` into the buffer, truncated to the entry width.
///
/// Inverse of [`decode`]. Other widths are written with a masked
/// read-modify-write that leaves neighbouring bits intact.
pub fn encode(
    data: &mut [u8],
    offset: PdoEntryOffset,
    format: ValueFormat,
    value: i64,
) -> Result<(), CodecError> {
    let byte = offset.byte;
    match format.bit_len {
        0 => Err(CodecError::UnsupportedWidth(0)),
        1 => {
            let slot = window_mut::<1>(data, byte)?;
            let mask = 1u8 << (offset.bit & 7);
            if value & 1 != 0 {
                slot[0] |= mask;
            } else {
                slot[0] &= !mask;
            }
            Ok(())
        }
        8 => {
            window_mut::<1>(data, byte)?[0] = value as u8;
            Ok(())
        }
        16 => {
            let mut v = value as u16;
            if format.swap_endian {
                v = v.swap_bytes();
            }
            window_mut::<2>(data, byte)?.copy_from_slice(&v.to_le_bytes());
            Ok(())
        }
        32 => {
            let mut v = value as u32;
            if format.swap_endian {
                v = v.swap_bytes();
            }
            window_mut::<4>(data, byte)?.copy_from_slice(&v.to_le_bytes());
            Ok(())
        }
        n if n < 32 => {
            let len = data.len();
            let span = span_bytes(offset, n);
            let slot = data
                .get_mut(byte..byte + span)
                .ok_or(CodecError::OutOfBounds { byte, len })?;
            let shift = u64::from(offset.bit & 7);
            let mask = u64::from(width_mask(n)) << shift;
            let mut buf = [0u8; 8];
            buf[..span].copy_from_slice(slot);
            let word = u64::from_le_bytes(buf);
            let merged = (word & !mask) | (((value as u64) << shift) & mask);
            slot.copy_from_slice(&merged.to_le_bytes()[..span]);
            Ok(())
        }
        n => Err(CodecError::UnsupportedWidth(n)),
    }
}
