//! Length prefixes for datagram framing: unsigned values in groups of 7 bits, least significant
//!  group first, with the high bit of each byte flagging that another byte follows.
//!
//! The accepted range is `[0, 2^28)`, i.e. at most four bytes on the wire, and it is enforced
//!  the same way in both directions: [store] refuses values that would need a fifth byte, and
//!  [parse] refuses anything [store] would not have produced. That includes a continuation bit
//!  on the fourth byte, and overlong encodings that end in a zero group (e.g. `80 00` for 0).

use std::fmt::{Display, Formatter};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

pub const MAX_VARINT_LEN: usize = 4;
pub const MAX_VARINT_VALUE: usize = (1 << 28) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarintError {
    /// the target buffer is too short for the encoded value
    NoSpace,
    /// the value is outside the supported range
    TooLarge,
    /// the input is not a canonical encoding of a value in the supported range
    Malformed,
}

impl Display for VarintError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VarintError::NoSpace => write!(f, "not enough space for varint"),
            VarintError::TooLarge => write!(f, "value exceeds varint range (max {})", MAX_VARINT_VALUE),
            VarintError::Malformed => write!(f, "malformed varint"),
        }
    }
}

impl std::error::Error for VarintError {}

/// the number of bytes [store] writes for a given value
pub fn encoded_len(value: usize) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        _ => 4,
    }
}

/// Writes `value` to the start of `buf`, returning the number of bytes written.
pub fn store(buf: &mut [u8], value: usize) -> Result<usize, VarintError> {
    if value > MAX_VARINT_VALUE {
        return Err(VarintError::TooLarge);
    }

    let len = encoded_len(value);
    if buf.len() < len {
        return Err(VarintError::NoSpace);
    }

    let mut out = &mut buf[..len];
    out.put_u32_varint(value as u32);
    Ok(len)
}

/// Decodes a value from the start of `buf`.
///
/// Returns `Ok(None)` if `buf` holds the beginning of a valid encoding but not all of it yet,
///  and `Ok(Some((consumed, value)))` otherwise.
pub fn parse(buf: &[u8]) -> Result<Option<(usize, usize)>, VarintError> {
    let terminator = buf.iter()
        .take(MAX_VARINT_LEN)
        .position(|b| b & 0x80 == 0);

    let last = match terminator {
        Some(idx) => idx,
        None if buf.len() >= MAX_VARINT_LEN => return Err(VarintError::Malformed),
        None => return Ok(None),
    };

    if last > 0 && buf[last] == 0 {
        return Err(VarintError::Malformed);
    }

    let mut encoded = &buf[..=last];
    let value = encoded.try_get_u32_varint()
        .map_err(|_| VarintError::Malformed)?;

    Ok(Some((last + 1, value as usize)))
}
