//! Deterministic, zero-dependency binary encoding for on-disk persistence.
//!
//! Every durable artifact in RockyardKV — write batches, manifest version
//! edits, table blocks, footers — is built from the primitives in this
//! module. Because the crate owns the format, the on-disk representation
//! **never** changes due to a dependency upgrade.
//!
//! # Wire format
//!
//! | Primitive            | Encoding                                      |
//! |----------------------|-----------------------------------------------|
//! | `fixed32` / `fixed64`| 4 / 8 bytes, little-endian                    |
//! | `varint32`           | LEB128, 1–5 bytes                             |
//! | `varint64`           | LEB128, 1–10 bytes                            |
//! | length-prefixed slice| `varint32 len` followed by `len` raw bytes    |
//!
//! Varints carry 7 payload bits per byte with the high bit as a
//! continuation flag, least-significant group first.
//!
//! # Safety limits
//!
//! Decoders bound every length they read: a length-prefixed slice longer
//! than [`MAX_SLICE_LEN`] is rejected before any allocation happens, so a
//! corrupted length field cannot become an allocation bomb.
//!
//! # Zero-panic guarantee
//!
//! No function in this module uses `unwrap()`, `expect()`, or indexing
//! that can panic on attacker-controlled input. All errors are propagated
//! via [`EncodingError`].


use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Safety limits
// ------------------------------------------------------------------------------------------------

/// Maximum byte length accepted for a single length-prefixed slice during
/// decoding (256 MiB). Lengths above this are treated as corruption.
pub const MAX_SLICE_LEN: u32 = 256 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced while decoding wire data.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// A varint used more continuation bytes than its type allows.
    #[error("varint overflow while decoding {type_name}")]
    VarintOverflow {
        /// The integer type being decoded.
        type_name: &'static str,
    },

    /// A tag or discriminant was not recognised.
    #[error("invalid tag {tag} for {type_name}")]
    InvalidTag {
        /// The tag value that was read.
        tag: u64,
        /// The Rust type being decoded.
        type_name: &'static str,
    },

    /// A decoded length exceeded its safety limit.
    #[error("length overflow: {0}")]
    LengthOverflow(String),
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

/// Verify that `buf` has at least `needed` bytes.
#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        Err(EncodingError::UnexpectedEof {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Fixed-width integers
// ------------------------------------------------------------------------------------------------

/// Append a `u32` as 4 little-endian bytes.
#[inline]
pub fn put_fixed32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Append a `u64` as 8 little-endian bytes.
#[inline]
pub fn put_fixed64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Decode 4 little-endian bytes from the front of `buf`.
///
/// Returns `(value, bytes_consumed)`.
#[inline]
pub fn get_fixed32(buf: &[u8]) -> Result<(u32, usize), EncodingError> {
    require(buf, 4)?;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[..4]);
    Ok((u32::from_le_bytes(bytes), 4))
}

/// Decode 8 little-endian bytes from the front of `buf`.
///
/// Returns `(value, bytes_consumed)`.
#[inline]
pub fn get_fixed64(buf: &[u8]) -> Result<(u64, usize), EncodingError> {
    require(buf, 8)?;
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    Ok((u64::from_le_bytes(bytes), 8))
}

// ------------------------------------------------------------------------------------------------
// Varints
// ------------------------------------------------------------------------------------------------

/// Append a `u32` in LEB128 form (1–5 bytes).
pub fn put_varint32(buf: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Append a `u64` in LEB128 form (1–10 bytes).
pub fn put_varint64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Decode a LEB128 `u32` from the front of `buf`.
///
/// Returns `(value, bytes_consumed)`.
pub fn get_varint32(buf: &[u8]) -> Result<(u32, usize), EncodingError> {
    let mut value: u32 = 0;
    for (i, &byte) in buf.iter().enumerate().take(5) {
        value |= u32::from(byte & 0x7f) << (7 * i as u32);
        if byte < 0x80 {
            if i == 4 && byte > 0x0f {
                return Err(EncodingError::VarintOverflow { type_name: "u32" });
            }
            return Ok((value, i + 1));
        }
    }
    if buf.len() < 5 {
        Err(EncodingError::UnexpectedEof {
            needed: buf.len() + 1,
            available: buf.len(),
        })
    } else {
        Err(EncodingError::VarintOverflow { type_name: "u32" })
    }
}

/// Decode a LEB128 `u64` from the front of `buf`.
///
/// Returns `(value, bytes_consumed)`.
pub fn get_varint64(buf: &[u8]) -> Result<(u64, usize), EncodingError> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * i as u32);
        if byte < 0x80 {
            if i == 9 && byte > 0x01 {
                return Err(EncodingError::VarintOverflow { type_name: "u64" });
            }
            return Ok((value, i + 1));
        }
    }
    if buf.len() < 10 {
        Err(EncodingError::UnexpectedEof {
            needed: buf.len() + 1,
            available: buf.len(),
        })
    } else {
        Err(EncodingError::VarintOverflow { type_name: "u64" })
    }
}

/// Number of bytes [`put_varint64`] would emit for `value`.
#[inline]
pub fn varint64_len(value: u64) -> usize {
    if value == 0 {
        return 1;
    }
    (64 - value.leading_zeros() as usize).div_ceil(7)
}

// ------------------------------------------------------------------------------------------------
// Length-prefixed slices
// ------------------------------------------------------------------------------------------------

/// Append `data` as `varint32 len` followed by the raw bytes.
pub fn put_length_prefixed_slice(buf: &mut Vec<u8>, data: &[u8]) {
    // Lengths written by this crate are bounded well below u32::MAX.
    put_varint32(buf, data.len() as u32);
    buf.extend_from_slice(data);
}

/// Decode a length-prefixed slice from the front of `buf`.
///
/// Returns `(bytes, total_consumed)`.
pub fn get_length_prefixed_slice(buf: &[u8]) -> Result<(Vec<u8>, usize), EncodingError> {
    let (len, prefix) = get_varint32(buf)?;
    if len > MAX_SLICE_LEN {
        return Err(EncodingError::LengthOverflow(format!(
            "slice length {len} exceeds MAX_SLICE_LEN ({MAX_SLICE_LEN})"
        )));
    }
    let len = len as usize;
    require(&buf[prefix..], len)?;
    Ok((buf[prefix..prefix + len].to_vec(), prefix + len))
}
