// nfc-rw-rs/nfc-rw/src/protocol/parser.rs
//! Bounds-checked readers for response frames.

use crate::{Error, Result};

/// Ensure the slice has at least `min` bytes.
pub fn ensure_len(data: &[u8], min: usize) -> Result<()> {
    if data.len() < min {
        return Err(Error::InvalidLength {
            expected: min,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Ensure the slice has exactly `len` bytes.
pub fn ensure_exact_len(data: &[u8], len: usize) -> Result<()> {
    if data.len() != len {
        return Err(Error::InvalidLength {
            expected: len,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Read a single byte at `idx`.
pub fn byte_at(data: &[u8], idx: usize) -> Result<u8> {
    ensure_len(data, idx + 1)?;
    Ok(data[idx])
}

/// Read a little-endian u16 at `idx` (ISO 15693 multi-byte fields).
pub fn le_u16_at(data: &[u8], idx: usize) -> Result<u16> {
    ensure_len(data, idx + 2)?;
    Ok(u16::from_le_bytes([data[idx], data[idx + 1]]))
}

/// Read a big-endian u16 at `idx` (TLV 3-byte length fields).
pub fn be_u16_at(data: &[u8], idx: usize) -> Result<u16> {
    ensure_len(data, idx + 2)?;
    Ok(u16::from_be_bytes([data[idx], data[idx + 1]]))
}

/// Subslice with bounds checking.
pub fn slice_at(data: &[u8], idx: usize, len: usize) -> Result<&[u8]> {
    ensure_len(data, idx + len)?;
    Ok(&data[idx..idx + len])
}

/// Fixed-size copy at `idx`.
pub fn array_at<const N: usize>(data: &[u8], idx: usize) -> Result<[u8; N]> {
    let s = slice_at(data, idx, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(s);
    Ok(out)
}
