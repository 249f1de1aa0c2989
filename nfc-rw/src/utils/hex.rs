// nfc-rw-rs/nfc-rw/src/utils/hex.rs
//! Hex helpers for log output and fixtures.

use std::fmt::Write;

/// Frames longer than this are cut short by [`frame_summary`].
pub const LOG_FRAME_LIMIT: usize = 32;

/// Lowercase hex without separators: `[0xde, 0xad]` -> `"dead"`.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

/// Lowercase hex with one space between bytes: `[0xde, 0xad]` -> `"de ad"`.
pub fn bytes_to_hex_spaced(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            s.push(' ');
        }
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Hex rendering of a frame for trace logs, truncated after
/// [`LOG_FRAME_LIMIT`] bytes with the total length appended.
pub fn frame_summary(frame: &[u8]) -> String {
    if frame.len() <= LOG_FRAME_LIMIT {
        return bytes_to_hex_spaced(frame);
    }
    format!(
        "{} .. ({} bytes)",
        bytes_to_hex_spaced(&frame[..LOG_FRAME_LIMIT]),
        frame.len()
    )
}
