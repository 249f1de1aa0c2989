// nfc-rw-rs/nfc-rw/src/protocol/mod.rs

/// Per-family command frames.
pub mod commands;
pub mod lock;
pub mod parser;
pub mod retry;
pub mod tlv;

pub use commands::*;
pub use lock::{LockLayout, LockTracker, SegmentBitmap};
pub use retry::{Link, PendingCommand, RetryCoordinator};
pub use tlv::{TlvCursor, TlvRecord, TlvScan, TlvType};
