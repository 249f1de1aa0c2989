// nfc-rw-rs/nfc-rw/src/prelude.rs

pub use crate::config::{RwConfig, T1tModel, T2tModel};
pub use crate::events::{I93SystemInfo, NdefDetectData, NdefFlags, RwEvent, Status};
pub use crate::protocol::{Command, LockTracker, TlvCursor, TlvType};
pub use crate::session::{ActivationParams, EventCallback, RwSession, TagControlBlock};
pub use crate::stats::RwStats;
pub use crate::tags::{I93Engine, NdefSizes, T1tEngine, T2tEngine, TagEngine};
pub use crate::transport::{MockTransport, Transport};
pub use crate::{Error, HeaderRom, I93Uid, Protocol, Result, T1tUid};

// Re-export small utilities for convenience
pub use crate::utils::{bytes_to_hex, bytes_to_hex_spaced};
