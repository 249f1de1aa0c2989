// nfc-rw-rs/nfc-rw/src/events.rs
//! Events delivered to the upper-layer callback.
//!
//! Every top-level operation ends with exactly one terminal event. Reads may
//! deliver several [`RwEvent::NdefRead`] segments before their terminal
//! [`RwEvent::NdefReadComplete`] / [`RwEvent::NdefReadFail`].

use derive_more::Display;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::types::{I93Uid, Protocol};

/// Outcome carried by an event.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Status {
    /// Success
    #[display(fmt = "OK")]
    Ok,
    /// Failed after retries, or the tag sent something unusable
    #[display(fmt = "FAILED")]
    Failed,
    /// No response
    #[display(fmt = "TIMEOUT")]
    Timeout,
    /// Tag cannot take the request
    #[display(fmt = "REJECTED")]
    Rejected,
    /// Request not allowed in the current state
    #[display(fmt = "REFUSED")]
    Refused,
    /// NDEF detection has not succeeded yet
    #[display(fmt = "NOT_INITIALIZED")]
    NotInitialized,
    /// Another operation is running
    #[display(fmt = "BUSY")]
    Busy,
    /// Explicit error code returned by the tag
    #[display(fmt = "TAG_ERROR({:#04x})", _0)]
    TagError(u8),
    /// Error code reported by the transport layer
    #[display(fmt = "TRANSPORT_ERROR({:#04x})", _0)]
    TransportError(u8),
}

impl Status {
    /// True for [`Status::Ok`].
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

/// NDEF capability flags reported by NDEF detection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NdefFlags(u8);

impl NdefFlags {
    /// No flag set.
    pub const NONE: Self = Self(0x00);
    /// Tag is read-only.
    pub const READ_ONLY: Self = Self(0x01);
    /// Tag holds a valid NDEF structure.
    pub const FORMATTED: Self = Self(0x02);
    /// Tag family supports NDEF.
    pub const SUPPORTED: Self = Self(0x04);
    /// NDEF state could not be determined.
    pub const UNKNOWN: Self = Self(0x08);
    /// Tag can be formatted for NDEF.
    pub const FORMATABLE: Self = Self(0x10);
    /// Tag can be made read-only through the CC.
    pub const SOFT_LOCKABLE: Self = Self(0x20);
    /// Tag can be made read-only through lock bits.
    pub const HARD_LOCKABLE: Self = Self(0x40);
    /// Tag memory is one-time programmable.
    pub const OTP: Self = Self(0x80);

    /// Raw flag byte.
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Flags from a raw byte; every bit is meaningful.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// True when every flag in `other` is set.
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the flags in `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clear the flags in `other`.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for NdefFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for NdefFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for NdefFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(NdefFlags, &str); 8] = [
            (NdefFlags::READ_ONLY, "READ_ONLY"),
            (NdefFlags::FORMATTED, "FORMATTED"),
            (NdefFlags::SUPPORTED, "SUPPORTED"),
            (NdefFlags::UNKNOWN, "UNKNOWN"),
            (NdefFlags::FORMATABLE, "FORMATABLE"),
            (NdefFlags::SOFT_LOCKABLE, "SOFT_LOCKABLE"),
            (NdefFlags::HARD_LOCKABLE, "HARD_LOCKABLE"),
            (NdefFlags::OTP, "OTP"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "NdefFlags({})", names.join(" | "))
    }
}

/// Result of NDEF detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NdefDetectData {
    /// Detection outcome
    pub status: Status,
    /// Family of the detected tag
    pub protocol: Protocol,
    /// Largest NDEF message the tag can hold
    pub max_size: u32,
    /// Length of the NDEF message currently stored
    pub cur_size: u32,
    /// Capability flags
    pub flags: NdefFlags,
}

impl NdefDetectData {
    /// Failed detection: no size information, given flags.
    pub fn failed(protocol: Protocol, status: Status, flags: NdefFlags) -> Self {
        Self {
            status,
            protocol,
            max_size: 0,
            cur_size: 0,
            flags,
        }
    }
}

/// Parsed ISO 15693 Get System Information response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct I93SystemInfo {
    /// Information flags byte; says which optional fields follow
    pub info_flags: u8,
    /// Tag UID
    pub uid: I93Uid,
    /// Data storage format id
    pub dsfid: u8,
    /// Application family id
    pub afi: u8,
    /// Number of blocks
    pub num_blocks: u16,
    /// Block size in bytes
    pub block_size: u16,
    /// IC reference byte
    pub ic_reference: u8,
}

/// Event delivered to the upper layer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RwEvent {
    /// NDEF detection finished
    NdefDetect(NdefDetectData),
    /// Lock / Memory Control TLV search finished
    TlvDetect {
        /// Outcome of the search
        status: Status,
        /// Bytes reserved by the TLVs found
        num_bytes: u16,
    },
    /// One segment of NDEF payload
    NdefRead {
        /// Payload bytes, in tag order
        data: Vec<u8>,
    },
    /// The whole NDEF message has been delivered
    NdefReadComplete,
    /// NDEF read stopped early
    NdefReadFail {
        /// Why the read stopped
        status: Status,
    },
    /// The new NDEF message is on the tag
    NdefUpdateComplete,
    /// NDEF write stopped early
    NdefUpdateFail {
        /// Why the write stopped
        status: Status,
    },
    /// Format finished
    FormatComplete {
        /// Format outcome
        status: Status,
    },
    /// Read-only conversion finished
    SetTagReadOnly {
        /// Conversion outcome
        status: Status,
    },
    /// Presence check finished
    PresenceCheck {
        /// `Ok` when the tag answered
        status: Status,
    },
    /// Data received while no command was outstanding
    RawFrame {
        /// Frame status
        status: Status,
        /// Frame bytes as received
        data: Vec<u8>,
    },
    /// Transport reported an error with no operation to fail
    InterfaceError {
        /// Transport error status
        status: Status,
    },
    /// Raw read command finished (Type 1 / Type 2)
    ReadComplete {
        /// Command outcome
        status: Status,
        /// Response payload
        data: Vec<u8>,
    },
    /// Raw write command finished (Type 1 / Type 2)
    WriteComplete {
        /// Command outcome
        status: Status,
        /// Response payload
        data: Vec<u8>,
    },
    /// Type 2 sector select finished
    SectorSelected {
        /// Select outcome
        status: Status,
    },
    /// ISO 15693 inventory answered
    I93Inventory {
        /// Command outcome
        status: Status,
        /// Data storage format id
        dsfid: u8,
        /// UID of the responding tag
        uid: I93Uid,
    },
    /// ISO 15693 read returned block data
    I93Data {
        /// Command outcome
        status: Status,
        /// Block bytes, or security status bytes
        data: Vec<u8>,
    },
    /// ISO 15693 command with no data in its response finished
    I93CommandComplete {
        /// Command outcome
        status: Status,
        /// Error code byte when the tag set the error flag
        error_code: u8,
    },
    /// ISO 15693 Get System Information answered
    I93SystemInfo {
        /// Command outcome
        status: Status,
        /// Parsed system information
        info: I93SystemInfo,
    },
}

impl RwEvent {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            RwEvent::NdefDetect(_) => "NDEF_DETECT",
            RwEvent::TlvDetect { .. } => "TLV_DETECT",
            RwEvent::NdefRead { .. } => "NDEF_READ",
            RwEvent::NdefReadComplete => "NDEF_READ_CPLT",
            RwEvent::NdefReadFail { .. } => "NDEF_READ_FAIL",
            RwEvent::NdefUpdateComplete => "NDEF_UPDATE_CPLT",
            RwEvent::NdefUpdateFail { .. } => "NDEF_UPDATE_FAIL",
            RwEvent::FormatComplete { .. } => "FORMAT_CPLT",
            RwEvent::SetTagReadOnly { .. } => "SET_TAG_RO",
            RwEvent::PresenceCheck { .. } => "PRESENCE_CHECK",
            RwEvent::RawFrame { .. } => "RAW_FRAME",
            RwEvent::InterfaceError { .. } => "INTF_ERROR",
            RwEvent::ReadComplete { .. } => "READ_CPLT",
            RwEvent::WriteComplete { .. } => "WRITE_CPLT",
            RwEvent::SectorSelected { .. } => "SELECT_CPLT",
            RwEvent::I93Inventory { .. } => "I93_INVENTORY",
            RwEvent::I93Data { .. } => "I93_DATA",
            RwEvent::I93CommandComplete { .. } => "I93_CMD_CMPL",
            RwEvent::I93SystemInfo { .. } => "I93_SYS_INFO",
        }
    }

    /// Status carried by the event; segment and completion events are `Ok`.
    pub fn status(&self) -> Status {
        match self {
            RwEvent::NdefDetect(d) => d.status,
            RwEvent::NdefRead { .. }
            | RwEvent::NdefReadComplete
            | RwEvent::NdefUpdateComplete => Status::Ok,
            RwEvent::TlvDetect { status, .. }
            | RwEvent::NdefReadFail { status }
            | RwEvent::NdefUpdateFail { status }
            | RwEvent::FormatComplete { status }
            | RwEvent::SetTagReadOnly { status }
            | RwEvent::PresenceCheck { status }
            | RwEvent::RawFrame { status, .. }
            | RwEvent::InterfaceError { status }
            | RwEvent::ReadComplete { status, .. }
            | RwEvent::WriteComplete { status, .. }
            | RwEvent::SectorSelected { status }
            | RwEvent::I93Inventory { status, .. }
            | RwEvent::I93Data { status, .. }
            | RwEvent::I93CommandComplete { status, .. }
            | RwEvent::I93SystemInfo { status, .. } => *status,
        }
    }

    /// True for every event except intermediate NDEF read segments.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RwEvent::NdefRead { .. })
    }
}
