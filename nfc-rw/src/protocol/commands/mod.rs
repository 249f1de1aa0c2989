// nfc-rw-rs/nfc-rw/src/protocol/commands/mod.rs
//! Command encoding for each tag family.

pub mod i93;
pub mod t1t;
pub mod t2t;

pub use i93::{I93Command, I93Request};
pub use t1t::T1tCommand;
pub use t2t::{is_ack as is_t2t_ack, T2tCommand};

use crate::types::{Protocol, T1tUid};

/// Command sent by an engine. New tag families add a variant here and keep
/// their encoders in `protocol::commands::<family>.rs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Type 1 command with the UID echo it carries
    Type1 {
        /// Command and parameters
        op: T1tCommand,
        /// UID echo appended to the frame
        uid: T1tUid,
    },
    /// Type 2 command
    Type2(T2tCommand),
    /// ISO 15693 request
    Iso15693(I93Request),
}

impl Command {
    /// Family the command belongs to.
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Type1 { .. } => Protocol::Type1,
            Self::Type2(_) => Protocol::Type2,
            Self::Iso15693(_) => Protocol::Iso15693,
        }
    }

    /// Command code on the wire.
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Type1 { op, .. } => op.opcode(),
            Self::Type2(cmd) => cmd.opcode(),
            Self::Iso15693(req) => req.opcode(),
        }
    }

    /// Encode the command into the raw frame handed to the transport.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Type1 { op, uid } => op.encode(uid),
            Self::Type2(cmd) => cmd.encode(),
            Self::Iso15693(req) => req.encode(),
        }
    }
}
