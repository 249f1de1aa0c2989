// nfc-rw-rs/nfc-rw/src/protocol/commands/t2t.rs
//! Type 2 command frames.

use crate::constants::t2t;

/// Type 2 command set. Block numbers are sector relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum T2tCommand {
    /// READ returns 16 bytes (4 blocks) starting at `block`
    Read {
        /// First block
        block: u8,
    },
    /// WRITE one 4-byte block
    Write {
        /// Block number
        block: u8,
        /// Block contents
        data: [u8; 4],
    },
    /// First step of sector select
    SectorSelect,
    /// Second step of sector select; the tag never answers a successful one
    SectorChange {
        /// Target sector
        sector: u8,
    },
}

/// Expected response lengths of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct T2tRspInfo {
    /// Command code
    pub opcode: u8,
    /// Frame length sent
    pub cmd_len: usize,
    /// Length of a positive response
    pub rsp_len: usize,
    /// Length of a NACK
    pub nack_rsp_len: usize,
}

impl T2tCommand {
    /// Command code byte. Sector change frames carry the sector number.
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Read { .. } => t2t::CMD_READ,
            Self::Write { .. } => t2t::CMD_WRITE,
            Self::SectorSelect => t2t::CMD_SEC_SEL,
            Self::SectorChange { sector } => *sector,
        }
    }

    /// Frame and response lengths of this command.
    pub fn rsp_info(&self) -> T2tRspInfo {
        match self {
            Self::Read { .. } => T2tRspInfo {
                opcode: t2t::CMD_READ,
                cmd_len: 2,
                rsp_len: t2t::READ_DATA_LEN,
                nack_rsp_len: 1,
            },
            Self::Write { .. } => T2tRspInfo {
                opcode: t2t::CMD_WRITE,
                cmd_len: 6,
                rsp_len: 1,
                nack_rsp_len: 1,
            },
            Self::SectorSelect => T2tRspInfo {
                opcode: t2t::CMD_SEC_SEL,
                cmd_len: 2,
                rsp_len: 1,
                nack_rsp_len: 1,
            },
            Self::SectorChange { sector } => T2tRspInfo {
                opcode: *sector,
                cmd_len: 4,
                rsp_len: 0,
                nack_rsp_len: 1,
            },
        }
    }

    /// Expects an answer from the tag.
    pub fn expects_response(&self) -> bool {
        !matches!(self, Self::SectorChange { .. })
    }

    /// Encode the frame.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Read { block } => vec![t2t::CMD_READ, *block],
            Self::Write { block, data } => {
                let mut v = Vec::with_capacity(6);
                v.push(t2t::CMD_WRITE);
                v.push(*block);
                v.extend_from_slice(data);
                v
            }
            Self::SectorSelect => vec![t2t::CMD_SEC_SEL, t2t::SEC_SEL_PARAM],
            Self::SectorChange { sector } => vec![*sector, 0x00, 0x00, 0x00],
        }
    }
}

/// True when a one-byte response is a positive acknowledgement.
pub fn is_ack(rsp: &[u8]) -> bool {
    rsp.len() == 1 && (rsp[0] & t2t::RSP_NACK_MASK) == t2t::RSP_ACK
}
