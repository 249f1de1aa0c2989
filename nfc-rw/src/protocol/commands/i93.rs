// nfc-rw-rs/nfc-rw/src/protocol/commands/i93.rs
//! ISO 15693 request frames.
//!
//! Every addressed request is `[flags, command, uid (LSB first), params..]`.
//! Block numbers are one byte, or two bytes little-endian when the protocol
//! extension flag is set.

use crate::constants::i93;
use crate::types::I93Uid;

/// Sub-carrier and data-rate flags sent with every request.
pub const BASE_FLAGS: u8 = i93::FLAG_DATA_RATE_HIGH;

/// ISO 15693 command set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum I93Command {
    /// One-slot inventory, optionally with AFI and full UID mask
    Inventory {
        /// AFI to match
        afi: Option<u8>,
        /// Full 64-bit mask; only this UID answers
        mask_uid: Option<I93Uid>,
    },
    /// Put the tag in quiet state; no response
    StayQuiet,
    /// Read one block
    ReadSingleBlock {
        /// Block number
        block: u16,
    },
    /// Write one block
    WriteSingleBlock {
        /// Block number
        block: u16,
        /// Exactly one block of data
        data: Vec<u8>,
    },
    /// Permanently lock one block
    LockBlock {
        /// Block number
        block: u8,
    },
    /// Read `count` blocks starting at `first`
    ReadMultipleBlocks {
        /// First block number
        first: u16,
        /// Number of blocks
        count: u16,
    },
    /// Write `count` blocks starting at `first`
    WriteMultipleBlocks {
        /// First block number
        first: u8,
        /// Number of blocks
        count: u16,
        /// `count` blocks of data
        data: Vec<u8>,
    },
    /// Select addresses the given UID rather than the session UID
    Select {
        /// UID to select
        uid: I93Uid,
    },
    /// Return the tag to ready state
    ResetToReady,
    /// Write the application family id
    WriteAfi {
        /// New AFI
        afi: u8,
    },
    /// Permanently lock the AFI
    LockAfi,
    /// Write the data storage format id
    WriteDsfid {
        /// New DSFID
        dsfid: u8,
    },
    /// Permanently lock the DSFID
    LockDsfid,
    /// `uid` overrides the session UID when present
    GetSystemInfo {
        /// UID to address instead of the session UID
        uid: Option<I93Uid>,
    },
    /// One lock status byte per block
    GetMultiBlockSecurityStatus {
        /// First block number
        first: u16,
        /// Number of blocks
        count: u16,
    },
}

impl I93Command {
    /// Command code byte.
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Inventory { .. } => i93::CMD_INVENTORY,
            Self::StayQuiet => i93::CMD_STAY_QUIET,
            Self::ReadSingleBlock { .. } => i93::CMD_READ_SINGLE_BLOCK,
            Self::WriteSingleBlock { .. } => i93::CMD_WRITE_SINGLE_BLOCK,
            Self::LockBlock { .. } => i93::CMD_LOCK_BLOCK,
            Self::ReadMultipleBlocks { .. } => i93::CMD_READ_MULTI_BLOCK,
            Self::WriteMultipleBlocks { .. } => i93::CMD_WRITE_MULTI_BLOCK,
            Self::Select { .. } => i93::CMD_SELECT,
            Self::ResetToReady => i93::CMD_RESET_TO_READY,
            Self::WriteAfi { .. } => i93::CMD_WRITE_AFI,
            Self::LockAfi => i93::CMD_LOCK_AFI,
            Self::WriteDsfid { .. } => i93::CMD_WRITE_DSFID,
            Self::LockDsfid => i93::CMD_LOCK_DSFID,
            Self::GetSystemInfo { .. } => i93::CMD_GET_SYS_INFO,
            Self::GetMultiBlockSecurityStatus { .. } => i93::CMD_GET_MULTI_BLK_SEC,
        }
    }
}

/// An addressed request with its per-request flag modifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I93Request {
    /// Command and its parameters
    pub command: I93Command,
    /// Session UID (MSB first); ignored by Inventory
    pub uid: I93Uid,
    /// Option flag (security status on reads, required by some TI writes)
    pub option: bool,
    /// Protocol extension: 16-bit block numbers
    pub extended: bool,
}

impl I93Request {
    /// Request with option and extension flags clear.
    pub fn new(command: I93Command, uid: I93Uid) -> Self {
        Self {
            command,
            uid,
            option: false,
            extended: false,
        }
    }

    /// Set the option flag.
    pub fn with_option(mut self, option: bool) -> Self {
        self.option = option;
        self
    }

    /// Use 16-bit block numbers.
    pub fn with_extended(mut self, extended: bool) -> Self {
        self.extended = extended;
        self
    }

    /// Command code byte.
    pub fn opcode(&self) -> u8 {
        self.command.opcode()
    }

    /// Request flags byte.
    pub fn flags(&self) -> u8 {
        if let I93Command::Inventory { afi, .. } = &self.command {
            let mut flags = i93::FLAG_ONE_SLOT | i93::FLAG_INVENTORY | BASE_FLAGS;
            if afi.is_some() {
                flags |= i93::FLAG_AFI_PRESENT;
            }
            return flags;
        }
        let mut flags = i93::FLAG_ADDRESS | BASE_FLAGS;
        if self.option {
            flags |= i93::FLAG_OPTION;
        }
        if self.extended {
            flags |= i93::FLAG_PROT_EXT;
        }
        flags
    }

    fn push_block(&self, buf: &mut Vec<u8>, block: u16) {
        if self.extended {
            buf.extend_from_slice(&block.to_le_bytes());
        } else {
            buf.push(block as u8);
        }
    }

    /// Encode as `[flags, command, uid (LSB first), params..]`. Inventory carries no UID.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        buf.push(self.flags());
        buf.push(self.opcode());

        match &self.command {
            I93Command::Inventory { afi, mask_uid } => {
                if let Some(afi) = afi {
                    buf.push(*afi);
                }
                match mask_uid {
                    Some(uid) => {
                        buf.push((i93::UID_LEN * 8) as u8);
                        buf.extend_from_slice(&uid.to_wire());
                    }
                    None => buf.push(0x00),
                }
                return buf;
            }
            I93Command::Select { uid } => {
                buf.extend_from_slice(&uid.to_wire());
                return buf;
            }
            I93Command::GetSystemInfo { uid: Some(uid) } => {
                buf.extend_from_slice(&uid.to_wire());
                return buf;
            }
            _ => buf.extend_from_slice(&self.uid.to_wire()),
        }

        match &self.command {
            I93Command::ReadSingleBlock { block } => self.push_block(&mut buf, *block),
            I93Command::WriteSingleBlock { block, data } => {
                self.push_block(&mut buf, *block);
                buf.extend_from_slice(data);
            }
            I93Command::LockBlock { block } => buf.push(*block),
            I93Command::ReadMultipleBlocks { first, count } => {
                self.push_block(&mut buf, *first);
                buf.push(count.saturating_sub(1) as u8);
            }
            I93Command::WriteMultipleBlocks { first, count, data } => {
                buf.push(*first);
                buf.push(count.saturating_sub(1) as u8);
                buf.extend_from_slice(data);
            }
            I93Command::WriteAfi { afi } => buf.push(*afi),
            I93Command::WriteDsfid { dsfid } => buf.push(*dsfid),
            I93Command::GetMultiBlockSecurityStatus { first, count } => {
                self.push_block(&mut buf, *first);
                self.push_block(&mut buf, count.saturating_sub(1));
            }
            _ => {}
        }
        buf
    }
}
