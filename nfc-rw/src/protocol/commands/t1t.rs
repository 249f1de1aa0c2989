// nfc-rw-rs/nfc-rw/src/protocol/commands/t1t.rs
//! Type 1 (Topaz) command frames.
//!
//! Static commands are 7 bytes `[op, add, dat, uid0..uid3]`, dynamic ones
//! 14 bytes `[op, add, d0..d7, uid0..uid3]`.

use crate::constants::t1t;
use crate::types::T1tUid;

/// Type 1 command set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum T1tCommand {
    /// Read header ROM and UID
    Rid,
    /// Read the 120 static bytes
    ReadAll,
    /// Read one byte
    Read {
        /// Block 0..=14
        block: u8,
        /// Byte 0..=7 within the block
        byte: u8,
    },
    /// Erase then write one byte
    WriteErase {
        /// Block 0..=14
        block: u8,
        /// Byte 0..=7 within the block
        byte: u8,
        /// Value written
        value: u8,
    },
    /// OR one byte into tag memory
    WriteNoErase {
        /// Block 0..=14
        block: u8,
        /// Byte 0..=7 within the block
        byte: u8,
        /// Bits to set
        value: u8,
    },
    /// Read one 128-byte segment
    ReadSegment {
        /// Segment number
        segment: u8,
    },
    /// Read one 8-byte block
    Read8 {
        /// Block number
        block: u8,
    },
    /// Erase then write one 8-byte block
    WriteErase8 {
        /// Block number
        block: u8,
        /// Block contents
        data: [u8; 8],
    },
    /// OR one 8-byte block into tag memory
    WriteNoErase8 {
        /// Block number
        block: u8,
        /// Bits to set
        data: [u8; 8],
    },
}

/// Frame and response lengths of one opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct T1tRspInfo {
    /// Command code
    pub opcode: u8,
    /// Frame length sent
    pub cmd_len: usize,
    /// Response length expected
    pub rsp_len: usize,
}

const RSP_INFO: [T1tRspInfo; 9] = [
    T1tRspInfo { opcode: t1t::CMD_RID, cmd_len: 7, rsp_len: 6 },
    T1tRspInfo { opcode: t1t::CMD_RALL, cmd_len: 7, rsp_len: 122 },
    T1tRspInfo { opcode: t1t::CMD_READ, cmd_len: 7, rsp_len: 2 },
    T1tRspInfo { opcode: t1t::CMD_WRITE_E, cmd_len: 7, rsp_len: 2 },
    T1tRspInfo { opcode: t1t::CMD_WRITE_NE, cmd_len: 7, rsp_len: 2 },
    T1tRspInfo { opcode: t1t::CMD_RSEG, cmd_len: 14, rsp_len: 129 },
    T1tRspInfo { opcode: t1t::CMD_READ8, cmd_len: 14, rsp_len: 9 },
    T1tRspInfo { opcode: t1t::CMD_WRITE_E8, cmd_len: 14, rsp_len: 9 },
    T1tRspInfo { opcode: t1t::CMD_WRITE_NE8, cmd_len: 14, rsp_len: 9 },
];

/// Lookup the response info of an opcode.
pub fn rsp_info(opcode: u8) -> Option<T1tRspInfo> {
    RSP_INFO.iter().copied().find(|i| i.opcode == opcode)
}

/// Static address byte: block in bits 3..6, byte in bits 0..2.
pub fn build_add(block: u8, byte: u8) -> u8 {
    ((block & 0x0F) << 3) | (byte & 0x07)
}

/// Segment address byte of RSEG.
pub fn build_adds(segment: u8) -> u8 {
    (segment & 0x0F) << 4
}

impl T1tCommand {
    /// Command code byte.
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Rid => t1t::CMD_RID,
            Self::ReadAll => t1t::CMD_RALL,
            Self::Read { .. } => t1t::CMD_READ,
            Self::WriteErase { .. } => t1t::CMD_WRITE_E,
            Self::WriteNoErase { .. } => t1t::CMD_WRITE_NE,
            Self::ReadSegment { .. } => t1t::CMD_RSEG,
            Self::Read8 { .. } => t1t::CMD_READ8,
            Self::WriteErase8 { .. } => t1t::CMD_WRITE_E8,
            Self::WriteNoErase8 { .. } => t1t::CMD_WRITE_NE8,
        }
    }

    /// Address byte echoed back in the first byte of the response.
    /// RID and RALL carry `0` and their responses are not address checked.
    pub fn address(&self) -> u8 {
        match self {
            Self::Rid | Self::ReadAll => 0,
            Self::Read { block, byte }
            | Self::WriteErase { block, byte, .. }
            | Self::WriteNoErase { block, byte, .. } => build_add(*block, *byte),
            Self::ReadSegment { segment } => build_adds(*segment),
            Self::Read8 { block }
            | Self::WriteErase8 { block, .. }
            | Self::WriteNoErase8 { block, .. } => *block,
        }
    }

    /// RID / RALL responses are accepted without address check.
    pub fn checks_address(&self) -> bool {
        !matches!(self, Self::Rid | Self::ReadAll)
    }

    /// Frame and response lengths of this command.
    pub fn rsp_info(&self) -> T1tRspInfo {
        // every variant has a table entry
        rsp_info(self.opcode()).unwrap_or(T1tRspInfo {
            opcode: self.opcode(),
            cmd_len: 7,
            rsp_len: 2,
        })
    }

    /// Encode the frame; every Type 1 command ends with the UID echo.
    pub fn encode(&self, uid: &T1tUid) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.rsp_info().cmd_len);
        buf.push(self.opcode());
        buf.push(self.address());
        match self {
            Self::WriteErase { value, .. } | Self::WriteNoErase { value, .. } => buf.push(*value),
            Self::Rid | Self::ReadAll | Self::Read { .. } => buf.push(0),
            Self::WriteErase8 { data, .. } | Self::WriteNoErase8 { data, .. } => {
                buf.extend_from_slice(data)
            }
            Self::ReadSegment { .. } | Self::Read8 { .. } => buf.extend_from_slice(&[0u8; 8]),
        }
        buf.extend_from_slice(uid.as_bytes());
        buf
    }
}
