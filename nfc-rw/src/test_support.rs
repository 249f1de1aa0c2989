// nfc-rw-rs/nfc-rw/src/test_support.rs
//! Test support helpers intended for use by unit and integration tests.
//!
//! Simulated tags answer the frames an engine sends through a
//! [`MockTransport`]; [`drive`] shuttles frames between the two until the
//! engine stops sending.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use crate::constants::{i93, t1t, t2t};
use crate::events::RwEvent;
use crate::protocol::retry::Link;
use crate::protocol::tlv::ndef_tlv;
use crate::session::{EventCallback, RwSession};
use crate::tags::TagEngine;
use crate::transport::MockTransport;
use crate::types::{HeaderRom, I93Uid, T1tUid};

/// Exchanges after which [`drive`] gives up on an engine that keeps sending.
const MAX_EXCHANGES: usize = 4096;

/// A tag answering raw command frames. `None` means no answer (the
/// engine sees a timeout).
pub trait SimulatedTag {
    /// Answer one frame.
    fn respond(&mut self, frame: &[u8]) -> Option<Vec<u8>>;
}

/// Feed every frame the engine sends to `tag` and hand the answer (or a
/// timeout) back, until the engine goes quiet. Returns the queued events.
#[doc(hidden)]
pub fn drive<E, T>(engine: &mut E, link: &mut Link, mock: &MockTransport, tag: &mut T) -> Vec<RwEvent>
where
    E: TagEngine + ?Sized,
    T: SimulatedTag,
{
    for _ in 0..MAX_EXCHANGES {
        let frames = mock.take_sent();
        if frames.is_empty() {
            break;
        }
        for frame in frames {
            match tag.respond(&frame) {
                Some(rsp) => engine.on_response(link, &rsp),
                None => engine.on_timeout(link),
            }
        }
    }
    link.drain_events()
}

/// Same as [`drive`] one level up: answers go through the session, whose
/// callback receives the events.
#[doc(hidden)]
pub fn drive_session<T: SimulatedTag>(session: &mut RwSession, mock: &MockTransport, tag: &mut T) {
    for _ in 0..MAX_EXCHANGES {
        let frames = mock.take_sent();
        if frames.is_empty() {
            break;
        }
        for frame in frames {
            match tag.respond(&frame) {
                Some(rsp) => session.on_response(&rsp),
                None => session.on_timeout(),
            }
        }
    }
}

/// Shared event sink handed to [`RwSession::select`].
#[derive(Debug, Clone, Default)]
pub struct EventLog(Rc<RefCell<Vec<RwEvent>>>);

impl EventLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback that appends to this log.
    pub fn callback(&self) -> EventCallback {
        let sink = Rc::clone(&self.0);
        Box::new(move |event| sink.borrow_mut().push(event))
    }

    /// Events received since the last call, oldest first.
    pub fn take(&self) -> Vec<RwEvent> {
        std::mem::take(&mut *self.0.borrow_mut())
    }
}

fn padded(mem: &[u8], start: usize, len: usize) -> Vec<u8> {
    (start..start + len).map(|i| mem.get(i).copied().unwrap_or(0)).collect()
}

// ---- Type 1 ---------------------------------------------------------------

/// Type 1 (Topaz) tag memory answering static and dynamic commands.
#[derive(Debug, Clone)]
pub struct SimT1t {
    /// Header ROM
    pub hr: [u8; 2],
    /// Tag memory, 128 or 512 bytes
    pub mem: Vec<u8>,
    /// Every frame received, oldest first
    pub log: Vec<Vec<u8>>,
    /// Stop answering
    pub mute: bool,
}

const T1T_UID: [u8; 7] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
const T1T_DYNAMIC_SIZE: usize = 512;

impl SimT1t {
    fn with_uid(hr: [u8; 2], size: usize) -> Self {
        let mut mem = vec![0u8; size];
        mem[..t1t::UID_LEN].copy_from_slice(&T1T_UID);
        Self {
            hr,
            mem,
            log: Vec::new(),
            mute: false,
        }
    }

    /// 96-byte Topaz holding `message`.
    pub fn formatted_static(message: &[u8]) -> Self {
        let mut tag = Self::with_uid([t1t::STATIC_HR0, 0x48], t1t::SEGMENT_SIZE);
        tag.mem[t1t::CC_NMN_BYTE..t1t::CC_NMN_BYTE + 4].copy_from_slice(&[t1t::CC_NMN, t1t::CC_VNO, 0x0E, 0x00]);
        tag.place(12, &ndef_tlv(message));
        tag
    }

    /// 512-byte Topaz with Lock and Memory Control TLVs, holding `message`.
    pub fn formatted_dynamic(message: &[u8]) -> Self {
        let mut tag = Self::blank_dynamic();
        tag.mem[t1t::CC_NMN_BYTE..t1t::CC_NMN_BYTE + 4].copy_from_slice(&[t1t::CC_NMN, t1t::CC_VNO, 0x3F, 0x00]);
        let mut area = vec![0x01, 0x03, 0xF2, 0x30, 0x33, 0x02, 0x03, 0xF0, 0x02, 0x03];
        area.extend(ndef_tlv(message));
        tag.place(12, &area);
        tag
    }

    /// Blank 512-byte dynamic tag.
    pub fn blank_dynamic() -> Self {
        Self::with_uid([0x12, 0x4C], T1T_DYNAMIC_SIZE)
    }

    /// Copy `bytes` from `start` on, skipping the reserved, lock and OTP
    /// blocks at the end of segment 0.
    fn place(&mut self, start: usize, bytes: &[u8]) {
        let reserved = t1t::RES_BLOCK as usize * t1t::BLOCK_SIZE..t1t::SEGMENT_SIZE;
        let mut offset = start;
        for &b in bytes {
            while reserved.contains(&offset) {
                offset += 1;
            }
            if offset >= self.mem.len() {
                return;
            }
            self.mem[offset] = b;
            offset += 1;
        }
    }

    /// Header ROM as activation reports it.
    pub fn header_rom(&self) -> HeaderRom {
        HeaderRom::new(self.hr[0], self.hr[1])
    }

    /// First four UID bytes.
    pub fn uid4(&self) -> T1tUid {
        T1tUid::from_bytes([self.mem[0], self.mem[1], self.mem[2], self.mem[3]])
    }

    fn static_offset(add: u8) -> usize {
        ((add >> 3) & 0x0F) as usize * t1t::BLOCK_SIZE + (add & 0x07) as usize
    }
}

impl SimulatedTag for SimT1t {
    fn respond(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        self.log.push(frame.to_vec());
        if self.mute || frame.len() < 3 {
            return None;
        }
        let (op, add) = (frame[0], frame[1]);
        let mut rsp = vec![add];
        match op {
            t1t::CMD_RID => {
                let mut r = self.hr.to_vec();
                r.extend_from_slice(&self.mem[..t1t::CMD_UID_LEN]);
                return Some(r);
            }
            t1t::CMD_RALL => {
                let mut r = self.hr.to_vec();
                r.extend(padded(&self.mem, 0, t1t::STATIC_SIZE));
                return Some(r);
            }
            t1t::CMD_READ => rsp.push(*self.mem.get(Self::static_offset(add))?),
            t1t::CMD_WRITE_E | t1t::CMD_WRITE_NE => {
                let byte = self.mem.get_mut(Self::static_offset(add))?;
                if op == t1t::CMD_WRITE_E {
                    *byte = frame[2];
                } else {
                    *byte |= frame[2];
                }
                rsp.push(*byte);
            }
            t1t::CMD_RSEG => rsp.extend(padded(&self.mem, (add >> 4) as usize * t1t::SEGMENT_SIZE, t1t::SEGMENT_SIZE)),
            t1t::CMD_READ8 => rsp.extend(padded(&self.mem, add as usize * t1t::BLOCK_SIZE, t1t::BLOCK_SIZE)),
            t1t::CMD_WRITE_E8 | t1t::CMD_WRITE_NE8 => {
                let start = add as usize * t1t::BLOCK_SIZE;
                let block = self.mem.get_mut(start..start + t1t::BLOCK_SIZE)?;
                for (dst, src) in block.iter_mut().zip(&frame[2..2 + t1t::BLOCK_SIZE]) {
                    if op == t1t::CMD_WRITE_E8 {
                        *dst = *src;
                    } else {
                        *dst |= *src;
                    }
                }
                rsp.extend_from_slice(block);
            }
            _ => return None,
        }
        Some(rsp)
    }
}

// ---- Type 2 ---------------------------------------------------------------

const T2T_ACK: u8 = 0x0A;
const T2T_NAK: u8 = 0x00;

/// Type 2 tag memory. Writes to blocks 2 and 3 OR into the existing bytes
/// and statically locked blocks answer with a NAK. Tags larger than one
/// sector accept SECTOR SELECT.
#[derive(Debug, Clone)]
pub struct SimT2t {
    /// Tag memory, 4-byte blocks across all sectors
    pub mem: Vec<u8>,
    /// Every frame received, oldest first
    pub log: Vec<Vec<u8>>,
    /// Stop answering
    pub mute: bool,
    /// Sector currently addressed
    pub sector: u8,
    sector_change_armed: bool,
}

impl SimT2t {
    /// Tag over `mem`, in sector 0.
    pub fn new(mem: Vec<u8>) -> Self {
        Self {
            mem,
            log: Vec::new(),
            mute: false,
            sector: 0,
            sector_change_armed: false,
        }
    }

    /// Unformatted tag of `size` bytes from manufacturer `mid`.
    pub fn blank(mid: u8, size: usize) -> Self {
        let mut mem = vec![0u8; size];
        mem[0] = mid;
        mem[1..3].copy_from_slice(&[0x11, 0x22]);
        Self::new(mem)
    }

    /// 64-byte MIFARE Ultralight as shipped: blank CC, block 4 all ones.
    pub fn blank_ultralight() -> Self {
        let mut tag = Self::blank(t2t::MANUFACTURER_NXP, t2t::STATIC_SIZE);
        tag.mem[16..20].fill(0xFF);
        tag
    }

    /// Tag with a CC announcing `tms`, holding `message`. Memory extends 16
    /// bytes past the data area for the dynamic lock bytes.
    pub fn formatted(mid: u8, tms: u8, message: &[u8]) -> Self {
        let size = t2t::HEADER_SIZE + tms as usize * t2t::TMS_TAG_FACTOR + 16;
        let mut tag = Self::blank(mid, size);
        tag.mem[t2t::CC_NMN_BYTE..t2t::HEADER_SIZE].copy_from_slice(&[t2t::CC_NMN, t2t::CC_VNO, tms, t2t::CC_RWA_RW]);
        let tlv = ndef_tlv(message);
        tag.mem[t2t::HEADER_SIZE..t2t::HEADER_SIZE + tlv.len()].copy_from_slice(&tlv);
        tag
    }

    fn statically_locked(&self, block: usize) -> bool {
        let bits = u16::from_le_bytes([self.mem[t2t::LOCK_0_OFFSET], self.mem[t2t::LOCK_0_OFFSET + 1]]);
        (3..16).contains(&block) && bits & (1 << block) != 0
    }

    fn write(&mut self, block: usize, data: &[u8]) -> u8 {
        let start = block * t2t::BLOCK_SIZE;
        if block < 2 || start + t2t::BLOCK_SIZE > self.mem.len() || self.statically_locked(block) {
            return T2T_NAK;
        }
        match block {
            2 => {
                self.mem[t2t::LOCK_0_OFFSET] |= data[2];
                self.mem[t2t::LOCK_0_OFFSET + 1] |= data[3];
            }
            3 => {
                for (dst, src) in self.mem[start..start + t2t::BLOCK_SIZE].iter_mut().zip(data) {
                    *dst |= *src;
                }
            }
            _ => self.mem[start..start + t2t::BLOCK_SIZE].copy_from_slice(&data[..t2t::BLOCK_SIZE]),
        }
        T2T_ACK
    }
}

impl SimulatedTag for SimT2t {
    fn respond(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        self.log.push(frame.to_vec());
        if self.mute {
            return None;
        }
        if self.sector_change_armed {
            self.sector_change_armed = false;
            if frame.len() == 4 {
                self.sector = frame[0];
                return None;
            }
        }
        let base = self.sector as usize * t2t::BLOCKS_PER_SECTOR as usize;
        match (frame.first()?, frame.len()) {
            (&t2t::CMD_READ, 2) => {
                let start = (base + frame[1] as usize) * t2t::BLOCK_SIZE;
                if start >= self.mem.len() {
                    return Some(vec![T2T_NAK]);
                }
                Some(padded(&self.mem, start, t2t::READ_DATA_LEN))
            }
            (&t2t::CMD_WRITE, 6) => Some(vec![self.write(base + frame[1] as usize, &frame[2..])]),
            (&t2t::CMD_SEC_SEL, 2) => {
                if self.mem.len() > t2t::SECTOR_SIZE {
                    self.sector_change_armed = true;
                    Some(vec![T2T_ACK])
                } else {
                    Some(vec![T2T_NAK])
                }
            }
            _ => Some(vec![T2T_NAK]),
        }
    }
}

// ---- ISO 15693 ------------------------------------------------------------

const I93_OK: u8 = 0x00;
const I93_ERR: u8 = 0x01;
const I93_ERR_NOT_SUPPORTED: u8 = 0x01;
const I93_ERR_BLOCK_UNAVAILABLE: u8 = 0x10;
const I93_ERR_BLOCK_LOCKED: u8 = 0x12;

/// ICODE SLIX UID used by [`SimI93::icode_slix`].
pub const SLIX_UID: [u8; 8] = [0xE0, 0x04, 0x01, 0x00, 0x11, 0x22, 0x33, 0x44];
/// M24LR04E-R UID used by [`SimI93::m24lr04e`].
pub const M24LR04E_UID: [u8; 8] = [0xE0, 0x02, 0x5A, 0x00, 0x55, 0x66, 0x77, 0x88];

/// ISO 15693 tag memory. Addressed requests for another UID are not
/// answered; STAY QUIET never is.
#[derive(Debug, Clone)]
pub struct SimI93 {
    /// Tag UID
    pub uid: I93Uid,
    /// DSFID reported in system information
    pub dsfid: u8,
    /// AFI reported in system information
    pub afi: u8,
    /// IC reference reported in system information
    pub ic_reference: u8,
    /// Block size in bytes
    pub block_size: usize,
    /// Tag memory
    pub mem: Vec<u8>,
    /// Per-block lock state
    pub locked: Vec<bool>,
    /// Every frame received, oldest first
    pub log: Vec<Vec<u8>>,
    /// Stop answering
    pub mute: bool,
    /// Answer a plain GET SYSTEM INFORMATION with "option not supported"
    pub needs_prot_ext: bool,
    /// Error code returned by every write and lock (the data is still stored)
    pub fail_writes_with: Option<u8>,
}

impl SimI93 {
    /// Zeroed memory of `num_blocks` blocks.
    pub fn blank(uid: [u8; 8], ic_reference: u8, block_size: usize, num_blocks: usize) -> Self {
        Self {
            uid: I93Uid::from_bytes(uid),
            dsfid: 0,
            afi: 0,
            ic_reference,
            block_size,
            mem: vec![0u8; block_size * num_blocks],
            locked: vec![false; num_blocks],
            log: Vec::new(),
            mute: false,
            needs_prot_ext: false,
            fail_writes_with: None,
        }
    }

    /// 112-byte ICODE SLIX (28 blocks of 4) holding `message`.
    pub fn icode_slix(message: &[u8]) -> Self {
        let mut tag = Self::blank(SLIX_UID, 0x01, 4, 28);
        tag.mem[..4].copy_from_slice(&[i93::CC_MAGIC, i93::CC_VERSION, 0x0E, i93::CC3_MBREAD]);
        tag.place(4, &ndef_tlv(message));
        tag
    }

    /// 512-byte M24LR04E-R (128 blocks of 4) holding `message`.
    pub fn m24lr04e(message: &[u8]) -> Self {
        let mut tag = Self::blank(M24LR04E_UID, i93::STM_M24LR04E_R, 4, 128);
        tag.mem[..4].copy_from_slice(&[i93::CC_MAGIC, i93::CC_VERSION, 0x40, i93::CC3_MBREAD]);
        tag.place(4, &ndef_tlv(message));
        tag
    }

    /// Copy `bytes` into memory at `offset`.
    pub fn place(&mut self, offset: usize, bytes: &[u8]) {
        self.mem[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.mem.len() / self.block_size
    }

    /// Contents of one block.
    pub fn block(&self, block: usize) -> &[u8] {
        &self.mem[block * self.block_size..(block + 1) * self.block_size]
    }

    fn block_number(frame: &[u8], pos: &mut usize, ext: bool) -> Option<usize> {
        if ext {
            let b = u16::from_le_bytes([*frame.get(*pos)?, *frame.get(*pos + 1)?]);
            *pos += 2;
            Some(b as usize)
        } else {
            let b = *frame.get(*pos)?;
            *pos += 1;
            Some(b as usize)
        }
    }

    fn write_result(&self) -> Vec<u8> {
        match self.fail_writes_with {
            Some(code) => vec![I93_ERR, code],
            None => vec![I93_OK],
        }
    }

    fn write_block(&mut self, block: usize, data: &[u8]) -> Vec<u8> {
        if block >= self.num_blocks() || data.len() < self.block_size {
            return vec![I93_ERR, I93_ERR_BLOCK_UNAVAILABLE];
        }
        if self.locked[block] {
            return vec![I93_ERR, I93_ERR_BLOCK_LOCKED];
        }
        let bs = self.block_size;
        self.mem[block * bs..(block + 1) * bs].copy_from_slice(&data[..bs]);
        self.write_result()
    }

    fn system_info(&self, ext: bool) -> Vec<u8> {
        if self.needs_prot_ext && !ext {
            return vec![I93_ERR, i93::ERROR_OPTION_NOT_SUPPORTED];
        }
        let mut rsp = vec![I93_OK, 0x0F];
        rsp.extend_from_slice(&self.uid.to_wire());
        rsp.extend_from_slice(&[self.dsfid, self.afi]);
        let last_block = self.num_blocks() - 1;
        if ext {
            rsp.extend_from_slice(&(last_block as u16).to_le_bytes());
        } else {
            rsp.push(last_block as u8);
        }
        rsp.push((self.block_size - 1) as u8);
        rsp.push(self.ic_reference);
        rsp
    }

    fn inventory(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let flags = frame[0];
        let mut pos = 2;
        if flags & i93::FLAG_AFI_PRESENT != 0 {
            let afi = *frame.get(pos)?;
            pos += 1;
            if afi != 0 && afi != self.afi {
                return None;
            }
        }
        let mask_len = *frame.get(pos)? as usize;
        pos += 1;
        let mask = frame.get(pos..pos + mask_len / 8)?;
        if mask != &self.uid.to_wire()[..mask_len / 8] {
            return None;
        }
        let mut rsp = vec![I93_OK, self.dsfid];
        rsp.extend_from_slice(&self.uid.to_wire());
        Some(rsp)
    }
}

impl SimulatedTag for SimI93 {
    fn respond(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        self.log.push(frame.to_vec());
        if self.mute || frame.len() < 2 {
            return None;
        }
        let (flags, cmd) = (frame[0], frame[1]);
        if flags & i93::FLAG_INVENTORY != 0 {
            return self.inventory(frame);
        }
        let mut pos = 2;
        if flags & i93::FLAG_ADDRESS != 0 || cmd == i93::CMD_SELECT {
            if frame.get(2..10)? != self.uid.to_wire() {
                return None;
            }
            pos = 10;
        }
        let ext = flags & i93::FLAG_PROT_EXT != 0;
        let option = flags & i93::FLAG_OPTION != 0;
        let bs = self.block_size;
        let rsp = match cmd {
            i93::CMD_STAY_QUIET => return None,
            i93::CMD_READ_SINGLE_BLOCK => {
                let block = Self::block_number(frame, &mut pos, ext)?;
                if block >= self.num_blocks() {
                    return Some(vec![I93_ERR, I93_ERR_BLOCK_UNAVAILABLE]);
                }
                let mut rsp = vec![I93_OK];
                if option {
                    rsp.push(self.locked[block] as u8);
                }
                rsp.extend_from_slice(self.block(block));
                rsp
            }
            i93::CMD_WRITE_SINGLE_BLOCK => {
                let block = Self::block_number(frame, &mut pos, ext)?;
                let data = frame.get(pos..)?.to_vec();
                self.write_block(block, &data)
            }
            i93::CMD_LOCK_BLOCK => {
                let block = *frame.get(pos)? as usize;
                match self.locked.get_mut(block) {
                    Some(l) => {
                        *l = true;
                        self.write_result()
                    }
                    None => vec![I93_ERR, I93_ERR_BLOCK_UNAVAILABLE],
                }
            }
            i93::CMD_READ_MULTI_BLOCK => {
                let first = Self::block_number(frame, &mut pos, ext)?;
                let count = *frame.get(pos)? as usize + 1;
                if first + count > self.num_blocks() {
                    return Some(vec![I93_ERR, I93_ERR_BLOCK_UNAVAILABLE]);
                }
                let mut rsp = vec![I93_OK];
                rsp.extend_from_slice(&self.mem[first * bs..(first + count) * bs]);
                rsp
            }
            i93::CMD_WRITE_MULTI_BLOCK => {
                let first = *frame.get(pos)? as usize;
                let count = *frame.get(pos + 1)? as usize + 1;
                let data = frame.get(pos + 2..pos + 2 + count * bs)?.to_vec();
                let mut rsp = vec![I93_OK];
                for (i, chunk) in data.chunks(bs).enumerate() {
                    rsp = self.write_block(first + i, chunk);
                    if rsp[0] != I93_OK {
                        break;
                    }
                }
                rsp
            }
            i93::CMD_WRITE_AFI => {
                self.afi = *frame.get(pos)?;
                self.write_result()
            }
            i93::CMD_WRITE_DSFID => {
                self.dsfid = *frame.get(pos)?;
                self.write_result()
            }
            i93::CMD_SELECT | i93::CMD_RESET_TO_READY | i93::CMD_LOCK_AFI | i93::CMD_LOCK_DSFID => vec![I93_OK],
            i93::CMD_GET_SYS_INFO => self.system_info(ext),
            i93::CMD_GET_MULTI_BLK_SEC => {
                let first = Self::block_number(frame, &mut pos, ext)?;
                let count = Self::block_number(frame, &mut pos, ext)? + 1;
                if first + count > self.num_blocks() {
                    return Some(vec![I93_ERR, I93_ERR_BLOCK_UNAVAILABLE]);
                }
                let mut rsp = vec![I93_OK];
                rsp.extend(self.locked[first..first + count].iter().map(|&l| l as u8));
                rsp
            }
            _ => vec![I93_ERR, I93_ERR_NOT_SUPPORTED],
        };
        Some(rsp)
    }
}
