// nfc-rw-rs/nfc-rw/src/tags/t2t_ndef.rs
//! Type 2 NDEF flows: TLV detection, read, write, format and read-only.

use std::collections::{BTreeMap, VecDeque};

use crate::constants::{t2t, tlv};
use crate::events::{NdefDetectData, NdefFlags, RwEvent, Status};
use crate::protocol::lock::LockStatus;
use crate::protocol::retry::Link;
use crate::protocol::tlv::{
    decode_control_tlv, encode_control_tlv, encode_length, fit_length_field, length_field_len, TlvCursor, TlvScan,
    TlvType,
};
use crate::tags::t2t::{BlockOp, T2tEngine, T2tState, T2tSubstate};
use crate::types::Protocol;
use crate::{Error, Result};

/// Largest tag memory a valid CC may announce.
const MAX_TAG_SIZE: usize = 2048;

type Block = [u8; t2t::BLOCK_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatchKind {
    /// Length field zeroed plus message bytes
    Data,
    /// Real length written back
    Length,
    Terminator,
}

/// Bytes to change in one block during an NDEF update.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Patch {
    block: u16,
    /// `(index in block, value)`
    bytes: Vec<(usize, u8)>,
    kind: PatchKind,
}

impl Patch {
    fn covers_block(&self) -> bool {
        self.bytes.len() == t2t::BLOCK_SIZE
    }

    fn apply(&self, mut base: Block) -> Block {
        for &(i, v) in &self.bytes {
            base[i] = v;
        }
        base
    }
}

/// Group `(tag offset, value)` pairs into per-block patches, in order.
fn group_patches(writes: &[(usize, u8)], kind: PatchKind) -> Vec<Patch> {
    writes
        .chunk_by(|a, b| a.0 / t2t::BLOCK_SIZE == b.0 / t2t::BLOCK_SIZE)
        .map(|group| Patch {
            block: (group[0].0 / t2t::BLOCK_SIZE) as u16,
            bytes: group.iter().map(|&(o, v)| (o % t2t::BLOCK_SIZE, v)).collect(),
            kind,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanOutcome {
    Found,
    NotFound,
    NeedMore,
}

/// Progress of the NDEF operation in flight.
#[derive(Debug, Default)]
pub(crate) struct T2tNdefOp {
    cursor: TlvCursor,
    read_buf: Vec<u8>,
    /// Next tag offset to collect message bytes from
    read_pos: usize,
    /// Known contents of blocks touched by the update
    blocks: BTreeMap<u16, Block>,
    prereads: VecDeque<(u16, T2tSubstate)>,
    patches: VecDeque<Patch>,
    /// Block written by the command in flight
    in_flight: Option<(u16, Block)>,
    new_msg_len: usize,
    new_msg_offset: usize,
    hard_lock: bool,
    /// Version block read while formatting a blank tag
    version_info: Option<[u8; t2t::READ_DATA_LEN]>,
    /// Third value byte of the Lock Control TLV written while formatting
    lock_tlv_tail: u8,
}

impl T2tEngine {
    fn cc_byte(&self, index: usize) -> u8 {
        self.tag_hdr[index]
    }

    fn tms(&self) -> usize {
        self.cc_byte(t2t::CC_TMS_BYTE) as usize
    }

    /// Tag offset right after the data area announced by the CC.
    fn data_area_end(&self) -> usize {
        t2t::HEADER_SIZE + self.tms() * t2t::TMS_TAG_FACTOR
    }

    /// Data area plus the dynamic lock and reserved bytes.
    pub(super) fn tag_size(&self) -> usize {
        self.data_area_end() + self.locks.control_byte_count()
    }

    fn cc_is_valid(&self) -> bool {
        let vno = self.cc_byte(t2t::CC_VNO_BYTE);
        let rwa = self.cc_byte(t2t::CC_RWA_BYTE);
        (rwa == t2t::CC_RWA_RW || rwa == t2t::CC_RWA_RO)
            && matches!(vno, t2t::CC_VNO | t2t::CC_LEGACY_VNO | t2t::CC_NEW_VNO)
    }

    fn is_otp(&self, link: &Link) -> bool {
        link.config()
            .t2t_model(self.tag_hdr[0], None)
            .is_some_and(|m| m.otp)
    }

    fn base_flags(&self, link: &Link) -> NdefFlags {
        let mut flags = NdefFlags::SUPPORTED;
        let tms = self.cc_byte(t2t::CC_TMS_BYTE);
        if tms == t2t::CC_TMS_STATIC || tms == 0 {
            flags |= NdefFlags::FORMATABLE;
        }
        if self.cc_byte(t2t::CC_RWA_BYTE) & 0x0F == t2t::CC_RWA_RO {
            flags |= NdefFlags::READ_ONLY;
        }
        if self.is_otp(link) {
            flags |= NdefFlags::OTP;
            if self.ndef_msg_len > 0 {
                flags |= NdefFlags::READ_ONLY;
            }
        }
        flags
    }

    /// Send a WRITE and remember the block content for the ack.
    fn write_block(&mut self, link: &mut Link, substate: T2tSubstate, block: u16, data: Block) -> Result<()> {
        self.ndef.in_flight = Some((block, data));
        self.issue(link, substate, BlockOp::Write(block, data))
    }

    // ---- TLV detection --------------------------------------------------

    /// NDEF detection that optionally skips reading the dynamic lock bytes.
    pub fn detect_ndef_ext(&mut self, link: &mut Link, skip_dyn_locks: bool) -> Result<()> {
        self.start_tlv_search(link, TlvType::Ndef, skip_dyn_locks)
    }

    /// Search for the NDEF, Lock Control, Memory Control or Proprietary TLV.
    pub fn locate_tlv(&mut self, link: &mut Link, wanted: TlvType) -> Result<()> {
        self.start_tlv_search(link, wanted, false)
    }

    fn start_tlv_search(&mut self, link: &mut Link, wanted: TlvType, skip_dyn_locks: bool) -> Result<()> {
        self.ensure_idle()?;
        if !matches!(
            wanted,
            TlvType::Ndef | TlvType::LockControl | TlvType::MemoryControl | TlvType::Proprietary
        ) {
            return Err(Error::InvalidParameter(format!("cannot search for {} TLV", wanted)));
        }
        if self.hdr_valid {
            if wanted == TlvType::LockControl && self.cc_byte(t2t::CC_TMS_BYTE) == t2t::CC_TMS_STATIC {
                self.hdr_valid = false;
                return Err(Error::refused("static tag has no Lock Control TLV"));
            }
            if wanted == TlvType::Ndef && self.cc_byte(t2t::CC_NMN_BYTE) != t2t::CC_NMN {
                self.hdr_valid = false;
                return Err(Error::refused(format!(
                    "not NDEF formatted (NMN={:#04x})",
                    self.cc_byte(t2t::CC_NMN_BYTE)
                )));
            }
        }
        let (substate, block) = if self.hdr_valid {
            (T2tSubstate::WaitTlvDetect, t2t::FIRST_DATA_BLOCK)
        } else {
            (T2tSubstate::WaitReadCc, 0)
        };
        self.launch(link, T2tState::TlvDetect, substate, BlockOp::Read(block))?;
        self.tlv_wanted = wanted;
        self.skip_dyn_locks = skip_dyn_locks;
        self.locks.reset();
        if self.hdr_valid {
            self.apply_static_attributes();
        }
        self.ndef.cursor = TlvCursor::new(t2t::HEADER_SIZE);
        self.prop_msg_len = 0;
        if wanted == TlvType::Ndef {
            self.ndef_detected = false;
            self.ndef_header_offset = 0;
            self.ndef_msg_offset = 0;
            self.ndef_msg_len = 0;
            self.max_ndef_msg_len = 0;
        }
        Ok(())
    }

    /// CC arrived during detection.
    fn process_cc(&mut self, link: &mut Link) -> Result<()> {
        if self.tlv_wanted == TlvType::Ndef && self.cc_byte(t2t::CC_NMN_BYTE) != t2t::CC_NMN {
            log::info!("T2T not NDEF formatted (NMN={:#04x})", self.cc_byte(t2t::CC_NMN_BYTE));
            self.finish_tlv_detect(link, Status::Failed);
            return Ok(());
        }
        if !self.cc_is_valid() {
            log::warn!("T2T invalid CC {:02X?}", &self.tag_hdr[t2t::CC_NMN_BYTE..]);
            self.finish_tlv_detect(link, Status::Failed);
            return Ok(());
        }
        self.issue(link, T2tSubstate::WaitTlvDetect, BlockOp::Read(t2t::FIRST_DATA_BLOCK))
    }

    fn have_wanted_control(&self) -> bool {
        match self.tlv_wanted {
            TlvType::LockControl => !self.locks.lock_tlvs().is_empty(),
            TlvType::MemoryControl => !self.locks.mem_tlvs().is_empty(),
            _ => false,
        }
    }

    fn control_outcome(&self) -> ScanOutcome {
        if self.have_wanted_control() {
            ScanOutcome::Found
        } else {
            ScanOutcome::NotFound
        }
    }

    /// Continue the TLV walk over one READ response.
    fn scan_chunk(&mut self, chunk: &[u8], chunk_offset: usize) -> ScanOutcome {
        let mut cursor = std::mem::take(&mut self.ndef.cursor);
        let outcome = loop {
            let scan = cursor.next(chunk, chunk_offset, |o| self.locks.is_lock_or_reserved(o));
            let rec = match scan {
                TlvScan::Record(rec) => rec,
                TlvScan::Terminator { .. } => break self.control_outcome(),
                TlvScan::NeedMoreData => break ScanOutcome::NeedMore,
                TlvScan::Invalid { offset, type_byte } => {
                    log::warn!("T2T unknown TLV type {:#04x} at {}", type_byte, offset);
                    break ScanOutcome::NotFound;
                }
            };
            match rec.tlv_type {
                TlvType::LockControl | TlvType::MemoryControl if rec.length == tlv::CONTROL_TLV_LEN => {
                    let value = decode_control_tlv(&[rec.value[0], rec.value[1], rec.value[2]]);
                    let added = if rec.tlv_type == TlvType::LockControl {
                        self.locks.add_lock_tlv(value.into()).map(|_| ())
                    } else {
                        self.locks.add_mem_tlv(value.into())
                    };
                    if let Err(e) = added {
                        log::warn!("T2T {} TLV at {} rejected: {}", rec.tlv_type, rec.offset, e);
                        break ScanOutcome::NotFound;
                    }
                    log::debug!(
                        "T2T {} TLV at {}: offset={} size={}",
                        rec.tlv_type,
                        rec.offset,
                        value.offset,
                        value.size
                    );
                }
                TlvType::LockControl | TlvType::MemoryControl => {
                    log::warn!("T2T malformed {} TLV at {}", rec.tlv_type, rec.offset);
                    break self.control_outcome();
                }
                TlvType::Ndef => match self.tlv_wanted {
                    TlvType::Ndef => {
                        self.ndef_header_offset = rec.length_offset;
                        self.ndef_msg_offset = rec.value_offset;
                        self.ndef_msg_len = rec.length;
                        break ScanOutcome::Found;
                    }
                    TlvType::Proprietary => {}
                    _ => break self.control_outcome(),
                },
                TlvType::Proprietary if self.tlv_wanted == TlvType::Proprietary => {
                    self.prop_msg_len = rec.length;
                    break ScanOutcome::Found;
                }
                _ => {}
            }
        };
        self.ndef.cursor = cursor;
        outcome
    }

    fn process_tlv_chunk(&mut self, link: &mut Link, data: &[u8]) -> Result<()> {
        let chunk_offset = self.block_read as usize * t2t::BLOCK_SIZE;
        if self.block_read == t2t::FIRST_DATA_BLOCK {
            self.tag_data.copy_from_slice(&data[..t2t::READ_DATA_LEN]);
            self.data_valid = true;
        }
        match self.scan_chunk(&data[..t2t::READ_DATA_LEN], chunk_offset) {
            ScanOutcome::Found => self.after_tlv_search(link, Status::Ok),
            ScanOutcome::NotFound => self.after_tlv_search(link, Status::Failed),
            ScanOutcome::NeedMore => {
                let next = self.block_read + t2t::BLOCKS_PER_READ as u16;
                if next as usize * t2t::BLOCK_SIZE >= self.data_area_end() {
                    let status = match self.control_outcome() {
                        ScanOutcome::Found => Status::Ok,
                        _ => Status::Failed,
                    };
                    self.after_tlv_search(link, status)
                } else {
                    self.issue(link, T2tSubstate::WaitTlvDetect, BlockOp::Read(next))
                }
            }
        }
    }

    fn after_tlv_search(&mut self, link: &mut Link, status: Status) -> Result<()> {
        match self.tlv_wanted {
            TlvType::Ndef if !status.is_ok() => {
                self.extract_default_locks(link);
                self.finish_tlv_detect(link, status);
                Ok(())
            }
            TlvType::Ndef | TlvType::LockControl => {
                self.extract_default_locks(link);
                self.continue_lock_read(link)
            }
            _ => {
                self.finish_tlv_detect(link, status);
                Ok(())
            }
        }
    }

    /// Tags without a Lock Control TLV still carry dynamic lock bits right
    /// after the data area when they are larger than 64 bytes.
    fn extract_default_locks(&mut self, link: &Link) {
        let tms = self.tms();
        if !self.locks.lock_tlvs().is_empty() || tms <= t2t::CC_TMS_STATIC as usize {
            return;
        }
        let blpb = link
            .config()
            .t2t_model(self.tag_hdr[0], None)
            .map(|m| m.default_lock_blpb)
            .unwrap_or(t2t::DEFAULT_LOCK_BLPB) as usize;
        let data_size = tms * t2t::TMS_TAG_FACTOR;
        let num_bits = (data_size - (t2t::STATIC_SIZE - t2t::HEADER_SIZE)) / blpb.max(1);
        if num_bits == 0 {
            return;
        }
        let info = crate::protocol::lock::LockTlvInfo {
            offset: data_size + t2t::HEADER_SIZE,
            num_bits,
            bytes_locked_per_bit: blpb,
        };
        log::debug!("T2T default dynamic locks: {} bits at {}", num_bits, info.offset);
        if let Err(e) = self.locks.add_lock_tlv(info) {
            log::warn!("T2T default lock bytes not tracked: {}", e);
        }
    }

    /// Read the next block holding unread lock bytes. Returns `Ok(true)`
    /// once every lock byte is known.
    fn read_locks(&mut self, link: &mut Link) -> Result<bool> {
        let tms = self.cc_byte(t2t::CC_TMS_BYTE);
        let nxp_without_locks = self.tag_hdr[0] == t2t::MANUFACTURER_NXP
            && (tms == t2t::ULTRALIGHT_C_TMS || tms == t2t::CC_TMS_STATIC);
        if self.cc_byte(t2t::CC_RWA_BYTE) != t2t::CC_RWA_RW || nxp_without_locks || self.skip_dyn_locks {
            self.locks.assume_unlocked();
            return Ok(true);
        }
        let Some(i) = self.locks.first_unread_lock_byte() else {
            return Ok(true);
        };
        let offset = self
            .locks
            .lock_byte_offset(i)
            .ok_or_else(|| Error::DataCorruption("lock byte without TLV".into()))?;
        let block = (offset / t2t::BLOCK_SIZE) as u16;
        let block = block - block % t2t::BLOCKS_PER_READ as u16;
        self.issue(link, T2tSubstate::WaitReadLocks, BlockOp::Read(block))?;
        Ok(false)
    }

    fn continue_lock_read(&mut self, link: &mut Link) -> Result<()> {
        let status = match self.read_locks(link) {
            Ok(false) => return Ok(()),
            Ok(true) if self.tlv_wanted == TlvType::LockControl && self.locks.lock_bytes().is_empty() => {
                Status::Failed
            }
            Ok(true) => Status::Ok,
            Err(e) => {
                log::warn!("T2T lock bytes unavailable: {}", e);
                Status::Failed
            }
        };
        self.finish_tlv_detect(link, status);
        Ok(())
    }

    fn finish_tlv_detect(&mut self, link: &mut Link, status: Status) {
        self.locks.invalidate();
        let event = match self.tlv_wanted {
            TlvType::Ndef => {
                let mut flags = self.base_flags(link);
                let cur_size = self.ndef_msg_len;
                if status.is_ok() {
                    flags |= NdefFlags::FORMATTED;
                }
                let mut max_size = if self.cc_byte(t2t::CC_RWA_BYTE) == t2t::CC_RWA_RW {
                    self.ndef_max_size()
                } else {
                    cur_size
                };
                if max_size < cur_size {
                    flags |= NdefFlags::READ_ONLY;
                    max_size = cur_size;
                }
                if !flags.contains(NdefFlags::READ_ONLY) {
                    flags |= NdefFlags::SOFT_LOCKABLE;
                    if status.is_ok() {
                        flags |= NdefFlags::HARD_LOCKABLE;
                    }
                }
                self.ndef_detected = status.is_ok();
                self.max_ndef_msg_len = max_size;
                log::info!(
                    "T2T NDEF detect {}: cur={} max={} flags={:?}",
                    status,
                    cur_size,
                    max_size,
                    flags
                );
                RwEvent::NdefDetect(NdefDetectData {
                    status,
                    protocol: Protocol::Type2,
                    max_size: max_size as u32,
                    cur_size: cur_size as u32,
                    flags,
                })
            }
            TlvType::Proprietary => RwEvent::TlvDetect {
                status,
                num_bytes: self.prop_msg_len as u16,
            },
            TlvType::LockControl => RwEvent::TlvDetect {
                status,
                num_bytes: self.locks.lock_bytes().len() as u16,
            },
            _ => RwEvent::TlvDetect {
                status,
                num_bytes: self.locks.mem_tlvs().iter().map(|m| m.num_bytes).sum::<usize>() as u16,
            },
        };
        self.op_complete();
        link.notify(event);
    }

    /// Largest NDEF message the tag can take: free bytes from the message
    /// start up to the first read-only byte.
    pub(super) fn ndef_max_size(&mut self) -> usize {
        let tag_size = self.tag_size();
        let nmn = self.cc_byte(t2t::CC_NMN_BYTE);
        if tag_size < t2t::STATIC_SIZE || tag_size > MAX_TAG_SIZE || (nmn != t2t::CC_NMN && nmn != 0) {
            // static area less header, TLV type and length bytes
            return t2t::STATIC_SIZE - t2t::HEADER_SIZE - 2;
        }
        let (start, field_len) = if self.ndef_msg_offset == 0 {
            (t2t::HEADER_SIZE + 2, tlv::SHORT_LEN_FIELD_LEN)
        } else {
            (self.ndef_msg_offset, self.ndef_msg_offset - self.ndef_header_offset)
        };
        let mut free = 0;
        for offset in start..tag_size {
            if self.locks.is_lock_or_reserved(offset) {
                continue;
            }
            if self.locks.is_read_only(offset) {
                break;
            }
            free += 1;
        }
        fit_length_field(free, field_len)
    }

    // ---- read -----------------------------------------------------------

    pub(super) fn start_read_ndef(&mut self, link: &mut Link) -> Result<()> {
        self.ensure_idle()?;
        if !self.ndef_detected {
            return Err(Error::failed("NDEF not detected"));
        }
        if self.ndef_msg_len == 0 {
            return Err(Error::NotInitialized);
        }
        self.ndef.read_buf.clear();
        self.ndef.read_pos = self.ndef_msg_offset;
        let block = (self.ndef_msg_offset / t2t::BLOCK_SIZE) as u16;
        let block = block - block % t2t::BLOCKS_PER_READ as u16;

        if block == t2t::FIRST_DATA_BLOCK && self.data_valid {
            self.set_state(T2tState::ReadNdef);
            let data = self.tag_data;
            if let Err(e) = self.consume_ndef(link, &data, block as usize * t2t::BLOCK_SIZE) {
                log::warn!("T2T NDEF read failed: {}", e);
                self.fail(link, super::error_status(&e));
            }
            return Ok(());
        }
        self.launch(link, T2tState::ReadNdef, T2tSubstate::WaitReadNdefBlock, BlockOp::Read(block))
    }

    /// Take message bytes out of `chunk` (tag offset `chunk_offset`) and
    /// either finish the read or ask for the next 16 bytes.
    fn consume_ndef(&mut self, link: &mut Link, chunk: &[u8], chunk_offset: usize) -> Result<()> {
        let end = chunk_offset + chunk.len();
        let mut pos = self.ndef.read_pos.max(chunk_offset);
        while pos < end && self.ndef.read_buf.len() < self.ndef_msg_len {
            if !self.locks.is_lock_or_reserved(pos) {
                self.ndef.read_buf.push(chunk[pos - chunk_offset]);
            }
            pos += 1;
        }
        self.ndef.read_pos = self.ndef.read_pos.max(pos);

        if self.ndef.read_buf.len() >= self.ndef_msg_len {
            let data = std::mem::take(&mut self.ndef.read_buf);
            log::debug!("T2T NDEF read complete: {} bytes", data.len());
            self.op_complete();
            link.notify(RwEvent::NdefRead { data });
            link.notify(RwEvent::NdefReadComplete);
            return Ok(());
        }
        if self.ndef.read_pos >= self.tag_size() {
            return Err(Error::failed("NDEF message runs past tag memory"));
        }
        let next = (end / t2t::BLOCK_SIZE) as u16;
        self.issue(link, T2tSubstate::WaitReadNdefBlock, BlockOp::Read(next))
    }

    // ---- write ----------------------------------------------------------

    /// Tag offsets of the next `count` data bytes from `start`, lock and
    /// reserved bytes skipped.
    fn data_positions(&mut self, start: usize, count: usize) -> Result<Vec<usize>> {
        let tag_size = self.tag_size();
        let mut positions = Vec::with_capacity(count);
        let mut offset = start;
        while positions.len() < count {
            if offset >= tag_size {
                return Err(Error::refused("message does not fit the tag"));
            }
            if !self.locks.is_lock_or_reserved(offset) {
                positions.push(offset);
            }
            offset += 1;
        }
        Ok(positions)
    }

    /// First writable data byte at or after `start`.
    fn next_free_byte(&mut self, start: usize) -> Option<usize> {
        (start..self.tag_size())
            .find(|&o| !self.locks.is_lock_or_reserved(o))
            .filter(|&o| !self.locks.is_read_only(o))
    }

    pub(super) fn start_write_ndef(&mut self, link: &mut Link, message: &[u8]) -> Result<()> {
        self.ensure_idle()?;
        if !self.ndef_detected {
            return Err(Error::failed("NDEF not detected"));
        }
        if self.cc_byte(t2t::CC_RWA_BYTE) != t2t::CC_RWA_RW {
            return Err(Error::refused("tag is read only"));
        }
        if message.len() > self.max_ndef_msg_len {
            return Err(Error::refused(format!(
                "message of {} bytes exceeds {}",
                message.len(),
                self.max_ndef_msg_len
            )));
        }
        if self.is_otp(link) && self.ndef_msg_len > 0 {
            return Err(Error::refused("one-time programmable tag already holds a message"));
        }

        let field_len = length_field_len(message.len());
        let positions = self.data_positions(self.ndef_header_offset, field_len + message.len())?;
        let last = positions.last().copied().unwrap_or(self.ndef_header_offset);
        let after = self.next_free_byte(last + 1);
        let new_msg_offset = positions.get(field_len).copied().or(after).unwrap_or(last + 1);
        let terminator = after.filter(|_| message.len() < self.max_ndef_msg_len);

        let (len_positions, msg_positions) = positions.split_at(field_len);
        let mut data_writes: Vec<(usize, u8)> = len_positions.iter().map(|&p| (p, 0)).collect();
        data_writes.extend(msg_positions.iter().copied().zip(message.iter().copied()));
        let mut patches: VecDeque<Patch> = group_patches(&data_writes, PatchKind::Data).into();
        if !message.is_empty() {
            let len_writes: Vec<(usize, u8)> = len_positions.iter().copied().zip(encode_length(message.len())).collect();
            patches.extend(group_patches(&len_writes, PatchKind::Length));
        }
        if let Some(offset) = terminator {
            patches.push_back(Patch {
                block: (offset / t2t::BLOCK_SIZE) as u16,
                bytes: vec![(offset % t2t::BLOCK_SIZE, tlv::TERMINATOR)],
                kind: PatchKind::Terminator,
            });
        }

        let mut blocks = BTreeMap::new();
        if self.data_valid {
            for (i, chunk) in self.tag_data.chunks_exact(t2t::BLOCK_SIZE).enumerate() {
                let mut b = [0u8; t2t::BLOCK_SIZE];
                b.copy_from_slice(chunk);
                blocks.insert(t2t::FIRST_DATA_BLOCK + i as u16, b);
            }
        }
        // blocks that must be read before anything is written
        let mut prereads = VecDeque::new();
        let first = patches.front().map(|p| (p.block, p.covers_block()));
        let last_data = patches
            .iter()
            .rev()
            .find(|p| p.kind == PatchKind::Data)
            .map(|p| (p.block, p.covers_block()));
        let term = patches
            .iter()
            .find(|p| p.kind == PatchKind::Terminator)
            .map(|p| (p.block, p.covers_block()));
        for (entry, substate) in [
            (first, T2tSubstate::WaitReadNdefFirstBlock),
            (last_data, T2tSubstate::WaitReadNdefLastBlock),
            (term, T2tSubstate::WaitReadTermTlvBlock),
        ] {
            if let Some((block, false)) = entry {
                prereads.push_back((block, substate));
            }
        }

        self.ndef.blocks = blocks;
        self.ndef.prereads = prereads;
        self.ndef.patches = patches;
        self.ndef.in_flight = None;
        self.ndef.new_msg_len = message.len();
        self.ndef.new_msg_offset = new_msg_offset;
        log::debug!(
            "T2T NDEF write: {} bytes in {} block writes",
            message.len(),
            self.ndef.patches.len()
        );

        self.set_state(T2tState::WriteNdef);
        if let Err(e) = self.write_next(link) {
            self.set_state(T2tState::Idle);
            self.set_substate(T2tSubstate::None);
            return Err(e);
        }
        Ok(())
    }

    /// Next command of the update: pending reads first, then the patches
    /// in order. A patch that leaves part of an unknown block untouched
    /// reads that block before writing it.
    fn write_next(&mut self, link: &mut Link) -> Result<()> {
        while let Some((block, substate)) = self.ndef.prereads.pop_front() {
            if !self.ndef.blocks.contains_key(&block) {
                return self.issue(link, substate, BlockOp::Read(block));
            }
        }
        let Some(patch) = self.ndef.patches.front().cloned() else {
            return self.finish_write_ndef(link);
        };
        let base = match self.ndef.blocks.get(&patch.block) {
            Some(b) => *b,
            None if patch.covers_block() => [0; t2t::BLOCK_SIZE],
            None => {
                return self.issue(link, T2tSubstate::WaitReadNdefNextBlock, BlockOp::Read(patch.block));
            }
        };
        let substate = match patch.kind {
            PatchKind::Data => T2tSubstate::WaitWriteNdefNextBlock,
            PatchKind::Length => T2tSubstate::WaitWriteNdefLenBlock,
            PatchKind::Terminator => T2tSubstate::WaitWriteTermTlv,
        };
        self.write_block(link, substate, patch.block, patch.apply(base))
    }

    /// Remember the four blocks returned by a READ (same sector only).
    fn store_read_blocks(&mut self, data: &[u8]) {
        let first = self.block_read;
        for (i, chunk) in data.chunks_exact(t2t::BLOCK_SIZE).enumerate() {
            let block = first + i as u16;
            if block / t2t::BLOCKS_PER_SECTOR != first / t2t::BLOCKS_PER_SECTOR {
                break;
            }
            let mut b = [0u8; t2t::BLOCK_SIZE];
            b.copy_from_slice(chunk);
            self.ndef.blocks.insert(block, b);
        }
    }

    fn handle_write_ndef_response(&mut self, link: &mut Link, data: &[u8]) -> Result<()> {
        match self.substate {
            T2tSubstate::WaitReadNdefFirstBlock
            | T2tSubstate::WaitReadNdefLastBlock
            | T2tSubstate::WaitReadTermTlvBlock
            | T2tSubstate::WaitReadNdefNextBlock => {
                self.store_read_blocks(&data[..t2t::READ_DATA_LEN]);
            }
            T2tSubstate::WaitWriteNdefNextBlock
            | T2tSubstate::WaitWriteNdefLenBlock
            | T2tSubstate::WaitWriteTermTlv => {
                if let Some((block, written)) = self.ndef.in_flight.take() {
                    self.ndef.blocks.insert(block, written);
                }
                self.ndef.patches.pop_front();
            }
            other => return Err(Error::failed(format!("write response in substate {}", other))),
        }
        self.write_next(link)
    }

    fn finish_write_ndef(&mut self, link: &mut Link) -> Result<()> {
        self.ndef_msg_len = self.ndef.new_msg_len;
        self.ndef_msg_offset = self.ndef.new_msg_offset;
        self.ndef.blocks.clear();
        log::info!("T2T NDEF updated: {} bytes", self.ndef_msg_len);
        self.op_complete();
        link.notify(RwEvent::NdefUpdateComplete);
        Ok(())
    }

    // ---- format ---------------------------------------------------------

    pub(super) fn start_format(&mut self, link: &mut Link) -> Result<()> {
        self.ensure_idle()?;
        self.ndef.version_info = None;
        if !self.hdr_valid {
            return self.launch(link, T2tState::FormatTag, T2tSubstate::WaitReadCc, BlockOp::Read(0));
        }
        if let Err(e) = self.format_tag(link) {
            self.hdr_valid = false;
            self.set_substate(T2tSubstate::None);
            return Err(e);
        }
        self.set_state(T2tState::FormatTag);
        Ok(())
    }

    /// Pick the CC size for the tag and start writing it. Blank tags of
    /// multi-version models identify themselves through a version block.
    fn format_tag(&mut self, link: &mut Link) -> Result<()> {
        let mid = self.tag_hdr[0];
        let model = link
            .config()
            .t2t_model(mid, None)
            .cloned()
            .ok_or_else(|| Error::rejected(format!("unknown T2T manufacturer {:#04x}", mid)))?;
        let tms = self.cc_byte(t2t::CC_TMS_BYTE);
        let blank = tms == 0;
        if !blank {
            if model.otp && self.ndef_msg_len > 0 {
                return Err(Error::refused("one-time programmable tag already holds a message"));
            }
            let nmn = self.cc_byte(t2t::CC_NMN_BYTE);
            let vno = self.cc_byte(t2t::CC_VNO_BYTE);
            if (nmn != 0 && nmn != t2t::CC_NMN)
                || (vno != 0 && !matches!(vno, t2t::CC_VNO | t2t::CC_LEGACY_VNO | t2t::CC_NEW_VNO))
            {
                return Err(Error::failed("capability container is corrupt"));
            }
            return self.set_cc(link, tms);
        }
        if !model.multi_version {
            return self.set_cc(link, model.tms);
        }
        if model.version_block != 0 {
            return self.issue(link, T2tSubstate::WaitReadVersionInfo, BlockOp::Read(model.version_block));
        }
        let hdr = self.tag_hdr;
        self.apply_version_info(link, &hdr)
    }

    fn apply_version_info(&mut self, link: &mut Link, data: &[u8]) -> Result<()> {
        let mut info = [0u8; t2t::READ_DATA_LEN];
        info.copy_from_slice(&data[..t2t::READ_DATA_LEN]);
        let version = u16::from_be_bytes([info[0], info[1]]);
        let model = link
            .config()
            .t2t_model(self.tag_hdr[0], Some(version))
            .cloned()
            .ok_or_else(|| Error::rejected(format!("unknown T2T version {:#06x}", version)))?;
        let tms = if model.calc_cc {
            let chunk = u16::from_be_bytes([info[2], info[3]]) as usize;
            let chunks = u16::from_be_bytes([info[4], info[5]]) as usize;
            ((chunk * chunks + 48) / t2t::TMS_TAG_FACTOR).min(u8::MAX as usize) as u8
        } else {
            model.tms
        };
        log::debug!("T2T version {:#06x}: tms={:#04x}", version, tms);
        self.ndef.version_info = Some(info);
        self.set_cc(link, tms)
    }

    fn set_cc(&mut self, link: &mut Link, tms: u8) -> Result<()> {
        log::info!("T2T formatting, tms={:#04x}", tms);
        let cc = [t2t::CC_NMN, t2t::CC_VNO, tms, t2t::CC_RWA_RW];
        self.write_block(link, T2tSubstate::WaitSetCc, t2t::CC_BLOCK, cc)
    }

    /// Lock Control TLV value for blank multi-version tags whose version
    /// block describes the dynamic lock area.
    fn format_lock_tlv(&self, link: &Link) -> Option<[u8; 3]> {
        let info = self.ndef.version_info?;
        let version = u16::from_be_bytes([info[0], info[1]]);
        if version == 0 {
            return None;
        }
        let model = link.config().t2t_model(self.tag_hdr[0], Some(version))?;
        if !model.multi_version || !model.calc_cc {
            return None;
        }
        let chunk = u16::from_be_bytes([info[2], info[3]]) as usize;
        let chunks = u16::from_be_bytes([info[4], info[5]]) as usize;
        let addr = u16::try_from(chunk * chunks + t2t::STATIC_SIZE).ok()?;
        let locked_area = chunk * info[6] as usize;
        if locked_area == 0 {
            return None;
        }
        let bytes_per_bit = 1u16 << locked_area.ilog2().min(15);
        encode_control_tlv(addr, info[7], bytes_per_bit)
    }

    fn null_ndef_terminator(&self, link: &Link) -> u8 {
        if self.is_otp(link) {
            0x00
        } else {
            tlv::TERMINATOR
        }
    }

    fn handle_format_response(&mut self, link: &mut Link, data: &[u8]) -> Result<()> {
        match self.substate {
            T2tSubstate::WaitReadCc => {
                self.store_header(data);
                self.format_tag(link)
            }
            T2tSubstate::WaitReadVersionInfo => self.apply_version_info(link, data),
            T2tSubstate::WaitSetCc => {
                if let Some((_, cc)) = self.ndef.in_flight.take() {
                    self.tag_hdr[t2t::CC_NMN_BYTE..].copy_from_slice(&cc);
                }
                let term = self.null_ndef_terminator(link);
                match self.format_lock_tlv(link) {
                    Some(value) => {
                        self.ndef.lock_tlv_tail = value[2];
                        let block = [tlv::LOCK_CTRL, tlv::CONTROL_TLV_LEN as u8, value[0], value[1]];
                        self.write_block(link, T2tSubstate::WaitSetLockTlv, t2t::FIRST_DATA_BLOCK, block)
                    }
                    None => {
                        let block = [tlv::NDEF, 0x00, term, 0x00];
                        self.write_block(link, T2tSubstate::WaitSetNullNdef, t2t::FIRST_DATA_BLOCK, block)
                    }
                }
            }
            T2tSubstate::WaitSetLockTlv => {
                let term = self.null_ndef_terminator(link);
                let block = [self.ndef.lock_tlv_tail, tlv::NDEF, 0x00, term];
                self.write_block(link, T2tSubstate::WaitSetNullNdef, t2t::FIRST_DATA_BLOCK + 1, block)
            }
            T2tSubstate::WaitSetNullNdef => {
                self.ndef.in_flight = None;
                self.ndef_detected = false;
                self.data_valid = false;
                log::info!("T2T format complete");
                self.op_complete();
                link.notify(RwEvent::FormatComplete { status: Status::Ok });
                Ok(())
            }
            other => Err(Error::failed(format!("format response in substate {}", other))),
        }
    }

    // ---- read-only ------------------------------------------------------

    pub(super) fn start_set_read_only(&mut self, link: &mut Link, hard_lock: bool) -> Result<()> {
        self.ensure_idle()?;
        self.ndef.hard_lock = hard_lock;
        if !self.hdr_valid {
            return self.launch(link, T2tState::SetTagRo, T2tSubstate::WaitReadCc, BlockOp::Read(0));
        }
        if let Err(e) = self.soft_lock(link) {
            self.set_substate(T2tSubstate::None);
            return Err(e);
        }
        self.set_state(T2tState::SetTagRo);
        log::info!("T2T set read only (hard={})", hard_lock);
        Ok(())
    }

    fn soft_lock(&mut self, link: &mut Link) -> Result<()> {
        if self.cc_byte(t2t::CC_RWA_BYTE) == t2t::CC_RWA_RO {
            return Err(Error::refused("tag is already read only"));
        }
        if self.ndef.hard_lock
            && self.cc_byte(t2t::CC_TMS_BYTE) != t2t::CC_TMS_STATIC
            && self.locks.lock_bytes().is_empty()
        {
            return Err(Error::failed("dynamic lock bytes unknown"));
        }
        for i in 0..self.locks.lock_bytes().len() {
            if let Some(lb) = self.locks.lock_byte_mut(i) {
                if lb.status != LockStatus::Updated {
                    lb.status = LockStatus::NotUpdated;
                }
            }
        }
        let mut cc = [0u8; t2t::BLOCK_SIZE];
        cc.copy_from_slice(&self.tag_hdr[t2t::CC_NMN_BYTE..]);
        cc[3] = t2t::CC_RWA_RO;
        self.write_block(link, T2tSubstate::WaitSetCcRo, t2t::CC_BLOCK, cc)
    }

    /// Set the lock bits of the next block holding dynamic lock bytes,
    /// then the static lock bytes once every dynamic one is done.
    fn set_dynamic_lock_bits(&mut self, link: &mut Link) -> Result<()> {
        for i in 0..self.locks.lock_bytes().len() {
            let mask = self.locks.lock_byte_mask(i);
            if let Some(lb) = self.locks.lock_byte_mut(i) {
                if lb.status == LockStatus::UpdateInitiated {
                    lb.status = LockStatus::Updated;
                    lb.value |= mask;
                }
            }
        }
        let next = self
            .locks
            .lock_bytes()
            .iter()
            .position(|lb| lb.status == LockStatus::NotUpdated);
        let Some(first) = next else {
            let hdr = &self.tag_hdr;
            let block = [
                hdr[t2t::INTERNAL_BYTES_OFFSET],
                hdr[t2t::INTERNAL_BYTES_OFFSET + 1],
                0xFF,
                0xFF,
            ];
            return self.write_block(link, T2tSubstate::WaitSetStLockBits, t2t::STATIC_LOCK_BLOCK, block);
        };
        let offset = self
            .locks
            .lock_byte_offset(first)
            .ok_or_else(|| Error::DataCorruption("lock byte without TLV".into()))?;
        let block = (offset / t2t::BLOCK_SIZE) as u16;
        self.issue(link, T2tSubstate::WaitReadDynLockByteBlock, BlockOp::Read(block))
    }

    /// OR the lock bits of every pending lock byte in the block just read.
    fn write_dynamic_lock_block(&mut self, link: &mut Link, data: &[u8]) -> Result<()> {
        let block = self.block_read;
        let mut content = [0u8; t2t::BLOCK_SIZE];
        content.copy_from_slice(&data[..t2t::BLOCK_SIZE]);
        for i in 0..self.locks.lock_bytes().len() {
            let Some(offset) = self.locks.lock_byte_offset(i) else {
                continue;
            };
            if offset / t2t::BLOCK_SIZE != block as usize {
                continue;
            }
            let mask = self.locks.lock_byte_mask(i);
            if let Some(lb) = self.locks.lock_byte_mut(i) {
                if lb.status == LockStatus::NotUpdated {
                    content[offset % t2t::BLOCK_SIZE] |= mask;
                    lb.status = LockStatus::UpdateInitiated;
                }
            }
        }
        self.write_block(link, T2tSubstate::WaitSetDynLockBits, block, content)
    }

    fn finish_set_read_only(&mut self, link: &mut Link) -> Result<()> {
        self.locks.invalidate();
        log::info!("T2T tag is read only");
        self.op_complete();
        link.notify(RwEvent::SetTagReadOnly { status: Status::Ok });
        Ok(())
    }

    fn handle_set_ro_response(&mut self, link: &mut Link, data: &[u8]) -> Result<()> {
        match self.substate {
            T2tSubstate::WaitReadCc => {
                self.store_header(data);
                self.soft_lock(link)
            }
            T2tSubstate::WaitSetCcRo => {
                self.ndef.in_flight = None;
                self.tag_hdr[t2t::CC_RWA_BYTE] = t2t::CC_RWA_RO;
                if self.ndef.hard_lock {
                    self.set_dynamic_lock_bits(link)
                } else {
                    self.finish_set_read_only(link)
                }
            }
            T2tSubstate::WaitReadDynLockByteBlock => self.write_dynamic_lock_block(link, data),
            T2tSubstate::WaitSetDynLockBits => {
                self.ndef.in_flight = None;
                self.set_dynamic_lock_bits(link)
            }
            T2tSubstate::WaitSetStLockBits => {
                self.ndef.in_flight = None;
                self.tag_hdr[t2t::LOCK_0_OFFSET] = 0xFF;
                self.tag_hdr[t2t::LOCK_0_OFFSET + 1] = 0xFF;
                self.apply_static_attributes();
                self.finish_set_read_only(link)
            }
            other => Err(Error::failed(format!("set read only response in substate {}", other))),
        }
    }

    // ---- dispatch -------------------------------------------------------

    pub(super) fn handle_ndef_response(&mut self, link: &mut Link, data: &[u8]) -> Result<()> {
        match self.state {
            T2tState::TlvDetect => match self.substate {
                T2tSubstate::WaitReadCc => {
                    self.store_header(data);
                    self.process_cc(link)
                }
                T2tSubstate::WaitTlvDetect => self.process_tlv_chunk(link, data),
                T2tSubstate::WaitReadLocks => {
                    let offset = self.block_read as usize * t2t::BLOCK_SIZE;
                    if self.locks.fill_lock_bytes(&data[..t2t::READ_DATA_LEN], offset) == 0 {
                        return Err(Error::DataCorruption(format!("no lock byte at block {}", self.block_read)));
                    }
                    self.continue_lock_read(link)
                }
                other => Err(Error::failed(format!("detect response in substate {}", other))),
            },
            T2tState::ReadNdef => {
                let offset = self.block_read as usize * t2t::BLOCK_SIZE;
                self.consume_ndef(link, &data[..t2t::READ_DATA_LEN], offset)
            }
            T2tState::WriteNdef => self.handle_write_ndef_response(link, data),
            T2tState::FormatTag => self.handle_format_response(link, data),
            T2tState::SetTagRo => self.handle_set_ro_response(link, data),
            other => {
                log::warn!("T2T response ignored in {}", other);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RwConfig;
    use crate::tags::TagEngine;
    use crate::test_support::{drive, SimT2t};
    use crate::transport::MockTransport;

    const NTAG_TMS: u8 = 0x6D;

    fn setup() -> (T2tEngine, Link, MockTransport) {
        let mock = MockTransport::new();
        let link = Link::new(Box::new(mock.clone()), RwConfig::default());
        (T2tEngine::new(), link, mock)
    }

    fn message(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 5 + 1) as u8).collect()
    }

    fn detect(eng: &mut T2tEngine, link: &mut Link, mock: &MockTransport, tag: &mut SimT2t) -> NdefDetectData {
        eng.detect_ndef(link).unwrap();
        match drive(eng, link, mock, tag).as_slice() {
            [RwEvent::NdefDetect(d)] => *d,
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn detect_short_ndef_on_static_tag() {
        let mut tag = SimT2t::formatted(t2t::MANUFACTURER_NXP, t2t::CC_TMS_STATIC, &[0xD1, 0x01]);
        let (mut eng, mut link, mock) = setup();
        let d = detect(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(d.status, Status::Ok);
        assert_eq!(d.protocol, Protocol::Type2);
        assert_eq!(d.cur_size, 2);
        assert_eq!(d.max_size, 46);
        assert!(d.flags.contains(NdefFlags::SUPPORTED | NdefFlags::FORMATTED | NdefFlags::FORMATABLE));
        assert!(!d.flags.contains(NdefFlags::READ_ONLY));
        // CC then the first data blocks
        assert_eq!(tag.log, vec![vec![0x30, 0x00], vec![0x30, 0x04]]);
    }

    #[test]
    fn read_after_detect_uses_cached_blocks() {
        let mut tag = SimT2t::formatted(t2t::MANUFACTURER_NXP, t2t::CC_TMS_STATIC, &[0xD1, 0x01]);
        let (mut eng, mut link, mock) = setup();
        detect(&mut eng, &mut link, &mock, &mut tag);
        tag.log.clear();
        eng.read_ndef(&mut link).unwrap();
        assert_eq!(
            link.drain_events(),
            vec![RwEvent::NdefRead { data: vec![0xD1, 0x01] }, RwEvent::NdefReadComplete]
        );
        assert!(tag.log.is_empty());
        assert!(eng.is_idle());
    }

    #[test]
    fn detect_reads_default_dynamic_lock_bytes() {
        let mut tag = SimT2t::formatted(t2t::MANUFACTURER_NXP, NTAG_TMS, &message(20));
        let (mut eng, mut link, mock) = setup();
        let d = detect(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(d.status, Status::Ok);
        assert_eq!(d.cur_size, 20);
        // 870 free bytes less two for the longer length field
        assert_eq!(d.max_size, 868);
        assert!(d.flags.contains(NdefFlags::HARD_LOCKABLE));
        assert_eq!(eng.lock_tracker().lock_bytes().len(), 13);
        assert!(eng.lock_tracker().all_lock_bytes_read());
        assert_eq!(tag.log.last().unwrap(), &vec![0x30, 224]);
    }

    #[test]
    fn skip_dyn_locks_reads_no_lock_blocks() {
        let mut tag = SimT2t::formatted(t2t::MANUFACTURER_NXP, NTAG_TMS, &message(20));
        let (mut eng, mut link, mock) = setup();
        eng.detect_ndef_ext(&mut link, true).unwrap();
        drive(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(tag.log.len(), 2);
    }

    #[test]
    fn write_zeroes_length_first_and_appends_terminator() {
        let mut tag = SimT2t::formatted(t2t::MANUFACTURER_NXP, t2t::CC_TMS_STATIC, &[0xD1, 0x01]);
        let (mut eng, mut link, mock) = setup();
        detect(&mut eng, &mut link, &mock, &mut tag);
        tag.log.clear();

        let msg = message(10);
        eng.write_ndef(&mut link, &msg).unwrap();
        let events = drive(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(events, vec![RwEvent::NdefUpdateComplete]);
        // blocks 4..7 came from the detection cache: no reads
        assert_eq!(tag.log.len(), 5);
        assert_eq!(tag.log[0], vec![0xA2, 0x04, 0x03, 0x00, msg[0], msg[1]]);
        assert_eq!(tag.log[3], vec![0xA2, 0x04, 0x03, 0x0A, msg[0], msg[1]]);
        assert_eq!(&tag.log[4][..3], &[0xA2, 0x07, tlv::TERMINATOR]);
        assert_eq!(&tag.mem[16..30], &[&[0x03, 0x0A][..], &msg[..], &[0xFE, 0x00][..]].concat()[..]);
    }

    #[test]
    fn deactivation_drops_the_pending_write() {
        let mut tag = SimT2t::formatted(t2t::MANUFACTURER_NXP, NTAG_TMS, &message(20));
        let (mut eng, mut link, mock) = setup();
        detect(&mut eng, &mut link, &mock, &mut tag);
        eng.write_ndef(&mut link, &message(300)).unwrap();
        assert!(!eng.ndef.patches.is_empty());
        assert!(!eng.ndef.blocks.is_empty());

        eng.on_deactivate(&mut link);
        assert!(eng.ndef.patches.is_empty());
        assert!(eng.ndef.blocks.is_empty());
        assert!(eng.ndef.prereads.is_empty());
        assert!(eng.ndef.in_flight.is_none());
        assert_eq!(eng.ndef.new_msg_len, 0);
        mock.take_sent();
        eng.on_response(&mut link, &[0x0A]);
        assert!(!link.has_events());
        assert_eq!(mock.sent_count(), 0);
    }

    #[test]
    fn second_write_reads_first_block() {
        let mut tag = SimT2t::formatted(t2t::MANUFACTURER_NXP, t2t::CC_TMS_STATIC, &[0xD1, 0x01]);
        let (mut eng, mut link, mock) = setup();
        detect(&mut eng, &mut link, &mock, &mut tag);
        eng.write_ndef(&mut link, &message(3)).unwrap();
        drive(&mut eng, &mut link, &mock, &mut tag);
        tag.log.clear();

        eng.write_ndef(&mut link, &message(6)).unwrap();
        drive(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(tag.log[0], vec![0x30, 0x04]);
        assert!(tag.log[1..].iter().all(|f| f[0] == 0xA2));
    }

    #[test]
    fn write_then_read_back_with_long_length_field() {
        let mut tag = SimT2t::formatted(t2t::MANUFACTURER_NXP, NTAG_TMS, &message(20));
        let (mut eng, mut link, mock) = setup();
        detect(&mut eng, &mut link, &mock, &mut tag);

        let msg = message(300);
        eng.write_ndef(&mut link, &msg).unwrap();
        assert_eq!(drive(&mut eng, &mut link, &mock, &mut tag), vec![RwEvent::NdefUpdateComplete]);
        assert_eq!(&tag.mem[16..20], &[0x03, 0xFF, 0x01, 0x2C]);
        assert_eq!(eng.ndef_sizes().cur_size, 300);

        eng.read_ndef(&mut link).unwrap();
        let events = drive(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(events, vec![RwEvent::NdefRead { data: msg.clone() }, RwEvent::NdefReadComplete]);

        let d = detect(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(d.cur_size, 300);
    }

    #[test]
    fn oversized_write_is_refused() {
        let mut tag = SimT2t::formatted(t2t::MANUFACTURER_NXP, t2t::CC_TMS_STATIC, &[0xD1, 0x01]);
        let (mut eng, mut link, mock) = setup();
        detect(&mut eng, &mut link, &mock, &mut tag);
        assert!(matches!(eng.write_ndef(&mut link, &message(47)), Err(Error::Refused(_))));
        assert!(eng.is_idle());
    }

    #[test]
    fn write_without_detection_fails() {
        let (mut eng, mut link, _mock) = setup();
        assert!(matches!(eng.write_ndef(&mut link, &[1]), Err(Error::Failed(_))));
        assert!(matches!(eng.read_ndef(&mut link), Err(Error::Failed(_))));
    }

    #[test]
    fn blank_ultralight_formats_then_detects_empty() {
        let mut tag = SimT2t::blank_ultralight();
        let (mut eng, mut link, mock) = setup();
        let d = detect(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(d.status, Status::Failed);
        assert!(d.flags.contains(NdefFlags::FORMATABLE));

        eng.format_ndef(&mut link).unwrap();
        let events = drive(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(events, vec![RwEvent::FormatComplete { status: Status::Ok }]);
        assert_eq!(&tag.mem[12..16], &[0xE1, 0x10, 0x06, 0x00]);
        assert_eq!(&tag.mem[16..20], &[0x03, 0x00, 0xFE, 0x00]);

        let d = detect(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(d.status, Status::Ok);
        assert_eq!(d.cur_size, 0);
        assert_eq!(eng.read_ndef(&mut link), Err(Error::NotInitialized));
    }

    #[test]
    fn format_from_version_block_writes_lock_tlv() {
        let mut tag = SimT2t::blank(t2t::MANUFACTURER_NXP, 256);
        // version 0x0200, 10 chunks of 16 bytes, one chunk per lock bit, 16 lock bits
        tag.mem[16..24].copy_from_slice(&[0x02, 0x00, 0x00, 0x10, 0x00, 0x0A, 0x01, 0x10]);
        let (mut eng, mut link, mock) = setup();
        eng.format_ndef(&mut link).unwrap();
        let events = drive(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(events, vec![RwEvent::FormatComplete { status: Status::Ok }]);
        assert_eq!(&tag.mem[12..16], &[0xE1, 0x10, 0x1A, 0x00]);
        assert_eq!(&tag.mem[16..24], &[0x01, 0x03, 0xE0, 0x10, 0x44, 0x03, 0x00, 0xFE]);
    }

    #[test]
    fn format_unknown_manufacturer_is_rejected() {
        let mut tag = SimT2t::blank(0x99, 64);
        let (mut eng, mut link, mock) = setup();
        eng.format_ndef(&mut link).unwrap();
        let events = drive(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(events, vec![RwEvent::FormatComplete { status: Status::Rejected }]);
    }

    #[test]
    fn hard_lock_sets_dynamic_then_static_lock_bits() {
        let mut tag = SimT2t::formatted(t2t::MANUFACTURER_NXP, NTAG_TMS, &message(8));
        let (mut eng, mut link, mock) = setup();
        detect(&mut eng, &mut link, &mock, &mut tag);
        tag.log.clear();

        eng.set_tag_read_only(&mut link, true).unwrap();
        let events = drive(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(events, vec![RwEvent::SetTagReadOnly { status: Status::Ok }]);
        assert_eq!(tag.mem[t2t::CC_RWA_BYTE], t2t::CC_RWA_RO);
        assert_eq!(&tag.mem[888..900], &[0xFF; 12]);
        // 103 lock bits: the last byte carries 7
        assert_eq!(tag.mem[900], 0x7F);
        assert_eq!(&tag.mem[10..12], &[0xFF, 0xFF]);
        // static lock bytes go last
        assert_eq!(&tag.log.last().unwrap()[..2], &[0xA2, 0x02]);
        assert!(matches!(eng.write_ndef(&mut link, &[1]), Err(Error::Refused(_))));
    }

    #[test]
    fn soft_lock_twice_is_refused() {
        let mut tag = SimT2t::formatted(t2t::MANUFACTURER_NXP, t2t::CC_TMS_STATIC, &[0xD1, 0x01]);
        let (mut eng, mut link, mock) = setup();
        eng.set_tag_read_only(&mut link, false).unwrap();
        let events = drive(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(events, vec![RwEvent::SetTagReadOnly { status: Status::Ok }]);
        assert_eq!(tag.log.len(), 2);
        assert!(matches!(eng.set_tag_read_only(&mut link, false), Err(Error::Refused(_))));
    }

    #[test]
    fn otp_tag_with_message_is_read_only() {
        let mut tag = SimT2t::formatted(t2t::MANUFACTURER_KOVIO, 0x1D, &message(4));
        let (mut eng, mut link, mock) = setup();
        let d = detect(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(d.status, Status::Ok);
        assert!(d.flags.contains(NdefFlags::OTP | NdefFlags::READ_ONLY));
        assert!(!d.flags.contains(NdefFlags::SOFT_LOCKABLE));
        assert!(matches!(eng.write_ndef(&mut link, &[1]), Err(Error::Refused(_))));
    }

    #[test]
    fn lock_and_proprietary_tlv_searches() {
        let mut tag = SimT2t::formatted(t2t::MANUFACTURER_NXP, NTAG_TMS, &message(4));
        let (mut eng, mut link, mock) = setup();
        eng.locate_tlv(&mut link, TlvType::LockControl).unwrap();
        assert_eq!(
            drive(&mut eng, &mut link, &mock, &mut tag),
            vec![RwEvent::TlvDetect {
                status: Status::Ok,
                num_bytes: 13
            }]
        );

        let mut tag = SimT2t::formatted(t2t::MANUFACTURER_NXP, t2t::CC_TMS_STATIC, &[]);
        tag.mem[16..27].copy_from_slice(&[0xFD, 0x03, 0xAA, 0xBB, 0xCC, 0x03, 0x02, 0xD1, 0x01, 0xFE, 0x00]);
        let (mut eng, mut link, mock) = setup();
        eng.locate_tlv(&mut link, TlvType::Proprietary).unwrap();
        assert_eq!(
            drive(&mut eng, &mut link, &mock, &mut tag),
            vec![RwEvent::TlvDetect {
                status: Status::Ok,
                num_bytes: 3
            }]
        );
        // static tags have no lock TLV once the CC is known
        assert!(matches!(eng.locate_tlv(&mut link, TlvType::LockControl), Err(Error::Refused(_))));
    }

    #[test]
    fn detect_timeout_reports_unknown() {
        let mut tag = SimT2t::formatted(t2t::MANUFACTURER_NXP, t2t::CC_TMS_STATIC, &[0xD1, 0x01]);
        tag.mute = true;
        let (mut eng, mut link, mock) = setup();
        let d = detect(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(d.status, Status::Timeout);
        assert_eq!(d.flags, NdefFlags::UNKNOWN);
        assert_eq!(tag.log.len(), 4);
    }
}
