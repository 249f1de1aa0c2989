// nfc-rw-rs/nfc-rw/src/tags/t1t_ndef.rs
//! Type 1 NDEF flows: TLV detection, read, write, format and read-only.

use std::collections::VecDeque;

use crate::constants::{t1t, tlv};
use crate::events::{NdefDetectData, NdefFlags, RwEvent, Status};
use crate::protocol::commands::T1tCommand;
use crate::protocol::lock::{static_lock_bitmap, LockStatus, SegmentBitmap};
use crate::protocol::retry::Link;
use crate::protocol::tlv::{decode_control_tlv, encode_length, fit_length_field, TlvCursor, TlvScan, TlvType};
use crate::tags::t1t::{T1tAttribute, T1tEngine, T1tState, T1tSubstate};
use crate::types::Protocol;
use crate::{Error, Result};

/// Largest tag memory a valid CC may announce.
const MAX_TAG_SIZE: usize = 2048;

/// One write command of an NDEF update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WriteStep {
    Byte { block: u8, byte: u8, value: u8 },
    Block { block: u8, data: [u8; 8] },
}

/// Progress of the NDEF operation in flight.
#[derive(Debug, Default)]
pub(crate) struct T1tNdefOp {
    read_buf: Vec<u8>,
    /// Next tag offset to collect message bytes from
    read_pos: usize,
    /// `(tag offset, value)` of every length field and message byte
    writes: Vec<(usize, u8)>,
    new_msg_len: usize,
    new_msg_offset: usize,
    final_block: usize,
    final_block_data: [u8; t1t::BLOCK_SIZE],
    steps: VecDeque<WriteStep>,
    hard_lock: bool,
    format_blocks: [[u8; t1t::BLOCK_SIZE]; 2],
    format_dynamic: bool,
    format_byte: usize,
}

impl T1tEngine {
    /// Bytes of tag memory announced by the CC.
    pub(super) fn tag_size(&self) -> usize {
        (self.mem[t1t::CC_TMS_BYTE] as usize + 1) * t1t::BLOCK_SIZE
    }

    /// Valid bytes of the segment 0 image.
    fn image_len(&self) -> usize {
        if self.is_dynamic_memory() {
            t1t::SEGMENT_SIZE
        } else {
            t1t::STATIC_SIZE
        }
    }

    fn segment0_read(&self) -> T1tCommand {
        if self.is_dynamic_memory() {
            T1tCommand::ReadSegment { segment: 0 }
        } else {
            T1tCommand::ReadAll
        }
    }

    /// Mirror a completed write into the segment 0 image.
    pub(super) fn apply_to_image(&mut self, op: &T1tCommand) {
        let in_image = |block: u8| (block as usize) < t1t::BLOCKS_PER_SEGMENT;
        match *op {
            T1tCommand::WriteErase { block, byte, value } if in_image(block) => {
                self.mem[block as usize * t1t::BLOCK_SIZE + byte as usize] = value;
            }
            T1tCommand::WriteNoErase { block, byte, value } if in_image(block) => {
                self.mem[block as usize * t1t::BLOCK_SIZE + byte as usize] |= value;
            }
            T1tCommand::WriteErase8 { block, data } if in_image(block) => {
                let start = block as usize * t1t::BLOCK_SIZE;
                self.mem[start..start + t1t::BLOCK_SIZE].copy_from_slice(&data);
            }
            T1tCommand::WriteNoErase8 { block, data } if in_image(block) => {
                let start = block as usize * t1t::BLOCK_SIZE;
                for (dst, src) in self.mem[start..start + t1t::BLOCK_SIZE].iter_mut().zip(data) {
                    *dst |= src;
                }
            }
            _ => {}
        }
    }

    /// Copy segment 0 out of a RALL / RSEG 0 response and derive the static
    /// reserved and read-only areas from it.
    fn store_segment0(&mut self, op: &T1tCommand, data: &[u8]) -> bool {
        match op {
            T1tCommand::ReadAll => {
                self.mem[..t1t::STATIC_SIZE]
                    .copy_from_slice(&data[t1t::HR_LEN..t1t::HR_LEN + t1t::STATIC_SIZE]);
                self.mem[t1t::STATIC_SIZE..].fill(0);
            }
            T1tCommand::ReadSegment { segment: 0 } => {
                self.mem
                    .copy_from_slice(&data[t1t::ADD_LEN..t1t::ADD_LEN + t1t::SEGMENT_SIZE]);
            }
            _ => return false,
        }
        self.segment0_cached = true;

        let mut reserved = SegmentBitmap::new();
        for block in [t1t::UID_BLOCK, t1t::RES_BLOCK, t1t::LOCK_BLOCK, t1t::STATIC_BLOCKS] {
            let start = block as usize * t1t::BLOCK_SIZE;
            reserved.set_range(start..start + t1t::BLOCK_SIZE);
        }
        self.locks.set_static_reserved(reserved);
        self.locks.set_static_read_only(static_lock_bitmap(
            self.mem[t1t::LOCK_0_OFFSET],
            self.mem[t1t::LOCK_0_OFFSET + 1],
            t1t::BLOCK_SIZE,
            &[t1t::UID_BLOCK as usize, t1t::RES_BLOCK as usize],
        ));
        true
    }

    fn cc_is_valid(&self) -> bool {
        let nmn = self.mem[t1t::CC_NMN_BYTE];
        let vno = self.mem[t1t::CC_VNO_BYTE];
        let rwa = self.mem[t1t::CC_RWA_BYTE];
        (nmn == t1t::CC_NMN || nmn == 0)
            && (vno == t1t::CC_VNO || vno == t1t::CC_LEGACY_VNO)
            && (rwa == t1t::CC_RWA_RW || rwa == t1t::CC_RWA_RO)
    }

    fn base_flags(&self, link: &Link) -> NdefFlags {
        let mut flags = NdefFlags::NONE;
        if self.ndef_supported() {
            flags |= NdefFlags::SUPPORTED;
        }
        if link.config().t1t_model(self.hr.hr0()).is_some() {
            flags |= NdefFlags::FORMATABLE;
        }
        if self.mem[t1t::CC_RWA_BYTE] & 0x0F == t1t::CC_RWA_RO {
            flags |= NdefFlags::READ_ONLY;
        }
        flags
    }

    // ---- TLV detection --------------------------------------------------

    /// Start a search for the NDEF, Lock Control or Memory Control TLV.
    pub fn locate_tlv(&mut self, link: &mut Link, wanted: TlvType) -> Result<()> {
        self.ensure_idle()?;
        if !matches!(wanted, TlvType::Ndef | TlvType::LockControl | TlvType::MemoryControl) {
            return Err(Error::InvalidParameter(format!("cannot search for {} TLV", wanted)));
        }
        if wanted == TlvType::Ndef && !self.ndef_supported() {
            return Err(Error::refused(format!(
                "HR0 {:#04x} does not announce NDEF",
                self.hr.hr0()
            )));
        }
        let op = self.segment0_read();
        self.start(link, op, T1tState::TlvDetect)?;
        self.set_substate(T1tSubstate::WaitReadTagMemory);
        self.tlv_wanted = wanted;
        self.locks.reset();
        if wanted == TlvType::Ndef {
            self.attribute = T1tAttribute::Unknown;
            self.ndef_header_offset = 0;
            self.ndef_msg_offset = 0;
            self.ndef_msg_len = 0;
            self.max_ndef_msg_len = 0;
        }
        Ok(())
    }

    /// True once the wanted control TLV was seen at least once.
    fn have_wanted_control(&self) -> bool {
        match self.tlv_wanted {
            TlvType::LockControl => !self.locks.lock_tlvs().is_empty(),
            TlvType::MemoryControl => !self.locks.mem_tlvs().is_empty(),
            _ => false,
        }
    }

    /// Walk the TLV area of segment 0 and register every control TLV on
    /// the way. Returns whether the wanted TLV was found.
    fn scan_tlvs(&mut self) -> bool {
        let mem = self.mem;
        let end = t1t::STATIC_SIZE - t1t::OTP_LOCK_RES_BYTES;
        let mut cursor = TlvCursor::new(t1t::CC_RWA_BYTE + 1);
        loop {
            let scan = cursor.next(&mem[..end], 0, |o| self.locks.is_lock_or_reserved(o));
            let rec = match scan {
                TlvScan::Record(rec) => rec,
                TlvScan::Invalid { offset, type_byte } => {
                    log::warn!("T1T unknown TLV type {:#04x} at {}", type_byte, offset);
                    return self.have_wanted_control();
                }
                TlvScan::Terminator { .. } | TlvScan::NeedMoreData => {
                    return self.have_wanted_control();
                }
            };
            match rec.tlv_type {
                TlvType::LockControl | TlvType::MemoryControl
                    if rec.length == tlv::CONTROL_TLV_LEN =>
                {
                    let value = decode_control_tlv(&[rec.value[0], rec.value[1], rec.value[2]]);
                    let added = if rec.tlv_type == TlvType::LockControl {
                        self.locks.add_lock_tlv(value.into()).map(|_| ())
                    } else {
                        self.locks.add_mem_tlv(value.into())
                    };
                    if let Err(e) = added {
                        log::warn!("T1T {} TLV at {} rejected: {}", rec.tlv_type, rec.offset, e);
                        return false;
                    }
                    log::debug!(
                        "T1T {} TLV at {}: offset={} size={}",
                        rec.tlv_type,
                        rec.offset,
                        value.offset,
                        value.size
                    );
                }
                TlvType::LockControl | TlvType::MemoryControl => {
                    log::warn!("T1T malformed {} TLV at {}", rec.tlv_type, rec.offset);
                    return self.have_wanted_control();
                }
                TlvType::Ndef => {
                    if self.tlv_wanted != TlvType::Ndef {
                        return self.have_wanted_control();
                    }
                    self.ndef_header_offset = rec.length_offset;
                    self.ndef_msg_offset = rec.value_offset;
                    self.ndef_msg_len = rec.length;
                    return true;
                }
                _ => {}
            }
        }
    }

    /// Segment 0 arrived during detection.
    fn process_tag_memory(&mut self, link: &mut Link) -> Result<()> {
        if self.tlv_wanted == TlvType::Ndef && self.mem[t1t::CC_NMN_BYTE] != t1t::CC_NMN {
            log::info!("T1T not NDEF formatted (NMN={:#04x})", self.mem[t1t::CC_NMN_BYTE]);
            self.attribute = if self.cc_is_valid() {
                T1tAttribute::Initialized
            } else {
                T1tAttribute::Unknown
            };
            let max_size = self.ndef_max_size(link);
            self.max_ndef_msg_len = max_size;
            let data = NdefDetectData {
                status: Status::Failed,
                protocol: Protocol::Type1,
                max_size: max_size as u32,
                cur_size: 0,
                flags: self.base_flags(link) | NdefFlags::SOFT_LOCKABLE,
            };
            self.op_complete();
            link.notify(RwEvent::NdefDetect(data));
            return Ok(());
        }

        let found = self.scan_tlvs();
        match self.tlv_wanted {
            TlvType::Ndef if found => {
                let rwa = self.mem[t1t::CC_RWA_BYTE];
                self.attribute = if self.ndef_msg_len == 0 {
                    T1tAttribute::InitializedNdef
                } else if rwa == t1t::CC_RWA_RO {
                    T1tAttribute::ReadOnly
                } else {
                    T1tAttribute::ReadWrite
                };
                let len = self.image_len();
                self.locks.fill_lock_bytes(&self.mem[..len], 0);
                self.continue_ndef_detect(link)
            }
            TlvType::Ndef => {
                log::info!("T1T no NDEF TLV found");
                self.attribute = if self.cc_is_valid() {
                    T1tAttribute::Initialized
                } else {
                    T1tAttribute::Unknown
                };
                let max_size = self.ndef_max_size(link);
                let data = NdefDetectData {
                    status: Status::Failed,
                    protocol: Protocol::Type1,
                    max_size: max_size as u32,
                    cur_size: 0,
                    flags: self.base_flags(link),
                };
                self.op_complete();
                link.notify(RwEvent::NdefDetect(data));
                Ok(())
            }
            wanted => {
                let (status, num_bytes) = if !found {
                    (Status::Failed, 0)
                } else if wanted == TlvType::LockControl {
                    (Status::Ok, self.locks.lock_bytes().len())
                } else {
                    let reserved: usize = self.locks.mem_tlvs().iter().map(|m| m.num_bytes).sum();
                    (Status::Ok, reserved)
                };
                self.op_complete();
                link.notify(RwEvent::TlvDetect {
                    status,
                    num_bytes: num_bytes as u16,
                });
                Ok(())
            }
        }
    }

    /// Collect lock byte values, reading blocks the image does not cover.
    /// Returns `Ok(true)` once every lock byte is known.
    fn read_locks(&mut self, link: &mut Link) -> Result<bool> {
        let image_len = self.image_len();
        let tag_size = self.tag_size();
        while let Some(i) = self.locks.first_unread_lock_byte() {
            let offset = self
                .locks
                .lock_byte_offset(i)
                .ok_or_else(|| Error::DataCorruption("lock byte without TLV".into()))?;
            if offset < image_len {
                self.locks.fill_lock_bytes(&self.mem[offset..=offset], offset);
            } else if offset < tag_size {
                let block = (offset / t1t::BLOCK_SIZE) as u8;
                self.send(link, T1tCommand::Read8 { block })?;
                self.set_substate(T1tSubstate::WaitReadLocks);
                return Ok(false);
            } else {
                return Err(Error::DataCorruption(format!(
                    "lock byte at {} beyond tag memory ({})",
                    offset, tag_size
                )));
            }
        }
        Ok(true)
    }

    fn continue_ndef_detect(&mut self, link: &mut Link) -> Result<()> {
        let status = match self.read_locks(link) {
            Ok(false) => return Ok(()),
            Ok(true) => Status::Ok,
            Err(e) => {
                log::warn!("T1T lock bytes unavailable: {}", e);
                Status::Failed
            }
        };
        self.finish_ndef_detect(link, status);
        Ok(())
    }

    fn finish_ndef_detect(&mut self, link: &mut Link, status: Status) {
        self.locks.invalidate();
        let mut flags = self.base_flags(link) | NdefFlags::FORMATTED;
        let mut max_size = self.ndef_max_size(link);
        let cur_size = self.ndef_msg_len;
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
        self.max_ndef_msg_len = max_size;
        log::info!(
            "T1T NDEF detect {}: cur={} max={} flags={:?}",
            status,
            cur_size,
            max_size,
            flags
        );
        self.op_complete();
        link.notify(RwEvent::NdefDetect(NdefDetectData {
            status,
            protocol: Protocol::Type1,
            max_size: max_size as u32,
            cur_size: cur_size as u32,
            flags,
        }));
    }

    /// Largest NDEF message the tag can take.
    ///
    /// Tags without a usable CC are sized from their model; formatted tags
    /// count the free bytes after the message start up to the first
    /// read-only byte.
    pub(super) fn ndef_max_size(&mut self, link: &Link) -> usize {
        let tag_size = self.tag_size();
        let nmn = self.mem[t1t::CC_NMN_BYTE];
        if tag_size < t1t::STATIC_SIZE
            || tag_size > MAX_TAG_SIZE
            || (nmn != t1t::CC_NMN && nmn != 0)
            || self.ndef_msg_offset == 0
        {
            if !self.ndef_supported() {
                return 0;
            }
            let Some(model) = link.config().t1t_model(self.hr.hr0()) else {
                return 0;
            };
            // UID, reserved byte, CC, NDEF TLV header and the lock/OTP area
            let overhead = t1t::OTP_LOCK_RES_BYTES
                + t1t::UID_LEN
                + t1t::RES_BYTE_LEN
                + t1t::CC_LEN
                + 2;
            let mut size = ((model.tms as usize + 1) * t1t::BLOCK_SIZE).saturating_sub(overhead);
            if model.dynamic {
                // default lock and memory control TLVs plus their bytes
                size = size.saturating_sub(10 + t1t::DYNAMIC_LOCK_BYTES);
            }
            return size;
        }

        let mut free = 0;
        for offset in self.ndef_msg_offset..tag_size {
            if self.locks.is_lock_or_reserved(offset) {
                continue;
            }
            if self.locks.is_read_only(offset) {
                break;
            }
            free += 1;
        }
        fit_length_field(free, self.ndef_msg_offset - self.ndef_header_offset)
    }

    // ---- read -----------------------------------------------------------

    pub(super) fn start_read_ndef(&mut self, link: &mut Link) -> Result<()> {
        self.ensure_idle()?;
        if !self.ndef_supported() {
            return Err(Error::refused("tag does not support NDEF"));
        }
        match self.attribute {
            T1tAttribute::ReadWrite | T1tAttribute::ReadOnly => {}
            T1tAttribute::InitializedNdef => return Err(Error::NotInitialized),
            other => return Err(Error::failed(format!("no NDEF message ({})", other))),
        }
        self.ndef.read_buf.clear();
        self.ndef.read_pos = self.ndef_msg_offset;

        if self.segment0_cached {
            self.set_state(T1tState::ReadNdef);
            let mem = self.mem;
            let len = self.image_len();
            if let Err(e) = self.consume_ndef(link, &mem[..len], 0) {
                log::warn!("T1T NDEF read failed: {}", e);
                self.fail(link, super::error_status(&e));
            }
            return Ok(());
        }
        let op = self.segment0_read();
        self.start(link, op, T1tState::ReadNdef)?;
        self.set_substate(T1tSubstate::WaitReadTagMemory);
        Ok(())
    }

    /// Take message bytes out of `chunk` (tag offset `chunk_offset`) and
    /// either finish the read or ask for the next part.
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
            log::debug!("T1T NDEF read complete: {} bytes", data.len());
            self.op_complete();
            link.notify(RwEvent::NdefRead { data });
            link.notify(RwEvent::NdefReadComplete);
            return Ok(());
        }
        if !self.is_dynamic_memory() || self.ndef.read_pos >= self.tag_size() {
            return Err(Error::failed("NDEF message runs past tag memory"));
        }
        let remaining = self.ndef_msg_len - self.ndef.read_buf.len();
        let op = if remaining <= t1t::BLOCK_SIZE {
            T1tCommand::Read8 {
                block: (self.ndef.read_pos / t1t::BLOCK_SIZE) as u8,
            }
        } else {
            T1tCommand::ReadSegment {
                segment: (self.ndef.read_pos / t1t::SEGMENT_SIZE) as u8,
            }
        };
        self.send(link, op)?;
        self.set_substate(T1tSubstate::None);
        Ok(())
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

    pub(super) fn start_write_ndef(&mut self, link: &mut Link, message: &[u8]) -> Result<()> {
        self.ensure_idle()?;
        if !self.ndef_supported() {
            return Err(Error::refused("tag does not support NDEF"));
        }
        if !matches!(
            self.attribute,
            T1tAttribute::ReadWrite | T1tAttribute::InitializedNdef
        ) {
            return Err(Error::refused(format!("tag not writable ({})", self.attribute)));
        }
        if message.len() > self.max_ndef_msg_len {
            return Err(Error::refused(format!(
                "message of {} bytes exceeds {}",
                message.len(),
                self.max_ndef_msg_len
            )));
        }

        let mut payload = encode_length(message.len());
        let field_len = payload.len();
        payload.extend_from_slice(message);
        let positions = self.data_positions(self.ndef_header_offset, payload.len())?;
        let last = positions.last().copied().unwrap_or(self.ndef_header_offset);
        self.ndef.new_msg_offset = match positions.get(field_len) {
            Some(&offset) => offset,
            None => self.data_positions(last + 1, 1)?.first().copied().unwrap_or(last + 1),
        };
        self.ndef.new_msg_len = message.len();
        self.ndef.final_block = last / t1t::BLOCK_SIZE;
        self.ndef.writes = positions.into_iter().zip(payload).collect();
        self.ndef.steps.clear();

        if self.is_dynamic_memory() && self.ndef.final_block >= t1t::BLOCKS_PER_SEGMENT {
            let block = self.ndef.final_block as u8;
            self.start(link, T1tCommand::Read8 { block }, T1tState::WriteNdef)?;
            self.set_substate(T1tSubstate::WaitReadNdefBlock);
        } else {
            self.start(link, invalidate_cmd(), T1tState::WriteNdef)?;
            self.set_substate(T1tSubstate::WaitInvalidateNdef);
        }
        log::debug!(
            "T1T NDEF write: {} bytes, last block {}",
            message.len(),
            self.ndef.final_block
        );
        Ok(())
    }

    /// Turn the pending byte writes into commands. Dynamic tags write whole
    /// blocks where the rest of the block content is known.
    fn build_write_plan(&mut self) {
        let dynamic = self.is_dynamic_memory();
        let first_block = self
            .ndef
            .writes
            .first()
            .map(|(o, _)| o / t1t::BLOCK_SIZE)
            .unwrap_or(0);
        let mut steps = VecDeque::new();
        let writes = std::mem::take(&mut self.ndef.writes);
        for group in writes.chunk_by(|a, b| a.0 / t1t::BLOCK_SIZE == b.0 / t1t::BLOCK_SIZE) {
            let block = group[0].0 / t1t::BLOCK_SIZE;
            let whole = dynamic
                && (block == first_block
                    || block == self.ndef.final_block
                    || group.len() == t1t::BLOCK_SIZE);
            if whole {
                let mut data = if block < t1t::BLOCKS_PER_SEGMENT {
                    let start = block * t1t::BLOCK_SIZE;
                    let mut b = [0u8; t1t::BLOCK_SIZE];
                    b.copy_from_slice(&self.mem[start..start + t1t::BLOCK_SIZE]);
                    b
                } else if block == self.ndef.final_block {
                    self.ndef.final_block_data
                } else {
                    [0u8; t1t::BLOCK_SIZE]
                };
                for &(offset, value) in group {
                    data[offset % t1t::BLOCK_SIZE] = value;
                }
                steps.push_back(WriteStep::Block {
                    block: block as u8,
                    data,
                });
            } else {
                for &(offset, value) in group {
                    steps.push_back(WriteStep::Byte {
                        block: block as u8,
                        byte: (offset % t1t::BLOCK_SIZE) as u8,
                        value,
                    });
                }
            }
        }
        self.ndef.writes = writes;
        self.ndef.steps = steps;
    }

    fn send_next_write(&mut self, link: &mut Link) -> Result<()> {
        match self.ndef.steps.pop_front() {
            Some(WriteStep::Byte { block, byte, value }) => {
                self.send(link, T1tCommand::WriteErase { block, byte, value })?;
                self.set_substate(T1tSubstate::WaitNdefWrite);
            }
            Some(WriteStep::Block { block, data }) => {
                self.send(link, T1tCommand::WriteErase8 { block, data })?;
                self.set_substate(T1tSubstate::WaitNdefWrite);
            }
            None => {
                self.send(link, validate_cmd())?;
                self.set_substate(T1tSubstate::WaitValidateNdef);
            }
        }
        Ok(())
    }

    fn handle_write_ndef_response(&mut self, link: &mut Link, op: &T1tCommand, data: &[u8]) -> Result<()> {
        match self.substate {
            T1tSubstate::WaitReadNdefBlock => {
                self.ndef
                    .final_block_data
                    .copy_from_slice(&data[t1t::ADD_LEN..t1t::ADD_LEN + t1t::BLOCK_SIZE]);
                self.send(link, invalidate_cmd())?;
                self.set_substate(T1tSubstate::WaitInvalidateNdef);
            }
            T1tSubstate::WaitInvalidateNdef => {
                self.apply_to_image(op);
                self.build_write_plan();
                self.send_next_write(link)?;
            }
            T1tSubstate::WaitNdefWrite => {
                self.apply_to_image(op);
                self.send_next_write(link)?;
            }
            T1tSubstate::WaitValidateNdef => {
                self.apply_to_image(op);
                self.ndef_msg_len = self.ndef.new_msg_len;
                self.ndef_msg_offset = self.ndef.new_msg_offset;
                self.attribute = if self.ndef_msg_len == 0 {
                    T1tAttribute::InitializedNdef
                } else {
                    T1tAttribute::ReadWrite
                };
                log::info!("T1T NDEF updated: {} bytes", self.ndef_msg_len);
                self.op_complete();
                link.notify(RwEvent::NdefUpdateComplete);
            }
            other => log::warn!("T1T write response in unexpected substate {}", other),
        }
        Ok(())
    }

    // ---- format ---------------------------------------------------------

    pub(super) fn start_format(&mut self, link: &mut Link) -> Result<()> {
        self.ensure_idle()?;
        if !self.ndef_supported() {
            return Err(Error::rejected("tag does not support NDEF"));
        }
        let model = link
            .config()
            .t1t_model(self.hr.hr0())
            .cloned()
            .ok_or_else(|| Error::rejected(format!("unknown T1T model {:#04x}", self.hr.hr0())))?;

        let mut cc_block = [0u8; t1t::BLOCK_SIZE];
        cc_block[..4].copy_from_slice(&[t1t::CC_NMN, t1t::CC_VNO, model.tms, t1t::CC_RWA_RW]);
        let mut next_block = [0u8; t1t::BLOCK_SIZE];
        if model.dynamic {
            cc_block[4..].copy_from_slice(&[
                tlv::LOCK_CTRL,
                tlv::CONTROL_TLV_LEN as u8,
                model.lock_tlv[0],
                model.lock_tlv[1],
            ]);
            next_block.copy_from_slice(&[
                model.lock_tlv[2],
                tlv::MEM_CTRL,
                tlv::CONTROL_TLV_LEN as u8,
                model.mem_tlv[0],
                model.mem_tlv[1],
                model.mem_tlv[2],
                tlv::NDEF,
                0x00,
            ]);
        } else {
            cc_block[4] = tlv::NDEF;
            cc_block[5] = 0x00;
        }
        self.ndef.format_blocks = [cc_block, next_block];
        self.ndef.format_dynamic = model.dynamic;

        let op = if self.supports_dynamic_commands() {
            T1tCommand::WriteErase8 {
                block: t1t::CC_BLOCK,
                data: cc_block,
            }
        } else {
            self.ndef.format_byte = 1;
            T1tCommand::WriteErase {
                block: t1t::CC_BLOCK,
                byte: 0,
                value: cc_block[0],
            }
        };
        self.start(link, op, T1tState::FormatTag)?;
        self.set_substate(T1tSubstate::WaitSetCc);
        log::info!("T1T formatting, tms={:#04x} dynamic={}", model.tms, model.dynamic);
        Ok(())
    }

    fn handle_format_response(&mut self, link: &mut Link, op: &T1tCommand) -> Result<()> {
        self.apply_to_image(op);
        match (self.substate, op) {
            (T1tSubstate::WaitSetCc, T1tCommand::WriteErase { .. })
                if self.ndef.format_byte < t1t::BLOCK_SIZE =>
            {
                let byte = self.ndef.format_byte;
                self.ndef.format_byte += 1;
                self.send(
                    link,
                    T1tCommand::WriteErase {
                        block: t1t::CC_BLOCK,
                        byte: byte as u8,
                        value: self.ndef.format_blocks[0][byte],
                    },
                )
            }
            (T1tSubstate::WaitSetCc, T1tCommand::WriteErase8 { .. }) if self.ndef.format_dynamic => {
                let data = self.ndef.format_blocks[1];
                self.send(link, T1tCommand::WriteErase8 { block: t1t::CC_BLOCK + 1, data })?;
                self.set_substate(T1tSubstate::WaitSetNullNdef);
                Ok(())
            }
            _ => {
                self.attribute = T1tAttribute::Unknown;
                self.op_complete();
                link.notify(RwEvent::FormatComplete { status: Status::Ok });
                Ok(())
            }
        }
    }

    // ---- read-only ------------------------------------------------------

    pub(super) fn start_set_read_only(&mut self, link: &mut Link, hard_lock: bool) -> Result<()> {
        self.ensure_idle()?;
        if !matches!(
            self.attribute,
            T1tAttribute::ReadWrite | T1tAttribute::Initialized | T1tAttribute::InitializedNdef
        ) {
            return Err(Error::refused(format!("cannot lock tag in {}", self.attribute)));
        }
        self.ndef.hard_lock = hard_lock;
        let op = T1tCommand::WriteNoErase {
            block: t1t::CC_BLOCK,
            byte: t1t::CC_RWA_OFFSET,
            value: t1t::CC_RWA_RO,
        };
        self.start(link, op, T1tState::SetTagRo)?;
        self.set_substate(T1tSubstate::WaitSetCcRwaRo);
        log::info!("T1T set read only (hard={})", hard_lock);
        Ok(())
    }

    fn handle_set_ro_response(&mut self, link: &mut Link, op: &T1tCommand) -> Result<()> {
        self.apply_to_image(op);
        match self.substate {
            T1tSubstate::WaitSetCcRwaRo if !self.ndef.hard_lock => self.finish_set_read_only(link),
            T1tSubstate::WaitSetCcRwaRo => {
                let op = if self.is_dynamic_memory() {
                    let mut data = [0u8; t1t::BLOCK_SIZE];
                    data[0] = 0xFF;
                    data[1] = 0xFF;
                    T1tCommand::WriteNoErase8 {
                        block: t1t::LOCK_BLOCK,
                        data,
                    }
                } else {
                    T1tCommand::WriteNoErase {
                        block: t1t::LOCK_BLOCK,
                        byte: 0,
                        value: 0xFF,
                    }
                };
                self.send(link, op)?;
                self.set_substate(T1tSubstate::WaitSetStaticLockBits);
                Ok(())
            }
            T1tSubstate::WaitSetStaticLockBits
                if matches!(op, T1tCommand::WriteNoErase { byte: 0, .. }) =>
            {
                let op = T1tCommand::WriteNoErase {
                    block: t1t::LOCK_BLOCK,
                    byte: 1,
                    value: 0xFF,
                };
                self.send(link, op)
            }
            _ => self.set_dynamic_lock_bits(link),
        }
    }

    /// Set the next group of dynamic lock bytes. Lock bytes sharing a block
    /// go out in one WRITE-NE8 on tags with segmented memory.
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
            return self.finish_set_read_only(link);
        };
        let offset = self
            .locks
            .lock_byte_offset(first)
            .ok_or_else(|| Error::DataCorruption("lock byte without TLV".into()))?;
        let block = offset / t1t::BLOCK_SIZE;

        let op = if self.is_dynamic_memory() {
            let mut data = [0u8; t1t::BLOCK_SIZE];
            for i in first..self.locks.lock_bytes().len() {
                match self.locks.lock_byte_offset(i) {
                    Some(o) if o / t1t::BLOCK_SIZE == block => {
                        data[o % t1t::BLOCK_SIZE] = self.locks.lock_byte_mask(i);
                        if let Some(lb) = self.locks.lock_byte_mut(i) {
                            lb.status = LockStatus::UpdateInitiated;
                        }
                    }
                    _ => break,
                }
            }
            T1tCommand::WriteNoErase8 {
                block: block as u8,
                data,
            }
        } else {
            let value = self.locks.lock_byte_mask(first);
            if let Some(lb) = self.locks.lock_byte_mut(first) {
                lb.status = LockStatus::UpdateInitiated;
            }
            T1tCommand::WriteNoErase {
                block: block as u8,
                byte: (offset % t1t::BLOCK_SIZE) as u8,
                value,
            }
        };
        self.send(link, op)?;
        self.set_substate(T1tSubstate::WaitSetDynamicLockBits);
        Ok(())
    }

    fn finish_set_read_only(&mut self, link: &mut Link) -> Result<()> {
        self.locks.invalidate();
        self.attribute = T1tAttribute::ReadOnly;
        self.op_complete();
        link.notify(RwEvent::SetTagReadOnly { status: Status::Ok });
        Ok(())
    }

    // ---- dispatch -------------------------------------------------------

    pub(super) fn handle_ndef_response(&mut self, link: &mut Link, op: &T1tCommand, data: &[u8]) -> Result<()> {
        match self.state {
            T1tState::TlvDetect => match self.substate {
                T1tSubstate::WaitReadTagMemory => {
                    if !self.store_segment0(op, data) {
                        return Err(Error::failed("unexpected response while reading tag memory"));
                    }
                    self.process_tag_memory(link)
                }
                T1tSubstate::WaitReadLocks => {
                    let offset = data[0] as usize * t1t::BLOCK_SIZE;
                    self.locks
                        .fill_lock_bytes(&data[t1t::ADD_LEN..t1t::ADD_LEN + t1t::BLOCK_SIZE], offset);
                    self.continue_ndef_detect(link)
                }
                other => Err(Error::failed(format!("detect response in substate {}", other))),
            },
            T1tState::ReadNdef => match op {
                T1tCommand::ReadAll => {
                    self.store_segment0(op, data);
                    let mem = self.mem;
                    self.consume_ndef(link, &mem[..t1t::STATIC_SIZE], 0)
                }
                T1tCommand::ReadSegment { segment } => {
                    if *segment == 0 {
                        self.store_segment0(op, data);
                    }
                    let offset = *segment as usize * t1t::SEGMENT_SIZE;
                    self.consume_ndef(link, &data[t1t::ADD_LEN..], offset)
                }
                T1tCommand::Read8 { block } => {
                    let offset = *block as usize * t1t::BLOCK_SIZE;
                    self.consume_ndef(link, &data[t1t::ADD_LEN..], offset)
                }
                _ => Err(Error::failed("unexpected command during NDEF read")),
            },
            T1tState::WriteNdef => self.handle_write_ndef_response(link, op, data),
            T1tState::FormatTag => self.handle_format_response(link, op),
            T1tState::SetTagRo => self.handle_set_ro_response(link, op),
            other => {
                log::warn!("T1T response ignored in {}", other);
                Ok(())
            }
        }
    }
}

fn invalidate_cmd() -> T1tCommand {
    T1tCommand::WriteErase {
        block: t1t::CC_BLOCK,
        byte: t1t::CC_NMN_OFFSET,
        value: 0x00,
    }
}

fn validate_cmd() -> T1tCommand {
    T1tCommand::WriteErase {
        block: t1t::CC_BLOCK,
        byte: t1t::CC_NMN_OFFSET,
        value: t1t::CC_NMN,
    }
}
