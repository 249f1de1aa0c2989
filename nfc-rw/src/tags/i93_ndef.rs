// nfc-rw-rs/nfc-rw/src/tags/i93_ndef.rs
//! ISO 15693 NDEF flows: detection, read, update, format and read-only.
//!
//! Memory is a flat array of `num_blocks` blocks of `block_size` bytes with
//! the CC in the first four bytes. Lock state is per block and comes from
//! the block security status.

use std::collections::VecDeque;

use crate::constants::{i93, tlv};
use crate::events::{NdefDetectData, NdefFlags, RwEvent, Status};
use crate::protocol::commands::{I93Command, I93Request};
use crate::protocol::parser::{array_at, byte_at, slice_at};
use crate::protocol::retry::Link;
use crate::protocol::tlv::{encode_length, length_field_len, TlvCursor, TlvScan, TlvType};
use crate::tags::i93::{I93Engine, I93State, I93Substate};
use crate::types::Protocol;
use crate::{Error, Result};

/// Per-operation scratch state.
#[derive(Debug, Default)]
pub struct I93NdefOp {
    cursor: TlvCursor,
    /// Next block whose security status is needed
    sec_block: u16,
    /// Next tag offset to read (READ_NDEF)
    rw_offset: usize,
    message: Vec<u8>,
    new_value_offset: usize,
    /// `(block, data)` still to write, in order
    writes: VecDeque<(u16, Vec<u8>)>,
    /// Blocks carrying the real length field, written last
    len_writes: VecDeque<(u16, Vec<u8>)>,
    locks: VecDeque<u16>,
    afi_checked: bool,
    reset_dsfid: bool,
    reset_afi: bool,
}

impl I93NdefOp {
    pub(super) fn reset_buffers(&mut self) {
        self.message.clear();
        self.writes.clear();
        self.len_writes.clear();
        self.locks.clear();
    }
}

impl I93Engine {
    fn mem_size(&self) -> usize {
        self.num_blocks as usize * self.block_size as usize
    }

    fn geometry_known(&self) -> bool {
        self.num_blocks != 0 && self.block_size != 0
    }

    fn bs(&self) -> usize {
        self.block_size as usize
    }

    /// Parts without GET MULTIPLE BLOCK SECURITY STATUS: the lock state is
    /// read block by block with the option flag.
    fn per_block_security(&self) -> bool {
        self.product.is_tag_it_std_pro()
            || (self.uid.manufacturer() == i93::MANUFACTURER_NXP
                && self.ic_reference & i93::ICODE_IC_REF_MBREAD_MASK != 0)
    }

    fn enter(&mut self, state: I93State, substate: I93Substate) {
        self.set_state(state);
        self.set_substate(substate);
    }

    /// Read the block holding tag offset `offset`, and the following ones
    /// when the tag supports READ MULTIPLE BLOCKS.
    pub(super) fn read_blocks_at(&mut self, link: &mut Link, offset: usize) -> Result<()> {
        let first = (offset / self.bs()) as u16;
        if !self.read_multi_block {
            return self.send_read_single(link, first, false);
        }
        let mut count = ((i93::READ_MULTI_BLOCK_SIZE / self.bs()).max(1) as u16).min(self.num_blocks - first);
        if self.product.has_stm_sector_limit() {
            count = count.min(i93::STM_MAX_BLOCKS_PER_READ);
            let sector_left = i93::STM_BLOCKS_PER_SECTOR - first % i93::STM_BLOCKS_PER_SECTOR;
            count = count.min(sector_left);
        }
        self.send_read_multi(link, first, count)
    }

    /// Tag offset and block data of a read answer.
    fn read_chunk<'a>(&self, req: &I93Request, payload: &'a [u8]) -> Result<(usize, &'a [u8])> {
        let (first, count) = match req.command {
            I93Command::ReadSingleBlock { block } => (block, 1),
            I93Command::ReadMultipleBlocks { first, count } => (first, count),
            _ => return Err(Error::failed(format!("unexpected answer to opcode {:#04x}", req.opcode()))),
        };
        let data = if req.option { slice_at(payload, 1, payload.len().saturating_sub(1))? } else { payload };
        Ok((first as usize * self.bs(), slice_at(data, 0, count as usize * self.bs())?))
    }

    fn request_security(&mut self, link: &mut Link) -> Result<()> {
        if self.sec_block_out_of_range() {
            return Err(Error::failed("security status past the last block"));
        }
        if self.per_block_security() {
            return self.send_read_single(link, self.ndef.sec_block, true);
        }
        let count = (self.num_blocks - self.ndef.sec_block).min(i93::MAX_SECURITY_STATUS_BLOCKS);
        self.send_security_status(link, self.ndef.sec_block, count)
    }

    fn sec_block_out_of_range(&self) -> bool {
        self.ndef.sec_block >= self.num_blocks
    }

    /// Block security bytes of a read-with-option or security status answer.
    fn security_bytes<'a>(&self, req: &I93Request, payload: &'a [u8]) -> Result<&'a [u8]> {
        match req.command {
            I93Command::ReadSingleBlock { .. } => slice_at(payload, 0, 1),
            I93Command::GetMultiBlockSecurityStatus { count, .. } => slice_at(payload, 0, count as usize),
            _ => Err(Error::failed(format!("unexpected answer to opcode {:#04x}", req.opcode()))),
        }
    }

    fn compute_max_ndef_length(&self) -> usize {
        let raw = self.ndef_area_end.saturating_sub(self.ndef_value_offset);
        if self.ndef_length < tlv::LONG_LEN_THRESHOLD && raw >= tlv::LONG_LEN_THRESHOLD {
            // room for the 3-byte length field
            (raw - (tlv::LONG_LEN_FIELD_LEN - tlv::SHORT_LEN_FIELD_LEN)).max(self.ndef_length)
        } else {
            raw
        }
    }

    // ---- detect ---------------------------------------------------------

    /// Inventory if the UID is unknown, system information if the geometry
    /// is, then the CC, the NDEF TLV and the lock state after it.
    pub(super) fn start_detect_ndef(&mut self, link: &mut Link) -> Result<()> {
        self.ensure_idle()?;
        self.ndef = Default::default();
        self.ndef_detected = false;
        self.read_only = false;
        self.read_multi_block = false;
        self.ndef_length = 0;
        self.max_ndef_length = 0;

        if !self.uid_known() {
            self.send_inventory(link, None, None)?;
            self.enter(I93State::DetectNdef, I93Substate::WaitUid);
        } else if !self.geometry_known() {
            self.ext_block_numbers = false;
            self.send_sys_info(link, None, false)?;
            self.enter(I93State::DetectNdef, I93Substate::WaitSysInfo);
        } else {
            self.send_read_single(link, 0, false)?;
            self.enter(I93State::DetectNdef, I93Substate::WaitCc);
        }
        Ok(())
    }

    /// Adopt an INVENTORY answer (`[dsfid, uid..]`).
    pub(super) fn adopt_inventory(&mut self, payload: &[u8]) -> Result<u8> {
        let dsfid = byte_at(payload, 0)?;
        self.uid = crate::types::I93Uid::from_wire(&array_at::<{ i93::UID_LEN }>(payload, 1)?);
        self.dsfid = dsfid;
        self.identify_product();
        Ok(dsfid)
    }

    /// System information answer inside a flow. Returns `false` while the
    /// request is being repeated with the protocol extension.
    fn adopt_system_info(&mut self, link: &mut Link, payload: &[u8]) -> Result<bool> {
        self.num_blocks = 0;
        self.block_size = 0;
        if !self.process_system_info(link, payload)? {
            return Ok(false);
        }
        if !self.geometry_known() {
            return Err(Error::failed("tag memory size unknown"));
        }
        log::debug!(
            "I93 memory: {} blocks of {} bytes (16-bit block numbers: {})",
            self.num_blocks,
            self.block_size,
            self.ext_block_numbers
        );
        Ok(true)
    }

    fn process_cc(&mut self, link: &mut Link, block0: &[u8]) -> Result<()> {
        let cc = array_at::<{ i93::CC_LEN }>(block0, 0)?;
        log::debug!("I93 CC {:02X} {:02X} {:02X} {:02X}", cc[0], cc[1], cc[2], cc[3]);
        let size_ok = cc[3] & i93::CC3_OVERFLOW != 0 || cc[2] as usize * 8 == self.mem_size();
        if cc[0] != i93::CC_MAGIC || !size_ok {
            return Err(Error::failed("no valid capability container"));
        }
        if cc[1] & i93::CC1_READ_ACCESS_MASK != i93::CC1_READ_ACCESS_GRANTED {
            return Err(Error::failed("read access not granted"));
        }
        self.read_only = cc[1] & i93::CC1_WRITE_ACCESS_MASK != i93::CC1_WRITE_ACCESS_GRANTED;
        self.read_multi_block = cc[3] & i93::CC3_MBREAD != 0;

        self.ndef.cursor = TlvCursor::new(i93::CC_LEN);
        self.set_substate(I93Substate::SearchNdefTlv);
        self.search_ndef_tlv(link, block0, 0)
    }

    fn search_ndef_tlv(&mut self, link: &mut Link, chunk: &[u8], chunk_offset: usize) -> Result<()> {
        match self.ndef.cursor.find(chunk, chunk_offset, TlvType::Ndef, |_| false) {
            TlvScan::Record(r) => {
                if r.value_offset + r.length > self.mem_size() {
                    return Err(Error::DataCorruption(format!("NDEF TLV of {} bytes overruns memory", r.length)));
                }
                self.ndef_tlv_start = r.offset;
                self.ndef_value_offset = r.value_offset;
                self.ndef_length = r.length;
                self.ndef_tlv_last = r.value_offset + r.length - 1;
                log::debug!("I93 NDEF TLV at {} length {}", r.offset, r.length);

                self.ndef.sec_block = (self.ndef_tlv_start / self.bs()) as u16;
                self.set_substate(I93Substate::CheckLockStatus);
                self.request_security(link)
            }
            TlvScan::Terminator { offset } => Err(Error::failed(format!("terminator at {} before any NDEF TLV", offset))),
            TlvScan::Invalid { offset, type_byte } => Err(Error::DataCorruption(format!(
                "invalid TLV type {:#04x} at {}",
                type_byte, offset
            ))),
            TlvScan::NeedMoreData => {
                let next = chunk_offset + chunk.len();
                if next >= self.mem_size() {
                    return Err(Error::failed("no NDEF TLV in tag memory"));
                }
                self.read_blocks_at(link, next)
            }
        }
    }

    /// Walk the security status from the NDEF TLV on: a locked block inside
    /// the TLV makes the message read-only, the first one after it ends the
    /// writable area.
    fn check_lock_status(&mut self, link: &mut Link, statuses: &[u8]) -> Result<()> {
        let last_block = (self.ndef_tlv_last / self.bs()) as u16;
        for &status in statuses {
            let block = self.ndef.sec_block;
            if status & i93::BLOCK_LOCKED != 0 {
                if block <= last_block {
                    log::debug!("I93 block {} of the NDEF TLV is locked", block);
                    self.read_only = true;
                }
                return self.finish_detect(link, block);
            }
            self.ndef.sec_block += 1;
        }
        if self.sec_block_out_of_range() {
            return self.finish_detect(link, self.num_blocks);
        }
        self.request_security(link)
    }

    fn finish_detect(&mut self, link: &mut Link, free_end_block: u16) -> Result<()> {
        self.ndef_area_end = free_end_block as usize * self.bs();
        self.max_ndef_length = self.compute_max_ndef_length();
        self.ndef_detected = true;

        let mut flags = NdefFlags::SUPPORTED | NdefFlags::FORMATTED | NdefFlags::FORMATABLE;
        let max_size = if self.read_only {
            flags |= NdefFlags::READ_ONLY;
            self.ndef_length
        } else {
            flags |= NdefFlags::HARD_LOCKABLE;
            self.max_ndef_length
        };
        log::info!(
            "I93 NDEF detected: cur={} max={} flags={:?}",
            self.ndef_length,
            max_size,
            flags
        );
        self.op_complete();
        link.notify(RwEvent::NdefDetect(NdefDetectData {
            status: Status::Ok,
            protocol: Protocol::Iso15693,
            max_size: max_size as u32,
            cur_size: self.ndef_length as u32,
            flags,
        }));
        Ok(())
    }

    fn handle_detect_response(&mut self, link: &mut Link, req: &I93Request, payload: &[u8]) -> Result<()> {
        match self.substate {
            I93Substate::WaitUid => {
                let dsfid = self.adopt_inventory(payload)?;
                if dsfid != i93::DSFID_UNSUPPORTED {
                    return Err(Error::failed(format!("unknown data storage format {:#04x}", dsfid)));
                }
                self.ext_block_numbers = false;
                self.send_sys_info(link, None, false)?;
                self.set_substate(I93Substate::WaitSysInfo);
                Ok(())
            }
            I93Substate::WaitSysInfo => {
                if !self.adopt_system_info(link, payload)? {
                    return Ok(());
                }
                self.send_read_single(link, 0, false)?;
                self.set_substate(I93Substate::WaitCc);
                Ok(())
            }
            I93Substate::WaitCc => {
                let (_, block0) = self.read_chunk(req, payload)?;
                self.process_cc(link, block0)
            }
            I93Substate::SearchNdefTlv => {
                let (offset, chunk) = self.read_chunk(req, payload)?;
                self.search_ndef_tlv(link, chunk, offset)
            }
            I93Substate::CheckLockStatus => {
                let statuses = self.security_bytes(req, payload)?;
                self.check_lock_status(link, statuses)
            }
            other => Err(Error::failed(format!("detect answer in substate {}", other))),
        }
    }

    // ---- read -----------------------------------------------------------

    pub(super) fn start_read_ndef(&mut self, link: &mut Link) -> Result<()> {
        self.ensure_idle()?;
        if !self.ndef_detected {
            return Err(Error::failed("NDEF not detected"));
        }
        if self.ndef_length == 0 {
            return Err(Error::NotInitialized);
        }
        self.ndef.rw_offset = self.ndef_value_offset;
        self.read_blocks_at(link, self.ndef_value_offset)?;
        self.enter(I93State::ReadNdef, I93Substate::None);
        Ok(())
    }

    /// Hand the message bytes of one read answer up as a segment.
    fn consume_ndef(&mut self, link: &mut Link, chunk: &[u8], chunk_offset: usize) -> Result<()> {
        let msg_end = self.ndef_value_offset + self.ndef_length;
        let start = self.ndef.rw_offset.max(chunk_offset);
        let end = (chunk_offset + chunk.len()).min(msg_end);
        if start < end {
            link.notify(RwEvent::NdefRead {
                data: chunk[start - chunk_offset..end - chunk_offset].to_vec(),
            });
            self.ndef.rw_offset = end;
        }
        if self.ndef.rw_offset >= msg_end {
            log::debug!("I93 NDEF read complete: {} bytes", self.ndef_length);
            self.op_complete();
            link.notify(RwEvent::NdefReadComplete);
            return Ok(());
        }
        if self.ndef.rw_offset >= self.mem_size() {
            return Err(Error::failed("NDEF message runs past tag memory"));
        }
        self.read_blocks_at(link, self.ndef.rw_offset)
    }

    // ---- update ---------------------------------------------------------

    /// Read the first TLV block, write the TLV with a zero length, then the
    /// real length.
    pub(super) fn start_update_ndef(&mut self, link: &mut Link, message: &[u8]) -> Result<()> {
        self.ensure_idle()?;
        if !self.ndef_detected {
            return Err(Error::failed("NDEF not detected"));
        }
        if self.read_only {
            return Err(Error::refused("NDEF is read-only"));
        }
        if message.len() > self.max_ndef_length {
            return Err(Error::refused(format!(
                "message of {} bytes exceeds the {} bytes available",
                message.len(),
                self.max_ndef_length
            )));
        }
        self.ndef.message = message.to_vec();
        let first = (self.ndef_tlv_start / self.bs()) as u16;
        self.send_read_single(link, first, false)?;
        self.enter(I93State::UpdateNdef, I93Substate::ResetLen);
        Ok(())
    }

    /// Build the block images of the update from the current content of the
    /// first TLV block.
    fn plan_update(&mut self, first_block: &[u8]) {
        let bs = self.bs();
        let base = self.ndef_tlv_start / bs * bs;
        let len = self.ndef.message.len();
        let field_len = length_field_len(len);

        let mut image = first_block[..self.ndef_tlv_start - base].to_vec();
        image.push(tlv::NDEF);
        let length_at = image.len();
        image.extend(std::iter::repeat_n(0u8, field_len));
        if field_len == tlv::LONG_LEN_FIELD_LEN {
            image[length_at] = tlv::LONG_LEN_MARKER;
        }
        image.extend_from_slice(&self.ndef.message);
        if base + image.len() < self.ndef_area_end {
            image.push(tlv::TERMINATOR);
        }
        let padded = image.len().div_ceil(bs) * bs;
        image.resize(padded, tlv::NULL);

        let mut real = image.clone();
        real[length_at..length_at + field_len].copy_from_slice(&encode_length(len));

        let first = (base / bs) as u16;
        self.ndef.writes = image
            .chunks(bs)
            .enumerate()
            .map(|(i, chunk)| (first + i as u16, chunk.to_vec()))
            .collect();
        self.ndef.len_writes.clear();
        if len > 0 {
            let len_blocks = (length_at / bs)..=((length_at + field_len - 1) / bs);
            for i in len_blocks {
                self.ndef.len_writes.push_back((first + i as u16, real[i * bs..(i + 1) * bs].to_vec()));
            }
        }
        self.ndef.new_value_offset = base + length_at + field_len;
        log::debug!(
            "I93 NDEF update: {} blocks from block {}, {} length blocks",
            self.ndef.writes.len(),
            first,
            self.ndef.len_writes.len()
        );
    }

    fn write_next_update_block(&mut self, link: &mut Link) -> Result<()> {
        if let Some((block, data)) = self.ndef.writes.pop_front() {
            self.set_substate(I93Substate::WriteNdef);
            return self.send_write_single(link, block, data);
        }
        if let Some((block, data)) = self.ndef.len_writes.pop_front() {
            self.set_substate(I93Substate::UpdateLen);
            return self.send_write_single(link, block, data);
        }
        self.finish_update(link);
        Ok(())
    }

    fn finish_update(&mut self, link: &mut Link) {
        self.ndef_length = self.ndef.message.len();
        self.ndef_value_offset = self.ndef.new_value_offset;
        self.ndef_tlv_last = self.ndef_value_offset + self.ndef_length - 1;
        self.max_ndef_length = self.compute_max_ndef_length();
        log::info!("I93 NDEF updated: {} bytes", self.ndef_length);
        self.op_complete();
        link.notify(RwEvent::NdefUpdateComplete);
    }

    fn handle_update_response(&mut self, link: &mut Link, req: &I93Request, payload: &[u8]) -> Result<()> {
        match self.substate {
            I93Substate::ResetLen => {
                let (_, block) = self.read_chunk(req, payload)?;
                let block = block.to_vec();
                self.plan_update(&block);
                self.write_next_update_block(link)
            }
            I93Substate::WriteNdef | I93Substate::UpdateLen => self.write_next_update_block(link),
            other => Err(Error::failed(format!("update answer in substate {}", other))),
        }
    }

    // ---- format ---------------------------------------------------------

    /// Reset DSFID and AFI, make sure no block is locked, then write the CC
    /// with an empty NDEF TLV.
    pub(super) fn start_format(&mut self, link: &mut Link) -> Result<()> {
        self.ensure_idle()?;
        self.ndef = Default::default();
        self.ndef_detected = false;
        self.read_only = false;
        self.read_multi_block = false;

        if self.product.is_tag_it_std_pro() {
            // no system information on these parts
            self.send_read_single(link, 0, true)?;
            self.enter(I93State::Format, I93Substate::CheckReadOnly);
            return Ok(());
        }
        let mask = self.uid_known().then_some(self.uid);
        self.send_inventory(link, None, mask)?;
        self.enter(I93State::Format, I93Substate::WaitUid);
        Ok(())
    }

    /// Next DSFID/AFI reset, or the lock check once both are done.
    fn format_reset_or_check(&mut self, link: &mut Link) -> Result<()> {
        if self.ndef.reset_dsfid {
            self.ndef.reset_dsfid = false;
            let req = I93Request::new(I93Command::WriteDsfid { dsfid: i93::DSFID_UNSUPPORTED }, self.uid);
            self.send(link, req)?;
            self.set_substate(I93Substate::WaitResetDsfidAfi);
            return Ok(());
        }
        if self.ndef.reset_afi {
            self.ndef.reset_afi = false;
            let req = I93Request::new(I93Command::WriteAfi { afi: 0 }, self.uid);
            self.send(link, req)?;
            self.set_substate(I93Substate::WaitResetDsfidAfi);
            return Ok(());
        }
        self.ndef.sec_block = 0;
        self.set_substate(I93Substate::CheckReadOnly);
        self.request_security(link)
    }

    fn check_no_block_locked(&mut self, link: &mut Link, statuses: &[u8]) -> Result<()> {
        if statuses.iter().any(|s| s & i93::BLOCK_LOCKED != 0) {
            return Err(Error::refused(format!("locked block at or after block {}", self.ndef.sec_block)));
        }
        if self.ndef.afi_checked {
            return self.write_format_image(link);
        }
        self.ndef.sec_block += statuses.len() as u16;
        if !self.sec_block_out_of_range() {
            return self.request_security(link);
        }
        if self.product.is_tag_it_std_pro() {
            // the AFI lives in a block past the user memory
            self.ndef.afi_checked = true;
            let afi_block = i93::TI_STD_PRO_AFI_LOCATION / self.block_size;
            return self.send_read_single(link, afi_block, true);
        }
        self.write_format_image(link)
    }

    fn format_cc3(&self) -> u8 {
        use super::i93::I93Product as P;
        match self.product {
            p if p.is_icode() => {
                if self.ic_reference & i93::ICODE_IC_REF_MBREAD_MASK != 0 {
                    i93::CC3_IPREAD
                } else {
                    i93::CC3_MBREAD
                }
            }
            P::TagItPlusInlay | P::TagItPlusChip => i93::CC3_MBREAD,
            P::TagItStandard | P::TagItPro => 0,
            _ if self.mem_size() / 8 > 0xFF => i93::CC3_MBREAD | i93::CC3_OVERFLOW,
            P::StmLris2k => 0,
            _ => i93::CC3_MBREAD,
        }
    }

    /// CC, empty NDEF TLV and terminator, padded with NULL to whole blocks.
    pub(super) fn format_image(&self) -> Vec<u8> {
        let size = self.mem_size() / 8;
        let cc2 = if size < 0x100 { size as u8 } else { 0xFF };
        let mut image = vec![
            i93::CC_MAGIC,
            i93::CC_VERSION,
            cc2,
            self.format_cc3(),
            tlv::NDEF,
            0x00,
            tlv::TERMINATOR,
            tlv::NULL,
        ];
        let padded = i93::FORMAT_DATA_LEN.div_ceil(self.bs()) * self.bs();
        image.resize(padded, tlv::NULL);
        image
    }

    fn write_format_image(&mut self, link: &mut Link) -> Result<()> {
        let bs = self.bs();
        self.ndef.writes = self
            .format_image()
            .chunks(bs)
            .enumerate()
            .map(|(i, chunk)| (i as u16, chunk.to_vec()))
            .collect();
        self.set_substate(I93Substate::WriteCcNdefTlv);
        self.write_next_format_block(link)
    }

    fn write_next_format_block(&mut self, link: &mut Link) -> Result<()> {
        if let Some((block, data)) = self.ndef.writes.pop_front() {
            return self.send_write_single(link, block, data);
        }
        log::info!("I93 formatted ({} bytes)", self.mem_size());
        self.op_complete();
        link.notify(RwEvent::FormatComplete { status: Status::Ok });
        Ok(())
    }

    fn handle_format_response(&mut self, link: &mut Link, req: &I93Request, payload: &[u8]) -> Result<()> {
        match self.substate {
            I93Substate::WaitUid => {
                self.adopt_inventory(payload)?;
                self.ext_block_numbers = false;
                self.send_sys_info(link, None, false)?;
                self.set_substate(I93Substate::WaitSysInfo);
                Ok(())
            }
            I93Substate::WaitSysInfo => {
                if !self.adopt_system_info(link, payload)? {
                    return Ok(());
                }
                self.ndef.reset_dsfid =
                    self.info_flags & i93::INFO_FLAG_DSFID != 0 && self.dsfid != i93::DSFID_UNSUPPORTED;
                self.ndef.reset_afi = self.info_flags & i93::INFO_FLAG_AFI != 0 && self.afi != 0;
                self.format_reset_or_check(link)
            }
            I93Substate::WaitResetDsfidAfi => {
                match req.command {
                    I93Command::WriteDsfid { dsfid } => self.dsfid = dsfid,
                    I93Command::WriteAfi { afi } => self.afi = afi,
                    _ => {}
                }
                self.format_reset_or_check(link)
            }
            I93Substate::CheckReadOnly => {
                let statuses = self.security_bytes(req, payload)?;
                self.check_no_block_locked(link, statuses)
            }
            I93Substate::WriteCcNdefTlv => self.write_next_format_block(link),
            other => Err(Error::failed(format!("format answer in substate {}", other))),
        }
    }

    // ---- read-only ------------------------------------------------------

    /// Mark the CC read-only, lock every block of the NDEF TLV, then the CC
    /// block.
    pub(super) fn start_set_read_only(&mut self, link: &mut Link) -> Result<()> {
        self.ensure_idle()?;
        if !self.ndef_detected {
            return Err(Error::failed("NDEF not detected"));
        }
        if self.read_only {
            return Err(Error::refused("NDEF is already read-only"));
        }
        self.send_read_single(link, 0, false)?;
        self.enter(I93State::SetReadOnly, I93Substate::WaitCc);
        Ok(())
    }

    fn lock_next_block(&mut self, link: &mut Link) -> Result<()> {
        let Some(block) = self.ndef.locks.pop_front() else {
            self.read_only = true;
            self.max_ndef_length = self.ndef_length;
            log::info!("I93 NDEF set read-only");
            self.op_complete();
            link.notify(RwEvent::SetTagReadOnly { status: Status::Ok });
            return Ok(());
        };
        let cc_block = self.ndef.locks.is_empty() && block == 0 && self.ndef_tlv_start >= self.bs();
        self.set_substate(if cc_block {
            I93Substate::WaitLockCc
        } else {
            I93Substate::LockNdefTlv
        });
        self.send_lock_block(link, block)
    }

    fn handle_set_read_only_response(&mut self, link: &mut Link, req: &I93Request, payload: &[u8]) -> Result<()> {
        match self.substate {
            I93Substate::WaitCc => {
                let (_, block0) = self.read_chunk(req, payload)?;
                let mut block0 = block0.to_vec();
                block0[1] |= i93::CC1_READ_ONLY;
                self.send_write_single(link, 0, block0)?;
                self.set_substate(I93Substate::WaitUpdateCc);
                Ok(())
            }
            I93Substate::WaitUpdateCc => {
                let first = (self.ndef_tlv_start / self.bs()) as u16;
                let last = (self.ndef_tlv_last / self.bs()) as u16;
                self.ndef.locks = (first..=last).collect();
                if first != 0 {
                    self.ndef.locks.push_back(0);
                }
                self.lock_next_block(link)
            }
            I93Substate::LockNdefTlv | I93Substate::WaitLockCc => self.lock_next_block(link),
            other => Err(Error::failed(format!("read-only answer in substate {}", other))),
        }
    }

    // ---- dispatch -------------------------------------------------------

    pub(super) fn handle_ndef_response(&mut self, link: &mut Link, req: &I93Request, payload: &[u8]) -> Result<()> {
        match self.state {
            I93State::DetectNdef => self.handle_detect_response(link, req, payload),
            I93State::ReadNdef => {
                let (offset, chunk) = self.read_chunk(req, payload)?;
                self.consume_ndef(link, chunk, offset)
            }
            I93State::UpdateNdef => self.handle_update_response(link, req, payload),
            I93State::Format => self.handle_format_response(link, req, payload),
            I93State::SetReadOnly => self.handle_set_read_only_response(link, req, payload),
            other => {
                log::warn!("I93 answer ignored in {}", other);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RwConfig;
    use crate::tags::i93::I93Product;
    use crate::tags::TagEngine;
    use crate::test_support::{drive, SimI93, M24LR04E_UID, SLIX_UID};
    use crate::transport::MockTransport;
    use crate::types::I93Uid;

    fn setup(uid: [u8; 8]) -> (I93Engine, Link, MockTransport) {
        let mock = MockTransport::new();
        let link = Link::new(Box::new(mock.clone()), RwConfig::default());
        (I93Engine::new(I93Uid::from_bytes(uid), 0), link, mock)
    }

    fn message(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    fn detect(eng: &mut I93Engine, link: &mut Link, mock: &MockTransport, tag: &mut SimI93) -> NdefDetectData {
        eng.detect_ndef(link).unwrap();
        match drive(eng, link, mock, tag).as_slice() {
            [RwEvent::NdefDetect(d)] => *d,
            other => panic!("unexpected events: {:?}", other),
        }
    }

    fn read_back(eng: &mut I93Engine, link: &mut Link, mock: &MockTransport, tag: &mut SimI93) -> Vec<u8> {
        eng.read_ndef(link).unwrap();
        let events = drive(eng, link, mock, tag);
        assert_eq!(events.last(), Some(&RwEvent::NdefReadComplete));
        events
            .iter()
            .filter_map(|e| match e {
                RwEvent::NdefRead { data } => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn detect_on_icode_slix() {
        let mut tag = SimI93::icode_slix(&[0xD1, 0x01, 0x00]);
        let (mut eng, mut link, mock) = setup(SLIX_UID);
        let d = detect(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(d.status, Status::Ok);
        assert_eq!(d.protocol, Protocol::Iso15693);
        assert_eq!(d.cur_size, 3);
        assert_eq!(d.max_size, 106);
        assert!(d.flags.contains(NdefFlags::SUPPORTED | NdefFlags::FORMATTED | NdefFlags::HARD_LOCKABLE));
        assert!(!d.flags.contains(NdefFlags::READ_ONLY));
        assert_eq!((eng.num_blocks(), eng.block_size()), (28, 4));
        // sysinfo, CC, one multi-block read, one security status batch
        let opcodes: Vec<u8> = tag.log.iter().map(|f| f[1]).collect();
        assert_eq!(
            opcodes,
            vec![
                i93::CMD_GET_SYS_INFO,
                i93::CMD_READ_SINGLE_BLOCK,
                i93::CMD_READ_MULTI_BLOCK,
                i93::CMD_GET_MULTI_BLK_SEC
            ]
        );
    }

    #[test]
    fn detect_large_tag_reserves_long_length_field() {
        let mut tag = SimI93::m24lr04e(&[0xD1]);
        let (mut eng, mut link, mock) = setup(M24LR04E_UID);
        let d = detect(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(d.max_size, 504);
        assert_eq!(eng.product(), I93Product::StmM24lr04eR);
    }

    #[test]
    fn detect_learns_uid_with_inventory() {
        let mut tag = SimI93::icode_slix(&[0xD1]);
        let (mut eng, mut link, mock) = setup([0; 8]);
        let d = detect(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(d.status, Status::Ok);
        assert_eq!(eng.uid(), I93Uid::from_bytes(SLIX_UID));
        assert_eq!(tag.log[0][1], i93::CMD_INVENTORY);
    }

    #[test]
    fn detect_rejects_unknown_dsfid() {
        let mut tag = SimI93::icode_slix(&[0xD1]);
        tag.dsfid = 0x12;
        let (mut eng, mut link, mock) = setup([0; 8]);
        let d = detect(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(d.status, Status::Failed);
        assert_eq!(d.flags, NdefFlags::FORMATABLE | NdefFlags::UNKNOWN);
    }

    #[test]
    fn detect_fails_on_invalid_cc() {
        let mut tag = SimI93::icode_slix(&[0xD1]);
        tag.mem[2] = 0x20;
        let (mut eng, mut link, mock) = setup(SLIX_UID);
        let d = detect(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(d.status, Status::Failed);
        assert_eq!(d.flags, NdefFlags::FORMATABLE | NdefFlags::UNKNOWN);
        assert!(eng.is_idle());
    }

    #[test]
    fn detect_fails_without_ndef_tlv() {
        let mut tag = SimI93::icode_slix(&[]);
        tag.place(4, &[0xFE]);
        let (mut eng, mut link, mock) = setup(SLIX_UID);
        assert_eq!(detect(&mut eng, &mut link, &mock, &mut tag).status, Status::Failed);
    }

    #[test]
    fn locked_block_after_message_limits_max_size() {
        let mut tag = SimI93::icode_slix(&[0xD1, 0x01]);
        tag.locked[10] = true;
        let (mut eng, mut link, mock) = setup(SLIX_UID);
        let d = detect(&mut eng, &mut link, &mock, &mut tag);
        // blocks 1..10 free, value starts at 6
        assert_eq!(d.max_size, 34);
    }

    #[test]
    fn locked_block_inside_message_marks_read_only() {
        let mut tag = SimI93::icode_slix(&message(10));
        tag.locked[2] = true;
        let (mut eng, mut link, mock) = setup(SLIX_UID);
        let d = detect(&mut eng, &mut link, &mock, &mut tag);
        assert!(d.flags.contains(NdefFlags::READ_ONLY));
        assert_eq!(d.max_size, 10);
        assert!(matches!(eng.write_ndef(&mut link, &[1]), Err(Error::Refused(_))));
    }

    #[test]
    fn per_block_security_with_mbread_ic_reference() {
        let mut tag = SimI93::icode_slix(&[0xD1]);
        tag.ic_reference = 0x02;
        let (mut eng, mut link, mock) = setup(SLIX_UID);
        let d = detect(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(d.max_size, 106);
        let with_option = tag
            .log
            .iter()
            .filter(|f| f[1] == i93::CMD_READ_SINGLE_BLOCK && f[0] & i93::FLAG_OPTION != 0)
            .count();
        assert_eq!(with_option, 27);
    }

    #[test]
    fn read_short_message() {
        let msg = message(20);
        let mut tag = SimI93::icode_slix(&msg);
        let (mut eng, mut link, mock) = setup(SLIX_UID);
        detect(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!(read_back(&mut eng, &mut link, &mock, &mut tag), msg);
    }

    #[test]
    fn read_without_detection_or_message() {
        let mut tag = SimI93::icode_slix(&[]);
        let (mut eng, mut link, mock) = setup(SLIX_UID);
        assert!(matches!(eng.read_ndef(&mut link), Err(Error::Failed(_))));
        detect(&mut eng, &mut link, &mock, &mut tag);
        assert!(matches!(eng.read_ndef(&mut link), Err(Error::NotInitialized)));
    }

    #[test]
    fn read_long_message_in_sector_sized_segments() {
        let msg = message(300);
        let mut tag = SimI93::m24lr04e(&msg);
        let (mut eng, mut link, mock) = setup(M24LR04E_UID);
        detect(&mut eng, &mut link, &mock, &mut tag);
        tag.log.clear();
        eng.read_ndef(&mut link).unwrap();
        let events = drive(&mut eng, &mut link, &mock, &mut tag);
        let segments = events.iter().filter(|e| matches!(e, RwEvent::NdefRead { .. })).count();
        assert_eq!(segments, 3);
        for frame in &tag.log {
            assert_eq!(frame[1], i93::CMD_READ_MULTI_BLOCK);
            assert!(frame[11] < 32);
        }
        assert_eq!(read_back(&mut eng, &mut link, &mock, &mut tag), msg);
    }

    #[test]
    fn stm_reads_stay_inside_one_sector() {
        let mut tag = SimI93::m24lr04e(&[]);
        let (mut eng, mut link, mock) = setup(M24LR04E_UID);
        detect(&mut eng, &mut link, &mock, &mut tag);
        mock.take_sent();
        eng.read_blocks_at(&mut link, 30 * 4).unwrap();
        let frame = mock.last_sent().unwrap();
        assert_eq!(&frame[10..], &[30, 1]);
    }

    #[test]
    fn write_zeroes_length_then_writes_it() {
        let msg = message(12);
        let mut tag = SimI93::icode_slix(&[0xD1]);
        let (mut eng, mut link, mock) = setup(SLIX_UID);
        detect(&mut eng, &mut link, &mock, &mut tag);
        tag.log.clear();
        eng.write_ndef(&mut link, &msg).unwrap();
        assert_eq!(drive(&mut eng, &mut link, &mock, &mut tag), vec![RwEvent::NdefUpdateComplete]);

        let writes: Vec<&Vec<u8>> = tag.log.iter().filter(|f| f[1] == i93::CMD_WRITE_SINGLE_BLOCK).collect();
        assert_eq!(&writes[0][10..], &[1, 0x03, 0x00, msg[0], msg[1]]);
        assert_eq!(&writes.last().unwrap()[10..], &[1, 0x03, 12, msg[0], msg[1]]);
        assert_eq!(tag.mem[6 + 12], 0xFE);
        assert_eq!(eng.ndef_sizes().cur_size, 12);
        assert_eq!(read_back(&mut eng, &mut link, &mock, &mut tag), msg);
    }

    #[test]
    fn write_long_message_switches_length_field() {
        let msg = message(400);
        let mut tag = SimI93::m24lr04e(&[0xD1]);
        let (mut eng, mut link, mock) = setup(M24LR04E_UID);
        detect(&mut eng, &mut link, &mock, &mut tag);
        eng.write_ndef(&mut link, &msg).unwrap();
        assert_eq!(drive(&mut eng, &mut link, &mock, &mut tag), vec![RwEvent::NdefUpdateComplete]);
        assert_eq!(&tag.mem[4..8], &[0x03, 0xFF, 0x01, 0x90]);
        assert_eq!(tag.mem[8 + 400], 0xFE);

        let (mut fresh, mut link2, mock2) = setup(M24LR04E_UID);
        let d = detect(&mut fresh, &mut link2, &mock2, &mut tag);
        assert_eq!(d.cur_size, 400);
        assert_eq!(d.max_size, 504);
        assert_eq!(read_back(&mut fresh, &mut link2, &mock2, &mut tag), msg);
    }

    #[test]
    fn empty_message_skips_length_rewrite() {
        let mut tag = SimI93::icode_slix(&message(8));
        let (mut eng, mut link, mock) = setup(SLIX_UID);
        detect(&mut eng, &mut link, &mock, &mut tag);
        tag.log.clear();
        eng.write_ndef(&mut link, &[]).unwrap();
        drive(&mut eng, &mut link, &mock, &mut tag);
        let writes = tag.log.iter().filter(|f| f[1] == i93::CMD_WRITE_SINGLE_BLOCK).count();
        assert_eq!(writes, 1);
        assert_eq!(&tag.mem[4..8], &[0x03, 0x00, 0xFE, 0x00]);
    }

    #[test]
    fn oversized_write_is_refused() {
        let mut tag = SimI93::icode_slix(&[0xD1]);
        let (mut eng, mut link, mock) = setup(SLIX_UID);
        detect(&mut eng, &mut link, &mock, &mut tag);
        assert!(matches!(eng.write_ndef(&mut link, &message(107)), Err(Error::Refused(_))));
        assert!(eng.is_idle());
    }

    #[test]
    fn write_to_locked_block_fails() {
        let mut tag = SimI93::icode_slix(&[0xD1]);
        let (mut eng, mut link, mock) = setup(SLIX_UID);
        detect(&mut eng, &mut link, &mock, &mut tag);
        tag.locked[2] = true;
        eng.write_ndef(&mut link, &message(10)).unwrap();
        assert_eq!(
            drive(&mut eng, &mut link, &mock, &mut tag),
            vec![RwEvent::NdefUpdateFail {
                status: Status::TagError(0x12)
            }]
        );
    }

    #[test]
    fn format_resets_dsfid_and_writes_cc() {
        let mut tag = SimI93::blank(SLIX_UID, 0x01, 4, 28);
        tag.dsfid = 0x05;
        tag.afi = 0x20;
        let (mut eng, mut link, mock) = setup(SLIX_UID);
        eng.format_ndef(&mut link).unwrap();
        assert_eq!(
            drive(&mut eng, &mut link, &mock, &mut tag),
            vec![RwEvent::FormatComplete { status: Status::Ok }]
        );
        assert_eq!((tag.dsfid, tag.afi), (0, 0));
        assert_eq!(&tag.mem[..8], &[0xE1, 0x40, 0x0E, 0x01, 0x03, 0x00, 0xFE, 0x00]);

        let d = detect(&mut eng, &mut link, &mock, &mut tag);
        assert_eq!((d.status, d.cur_size, d.max_size), (Status::Ok, 0, 106));
    }

    #[test]
    fn format_with_locked_block_is_refused() {
        let mut tag = SimI93::blank(SLIX_UID, 0x01, 4, 28);
        tag.locked[20] = true;
        let (mut eng, mut link, mock) = setup(SLIX_UID);
        eng.format_ndef(&mut link).unwrap();
        assert_eq!(
            drive(&mut eng, &mut link, &mock, &mut tag),
            vec![RwEvent::FormatComplete {
                status: Status::Refused
            }]
        );
        assert!(tag.mem.iter().all(|&b| b == 0));
    }

    #[test]
    fn format_image_pads_large_blocks() {
        let (mut eng, _link, _mock) = setup(M24LR04E_UID);
        eng.num_blocks = 2048;
        eng.block_size = 16;
        eng.info_flags = i93::INFO_FLAG_IC_REF;
        eng.ic_reference = i93::STM_M24LR64E_R;
        eng.identify_product();
        let image = eng.format_image();
        assert_eq!(image.len(), 16);
        assert_eq!(&image[..4], &[0xE1, 0x40, 0xFF, i93::CC3_MBREAD | i93::CC3_OVERFLOW]);
        assert!(image[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn icode_cc3_follows_the_ic_reference() {
        let (mut eng, _link, _mock) = setup(SLIX_UID);
        eng.num_blocks = 28;
        eng.block_size = 4;
        eng.info_flags = i93::INFO_FLAG_IC_REF;
        eng.ic_reference = 0x01;
        eng.identify_product();
        assert_eq!(eng.product(), I93Product::IcodeSli);
        assert_eq!(eng.format_image()[3], i93::CC3_MBREAD);

        eng.ic_reference = i93::ICODE_IC_REF_MBREAD_MASK;
        assert_eq!(eng.format_image()[3], i93::CC3_IPREAD);
    }

    #[test]
    fn set_read_only_locks_tlv_blocks_and_cc() {
        let mut tag = SimI93::icode_slix(&message(10));
        let (mut eng, mut link, mock) = setup(SLIX_UID);
        detect(&mut eng, &mut link, &mock, &mut tag);
        eng.set_tag_read_only(&mut link, false).unwrap();
        assert_eq!(
            drive(&mut eng, &mut link, &mock, &mut tag),
            vec![RwEvent::SetTagReadOnly { status: Status::Ok }]
        );
        assert_eq!(tag.mem[1], 0x43);
        // TLV spans offsets 4..=15: blocks 1..=3, then the CC block
        let locked: Vec<usize> = (0..28).filter(|&b| tag.locked[b]).collect();
        assert_eq!(locked, vec![0, 1, 2, 3]);
        let lock_order: Vec<u8> = tag.log.iter().filter(|f| f[1] == i93::CMD_LOCK_BLOCK).map(|f| f[10]).collect();
        assert_eq!(lock_order, vec![1, 2, 3, 0]);
        assert!(matches!(eng.set_tag_read_only(&mut link, true), Err(Error::Refused(_))));

        let d = detect(&mut eng, &mut link, &mock, &mut tag);
        assert!(d.flags.contains(NdefFlags::READ_ONLY));
    }

    #[test]
    fn ti_block_fail_to_write_is_ignored() {
        let uid = [0xE0, 0x07, 0x81, 0x00, 0x01, 0x02, 0x03, 0x04];
        let mut tag = SimI93::blank(uid, 0x00, 4, 64);
        tag.mem[..4].copy_from_slice(&[0xE1, 0x40, 0x20, 0x01]);
        tag.place(4, &[0x03, 0x00, 0xFE]);
        let (mut eng, mut link, mock) = setup(uid);
        assert_eq!(eng.product(), I93Product::TagItPlusChip);
        detect(&mut eng, &mut link, &mock, &mut tag);
        tag.fail_writes_with = Some(i93::ERROR_BLOCK_FAIL_TO_WRITE);
        eng.write_ndef(&mut link, &message(6)).unwrap();
        assert_eq!(drive(&mut eng, &mut link, &mock, &mut tag), vec![RwEvent::NdefUpdateComplete]);
        // writes carry the option flag on TI parts
        let write = tag.log.iter().find(|f| f[1] == i93::CMD_WRITE_SINGLE_BLOCK).unwrap();
        assert_ne!(write[0] & i93::FLAG_OPTION, 0);
        assert_eq!(&tag.mem[4..6], &[0x03, 0x06]);
    }

    #[test]
    fn deactivate_mid_read_drops_the_operation() {
        let mut tag = SimI93::icode_slix(&message(20));
        let (mut eng, mut link, mock) = setup(SLIX_UID);
        detect(&mut eng, &mut link, &mock, &mut tag);
        eng.read_ndef(&mut link).unwrap();
        eng.on_deactivate(&mut link);
        assert!(drive(&mut eng, &mut link, &mock, &mut tag).is_empty());
        assert_eq!(eng.state(), I93State::NotActivated);
    }
}
