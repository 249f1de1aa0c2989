// nfc-rw-rs/nfc-rw/src/tags/t2t.rs
//! Type 2 engine: state machine, sector addressing and response matching.
//!
//! NDEF flows live in [`crate::tags::t2t_ndef`]. Every block number handed
//! to the engine is absolute; a block outside the current sector first
//! goes through the two-step SECTOR SELECT and the original command is
//! sent once the tag has switched.

use derive_more::Display;

use crate::constants::t2t;
use crate::events::{NdefDetectData, NdefFlags, RwEvent, Status};
use crate::protocol::commands::{is_t2t_ack, Command, T2tCommand};
use crate::protocol::lock::{static_lock_bitmap, LockLayout, LockTracker, SegmentBitmap};
use crate::protocol::retry::{Link, RetryCoordinator};
use crate::protocol::tlv::TlvType;
use crate::tags::{log_transition, NdefSizes, TagEngine};
use crate::types::Protocol;
use crate::utils::frame_summary;
use crate::{Error, Result};

/// Top-level state of the Type 2 engine.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum T2tState {
    /// No tag selected
    #[display(fmt = "NOT_ACTIVATED")]
    NotActivated,
    /// Ready for a new operation
    #[display(fmt = "IDLE")]
    Idle,
    /// Raw read outstanding
    #[display(fmt = "READ")]
    Read,
    /// Raw write outstanding
    #[display(fmt = "WRITE")]
    Write,
    /// Raw sector select running
    #[display(fmt = "SELECT_SECTOR")]
    SelectSector,
    /// Lock/Memory Control TLV search
    #[display(fmt = "TLV_DETECT")]
    TlvDetect,
    /// NDEF detection or read running
    #[display(fmt = "READ_NDEF")]
    ReadNdef,
    /// NDEF write running
    #[display(fmt = "WRITE_NDEF")]
    WriteNdef,
    /// Read-only conversion running
    #[display(fmt = "SET_TAG_RO")]
    SetTagRo,
    /// Presence check outstanding
    #[display(fmt = "CHECK_PRESENCE")]
    CheckPresence,
    /// Format running
    #[display(fmt = "FORMAT_TAG")]
    FormatTag,
    /// The tag NAKed twice in a row and is assumed to sit in HALT
    #[display(fmt = "HALT")]
    Halt,
}

/// Step within the current flow.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum T2tSubstate {
    /// No step
    #[display(fmt = "NONE")]
    None,
    /// First sector select frame sent
    #[display(fmt = "WAIT_SELECT_SECTOR_SUPPORT")]
    WaitSelectSectorSupport,
    /// Second sector select frame sent
    #[display(fmt = "WAIT_SELECT_SECTOR")]
    WaitSelectSector,
    /// Reading blocks 0..3
    #[display(fmt = "WAIT_READ_CC")]
    WaitReadCc,
    /// Scanning the TLV area
    #[display(fmt = "WAIT_TLV_DETECT")]
    WaitTlvDetect,
    /// Reading dynamic lock bytes
    #[display(fmt = "WAIT_READ_LOCKS")]
    WaitReadLocks,
    /// Reading NDEF payload
    #[display(fmt = "WAIT_READ_NDEF_BLOCK")]
    WaitReadNdefBlock,
    /// Reading the first block the new message touches
    #[display(fmt = "WAIT_READ_NDEF_FIRST_BLOCK")]
    WaitReadNdefFirstBlock,
    /// Reading the last block the new message touches
    #[display(fmt = "WAIT_READ_NDEF_LAST_BLOCK")]
    WaitReadNdefLastBlock,
    /// Reading the block that will hold the terminator
    #[display(fmt = "WAIT_READ_TERM_TLV_BLOCK")]
    WaitReadTermTlvBlock,
    /// Reading a block the write only partly covers
    #[display(fmt = "WAIT_READ_NDEF_NEXT_BLOCK")]
    WaitReadNdefNextBlock,
    /// Writing message blocks
    #[display(fmt = "WAIT_WRITE_NDEF_NEXT_BLOCK")]
    WaitWriteNdefNextBlock,
    /// Writing the final NDEF length
    #[display(fmt = "WAIT_WRITE_NDEF_LEN_BLOCK")]
    WaitWriteNdefLenBlock,
    /// Writing the terminator TLV
    #[display(fmt = "WAIT_WRITE_TERM_TLV")]
    WaitWriteTermTlv,
    /// Reading the version block for the model table
    #[display(fmt = "WAIT_READ_VERSION_INFO")]
    WaitReadVersionInfo,
    /// Writing the CC
    #[display(fmt = "WAIT_SET_CC")]
    WaitSetCc,
    /// Writing the Lock Control TLV
    #[display(fmt = "WAIT_SET_LOCK_TLV")]
    WaitSetLockTlv,
    /// Writing the empty NDEF TLV
    #[display(fmt = "WAIT_SET_NULL_NDEF")]
    WaitSetNullNdef,
    /// Writing the read-only CC
    #[display(fmt = "WAIT_SET_CC_RO")]
    WaitSetCcRo,
    /// Reading a block of dynamic lock bytes
    #[display(fmt = "WAIT_READ_DYN_LOCK_BYTE_BLOCK")]
    WaitReadDynLockByteBlock,
    /// Setting dynamic lock bits
    #[display(fmt = "WAIT_SET_DYN_LOCK_BITS")]
    WaitSetDynLockBits,
    /// Setting the static lock bytes
    #[display(fmt = "WAIT_SET_ST_LOCK_BITS")]
    WaitSetStLockBits,
}

/// A block access expressed with an absolute block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BlockOp {
    Read(u16),
    Write(u16, [u8; t2t::BLOCK_SIZE]),
}

impl BlockOp {
    fn block(&self) -> u16 {
        match *self {
            BlockOp::Read(b) | BlockOp::Write(b, _) => b,
        }
    }

    fn command(&self) -> T2tCommand {
        let block = (self.block() % t2t::BLOCKS_PER_SECTOR) as u8;
        match *self {
            BlockOp::Read(_) => T2tCommand::Read { block },
            BlockOp::Write(_, data) => T2tCommand::Write { block, data },
        }
    }
}

/// Type 2 tag engine.
#[derive(Debug)]
pub struct T2tEngine {
    pub(super) state: T2tState,
    pub(super) substate: T2tSubstate,
    /// Substate to resume once a sector change completes
    pub(super) prev_substate: T2tSubstate,
    pub(super) retry: RetryCoordinator,
    /// Blocks 0..3 (UID, lock bytes, CC)
    pub(super) tag_hdr: [u8; t2t::READ_DATA_LEN],
    pub(super) hdr_valid: bool,
    /// Blocks 4..7 as read during detection
    pub(super) tag_data: [u8; t2t::READ_DATA_LEN],
    pub(super) data_valid: bool,
    pub(super) sector: u8,
    pub(super) select_sector: u8,
    /// Command waiting for a sector change to finish
    pub(super) deferred: Option<T2tCommand>,
    pub(super) block_read: u16,
    pub(super) block_written: u16,
    /// Set after a NAK was answered with one retransmission
    pub(super) check_tag_halt: bool,
    pub(super) locks: LockTracker,
    pub(super) tlv_wanted: TlvType,
    pub(super) skip_dyn_locks: bool,
    pub(super) ndef_detected: bool,
    /// Tag offset of the NDEF length field
    pub(super) ndef_header_offset: usize,
    /// Tag offset of the first NDEF message byte
    pub(super) ndef_msg_offset: usize,
    pub(super) ndef_msg_len: usize,
    pub(super) max_ndef_msg_len: usize,
    pub(super) prop_msg_len: usize,
    pub(super) ndef: super::t2t_ndef::T2tNdefOp,
}

impl Default for T2tEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl T2tEngine {
    /// Engine for a freshly activated tag, in sector 0.
    pub fn new() -> Self {
        log::info!("T2T activated");
        Self {
            state: T2tState::Idle,
            substate: T2tSubstate::None,
            prev_substate: T2tSubstate::None,
            retry: RetryCoordinator::new(),
            tag_hdr: [0; t2t::READ_DATA_LEN],
            hdr_valid: false,
            tag_data: [0; t2t::READ_DATA_LEN],
            data_valid: false,
            sector: 0,
            select_sector: 0,
            deferred: None,
            block_read: 0,
            block_written: 0,
            check_tag_halt: false,
            locks: LockTracker::new(LockLayout::TYPE2),
            tlv_wanted: TlvType::Ndef,
            skip_dyn_locks: false,
            ndef_detected: false,
            ndef_header_offset: 0,
            ndef_msg_offset: 0,
            ndef_msg_len: 0,
            max_ndef_msg_len: 0,
            prop_msg_len: 0,
            ndef: Default::default(),
        }
    }

    /// Current state.
    pub fn state(&self) -> T2tState {
        self.state
    }

    /// Current substate.
    pub fn substate(&self) -> T2tSubstate {
        self.substate
    }

    /// Sector the tag currently addresses.
    pub fn sector(&self) -> u8 {
        self.sector
    }

    /// Cached blocks 0..3, if read.
    pub fn header(&self) -> Option<&[u8; t2t::READ_DATA_LEN]> {
        self.hdr_valid.then_some(&self.tag_hdr)
    }

    /// Lock and reserved byte bookkeeping.
    pub fn lock_tracker(&self) -> &LockTracker {
        &self.locks
    }

    pub(super) fn set_state(&mut self, state: T2tState) {
        log_transition("T2T", &self.state, &state);
        self.state = state;
    }

    pub(super) fn set_substate(&mut self, substate: T2tSubstate) {
        if self.substate != substate {
            log::trace!("T2T substate: {} -> {}", self.substate, substate);
        }
        self.substate = substate;
    }

    fn send_with_timeout(&mut self, link: &mut Link, cmd: T2tCommand, timeout: u32) -> Result<()> {
        log::trace!("T2T send opcode={:#04x}", cmd.opcode());
        self.retry.send(link, Command::Type2(cmd), timeout)
    }

    pub(super) fn send(&mut self, link: &mut Link, cmd: T2tCommand) -> Result<()> {
        let timeout = link.config().t2t_response_timeout_ms;
        self.send_with_timeout(link, cmd, timeout)
    }

    pub(super) fn ensure_idle(&self) -> Result<()> {
        match self.state {
            T2tState::Idle => Ok(()),
            T2tState::NotActivated => Err(Error::NotActivated),
            T2tState::Halt => Err(Error::rejected("tag is in HALT")),
            _ => {
                log::warn!("T2T busy in state {}", self.state);
                Err(Error::Busy)
            }
        }
    }

    /// Enter `substate` and issue `op`, selecting its sector first when
    /// needed. The substate is restored once the sector change is done.
    pub(super) fn issue(&mut self, link: &mut Link, substate: T2tSubstate, op: BlockOp) -> Result<()> {
        let block = op.block();
        let sector = (block / t2t::BLOCKS_PER_SECTOR) as u8;
        if sector >= t2t::MAX_SECTOR {
            return Err(Error::InvalidParameter(format!("block {} beyond last sector", block)));
        }
        match op {
            BlockOp::Read(b) => self.block_read = b,
            BlockOp::Write(b, _) => self.block_written = b,
        }
        self.set_substate(substate);
        if sector != self.sector {
            log::debug!("T2T block {} needs sector {} (current {})", block, sector, self.sector);
            self.send(link, T2tCommand::SectorSelect)?;
            self.select_sector = sector;
            self.deferred = Some(op.command());
            self.prev_substate = substate;
            self.set_substate(T2tSubstate::WaitSelectSectorSupport);
            return Ok(());
        }
        self.send(link, op.command())
    }

    /// First command of an operation: nothing changes when the send fails.
    pub(super) fn launch(&mut self, link: &mut Link, state: T2tState, substate: T2tSubstate, op: BlockOp) -> Result<()> {
        if let Err(e) = self.issue(link, substate, op) {
            self.set_substate(T2tSubstate::None);
            return Err(e);
        }
        self.set_state(state);
        Ok(())
    }

    /// Back to IDLE, or stay in HALT. The detection data cache does not
    /// survive NDEF reads and writes.
    pub(super) fn op_complete(&mut self) {
        if matches!(self.state, T2tState::ReadNdef | T2tState::WriteNdef) {
            self.data_valid = false;
        }
        self.deferred = None;
        if self.state != T2tState::Halt {
            self.set_state(T2tState::Idle);
        }
        self.set_substate(T2tSubstate::None);
    }

    /// Terminal event of the current operation for a failure `status`.
    pub(super) fn failure_event(&self, status: Status) -> RwEvent {
        match self.state {
            T2tState::TlvDetect if self.tlv_wanted == TlvType::Ndef => {
                let flags = if self.substate == T2tSubstate::WaitReadLocks {
                    NdefFlags::FORMATTED
                } else {
                    NdefFlags::UNKNOWN
                };
                RwEvent::NdefDetect(NdefDetectData::failed(Protocol::Type2, status, flags))
            }
            T2tState::TlvDetect => RwEvent::TlvDetect {
                status,
                num_bytes: 0,
            },
            T2tState::ReadNdef => RwEvent::NdefReadFail { status },
            T2tState::WriteNdef => RwEvent::NdefUpdateFail { status },
            T2tState::SetTagRo => RwEvent::SetTagReadOnly { status },
            T2tState::CheckPresence => RwEvent::PresenceCheck { status },
            T2tState::FormatTag => RwEvent::FormatComplete { status },
            T2tState::SelectSector => RwEvent::SectorSelected { status },
            T2tState::Read => RwEvent::ReadComplete {
                status,
                data: Vec::new(),
            },
            T2tState::Write => RwEvent::WriteComplete {
                status,
                data: Vec::new(),
            },
            T2tState::Idle | T2tState::NotActivated | T2tState::Halt => {
                RwEvent::InterfaceError { status }
            }
        }
    }

    /// End the current operation with a failure event.
    pub(super) fn fail(&mut self, link: &mut Link, status: Status) {
        let event = self.failure_event(status);
        self.op_complete();
        link.notify(event);
    }

    /// End the current operation with `Rejected` and park the engine in
    /// HALT until the tag is deactivated.
    fn halt(&mut self, link: &mut Link) {
        log::warn!("T2T tag assumed in HALT during {}", self.state);
        self.check_tag_halt = false;
        let event = self.failure_event(Status::Rejected);
        self.op_complete();
        self.set_state(T2tState::Halt);
        link.notify(event);
    }

    /// Retransmit the outstanding command or fail the operation. Returns
    /// true when the command went out again.
    fn process_error(&mut self, link: &mut Link) -> bool {
        if !self.check_tag_halt && self.retry.retransmit(link) {
            return true;
        }
        log::error!("T2T {} failed after {} retries", self.state, self.retry.retry_count());
        link.stats_mut().record_failure();
        if self.check_tag_halt {
            self.halt(link);
        } else {
            self.fail(link, Status::Timeout);
        }
        false
    }

    /// A NAK gets one retransmission; a second one in a row means HALT.
    fn handle_nak(&mut self, link: &mut Link, data: &[u8]) {
        log::warn!("T2T NAK [{}] in {}/{}", frame_summary(data), self.state, self.substate);
        if self.check_tag_halt {
            link.stats_mut().record_failure();
            self.halt(link);
        } else if self.process_error(link) {
            self.check_tag_halt = true;
        }
    }

    /// Presence lost: HALT when the tag had just NAKed, plain failure
    /// otherwise.
    fn presence_lost(&mut self, link: &mut Link) {
        link.stats_mut().record_failure();
        if self.check_tag_halt {
            self.halt(link);
        } else {
            self.fail(link, Status::Failed);
        }
    }

    /// The sector change went through: send the command that waited for it.
    fn resume_after_sector_change(&mut self, link: &mut Link) {
        self.sector = self.select_sector;
        log::debug!("T2T now in sector {}", self.sector);
        if self.state == T2tState::SelectSector {
            self.op_complete();
            link.notify(RwEvent::SectorSelected { status: Status::Ok });
            return;
        }
        let substate = self.prev_substate;
        self.set_substate(substate);
        let result = match self.deferred.take() {
            Some(cmd) => self.send(link, cmd),
            None => Err(Error::failed("no command waiting for the sector change")),
        };
        if let Err(e) = result {
            log::error!("T2T resume after sector change failed: {}", e);
            self.fail(link, super::error_status(&e));
        }
    }

    /// Keep blocks 0..3 and derive the static reserved and read-only areas.
    pub(super) fn store_header(&mut self, data: &[u8]) {
        self.tag_hdr.copy_from_slice(&data[..t2t::READ_DATA_LEN]);
        self.hdr_valid = true;
        let tms = self.tag_hdr[t2t::CC_TMS_BYTE];
        if self.tag_hdr[0] == t2t::MANUFACTURER_NXP
            && (t2t::INVALID_CC_TMS_LOW..=t2t::INVALID_CC_TMS_HIGH).contains(&tms)
        {
            log::info!("T2T correcting TMS {:#04x} to {:#04x}", tms, t2t::ULTRALIGHT_C_TMS);
            self.tag_hdr[t2t::CC_TMS_BYTE] = t2t::ULTRALIGHT_C_TMS;
        }
        self.apply_static_attributes();
    }

    pub(super) fn apply_static_attributes(&mut self) {
        let mut reserved = SegmentBitmap::new();
        reserved.set_range(0..t2t::HEADER_SIZE);
        self.locks.set_static_reserved(reserved);
        self.locks.set_static_read_only(static_lock_bitmap(
            self.tag_hdr[t2t::LOCK_0_OFFSET],
            self.tag_hdr[t2t::LOCK_0_OFFSET + 1],
            t2t::BLOCK_SIZE,
            &[0, 1],
        ));
    }

    // ---- raw commands ---------------------------------------------------

    /// READ 16 bytes starting at absolute block `block`.
    pub fn read(&mut self, link: &mut Link, block: u16) -> Result<()> {
        self.ensure_idle()?;
        self.launch(link, T2tState::Read, T2tSubstate::None, BlockOp::Read(block))
    }

    /// WRITE one block at absolute block `block`.
    pub fn write(&mut self, link: &mut Link, block: u16, data: [u8; t2t::BLOCK_SIZE]) -> Result<()> {
        self.ensure_idle()?;
        if block < t2t::FIRST_DATA_BLOCK {
            self.hdr_valid = false;
        } else if block < t2t::FIRST_DATA_BLOCK + t2t::BLOCKS_PER_READ as u16 {
            self.data_valid = false;
        }
        self.launch(link, T2tState::Write, T2tSubstate::None, BlockOp::Write(block, data))
    }

    /// Switch the tag to `sector`. Completion is reported with
    /// [`RwEvent::SectorSelected`].
    pub fn sector_select(&mut self, link: &mut Link, sector: u8) -> Result<()> {
        self.ensure_idle()?;
        if sector >= t2t::MAX_SECTOR {
            return Err(Error::refused(format!("sector {} not supported", sector)));
        }
        self.send(link, T2tCommand::SectorSelect)?;
        self.select_sector = sector;
        self.set_state(T2tState::SelectSector);
        self.set_substate(T2tSubstate::WaitSelectSectorSupport);
        Ok(())
    }

    // ---- inbound --------------------------------------------------------

    fn outstanding_op(&self) -> Option<T2tCommand> {
        if matches!(self.state, T2tState::Idle | T2tState::NotActivated) {
            return None;
        }
        match self.retry.pending_command() {
            Some(Command::Type2(cmd)) => Some(cmd.clone()),
            _ => None,
        }
    }

    fn handle_sector_response(&mut self, link: &mut Link, data: &[u8]) {
        if self.substate == T2tSubstate::WaitSelectSector {
            // a successful sector change is never answered
            log::warn!("T2T sector change answered [{}]", frame_summary(data));
            self.fail(link, Status::Failed);
            return;
        }
        if !is_t2t_ack(data) {
            log::warn!("T2T tag does not support sector select");
            self.fail(link, Status::Rejected);
            return;
        }
        let timeout = link.config().t2t_sector_select_timeout_ms;
        let sector = self.select_sector;
        match self.send_with_timeout(link, T2tCommand::SectorChange { sector }, timeout) {
            Ok(()) => self.set_substate(T2tSubstate::WaitSelectSector),
            Err(e) => self.fail(link, super::error_status(&e)),
        }
    }

    fn handle_response(&mut self, link: &mut Link, data: &[u8]) {
        match self.state {
            T2tState::CheckPresence => {
                self.op_complete();
                link.notify(RwEvent::PresenceCheck { status: Status::Ok });
            }
            T2tState::Read => {
                if self.block_read == 0 {
                    self.store_header(data);
                }
                self.op_complete();
                link.notify(RwEvent::ReadComplete {
                    status: Status::Ok,
                    data: data.to_vec(),
                });
            }
            T2tState::Write => {
                self.op_complete();
                link.notify(RwEvent::WriteComplete {
                    status: Status::Ok,
                    data: data.to_vec(),
                });
            }
            _ => {
                if let Err(e) = self.handle_ndef_response(link, data) {
                    log::error!("T2T {} aborted: {}", self.state, e);
                    self.fail(link, super::error_status(&e));
                }
            }
        }
    }
}

impl TagEngine for T2tEngine {
    fn protocol(&self) -> Protocol {
        Protocol::Type2
    }

    fn is_idle(&self) -> bool {
        self.state == T2tState::Idle
    }

    fn detect_ndef(&mut self, link: &mut Link) -> Result<()> {
        self.detect_ndef_ext(link, false)
    }

    fn read_ndef(&mut self, link: &mut Link) -> Result<()> {
        self.start_read_ndef(link)
    }

    fn write_ndef(&mut self, link: &mut Link, message: &[u8]) -> Result<()> {
        self.start_write_ndef(link, message)
    }

    fn format_ndef(&mut self, link: &mut Link) -> Result<()> {
        self.start_format(link)
    }

    fn set_tag_read_only(&mut self, link: &mut Link, hard_lock: bool) -> Result<()> {
        self.start_set_read_only(link, hard_lock)
    }

    /// READ of block 0 in the current sector; no sector change.
    fn presence_check(&mut self, link: &mut Link) -> Result<()> {
        self.ensure_idle()?;
        self.send(link, T2tCommand::Read { block: 0 })?;
        self.set_state(T2tState::CheckPresence);
        Ok(())
    }

    fn on_response(&mut self, link: &mut Link, data: &[u8]) {
        log::trace!("T2T rx [{}] in {}/{}", frame_summary(data), self.state, self.substate);
        match self.state {
            T2tState::NotActivated => {
                log::debug!("T2T frame ignored: not activated");
                return;
            }
            T2tState::Halt => {
                log::debug!("T2T frame dropped in HALT");
                return;
            }
            _ => {}
        }
        let Some(op) = self.outstanding_op() else {
            link.notify(RwEvent::RawFrame {
                status: Status::Ok,
                data: data.to_vec(),
            });
            return;
        };
        link.stats_mut().record_rx(data.len());
        link.cancel_timer();

        let info = op.rsp_info();
        if self.substate != T2tSubstate::WaitSelectSector
            && data.len() != info.rsp_len
            && data.len() != info.nack_rsp_len
        {
            log::warn!(
                "T2T unexpected response to opcode {:#04x}: len={} (expected {})",
                info.opcode,
                data.len(),
                info.rsp_len
            );
            link.stats_mut().record_frame_error();
            self.process_error(link);
            self.check_tag_halt = false;
            return;
        }

        if matches!(
            self.substate,
            T2tSubstate::WaitSelectSectorSupport | T2tSubstate::WaitSelectSector
        ) {
            self.retry.acknowledge(link);
            self.handle_sector_response(link, data);
            return;
        }

        let is_write = matches!(op, T2tCommand::Write { .. });
        if data.len() != info.rsp_len || (is_write && !is_t2t_ack(data)) {
            self.handle_nak(link, data);
            return;
        }

        self.check_tag_halt = false;
        let retries = self.retry.acknowledge(link);
        if retries > 0 {
            log::debug!("T2T answer after {} retransmissions", retries);
        }
        self.handle_response(link, data);
    }

    fn on_timeout(&mut self, link: &mut Link) {
        match self.state {
            T2tState::NotActivated | T2tState::Idle | T2tState::Halt => {
                log::debug!("T2T timeout ignored in {}", self.state);
            }
            T2tState::CheckPresence => {
                log::debug!("T2T presence check timed out");
                self.presence_lost(link);
            }
            _ if self.substate == T2tSubstate::WaitSelectSector => {
                self.resume_after_sector_change(link);
            }
            _ => {
                log::warn!("T2T response timeout in {}/{}", self.state, self.substate);
                self.process_error(link);
            }
        }
    }

    fn on_transport_error(&mut self, link: &mut Link, code: u8) {
        link.stats_mut().record_transport_error();
        match self.state {
            T2tState::NotActivated | T2tState::Idle | T2tState::Halt => {
                link.notify(RwEvent::InterfaceError {
                    status: Status::TransportError(code),
                });
            }
            T2tState::CheckPresence => {
                link.cancel_timer();
                self.presence_lost(link);
            }
            _ => {
                log::warn!("T2T transport error {:#04x} in {}", code, self.state);
                link.cancel_timer();
                self.process_error(link);
            }
        }
    }

    fn on_deactivate(&mut self, link: &mut Link) {
        self.retry.release(link);
        self.deferred = None;
        self.check_tag_halt = false;
        self.hdr_valid = false;
        self.data_valid = false;
        self.ndef = Default::default();
        self.set_state(T2tState::NotActivated);
        self.set_substate(T2tSubstate::None);
    }

    fn ndef_sizes(&self) -> NdefSizes {
        NdefSizes {
            cur_size: self.ndef_msg_len as u32,
            max_size: self.max_ndef_msg_len as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RwConfig;
    use crate::transport::MockTransport;

    const ACK: [u8; 1] = [0x0A];
    const NAK: [u8; 1] = [0x00];

    fn setup() -> (T2tEngine, Link, MockTransport) {
        let mock = MockTransport::new();
        let link = Link::new(Box::new(mock.clone()), RwConfig::default());
        (T2tEngine::new(), link, mock)
    }

    fn header() -> [u8; 16] {
        [
            0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x48, 0x00, 0x00, 0xE1, 0x10, 0x06, 0x00,
        ]
    }

    #[test]
    fn raw_read_of_block_zero_caches_header() {
        let (mut eng, mut link, mock) = setup();
        eng.read(&mut link, 0).unwrap();
        assert_eq!(mock.last_sent().unwrap(), vec![0x30, 0x00]);
        eng.on_response(&mut link, &header());
        assert_eq!(
            link.drain_events(),
            vec![RwEvent::ReadComplete {
                status: Status::Ok,
                data: header().to_vec()
            }]
        );
        assert_eq!(eng.header(), Some(&header()));
    }

    #[test]
    fn corrupt_ultralight_c_tms_is_corrected() {
        let (mut eng, mut link, _mock) = setup();
        let mut hdr = header();
        hdr[t2t::CC_TMS_BYTE] = 0x1A;
        eng.read(&mut link, 0).unwrap();
        eng.on_response(&mut link, &hdr);
        assert_eq!(eng.header().unwrap()[t2t::CC_TMS_BYTE], t2t::ULTRALIGHT_C_TMS);
    }

    #[test]
    fn read_in_other_sector_selects_it_first() {
        let (mut eng, mut link, mock) = setup();
        eng.read(&mut link, 260).unwrap();
        assert_eq!(mock.last_sent().unwrap(), vec![0xC2, 0xFF]);
        assert_eq!(eng.substate(), T2tSubstate::WaitSelectSectorSupport);

        eng.on_response(&mut link, &ACK);
        assert_eq!(mock.last_sent().unwrap(), vec![0x01, 0x00, 0x00, 0x00]);
        assert_eq!(mock.armed_timer(), Some(10));

        // silence means the tag switched
        eng.on_timeout(&mut link);
        assert_eq!(eng.sector(), 1);
        assert_eq!(mock.last_sent().unwrap(), vec![0x30, 0x04]);
        assert_eq!(eng.substate(), T2tSubstate::None);

        eng.on_response(&mut link, &[0x5A; 16]);
        assert!(matches!(
            link.drain_events().as_slice(),
            [RwEvent::ReadComplete {
                status: Status::Ok,
                ..
            }]
        ));
    }

    #[test]
    fn sector_select_without_support_is_rejected() {
        let (mut eng, mut link, _mock) = setup();
        eng.sector_select(&mut link, 1).unwrap();
        eng.on_response(&mut link, &NAK);
        assert_eq!(
            link.drain_events(),
            vec![RwEvent::SectorSelected {
                status: Status::Rejected
            }]
        );
        assert!(eng.is_idle());
        assert_eq!(eng.sector(), 0);
    }

    #[test]
    fn answered_sector_change_fails() {
        let (mut eng, mut link, _mock) = setup();
        eng.sector_select(&mut link, 1).unwrap();
        eng.on_response(&mut link, &ACK);
        eng.on_response(&mut link, &NAK);
        assert_eq!(
            link.drain_events(),
            vec![RwEvent::SectorSelected {
                status: Status::Failed
            }]
        );
    }

    #[test]
    fn sector_select_completes_on_timeout() {
        let (mut eng, mut link, _mock) = setup();
        eng.sector_select(&mut link, 1).unwrap();
        eng.on_response(&mut link, &ACK);
        eng.on_timeout(&mut link);
        assert_eq!(
            link.drain_events(),
            vec![RwEvent::SectorSelected { status: Status::Ok }]
        );
        assert_eq!(eng.sector(), 1);
        assert!(matches!(eng.sector_select(&mut link, 2), Err(Error::Refused(_))));
    }

    #[test]
    fn write_nak_twice_enters_halt() {
        let (mut eng, mut link, mock) = setup();
        eng.write(&mut link, 4, [1, 2, 3, 4]).unwrap();
        eng.on_response(&mut link, &NAK);
        // one retransmission
        assert_eq!(mock.sent_count(), 2);
        assert!(!link.has_events());
        eng.on_response(&mut link, &NAK);
        assert_eq!(
            link.drain_events(),
            vec![RwEvent::WriteComplete {
                status: Status::Rejected,
                data: vec![]
            }]
        );
        assert_eq!(eng.state(), T2tState::Halt);
        assert!(matches!(eng.read(&mut link, 0), Err(Error::Rejected(_))));
        // frames are dropped in HALT
        eng.on_response(&mut link, &ACK);
        assert!(!link.has_events());
    }

    #[test]
    fn nak_then_silence_enters_halt() {
        let (mut eng, mut link, _mock) = setup();
        eng.read(&mut link, 4).unwrap();
        eng.on_response(&mut link, &NAK);
        eng.on_timeout(&mut link);
        assert_eq!(
            link.drain_events(),
            vec![RwEvent::ReadComplete {
                status: Status::Rejected,
                data: vec![]
            }]
        );
        assert_eq!(eng.state(), T2tState::Halt);
    }

    #[test]
    fn nak_then_success_clears_halt_check() {
        let (mut eng, mut link, _mock) = setup();
        eng.write(&mut link, 4, [1, 2, 3, 4]).unwrap();
        eng.on_response(&mut link, &NAK);
        eng.on_response(&mut link, &ACK);
        assert!(matches!(
            link.drain_events().as_slice(),
            [RwEvent::WriteComplete {
                status: Status::Ok,
                ..
            }]
        ));
        assert!(!eng.check_tag_halt);
        assert!(eng.is_idle());
    }

    #[test]
    fn timeouts_retry_up_to_ceiling() {
        let (mut eng, mut link, mock) = setup();
        eng.read(&mut link, 8).unwrap();
        for _ in 0..3 {
            eng.on_timeout(&mut link);
        }
        assert_eq!(mock.sent_count(), 4);
        eng.on_timeout(&mut link);
        assert_eq!(
            link.drain_events(),
            vec![RwEvent::ReadComplete {
                status: Status::Timeout,
                data: vec![]
            }]
        );
        assert_eq!(link.stats().num_retries, 3);
        assert!(eng.is_idle());
    }

    #[test]
    fn presence_check_reads_block_zero_of_current_sector() {
        let (mut eng, mut link, mock) = setup();
        eng.presence_check(&mut link).unwrap();
        assert_eq!(mock.last_sent().unwrap(), vec![0x30, 0x00]);
        eng.on_response(&mut link, &header());
        assert_eq!(
            link.drain_events(),
            vec![RwEvent::PresenceCheck { status: Status::Ok }]
        );
    }

    #[test]
    fn presence_lost_after_nak_is_halt() {
        let (mut eng, mut link, _mock) = setup();
        eng.presence_check(&mut link).unwrap();
        eng.on_response(&mut link, &NAK);
        eng.on_timeout(&mut link);
        assert_eq!(
            link.drain_events(),
            vec![RwEvent::PresenceCheck {
                status: Status::Rejected
            }]
        );
        assert_eq!(eng.state(), T2tState::Halt);
    }

    #[test]
    fn presence_timeout_fails() {
        let (mut eng, mut link, mock) = setup();
        eng.presence_check(&mut link).unwrap();
        eng.on_timeout(&mut link);
        assert_eq!(mock.sent_count(), 1);
        assert_eq!(
            link.drain_events(),
            vec![RwEvent::PresenceCheck {
                status: Status::Failed
            }]
        );
    }

    #[test]
    fn wrong_length_is_a_frame_error() {
        let (mut eng, mut link, mock) = setup();
        eng.read(&mut link, 4).unwrap();
        eng.on_response(&mut link, &[0x00; 5]);
        assert_eq!(link.stats().num_crc, 1);
        assert_eq!(mock.sent_count(), 2);
    }

    #[test]
    fn transport_error_in_halt_is_interface_error() {
        let (mut eng, mut link, _mock) = setup();
        eng.write(&mut link, 4, [0; 4]).unwrap();
        eng.on_response(&mut link, &NAK);
        eng.on_response(&mut link, &NAK);
        link.drain_events();
        eng.on_transport_error(&mut link, 0x03);
        assert_eq!(
            link.drain_events(),
            vec![RwEvent::InterfaceError {
                status: Status::TransportError(0x03)
            }]
        );
    }

    #[test]
    fn deactivate_forgets_pending_sector_change() {
        let (mut eng, mut link, mock) = setup();
        eng.read(&mut link, 300).unwrap();
        eng.on_deactivate(&mut link);
        assert_eq!(eng.state(), T2tState::NotActivated);
        assert!(eng.deferred.is_none());
        assert_eq!(mock.armed_timer(), None);
        eng.on_timeout(&mut link);
        assert!(!link.has_events());
    }
}
