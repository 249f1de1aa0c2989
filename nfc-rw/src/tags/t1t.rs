// nfc-rw-rs/nfc-rw/src/tags/t1t.rs
//! Type 1 (Topaz) engine: state machine, raw commands and response matching.
//!
//! NDEF flows live in [`crate::tags::t1t_ndef`].

use derive_more::Display;

use crate::constants::t1t;
use crate::events::{NdefDetectData, NdefFlags, RwEvent, Status};
use crate::protocol::commands::{Command, T1tCommand};
use crate::protocol::lock::{LockLayout, LockTracker};
use crate::protocol::retry::{Link, RetryCoordinator};
use crate::protocol::tlv::TlvType;
use crate::tags::{log_transition, NdefSizes, TagEngine};
use crate::types::{HeaderRom, Protocol, T1tUid};
use crate::utils::frame_summary;
use crate::{Error, Result};

/// Top-level state of the Type 1 engine.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum T1tState {
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
}

/// Step within the current NDEF flow.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum T1tSubstate {
    /// No step
    #[display(fmt = "NONE")]
    None,
    /// Waiting for RALL or the first segment
    #[display(fmt = "WAIT_READ_TAG_MEM")]
    WaitReadTagMemory,
    /// Reading dynamic lock bytes
    #[display(fmt = "WAIT_READ_LOCKS")]
    WaitReadLocks,
    /// Reading NDEF blocks beyond the first segment
    #[display(fmt = "WAIT_READ_NDEF_BLOCK")]
    WaitReadNdefBlock,
    /// Clearing the NMN or the length field
    #[display(fmt = "WAIT_INVALIDATE_NDEF")]
    WaitInvalidateNdef,
    /// Writing message bytes
    #[display(fmt = "WAIT_NDEF_WRITE")]
    WaitNdefWrite,
    /// Writing the final length or the NMN
    #[display(fmt = "WAIT_VALIDATE_NDEF")]
    WaitValidateNdef,
    /// Writing the read-only CC access byte
    #[display(fmt = "WAIT_SET_CC_RWA_RO")]
    WaitSetCcRwaRo,
    /// Setting the static lock bytes
    #[display(fmt = "WAIT_SET_ST_LOCK_BITS")]
    WaitSetStaticLockBits,
    /// Setting the dynamic lock bytes
    #[display(fmt = "WAIT_SET_DYN_LOCK_BITS")]
    WaitSetDynamicLockBits,
    /// Writing the CC
    #[display(fmt = "WAIT_SET_CC")]
    WaitSetCc,
    /// Writing the empty NDEF TLV
    #[display(fmt = "WAIT_SET_NULL_NDEF")]
    WaitSetNullNdef,
}

/// What the capability container and the TLV area say about the tag.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default)]
pub enum T1tAttribute {
    /// Not determined yet
    #[default]
    #[display(fmt = "UNKNOWN")]
    Unknown,
    /// Valid CC, no NDEF TLV
    #[display(fmt = "INITIALIZED")]
    Initialized,
    /// NDEF TLV present with an empty message
    #[display(fmt = "INITIALIZED_NDEF")]
    InitializedNdef,
    /// NDEF message present, writable
    #[display(fmt = "READ_WRITE")]
    ReadWrite,
    /// NDEF message present, read-only
    #[display(fmt = "READ_ONLY")]
    ReadOnly,
}

/// Response still expected for a command that was retransmitted. Frames
/// matching it are dropped instead of being taken for the next answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct StaleResponse {
    pub opcode: u8,
    pub addr: u8,
    pub rsp_len: usize,
    pub pending: u8,
}

impl StaleResponse {
    fn new(op: &T1tCommand, pending: u8) -> Self {
        Self {
            opcode: op.opcode(),
            addr: op.address(),
            rsp_len: op.rsp_info().rsp_len,
            pending,
        }
    }

    fn matches(&self, data: &[u8]) -> bool {
        self.pending > 0
            && self.rsp_len == data.len()
            && (matches!(self.opcode, t1t::CMD_RID | t1t::CMD_RALL)
                || data.first() == Some(&self.addr))
    }
}

/// Type 1 tag engine.
#[derive(Debug)]
pub struct T1tEngine {
    pub(super) state: T1tState,
    pub(super) substate: T1tSubstate,
    pub(super) hr: HeaderRom,
    pub(super) uid: T1tUid,
    pub(super) retry: RetryCoordinator,
    pub(super) stale: Option<StaleResponse>,
    /// Image of segment 0 (RALL fills the first 120 bytes)
    pub(super) mem: [u8; t1t::SEGMENT_SIZE],
    /// `mem` holds a current copy of segment 0
    pub(super) segment0_cached: bool,
    pub(super) attribute: T1tAttribute,
    pub(super) locks: LockTracker,
    pub(super) tlv_wanted: TlvType,
    /// Tag offset of the NDEF length field
    pub(super) ndef_header_offset: usize,
    /// Tag offset of the first NDEF message byte
    pub(super) ndef_msg_offset: usize,
    pub(super) ndef_msg_len: usize,
    pub(super) max_ndef_msg_len: usize,
    pub(super) ndef: super::t1t_ndef::T1tNdefOp,
}

impl T1tEngine {
    /// Engine for a tag activated with header ROM `hr` and the first four
    /// UID bytes `uid`.
    pub fn new(hr: HeaderRom, uid: T1tUid) -> Self {
        log::info!(
            "T1T activated: hr={:02X}{:02X} uid={}",
            hr.hr0(),
            hr.hr1(),
            uid.to_hex()
        );
        Self {
            state: T1tState::Idle,
            substate: T1tSubstate::None,
            hr,
            uid,
            retry: RetryCoordinator::new(),
            stale: None,
            mem: [0; t1t::SEGMENT_SIZE],
            segment0_cached: false,
            attribute: T1tAttribute::Unknown,
            locks: LockTracker::new(LockLayout::TYPE1),
            tlv_wanted: TlvType::Ndef,
            ndef_header_offset: 0,
            ndef_msg_offset: 0,
            ndef_msg_len: 0,
            max_ndef_msg_len: 0,
            ndef: Default::default(),
        }
    }

    /// Current state.
    pub fn state(&self) -> T1tState {
        self.state
    }

    /// Current substate.
    pub fn substate(&self) -> T1tSubstate {
        self.substate
    }

    /// Header ROM from activation.
    pub fn header_rom(&self) -> HeaderRom {
        self.hr
    }

    /// UID echo from activation.
    pub fn uid(&self) -> T1tUid {
        self.uid
    }

    /// NDEF attribute found by detection.
    pub fn attribute(&self) -> T1tAttribute {
        self.attribute
    }

    /// Lock and reserved byte bookkeeping.
    pub fn lock_tracker(&self) -> &LockTracker {
        &self.locks
    }

    /// HR0 announces NDEF support.
    pub fn ndef_supported(&self) -> bool {
        self.hr.hr0() & 0xF0 == t1t::NDEF_SUPPORTED
    }

    /// Memory beyond the 120 byte static area (segmented addressing).
    pub fn is_dynamic_memory(&self) -> bool {
        self.hr.hr0() & 0x0F != 0x01
    }

    /// The tag understands RSEG / READ8 / WRITE-E8 / WRITE-NE8.
    pub fn supports_dynamic_commands(&self) -> bool {
        self.hr.hr0() != t1t::STATIC_HR0 || self.hr.hr1() >= t1t::HR1_MIN
    }

    pub(super) fn set_state(&mut self, state: T1tState) {
        log_transition("T1T", &self.state, &state);
        self.state = state;
    }

    pub(super) fn set_substate(&mut self, substate: T1tSubstate) {
        if self.substate != substate {
            log::trace!("T1T substate: {} -> {}", self.substate, substate);
        }
        self.substate = substate;
    }

    pub(super) fn send(&mut self, link: &mut Link, op: T1tCommand) -> Result<()> {
        let timeout = link.config().t1t_response_timeout_ms;
        log::trace!("T1T send opcode={:#04x} add={:#04x}", op.opcode(), op.address());
        self.retry.send(link, Command::Type1 { op, uid: self.uid }, timeout)
    }

    pub(super) fn ensure_idle(&self) -> Result<()> {
        match self.state {
            T1tState::Idle => Ok(()),
            T1tState::NotActivated => Err(Error::NotActivated),
            _ => {
                log::warn!("T1T busy in state {}", self.state);
                Err(Error::Busy)
            }
        }
    }

    pub(super) fn start(&mut self, link: &mut Link, op: T1tCommand, state: T1tState) -> Result<()> {
        self.send(link, op)?;
        self.set_state(state);
        Ok(())
    }

    /// Back to IDLE. The segment 0 image survives detection and reads only.
    pub(super) fn op_complete(&mut self) {
        if !matches!(self.state, T1tState::TlvDetect | T1tState::ReadNdef) {
            self.segment0_cached = false;
        }
        self.set_state(T1tState::Idle);
        self.set_substate(T1tSubstate::None);
    }

    /// Terminal event of the current operation for a failure `status`.
    pub(super) fn failure_event(&self, status: Status) -> RwEvent {
        match self.state {
            T1tState::TlvDetect if self.tlv_wanted == TlvType::Ndef => RwEvent::NdefDetect(
                NdefDetectData::failed(Protocol::Type1, status, NdefFlags::UNKNOWN),
            ),
            T1tState::TlvDetect => RwEvent::TlvDetect {
                status,
                num_bytes: 0,
            },
            T1tState::ReadNdef => RwEvent::NdefReadFail { status },
            T1tState::WriteNdef => RwEvent::NdefUpdateFail { status },
            T1tState::SetTagRo => RwEvent::SetTagReadOnly { status },
            T1tState::CheckPresence => RwEvent::PresenceCheck { status },
            T1tState::FormatTag => RwEvent::FormatComplete { status },
            T1tState::Read => RwEvent::ReadComplete {
                status,
                data: Vec::new(),
            },
            T1tState::Write => RwEvent::WriteComplete {
                status,
                data: Vec::new(),
            },
            T1tState::Idle | T1tState::NotActivated => RwEvent::InterfaceError { status },
        }
    }

    /// End the current operation with a failure event.
    pub(super) fn fail(&mut self, link: &mut Link, status: Status) {
        let event = self.failure_event(status);
        self.op_complete();
        link.notify(event);
    }

    /// Retransmit the outstanding command or fail the operation.
    fn process_error(&mut self, link: &mut Link) {
        if self.retry.retransmit(link) {
            return;
        }
        let max = link.config().max_retries;
        if self.retry.retry_count() >= max {
            if let Some(Command::Type1 { op, .. }) = self.retry.pending_command() {
                self.stale = Some(StaleResponse::new(op, max));
            }
        }
        log::error!("T1T {} failed after {} retries", self.state, self.retry.retry_count());
        link.stats_mut().record_failure();
        self.fail(link, Status::Timeout);
    }

    fn absorb_stale(&mut self, data: &[u8]) -> bool {
        match self.stale.as_mut() {
            Some(stale) if stale.matches(data) => {
                stale.pending -= 1;
                log::debug!("T1T dropped late response to opcode {:#04x}", stale.opcode);
                true
            }
            _ => false,
        }
    }

    // ---- raw commands ---------------------------------------------------

    /// Read the header ROM and the first UID bytes.
    pub fn rid(&mut self, link: &mut Link) -> Result<()> {
        self.ensure_idle()?;
        self.start(link, T1tCommand::Rid, T1tState::Read)
    }

    /// Read the 120 byte static area.
    pub fn read_all(&mut self, link: &mut Link) -> Result<()> {
        self.ensure_idle()?;
        self.start(link, T1tCommand::ReadAll, T1tState::Read)
    }

    /// READ one byte.
    pub fn read(&mut self, link: &mut Link, block: u8, byte: u8) -> Result<()> {
        self.ensure_idle()?;
        self.start(link, T1tCommand::Read { block, byte }, T1tState::Read)
    }

    /// WRITE-E one byte. Lock and OTP bytes are refused.
    pub fn write_erase(&mut self, link: &mut Link, block: u8, byte: u8, value: u8) -> Result<()> {
        self.ensure_idle()?;
        self.check_static_write(block, byte)?;
        self.invalidate_cache_for(block);
        self.start(link, T1tCommand::WriteErase { block, byte, value }, T1tState::Write)
    }

    /// WRITE-NE one byte: sets bits without erasing.
    pub fn write_no_erase(&mut self, link: &mut Link, block: u8, byte: u8, value: u8) -> Result<()> {
        self.ensure_idle()?;
        self.check_static_write(block, byte)?;
        self.invalidate_cache_for(block);
        self.start(link, T1tCommand::WriteNoErase { block, byte, value }, T1tState::Write)
    }

    /// RSEG; dynamic tags only.
    pub fn read_segment(&mut self, link: &mut Link, segment: u8) -> Result<()> {
        self.ensure_idle()?;
        if segment as usize >= t1t::MAX_SEGMENTS || self.hr.hr0() == t1t::STATIC_HR0 {
            return Err(Error::refused(format!("segment {} not addressable", segment)));
        }
        self.start(link, T1tCommand::ReadSegment { segment }, T1tState::Read)
    }

    /// READ8; dynamic tags only.
    pub fn read8(&mut self, link: &mut Link, block: u8) -> Result<()> {
        self.ensure_idle()?;
        self.check_dynamic_commands()?;
        self.start(link, T1tCommand::Read8 { block }, T1tState::Read)
    }

    /// WRITE-E8 one block.
    pub fn write_erase8(&mut self, link: &mut Link, block: u8, data: [u8; 8]) -> Result<()> {
        self.ensure_idle()?;
        self.check_dynamic_commands()?;
        self.check_block_write(block)?;
        self.invalidate_cache_for(block);
        self.start(link, T1tCommand::WriteErase8 { block, data }, T1tState::Write)
    }

    /// WRITE-NE8 one block: sets bits without erasing.
    pub fn write_no_erase8(&mut self, link: &mut Link, block: u8, data: [u8; 8]) -> Result<()> {
        self.ensure_idle()?;
        self.check_dynamic_commands()?;
        self.check_block_write(block)?;
        self.invalidate_cache_for(block);
        self.start(link, T1tCommand::WriteNoErase8 { block, data }, T1tState::Write)
    }

    fn check_dynamic_commands(&self) -> Result<()> {
        if self.supports_dynamic_commands() {
            Ok(())
        } else {
            Err(Error::refused("tag does not support 8 byte commands"))
        }
    }

    fn check_static_write(&self, block: u8, byte: u8) -> Result<()> {
        if self.attribute == T1tAttribute::ReadOnly
            && block != t1t::CC_BLOCK
            && byte != t1t::CC_RWA_OFFSET
        {
            return Err(Error::refused("tag is read only"));
        }
        if block >= t1t::STATIC_BLOCKS || byte as usize >= t1t::BLOCK_SIZE {
            return Err(Error::refused(format!("address {}:{} out of range", block, byte)));
        }
        if block == t1t::UID_BLOCK || block == t1t::RES_BLOCK {
            return Err(Error::refused(format!("block {:#04x} is not writable", block)));
        }
        Ok(())
    }

    fn check_block_write(&self, block: u8) -> Result<()> {
        if self.attribute == T1tAttribute::ReadOnly && block != t1t::CC_BLOCK {
            return Err(Error::refused("tag is read only"));
        }
        if block == t1t::UID_BLOCK || block == t1t::RES_BLOCK {
            return Err(Error::refused(format!("block {:#04x} is not writable", block)));
        }
        Ok(())
    }

    fn invalidate_cache_for(&mut self, block: u8) {
        if (block as usize) < t1t::BLOCKS_PER_SEGMENT {
            self.segment0_cached = false;
        }
    }

    // ---- inbound --------------------------------------------------------

    fn outstanding_op(&self) -> Option<T1tCommand> {
        if matches!(self.state, T1tState::Idle | T1tState::NotActivated) {
            return None;
        }
        match self.retry.pending_command() {
            Some(Command::Type1 { op, .. }) => Some(op.clone()),
            _ => None,
        }
    }

    fn handle_response(&mut self, link: &mut Link, op: &T1tCommand, data: &[u8]) {
        match self.state {
            T1tState::CheckPresence => {
                self.op_complete();
                link.notify(RwEvent::PresenceCheck { status: Status::Ok });
            }
            T1tState::Read => {
                if let T1tCommand::Rid = op {
                    self.hr = HeaderRom::new(data[0], data[1]);
                    self.uid = T1tUid::from_bytes([data[2], data[3], data[4], data[5]]);
                }
                self.op_complete();
                link.notify(RwEvent::ReadComplete {
                    status: Status::Ok,
                    data: data.to_vec(),
                });
            }
            T1tState::Write => {
                self.apply_to_image(op);
                self.op_complete();
                link.notify(RwEvent::WriteComplete {
                    status: Status::Ok,
                    data: data.to_vec(),
                });
            }
            _ => {
                if let Err(e) = self.handle_ndef_response(link, op, data) {
                    log::error!("T1T {} aborted: {}", self.state, e);
                    self.fail(link, super::error_status(&e));
                }
            }
        }
    }
}

impl TagEngine for T1tEngine {
    fn protocol(&self) -> Protocol {
        Protocol::Type1
    }

    fn is_idle(&self) -> bool {
        self.state == T1tState::Idle
    }

    fn detect_ndef(&mut self, link: &mut Link) -> Result<()> {
        self.locate_tlv(link, TlvType::Ndef)
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

    fn presence_check(&mut self, link: &mut Link) -> Result<()> {
        self.ensure_idle()?;
        self.start(link, T1tCommand::Rid, T1tState::CheckPresence)
    }

    fn on_response(&mut self, link: &mut Link, data: &[u8]) {
        log::trace!("T1T rx [{}] in {}", frame_summary(data), self.state);
        if self.state == T1tState::NotActivated {
            log::debug!("T1T frame ignored: not activated");
            return;
        }
        let Some(op) = self.outstanding_op() else {
            if !self.absorb_stale(data) {
                link.notify(RwEvent::RawFrame {
                    status: Status::Ok,
                    data: data.to_vec(),
                });
            }
            return;
        };
        link.stats_mut().record_rx(data.len());

        let info = op.rsp_info();
        if data.len() != info.rsp_len || (op.checks_address() && data[0] != op.address()) {
            if self.absorb_stale(data) {
                return;
            }
            log::warn!(
                "T1T unexpected response to opcode {:#04x}: len={} (expected {})",
                info.opcode,
                data.len(),
                info.rsp_len
            );
            link.cancel_timer();
            link.stats_mut().record_frame_error();
            self.process_error(link);
            return;
        }

        let retries = self.retry.acknowledge(link);
        self.stale = (retries > 0).then(|| StaleResponse::new(&op, retries));
        self.handle_response(link, &op, data);
    }

    fn on_timeout(&mut self, link: &mut Link) {
        match self.state {
            T1tState::NotActivated | T1tState::Idle => {
                log::debug!("T1T timeout ignored in {}", self.state);
            }
            T1tState::CheckPresence => {
                log::debug!("T1T presence check timed out");
                link.stats_mut().record_failure();
                self.fail(link, Status::Failed);
            }
            _ => {
                log::warn!("T1T response timeout in {}", self.state);
                self.process_error(link);
            }
        }
    }

    fn on_transport_error(&mut self, link: &mut Link, code: u8) {
        link.stats_mut().record_transport_error();
        match self.state {
            T1tState::NotActivated | T1tState::Idle => {
                link.notify(RwEvent::InterfaceError {
                    status: Status::TransportError(code),
                });
            }
            T1tState::CheckPresence => {
                link.cancel_timer();
                self.fail(link, Status::Failed);
            }
            _ => {
                log::warn!("T1T transport error {:#04x} in {}", code, self.state);
                link.cancel_timer();
                self.process_error(link);
            }
        }
    }

    fn on_deactivate(&mut self, link: &mut Link) {
        self.retry.release(link);
        self.stale = None;
        self.segment0_cached = false;
        self.ndef = Default::default();
        self.set_state(T1tState::NotActivated);
        self.set_substate(T1tSubstate::None);
    }

    fn ndef_sizes(&self) -> NdefSizes {
        NdefSizes {
            cur_size: self.ndef_msg_len as u32,
            max_size: self.max_ndef_msg_len as u32,
        }
    }
}
