// nfc-rw-rs/nfc-rw/src/tags/i93.rs
//! ISO 15693 engine: product identification, raw commands and response
//! dispatch.
//!
//! Every request carries the tag UID; there is no block session to keep in
//! step with the tag. NDEF flows live in [`crate::tags::i93_ndef`].

use derive_more::Display;

use crate::constants::i93;
use crate::events::{I93SystemInfo, NdefDetectData, NdefFlags, RwEvent, Status};
use crate::protocol::commands::{Command, I93Command, I93Request};
use crate::protocol::parser::{array_at, byte_at, le_u16_at};
use crate::protocol::retry::{Link, RetryCoordinator};
use crate::tags::{log_transition, NdefSizes, TagEngine};
use crate::types::{I93Uid, Protocol};
use crate::utils::frame_summary;
use crate::{Error, Result};

/// Top-level state of the ISO 15693 engine.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum I93State {
    /// No tag selected
    #[display(fmt = "NOT_ACTIVATED")]
    NotActivated,
    /// Ready for a new operation
    #[display(fmt = "IDLE")]
    Idle,
    /// A raw command is outstanding
    #[display(fmt = "BUSY")]
    Busy,
    /// NDEF detection running
    #[display(fmt = "NDEF_DETECTION")]
    DetectNdef,
    /// NDEF read running
    #[display(fmt = "READ_NDEF")]
    ReadNdef,
    /// NDEF write running
    #[display(fmt = "UPDATE_NDEF")]
    UpdateNdef,
    /// Format running
    #[display(fmt = "FORMAT")]
    Format,
    /// Read-only conversion running
    #[display(fmt = "SET_READ_ONLY")]
    SetReadOnly,
    /// Presence check outstanding
    #[display(fmt = "PRESENCE_CHECK")]
    PresenceCheck,
}

/// Step within the current NDEF flow.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum I93Substate {
    /// No step
    #[display(fmt = "NONE")]
    None,
    /// Waiting for the inventory answer
    #[display(fmt = "WAIT_UID")]
    WaitUid,
    /// Waiting for system information
    #[display(fmt = "WAIT_SYS_INFO")]
    WaitSysInfo,
    /// Waiting for the CC block
    #[display(fmt = "WAIT_CC")]
    WaitCc,
    /// Scanning for the NDEF TLV
    #[display(fmt = "SEARCH_NDEF_TLV")]
    SearchNdefTlv,
    /// Reading block lock status
    #[display(fmt = "CHECK_LOCK_STATUS")]
    CheckLockStatus,
    /// Zeroing the NDEF length before the write
    #[display(fmt = "RESET_LEN")]
    ResetLen,
    /// Writing message blocks
    #[display(fmt = "WRITE_NDEF")]
    WriteNdef,
    /// Writing the final NDEF length
    #[display(fmt = "UPDATE_LEN")]
    UpdateLen,
    /// Clearing DSFID and AFI before formatting
    #[display(fmt = "WAIT_RESET_DSFID_AFI")]
    WaitResetDsfidAfi,
    /// Checking that no block is locked
    #[display(fmt = "CHECK_READ_ONLY")]
    CheckReadOnly,
    /// Writing CC and empty NDEF TLV
    #[display(fmt = "WRITE_CC_NDEF_TLV")]
    WriteCcNdefTlv,
    /// Waiting for the read-only CC write
    #[display(fmt = "WAIT_UPDATE_CC")]
    WaitUpdateCc,
    /// Locking the blocks of the NDEF TLV
    #[display(fmt = "LOCK_NDEF_TLV")]
    LockNdefTlv,
    /// Locking the CC block
    #[display(fmt = "WAIT_LOCK_CC")]
    WaitLockCc,
}

/// Tag products with known quirks.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum I93Product {
    /// Not a known product
    #[display(fmt = "UNKNOWN")]
    Unknown,
    /// NXP ICODE SLI / SLIX
    #[display(fmt = "SLI/SLIX")]
    IcodeSli,
    /// NXP ICODE SLI-S / SLIX-S
    #[display(fmt = "SLI-S/SLIX-S")]
    IcodeSliS,
    /// NXP ICODE SLI-L / SLIX-L
    #[display(fmt = "SLI-L/SLIX-L")]
    IcodeSliL,
    /// TI Tag-it HF-I Plus Inlay
    #[display(fmt = "Tag-it HF-I Plus Inlay")]
    TagItPlusInlay,
    /// TI Tag-it HF-I Plus Chip
    #[display(fmt = "Tag-it HF-I Plus Chip")]
    TagItPlusChip,
    /// TI Tag-it HF-I Standard
    #[display(fmt = "Tag-it HF-I Standard")]
    TagItStandard,
    /// TI Tag-it HF-I Pro
    #[display(fmt = "Tag-it HF-I Pro")]
    TagItPro,
    /// ST LRi1K
    #[display(fmt = "LRi1K")]
    StmLri1k,
    /// ST LRi2K
    #[display(fmt = "LRi2K")]
    StmLri2k,
    /// ST LRiS2K
    #[display(fmt = "LRiS2K")]
    StmLris2k,
    /// ST LRiS64K
    #[display(fmt = "LRiS64K")]
    StmLris64k,
    /// ST M24LR64-R
    #[display(fmt = "M24LR64")]
    StmM24lr64R,
    /// ST M24LR04E-R
    #[display(fmt = "M24LR04E")]
    StmM24lr04eR,
    /// ST M24LR16E-R
    #[display(fmt = "M24LR16E")]
    StmM24lr16eR,
    /// ST M24LR64E-R
    #[display(fmt = "M24LR64E")]
    StmM24lr64eR,
}

impl I93Product {
    /// Identify the product from the UID. STM parts are told apart by the
    /// IC reference from the system information only.
    pub fn identify(uid: &I93Uid, ic_reference: Option<u8>) -> Self {
        match uid.manufacturer() {
            i93::MANUFACTURER_NXP => match uid.product_byte() {
                i93::ICODE_TYPE_SLI => Self::IcodeSli,
                i93::ICODE_TYPE_SLI_S => Self::IcodeSliS,
                i93::ICODE_TYPE_SLI_L => Self::IcodeSliL,
                _ => Self::Unknown,
            },
            i93::MANUFACTURER_TI => match uid.product_byte() & i93::TI_PRODUCT_MASK {
                i93::TI_TAG_IT_HF_I_PLUS_INLAY => Self::TagItPlusInlay,
                i93::TI_TAG_IT_HF_I_PLUS_CHIP => Self::TagItPlusChip,
                i93::TI_TAG_IT_HF_I_STANDARD => Self::TagItStandard,
                i93::TI_TAG_IT_HF_I_PRO => Self::TagItPro,
                _ => Self::Unknown,
            },
            i93::MANUFACTURER_STM => match ic_reference {
                Some(i93::STM_M24LR04E_R) => Self::StmM24lr04eR,
                Some(i93::STM_M24LR16E_R) => Self::StmM24lr16eR,
                Some(i93::STM_M24LR64E_R) => Self::StmM24lr64eR,
                Some(ic) => match ic & i93::STM_IC_REF_MASK {
                    i93::STM_LRI1K => Self::StmLri1k,
                    i93::STM_LRI2K => Self::StmLri2k,
                    i93::STM_LRIS2K => Self::StmLris2k,
                    i93::STM_LRIS64K => Self::StmLris64k,
                    i93::STM_M24LR64_R => Self::StmM24lr64R,
                    _ => Self::Unknown,
                },
                None => Self::Unknown,
            },
            _ => Self::Unknown,
        }
    }

    /// NXP ICODE parts.
    pub fn is_icode(&self) -> bool {
        matches!(self, Self::IcodeSli | Self::IcodeSliS | Self::IcodeSliL)
    }

    /// TI parts need the option flag on writes and locks.
    pub fn is_ti(&self) -> bool {
        matches!(
            self,
            Self::TagItPlusInlay | Self::TagItPlusChip | Self::TagItStandard | Self::TagItPro
        )
    }

    /// Tag-it HF-I Standard and Pro have no system information and a fixed
    /// geometry.
    pub fn is_tag_it_std_pro(&self) -> bool {
        matches!(self, Self::TagItStandard | Self::TagItPro)
    }

    /// Reads limited to 32 blocks inside one 32-block sector.
    pub fn has_stm_sector_limit(&self) -> bool {
        matches!(
            self,
            Self::StmLris64k | Self::StmM24lr64R | Self::StmM24lr04eR | Self::StmM24lr16eR | Self::StmM24lr64eR
        )
    }
}

/// Parse a Get System Information answer (response flags stripped).
///
/// The number of blocks is one byte, or two bytes little-endian when the
/// request carried the protocol extension flag.
pub fn parse_system_info(data: &[u8], ext_block_numbers: bool) -> Result<I93SystemInfo> {
    let info_flags = byte_at(data, 0)?;
    let mut info = I93SystemInfo {
        info_flags,
        uid: I93Uid::from_wire(&array_at::<{ i93::UID_LEN }>(data, 1)?),
        ..Default::default()
    };
    let mut pos = 1 + i93::UID_LEN;
    if info_flags & i93::INFO_FLAG_DSFID != 0 {
        info.dsfid = byte_at(data, pos)?;
        pos += 1;
    }
    if info_flags & i93::INFO_FLAG_AFI != 0 {
        info.afi = byte_at(data, pos)?;
        pos += 1;
    }
    if info_flags & i93::INFO_FLAG_MEM_SIZE != 0 {
        if ext_block_numbers {
            info.num_blocks = le_u16_at(data, pos)?.saturating_add(1);
            pos += 2;
        } else {
            info.num_blocks = byte_at(data, pos)? as u16 + 1;
            pos += 1;
        }
        info.block_size = (byte_at(data, pos)? & i93::BLOCK_SIZE_MASK) as u16 + 1;
        pos += 1;
    }
    if info_flags & i93::INFO_FLAG_IC_REF != 0 {
        info.ic_reference = byte_at(data, pos)?;
    }
    Ok(info)
}

/// ISO 15693 tag engine.
#[derive(Debug)]
pub struct I93Engine {
    pub(super) state: I93State,
    pub(super) substate: I93Substate,
    pub(super) retry: RetryCoordinator,
    pub(super) uid: I93Uid,
    pub(super) dsfid: u8,
    pub(super) afi: u8,
    pub(super) info_flags: u8,
    pub(super) ic_reference: u8,
    pub(super) product: I93Product,
    pub(super) num_blocks: u16,
    pub(super) block_size: u16,
    /// Block numbers travel as 16-bit values (protocol extension)
    pub(super) ext_block_numbers: bool,
    pub(super) read_only: bool,
    /// CC announces Read Multiple Blocks support
    pub(super) read_multi_block: bool,
    pub(super) ndef_detected: bool,
    /// Tag offset of the NDEF TLV type byte
    pub(super) ndef_tlv_start: usize,
    /// Tag offset of the last byte of the NDEF TLV
    pub(super) ndef_tlv_last: usize,
    pub(super) ndef_value_offset: usize,
    pub(super) ndef_length: usize,
    pub(super) max_ndef_length: usize,
    /// End (exclusive) of the unlocked blocks following the NDEF TLV
    pub(super) ndef_area_end: usize,
    pub(super) ndef: super::i93_ndef::I93NdefOp,
}

impl I93Engine {
    /// Engine for the tag found during activation. A UID whose first byte
    /// is not `E0` is learnt with an Inventory on the first detection.
    pub fn new(uid: I93Uid, dsfid: u8) -> Self {
        let mut engine = Self {
            state: I93State::Idle,
            substate: I93Substate::None,
            retry: RetryCoordinator::new(),
            uid,
            dsfid,
            afi: 0,
            info_flags: 0,
            ic_reference: 0,
            product: I93Product::Unknown,
            num_blocks: 0,
            block_size: 0,
            ext_block_numbers: false,
            read_only: false,
            read_multi_block: false,
            ndef_detected: false,
            ndef_tlv_start: 0,
            ndef_tlv_last: 0,
            ndef_value_offset: 0,
            ndef_length: 0,
            max_ndef_length: 0,
            ndef_area_end: 0,
            ndef: Default::default(),
        };
        engine.identify_product();
        log::info!("I93 activated uid={} product={}", uid.to_hex(), engine.product);
        engine
    }

    /// Current state.
    pub fn state(&self) -> I93State {
        self.state
    }

    /// Current substate.
    pub fn substate(&self) -> I93Substate {
        self.substate
    }

    /// Session UID.
    pub fn uid(&self) -> I93Uid {
        self.uid
    }

    /// Identified product.
    pub fn product(&self) -> I93Product {
        self.product
    }

    /// Block size from system information; `0` until known.
    pub fn block_size(&self) -> u16 {
        self.block_size
    }

    /// Block count from system information.
    pub fn num_blocks(&self) -> u16 {
        self.num_blocks
    }

    /// System information as currently known to the engine.
    pub fn system_info(&self) -> I93SystemInfo {
        I93SystemInfo {
            info_flags: self.info_flags,
            uid: self.uid,
            dsfid: self.dsfid,
            afi: self.afi,
            num_blocks: self.num_blocks,
            block_size: self.block_size,
            ic_reference: self.ic_reference,
        }
    }

    pub(super) fn uid_known(&self) -> bool {
        self.uid.as_bytes()[0] == i93::UID_FIRST_BYTE
    }

    /// Re-derive the product, applying the fixed Tag-it Standard/Pro
    /// geometry.
    pub(super) fn identify_product(&mut self) {
        let ic_ref = (self.info_flags & i93::INFO_FLAG_IC_REF != 0).then_some(self.ic_reference);
        self.product = I93Product::identify(&self.uid, ic_ref);
        if self.product.is_tag_it_std_pro() {
            self.block_size = i93::TI_STD_PRO_BLOCK_SIZE;
            self.num_blocks = i93::TI_STD_PRO_NUM_BLOCKS;
        }
    }

    pub(super) fn set_state(&mut self, state: I93State) {
        log_transition("I93", &self.state, &state);
        self.state = state;
    }

    pub(super) fn set_substate(&mut self, substate: I93Substate) {
        if self.substate != substate {
            log::trace!("I93 substate: {} -> {}", self.substate, substate);
        }
        self.substate = substate;
    }

    pub(super) fn ensure_idle(&self) -> Result<()> {
        match self.state {
            I93State::Idle => Ok(()),
            I93State::NotActivated => Err(Error::NotActivated),
            _ => {
                log::warn!("I93 busy in state {}", self.state);
                Err(Error::Busy)
            }
        }
    }

    // ---- outbound -------------------------------------------------------

    fn request(&self, command: I93Command) -> I93Request {
        I93Request::new(command, self.uid)
    }

    pub(super) fn send(&mut self, link: &mut Link, req: I93Request) -> Result<()> {
        let timeout = match req.command {
            I93Command::StayQuiet => link.config().i93_stay_quiet_timeout_ms,
            _ => link.config().i93_response_timeout_ms,
        };
        log::trace!("I93 send opcode={:#04x} flags={:#04x}", req.opcode(), req.flags());
        self.retry.send(link, Command::Iso15693(req), timeout)
    }

    pub(super) fn send_inventory(&mut self, link: &mut Link, afi: Option<u8>, mask_uid: Option<I93Uid>) -> Result<()> {
        let req = self.request(I93Command::Inventory { afi, mask_uid });
        self.send(link, req)
    }

    /// READ SINGLE BLOCK; `security` asks for the block security status in
    /// front of the data.
    pub(super) fn send_read_single(&mut self, link: &mut Link, block: u16, security: bool) -> Result<()> {
        let req = self
            .request(I93Command::ReadSingleBlock { block })
            .with_option(security)
            .with_extended(self.ext_block_numbers);
        self.send(link, req)
    }

    pub(super) fn send_read_multi(&mut self, link: &mut Link, first: u16, count: u16) -> Result<()> {
        let req = self
            .request(I93Command::ReadMultipleBlocks { first, count })
            .with_extended(self.ext_block_numbers);
        self.send(link, req)
    }

    pub(super) fn send_write_single(&mut self, link: &mut Link, block: u16, data: Vec<u8>) -> Result<()> {
        let req = self
            .request(I93Command::WriteSingleBlock { block, data })
            .with_option(self.product.is_ti())
            .with_extended(self.ext_block_numbers);
        self.send(link, req)
    }

    pub(super) fn send_lock_block(&mut self, link: &mut Link, block: u16) -> Result<()> {
        let block = u8::try_from(block)
            .map_err(|_| Error::InvalidParameter(format!("block {} cannot be locked", block)))?;
        let req = self
            .request(I93Command::LockBlock { block })
            .with_option(self.product.is_ti());
        self.send(link, req)
    }

    pub(super) fn send_security_status(&mut self, link: &mut Link, first: u16, count: u16) -> Result<()> {
        let req = self
            .request(I93Command::GetMultiBlockSecurityStatus { first, count })
            .with_extended(self.ext_block_numbers);
        self.send(link, req)
    }

    pub(super) fn send_sys_info(&mut self, link: &mut Link, uid: Option<I93Uid>, extended: bool) -> Result<()> {
        let req = self
            .request(I93Command::GetSystemInfo { uid })
            .with_extended(extended);
        self.send(link, req)
    }

    /// Raw commands: IDLE -> BUSY until the answer arrives.
    fn start_raw(&mut self, link: &mut Link, req: I93Request) -> Result<()> {
        self.send(link, req)?;
        self.set_state(I93State::Busy);
        Ok(())
    }

    fn check_count(count: u16, max: u16) -> Result<()> {
        if count == 0 || count > max {
            return Err(Error::InvalidParameter(format!("block count {} out of 1..={}", count, max)));
        }
        Ok(())
    }

    // ---- raw commands ---------------------------------------------------

    /// One-slot INVENTORY, optionally restricted to an AFI and masked with a
    /// full UID.
    pub fn inventory(&mut self, link: &mut Link, afi: Option<u8>, uid: Option<I93Uid>) -> Result<()> {
        self.ensure_idle()?;
        let req = self.request(I93Command::Inventory { afi, mask_uid: uid });
        self.start_raw(link, req)
    }

    /// STAY QUIET is never answered: the short timeout completing is the
    /// success.
    pub fn stay_quiet(&mut self, link: &mut Link) -> Result<()> {
        self.ensure_idle()?;
        let req = self.request(I93Command::StayQuiet);
        self.start_raw(link, req)?;
        self.retry.exhaust(link);
        Ok(())
    }

    /// READ SINGLE BLOCK.
    pub fn read_single_block(&mut self, link: &mut Link, block: u16) -> Result<()> {
        self.ensure_idle()?;
        self.send_read_single(link, block, false)?;
        self.set_state(I93State::Busy);
        Ok(())
    }

    /// WRITE SINGLE BLOCK; `data` must be exactly one block.
    pub fn write_single_block(&mut self, link: &mut Link, block: u16, data: &[u8]) -> Result<()> {
        self.ensure_idle()?;
        if self.block_size == 0 {
            return Err(Error::failed("block size unknown; read the system information first"));
        }
        if data.len() != self.block_size as usize {
            return Err(Error::InvalidLength {
                expected: self.block_size as usize,
                actual: data.len(),
            });
        }
        self.send_write_single(link, block, data.to_vec())?;
        self.set_state(I93State::Busy);
        Ok(())
    }

    /// LOCK BLOCK.
    pub fn lock_block(&mut self, link: &mut Link, block: u8) -> Result<()> {
        self.ensure_idle()?;
        self.send_lock_block(link, block as u16)?;
        self.set_state(I93State::Busy);
        Ok(())
    }

    /// READ MULTIPLE BLOCKS, at most 256.
    pub fn read_multiple_blocks(&mut self, link: &mut Link, first: u16, count: u16) -> Result<()> {
        self.ensure_idle()?;
        Self::check_count(count, 256)?;
        self.send_read_multi(link, first, count)?;
        self.set_state(I93State::Busy);
        Ok(())
    }

    /// WRITE MULTIPLE BLOCKS; `data` holds `count` whole blocks.
    pub fn write_multiple_blocks(&mut self, link: &mut Link, first: u8, count: u16, data: &[u8]) -> Result<()> {
        self.ensure_idle()?;
        if self.block_size == 0 {
            return Err(Error::failed("block size unknown; read the system information first"));
        }
        Self::check_count(count, 256)?;
        let expected = count as usize * self.block_size as usize;
        if data.len() != expected {
            return Err(Error::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        let req = self.request(I93Command::WriteMultipleBlocks {
            first,
            count,
            data: data.to_vec(),
        });
        self.start_raw(link, req)
    }

    /// SELECT `uid`.
    pub fn select(&mut self, link: &mut Link, uid: I93Uid) -> Result<()> {
        self.ensure_idle()?;
        let req = self.request(I93Command::Select { uid });
        self.start_raw(link, req)
    }

    /// RESET TO READY.
    pub fn reset_to_ready(&mut self, link: &mut Link) -> Result<()> {
        self.ensure_idle()?;
        let req = self.request(I93Command::ResetToReady);
        self.start_raw(link, req)
    }

    /// WRITE AFI.
    pub fn write_afi(&mut self, link: &mut Link, afi: u8) -> Result<()> {
        self.ensure_idle()?;
        let req = self.request(I93Command::WriteAfi { afi });
        self.start_raw(link, req)
    }

    /// LOCK AFI.
    pub fn lock_afi(&mut self, link: &mut Link) -> Result<()> {
        self.ensure_idle()?;
        let req = self.request(I93Command::LockAfi);
        self.start_raw(link, req)
    }

    /// WRITE DSFID.
    pub fn write_dsfid(&mut self, link: &mut Link, dsfid: u8) -> Result<()> {
        self.ensure_idle()?;
        let req = self.request(I93Command::WriteDsfid { dsfid });
        self.start_raw(link, req)
    }

    /// LOCK DSFID.
    pub fn lock_dsfid(&mut self, link: &mut Link) -> Result<()> {
        self.ensure_idle()?;
        let req = self.request(I93Command::LockDsfid);
        self.start_raw(link, req)
    }

    /// GET SYSTEM INFORMATION of the session tag, or of `uid` when given.
    pub fn get_system_info(&mut self, link: &mut Link, uid: Option<I93Uid>) -> Result<()> {
        self.ensure_idle()?;
        self.send_sys_info(link, uid, false)?;
        self.set_state(I93State::Busy);
        Ok(())
    }

    /// GET MULTIPLE BLOCK SECURITY STATUS.
    pub fn get_multi_block_security_status(&mut self, link: &mut Link, first: u16, count: u16) -> Result<()> {
        self.ensure_idle()?;
        Self::check_count(count, i93::MAX_SECURITY_STATUS_BLOCKS)?;
        self.send_security_status(link, first, count)?;
        self.set_state(I93State::Busy);
        Ok(())
    }

    // ---- completion -----------------------------------------------------

    pub(super) fn op_complete(&mut self) {
        self.ndef.reset_buffers();
        self.set_state(I93State::Idle);
        self.set_substate(I93Substate::None);
    }

    fn pending_is_stay_quiet(&self) -> bool {
        matches!(
            self.retry.pending_command(),
            Some(Command::Iso15693(I93Request {
                command: I93Command::StayQuiet,
                ..
            }))
        )
    }

    /// Terminal event of the current operation for a failure `status`.
    pub(super) fn failure_event(&self, status: Status) -> RwEvent {
        match self.state {
            I93State::DetectNdef => RwEvent::NdefDetect(NdefDetectData::failed(
                Protocol::Iso15693,
                status,
                NdefFlags::FORMATABLE | NdefFlags::UNKNOWN,
            )),
            I93State::ReadNdef => RwEvent::NdefReadFail { status },
            I93State::UpdateNdef => RwEvent::NdefUpdateFail { status },
            I93State::Format => RwEvent::FormatComplete { status },
            I93State::SetReadOnly => RwEvent::SetTagReadOnly { status },
            I93State::PresenceCheck => RwEvent::PresenceCheck { status },
            I93State::Busy if self.pending_is_stay_quiet() => RwEvent::I93CommandComplete {
                status: Status::Ok,
                error_code: 0,
            },
            I93State::Busy | I93State::Idle | I93State::NotActivated => RwEvent::InterfaceError { status },
        }
    }

    pub(super) fn fail(&mut self, link: &mut Link, status: Status) {
        let event = self.failure_event(status);
        self.op_complete();
        link.notify(event);
    }

    /// Retransmit the outstanding command or fail the operation with
    /// `status`.
    fn process_error(&mut self, link: &mut Link, status: Status) {
        if self.retry.retransmit(link) {
            return;
        }
        log::error!("I93 {} failed after {} retries", self.state, self.retry.retry_count());
        link.stats_mut().record_failure();
        self.fail(link, status);
    }

    /// Adopt a system information answer.
    ///
    /// Returns `false` when the request went out again with the protocol
    /// extension and nothing should be reported yet.
    pub(super) fn process_system_info(&mut self, link: &mut Link, data: &[u8]) -> Result<bool> {
        let info = parse_system_info(data, self.ext_block_numbers)?;
        self.info_flags = info.info_flags;
        if info.info_flags & i93::INFO_FLAG_DSFID != 0 {
            self.dsfid = info.dsfid;
        }
        if info.info_flags & i93::INFO_FLAG_AFI != 0 {
            self.afi = info.afi;
        }
        if info.info_flags & i93::INFO_FLAG_MEM_SIZE != 0 {
            self.num_blocks = info.num_blocks;
            self.block_size = info.block_size;
        }
        if info.info_flags & i93::INFO_FLAG_IC_REF == 0 {
            return Ok(true);
        }
        self.ic_reference = info.ic_reference;
        self.uid = info.uid;
        self.identify_product();
        log::debug!("I93 product {} (IC ref {:#04x})", self.product, self.ic_reference);
        match self.product {
            I93Product::IcodeSliL if self.ic_reference == i93::ICODE_IC_REF_SLI_L => {
                self.num_blocks = 8;
                self.block_size = 4;
            }
            // memory size is only reported with the protocol extension
            I93Product::StmM24lr16eR | I93Product::StmM24lr64eR if !self.ext_block_numbers => {
                self.send_sys_info(link, None, true)?;
                self.ext_block_numbers = true;
                return Ok(false);
            }
            I93Product::StmLri2k if self.ic_reference == i93::STM_LRI2K_IC_REF_21 => {
                self.num_blocks = 64;
                self.block_size = 4;
            }
            _ => {}
        }
        Ok(true)
    }

    // ---- inbound --------------------------------------------------------

    fn outstanding_request(&self) -> Option<I93Request> {
        if matches!(self.state, I93State::Idle | I93State::NotActivated) {
            return None;
        }
        match self.retry.pending_command() {
            Some(Command::Iso15693(req)) => Some(req.clone()),
            _ => None,
        }
    }

    /// Shortest well-formed answer to `req`.
    fn min_response_len(&self, req: &I93Request, data: &[u8]) -> usize {
        if data.first().is_some_and(|f| f & i93::RSP_FLAG_ERROR != 0) {
            return 2;
        }
        let block = (self.block_size as usize).max(1);
        match &req.command {
            I93Command::Inventory { .. } => 2 + i93::UID_LEN,
            I93Command::GetSystemInfo { .. } => 2 + i93::UID_LEN,
            I93Command::ReadSingleBlock { .. } => 1 + req.option as usize + block,
            I93Command::ReadMultipleBlocks { count, .. } => 1 + *count as usize * block,
            I93Command::GetMultiBlockSecurityStatus { count, .. } => 1 + *count as usize,
            _ => 1,
        }
    }

    /// An "option not supported" answer to a plain GET SYSTEM INFORMATION
    /// is asked again once with the protocol extension. The new request is
    /// a fresh command, not a retransmission.
    fn retry_sys_info_extended(&mut self, link: &mut Link, req: &I93Request, code: u8) -> bool {
        if code != i93::ERROR_OPTION_NOT_SUPPORTED
            || req.extended
            || !matches!(req.command, I93Command::GetSystemInfo { .. })
        {
            return false;
        }
        log::debug!("I93 system information needs the protocol extension");
        match self.send(link, req.clone().with_extended(true)) {
            Ok(()) => {
                self.ext_block_numbers = true;
                true
            }
            Err(e) => {
                log::error!("I93 extended system information request failed: {}", e);
                false
            }
        }
    }

    fn handle_error_response(&mut self, link: &mut Link, req: &I93Request, code: u8) {
        log::warn!(
            "I93 error {:#04x} for opcode {:#04x} in {}/{}",
            code,
            req.opcode(),
            self.state,
            self.substate
        );
        if self.retry_sys_info_extended(link, req, code) {
            return;
        }
        let is_write = matches!(
            req.command,
            I93Command::WriteSingleBlock { .. }
                | I93Command::WriteMultipleBlocks { .. }
                | I93Command::LockBlock { .. }
                | I93Command::WriteAfi { .. }
                | I93Command::WriteDsfid { .. }
        );
        match self.state {
            I93State::Busy => {
                self.op_complete();
                link.notify(RwEvent::I93CommandComplete {
                    status: Status::Failed,
                    error_code: code,
                });
            }
            // any answer proves the tag is there
            I93State::PresenceCheck => {
                self.op_complete();
                link.notify(RwEvent::PresenceCheck { status: Status::Ok });
            }
            I93State::UpdateNdef | I93State::Format | I93State::SetReadOnly
                if is_write && self.product.is_ti() && code == i93::ERROR_BLOCK_FAIL_TO_WRITE =>
            {
                // TI parts report this even though the write went through
                log::debug!("I93 ignoring block-fail-to-write from {}", self.product);
                self.dispatch_ndef(link, req, &[]);
            }
            _ => {
                link.stats_mut().record_failure();
                self.fail(link, Status::TagError(code));
            }
        }
    }

    fn raw_event(&mut self, link: &mut Link, req: &I93Request, payload: &[u8]) -> Result<Option<RwEvent>> {
        let event = match &req.command {
            I93Command::Inventory { .. } => RwEvent::I93Inventory {
                status: Status::Ok,
                dsfid: self.adopt_inventory(payload)?,
                uid: self.uid,
            },
            I93Command::ReadSingleBlock { .. }
            | I93Command::ReadMultipleBlocks { .. }
            | I93Command::GetMultiBlockSecurityStatus { .. } => RwEvent::I93Data {
                status: Status::Ok,
                data: payload.to_vec(),
            },
            I93Command::GetSystemInfo { .. } => {
                if !self.process_system_info(link, payload)? {
                    return Ok(None);
                }
                RwEvent::I93SystemInfo {
                    status: Status::Ok,
                    info: self.system_info(),
                }
            }
            _ => RwEvent::I93CommandComplete {
                status: Status::Ok,
                error_code: 0,
            },
        };
        Ok(Some(event))
    }

    fn handle_raw_response(&mut self, link: &mut Link, req: &I93Request, payload: &[u8]) {
        match self.raw_event(link, req, payload) {
            Ok(Some(event)) => {
                self.op_complete();
                link.notify(event);
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("I93 bad answer to opcode {:#04x}: {}", req.opcode(), e);
                self.fail(link, super::error_status(&e));
            }
        }
    }

    fn dispatch_ndef(&mut self, link: &mut Link, req: &I93Request, payload: &[u8]) {
        if let Err(e) = self.handle_ndef_response(link, req, payload) {
            log::error!("I93 {} aborted: {}", self.state, e);
            self.fail(link, super::error_status(&e));
        }
    }
}

impl TagEngine for I93Engine {
    fn protocol(&self) -> Protocol {
        Protocol::Iso15693
    }

    fn is_idle(&self) -> bool {
        self.state == I93State::Idle
    }

    fn detect_ndef(&mut self, link: &mut Link) -> Result<()> {
        self.start_detect_ndef(link)
    }

    fn read_ndef(&mut self, link: &mut Link) -> Result<()> {
        self.start_read_ndef(link)
    }

    fn write_ndef(&mut self, link: &mut Link, message: &[u8]) -> Result<()> {
        self.start_update_ndef(link, message)
    }

    fn format_ndef(&mut self, link: &mut Link) -> Result<()> {
        self.start_format(link)
    }

    /// ISO 15693 tags are always hard locked: the CC is marked read-only
    /// and every block of the NDEF TLV is locked.
    fn set_tag_read_only(&mut self, link: &mut Link, _hard_lock: bool) -> Result<()> {
        self.start_set_read_only(link)
    }

    /// INVENTORY masked with the session UID; never retransmitted.
    fn presence_check(&mut self, link: &mut Link) -> Result<()> {
        self.ensure_idle()?;
        let uid = self.uid;
        self.send_inventory(link, None, Some(uid))?;
        self.retry.exhaust(link);
        self.set_state(I93State::PresenceCheck);
        Ok(())
    }

    fn on_response(&mut self, link: &mut Link, data: &[u8]) {
        log::trace!("I93 rx [{}] in {}/{}", frame_summary(data), self.state, self.substate);
        if self.state == I93State::NotActivated {
            log::debug!("I93 frame ignored: not activated");
            return;
        }
        let Some(req) = self.outstanding_request() else {
            link.notify(RwEvent::RawFrame {
                status: Status::Ok,
                data: data.to_vec(),
            });
            return;
        };
        link.stats_mut().record_rx(data.len());
        link.cancel_timer();

        let min_len = self.min_response_len(&req, data);
        if data.len() < min_len {
            log::warn!(
                "I93 short answer to opcode {:#04x}: len={} (expected at least {})",
                req.opcode(),
                data.len(),
                min_len
            );
            link.stats_mut().record_frame_error();
            self.process_error(link, Status::Failed);
            return;
        }

        let retries = self.retry.acknowledge(link);
        if retries > 0 {
            log::debug!("I93 answer after {} retransmissions", retries);
        }
        let (flags, payload) = (data[0], &data[1..]);
        if flags & i93::RSP_FLAG_ERROR != 0 {
            self.handle_error_response(link, &req, payload[0]);
            return;
        }
        match self.state {
            I93State::Busy => self.handle_raw_response(link, &req, payload),
            I93State::PresenceCheck => {
                self.op_complete();
                link.notify(RwEvent::PresenceCheck { status: Status::Ok });
            }
            _ => self.dispatch_ndef(link, &req, payload),
        }
    }

    fn on_timeout(&mut self, link: &mut Link) {
        match self.state {
            I93State::NotActivated | I93State::Idle => {
                log::debug!("I93 timeout ignored in {}", self.state);
            }
            I93State::Busy if self.pending_is_stay_quiet() => {
                log::debug!("I93 stay quiet done");
                let event = self.failure_event(Status::Ok);
                self.retry.release(link);
                self.op_complete();
                link.notify(event);
            }
            _ => {
                log::warn!("I93 response timeout in {}/{}", self.state, self.substate);
                self.process_error(link, Status::Timeout);
            }
        }
    }

    fn on_transport_error(&mut self, link: &mut Link, code: u8) {
        link.stats_mut().record_transport_error();
        match self.state {
            I93State::NotActivated | I93State::Idle => {
                link.notify(RwEvent::InterfaceError {
                    status: Status::TransportError(code),
                });
            }
            _ => {
                log::warn!("I93 transport error {:#04x} in {}", code, self.state);
                link.cancel_timer();
                self.process_error(link, Status::TransportError(code));
            }
        }
    }

    fn on_deactivate(&mut self, link: &mut Link) {
        self.retry.release(link);
        self.ndef = Default::default();
        self.set_state(I93State::NotActivated);
        self.set_substate(I93Substate::None);
    }

    fn ndef_sizes(&self) -> NdefSizes {
        NdefSizes {
            cur_size: self.ndef_length as u32,
            max_size: self.max_ndef_length as u32,
        }
    }
}
