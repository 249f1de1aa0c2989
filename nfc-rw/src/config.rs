// nfc-rw-rs/nfc-rw/src/config.rs
//! Engine configuration: response timeouts, the retry ceiling and the
//! vendor model tables used to format blank tags.

use crate::constants::{t1t, t2t};

/// Default retry ceiling for every engine.
pub const DEFAULT_MAX_RETRIES: u8 = 3;

/// Type 1 tag model, keyed by header ROM byte 0.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct T1tModel {
    /// Header ROM byte 0 identifying the model
    pub hr0: u8,
    /// Tag memory size byte written into the CC (`(tms + 1) * 8` bytes)
    pub tms: u8,
    /// Dynamic memory layout (more than 120 bytes)
    pub dynamic: bool,
    /// Lock Control TLV value written when formatting a dynamic tag
    pub lock_tlv: [u8; 3],
    /// Memory Control TLV value written when formatting a dynamic tag
    pub mem_tlv: [u8; 3],
}

/// Type 2 tag model, keyed by manufacturer id and optional version number.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct T2tModel {
    /// Manufacturer id (first UID byte)
    pub manufacturer_id: u8,
    /// Several entries share this manufacturer; match on `version_no`
    pub multi_version: bool,
    /// Block holding the version number
    pub version_block: u16,
    /// Version number this entry applies to
    pub version_no: u16,
    /// Mask applied to the read version before comparing
    pub version_mask: u16,
    /// Compute TMS from the version block instead of using `tms`
    pub calc_cc: bool,
    /// Tag memory size byte written into the CC
    pub tms: u8,
    /// One-time programmable memory
    pub otp: bool,
    /// Bytes locked per dynamic lock bit when the tag has no Lock Control TLV
    pub default_lock_blpb: u8,
}

impl T2tModel {
    #[allow(clippy::too_many_arguments)]
    fn new(
        manufacturer_id: u8,
        multi_version: bool,
        version_block: u16,
        version_no: u16,
        version_mask: u16,
        calc_cc: bool,
        tms: u8,
        otp: bool,
        default_lock_blpb: u8,
    ) -> Self {
        Self {
            manufacturer_id,
            multi_version,
            version_block,
            version_no,
            version_mask,
            calc_cc,
            tms,
            otp,
            default_lock_blpb,
        }
    }
}

/// Runtime configuration of an [`crate::session::RwSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RwConfig {
    /// Retransmissions before an operation fails
    pub max_retries: u8,
    /// Type 1 response timeout
    pub t1t_response_timeout_ms: u32,
    /// Type 2 response timeout
    pub t2t_response_timeout_ms: u32,
    /// Type 2 wait after the first sector select frame
    pub t2t_sector_select_timeout_ms: u32,
    /// ISO 15693 response timeout
    pub i93_response_timeout_ms: u32,
    /// ISO 15693 wait after Stay Quiet, which has no response
    pub i93_stay_quiet_timeout_ms: u32,
    /// Type 1 models used by format
    pub t1t_models: Vec<T1tModel>,
    /// Type 2 models used by format
    pub t2t_models: Vec<T2tModel>,
}

impl Default for RwConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            t1t_response_timeout_ms: 100,
            t2t_response_timeout_ms: 100,
            t2t_sector_select_timeout_ms: 10,
            i93_response_timeout_ms: 1000,
            i93_stay_quiet_timeout_ms: 200,
            t1t_models: default_t1t_models(),
            t2t_models: default_t2t_models(),
        }
    }
}

impl RwConfig {
    /// Model entry for a Type 1 header ROM byte 0.
    pub fn t1t_model(&self, hr0: u8) -> Option<&T1tModel> {
        self.t1t_models.iter().find(|m| m.hr0 == hr0)
    }

    /// Model entry for a Type 2 manufacturer id. When `version` is given,
    /// multi-version entries must match it under their mask.
    pub fn t2t_model(&self, manufacturer_id: u8, version: Option<u16>) -> Option<&T2tModel> {
        self.t2t_models.iter().find(|m| {
            m.manufacturer_id == manufacturer_id
                && match version {
                    Some(v) if m.multi_version => m.version_no == (v & m.version_mask),
                    _ => true,
                }
        })
    }
}

fn default_t1t_models() -> Vec<T1tModel> {
    vec![
        T1tModel {
            hr0: t1t::STATIC_HR0,
            tms: 0x0E,
            dynamic: false,
            lock_tlv: [0; 3],
            mem_tlv: [0; 3],
        },
        T1tModel {
            hr0: 0x12,
            tms: 0x3F,
            dynamic: true,
            lock_tlv: [0xF2, 0x30, 0x33],
            mem_tlv: [0xF0, 0x02, 0x03],
        },
    ]
}

fn default_t2t_models() -> Vec<T2tModel> {
    let blpb = t2t::DEFAULT_LOCK_BLPB;
    vec![
        // MIFARE Ultralight, blank
        T2tModel::new(t2t::MANUFACTURER_NXP, true, 0x04, 0xFFFF, 0xFFFF, false, 0x06, false, blpb),
        // MIFARE Ultralight family
        T2tModel::new(t2t::MANUFACTURER_NXP, true, 0x04, 0x0200, 0xFFFF, true, 0x00, false, blpb),
        T2tModel::new(t2t::MANUFACTURER_KOVIO, false, 0x00, 0x0000, 0x0000, false, 0x1D, true, 0x04),
        // my-d move lean / my-d move
        T2tModel::new(t2t::MANUFACTURER_INFINEON, true, 0x00, 0x0570, 0xFFF0, false, 0x06, false, blpb),
        T2tModel::new(t2t::MANUFACTURER_INFINEON, true, 0x00, 0x0530, 0xFFF0, false, 0x10, false, blpb),
        T2tModel::new(t2t::MANUFACTURER_BRCM, true, 0x00, 0x2E01, 0xFFFF, false, 0x06, false, blpb),
        T2tModel::new(t2t::MANUFACTURER_BRCM, true, 0x00, 0x2E02, 0xFFFF, false, 0x3C, false, blpb),
    ]
}
