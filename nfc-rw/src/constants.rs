// nfc-rw-rs/nfc-rw/src/constants.rs
//! Bit-exact tag memory and command constants, grouped per tag family.

/// TLV type codes and length encoding shared by Type 1 / Type 2 / ISO 15693
pub mod tlv {
    /// NULL TLV (padding)
    pub const NULL: u8 = 0x00;
    /// Lock Control TLV
    pub const LOCK_CTRL: u8 = 0x01;
    /// Memory Control TLV
    pub const MEM_CTRL: u8 = 0x02;
    /// NDEF message TLV
    pub const NDEF: u8 = 0x03;
    /// Proprietary TLV
    pub const PROPRIETARY: u8 = 0xFD;
    /// Terminator TLV
    pub const TERMINATOR: u8 = 0xFE;

    /// First length byte announcing a 3-byte length field
    pub const LONG_LEN_MARKER: u8 = 0xFF;
    /// Messages of this length or more need the 3-byte length field
    pub const LONG_LEN_THRESHOLD: usize = 0xFF;
    /// One-byte length field
    pub const SHORT_LEN_FIELD_LEN: usize = 1;
    /// Marker plus two length bytes
    pub const LONG_LEN_FIELD_LEN: usize = 3;
    /// Value length of a Lock / Memory Control TLV
    pub const CONTROL_TLV_LEN: usize = 3;
}

/// NFC Forum Type 1 (Topaz) layout
pub mod t1t {
    /// Header ROM bytes
    pub const HR_LEN: usize = 2;
    /// UID bytes echoed in every command
    pub const CMD_UID_LEN: usize = 4;
    /// Full UID length
    pub const UID_LEN: usize = 7;
    /// Reserved byte after the UID
    pub const RES_BYTE_LEN: usize = 1;
    /// Capability container bytes
    pub const CC_LEN: usize = 4;
    /// Address byte
    pub const ADD_LEN: usize = 1;

    /// Bytes per block
    pub const BLOCK_SIZE: usize = 8;
    /// Bytes per segment
    pub const SEGMENT_SIZE: usize = 128;
    /// Blocks per segment
    pub const BLOCKS_PER_SEGMENT: usize = 16;
    /// Segments a dynamic tag can address
    pub const MAX_SEGMENTS: usize = 16;
    /// Blocks covered by READ ALL
    pub const STATIC_BLOCKS: u8 = 0x0F;
    /// Bytes returned by READ ALL
    pub const STATIC_SIZE: usize = 120;

    /// Block holding the UID
    pub const UID_BLOCK: u8 = 0x00;
    /// Block holding the CC
    pub const CC_BLOCK: u8 = 0x01;
    /// Reserved block
    pub const RES_BLOCK: u8 = 0x0D;
    /// Static lock and OTP block
    pub const LOCK_BLOCK: u8 = 0x0E;

    /// NMN byte within the CC block
    pub const CC_NMN_OFFSET: u8 = 0x00;
    /// Access byte within the CC block
    pub const CC_RWA_OFFSET: u8 = 0x03;
    /// Offsets of the CC bytes inside tag memory
    pub const CC_NMN_BYTE: usize = 8;
    /// Tag offset of the version byte
    pub const CC_VNO_BYTE: usize = 9;
    /// Tag offset of the memory size byte
    pub const CC_TMS_BYTE: usize = 10;
    /// Tag offset of the access byte
    pub const CC_RWA_BYTE: usize = 11;

    /// NDEF magic number
    pub const CC_NMN: u8 = 0xE1;
    /// Mapping version 1.0
    pub const CC_VNO: u8 = 0x10;
    /// Mapping version 1.1
    pub const CC_LEGACY_VNO: u8 = 0x11;
    /// Read/write access
    pub const CC_RWA_RW: u8 = 0x00;
    /// Read-only access
    pub const CC_RWA_RO: u8 = 0x0F;

    /// Tag offset of the first static lock byte
    pub const LOCK_0_OFFSET: usize = 0x70;
    /// Static lock bytes
    pub const NUM_STATIC_LOCK_BYTES: usize = 2;
    /// Reserved, lock and OTP bytes at the end of segment 0
    pub const OTP_LOCK_RES_BYTES: usize = 16;
    /// Dynamic lock bytes of the default 512-byte layout
    pub const DYNAMIC_LOCK_BYTES: usize = 8;

    /// HR0 high nibble announcing NDEF support
    pub const NDEF_SUPPORTED: u8 = 0x10;
    /// HR0 of the static (96 byte) Topaz
    pub const STATIC_HR0: u8 = 0x11;
    /// Static tags accept dynamic commands from this HR1 on
    pub const HR1_MIN: u8 = 0x49;

    /// Lock Control TLVs tracked
    pub const MAX_LOCK_TLVS: usize = 5;
    /// Memory Control TLVs tracked
    pub const MAX_MEM_TLVS: usize = 5;
    /// Dynamic lock bytes tracked
    pub const MAX_LOCK_BYTES: usize = 0x1E;

    /// Read identification
    pub const CMD_RID: u8 = 0x78;
    /// Read all static bytes
    pub const CMD_RALL: u8 = 0x00;
    /// Read one byte
    pub const CMD_READ: u8 = 0x01;
    /// Write one byte with erase
    pub const CMD_WRITE_E: u8 = 0x53;
    /// Write one byte without erase
    pub const CMD_WRITE_NE: u8 = 0x1A;
    /// Read one segment
    pub const CMD_RSEG: u8 = 0x10;
    /// Read one block
    pub const CMD_READ8: u8 = 0x02;
    /// Write one block with erase
    pub const CMD_WRITE_E8: u8 = 0x54;
    /// Write one block without erase
    pub const CMD_WRITE_NE8: u8 = 0x1B;
}

/// NFC Forum Type 2 layout
pub mod t2t {
    /// Bytes per block
    pub const BLOCK_SIZE: usize = 4;
    /// Bytes returned by one READ command
    pub const READ_DATA_LEN: usize = 16;
    /// Blocks returned by one READ
    pub const BLOCKS_PER_READ: usize = 4;
    /// First block after the CC
    pub const FIRST_DATA_BLOCK: u16 = 4;
    /// Block holding the CC
    pub const CC_BLOCK: u16 = 3;

    /// Offset of the NMN byte
    pub const CC_NMN_BYTE: usize = 12;
    /// Offset of the version byte
    pub const CC_VNO_BYTE: usize = 13;
    /// Offset of the memory size byte
    pub const CC_TMS_BYTE: usize = 14;
    /// Offset of the access byte
    pub const CC_RWA_BYTE: usize = 15;

    /// NDEF magic number
    pub const CC_NMN: u8 = 0xE1;
    /// Mapping version 1.0
    pub const CC_VNO: u8 = 0x10;
    /// Mapping version 1.1
    pub const CC_LEGACY_VNO: u8 = 0x11;
    /// Mapping version 1.2
    pub const CC_NEW_VNO: u8 = 0x12;
    /// Read/write access
    pub const CC_RWA_RW: u8 = 0x00;
    /// Read-only access
    pub const CC_RWA_RO: u8 = 0x0F;

    /// Offset of the first static lock byte
    pub const LOCK_0_OFFSET: usize = 10;
    /// Static lock bytes
    pub const NUM_STATIC_LOCK_BYTES: usize = 2;
    /// Offset of block 2
    pub const INTERNAL_BYTES_OFFSET: usize = 8;
    /// Block holding the static lock bytes
    pub const STATIC_LOCK_BLOCK: u16 = 2;

    /// Bytes covered by the static lock bytes
    pub const STATIC_SIZE: usize = 64;
    /// Bytes in blocks 0..3
    pub const HEADER_SIZE: usize = 16;
    /// CC TMS unit in bytes
    pub const TMS_TAG_FACTOR: usize = 8;
    /// TMS of a 64-byte tag
    pub const CC_TMS_STATIC: u8 = 0x06;
    /// Bytes per sector
    pub const SECTOR_SIZE: usize = 1024;
    /// Blocks per sector
    pub const BLOCKS_PER_SECTOR: u16 = 256;
    /// Highest sector supported
    pub const MAX_SECTOR: u8 = 2;
    /// Bytes per lock attribute segment
    pub const SEGMENT_BYTES: usize = 128;
    /// Bitmap bytes per segment
    pub const SEGMENT_SIZE: usize = 16;
    /// NDEF TLV must start within this many bytes
    pub const MAX_NDEF_OFFSET: usize = 128;

    /// Bytes locked per dynamic lock bit when no TLV says otherwise
    pub const DEFAULT_LOCK_BLPB: u8 = 8;
    /// Lock Control TLVs tracked
    pub const MAX_LOCK_TLVS: usize = 5;
    /// Memory Control TLVs tracked
    pub const MAX_MEM_TLVS: usize = 5;
    /// Dynamic lock bytes tracked
    pub const MAX_LOCK_BYTES: usize = 0x1E;

    /// TMS of MIFARE Ultralight C
    pub const ULTRALIGHT_C_TMS: u8 = 0x12;
    /// Lowest TMS value rejected by format
    pub const INVALID_CC_TMS_LOW: u8 = 0x10;
    /// Highest TMS value rejected by format
    pub const INVALID_CC_TMS_HIGH: u8 = 0x1F;

    /// READ four blocks
    pub const CMD_READ: u8 = 0x30;
    /// WRITE one block
    pub const CMD_WRITE: u8 = 0xA2;
    /// SECTOR SELECT
    pub const CMD_SEC_SEL: u8 = 0xC2;
    /// Second byte of the sector select command
    pub const SEC_SEL_PARAM: u8 = 0xFF;
    /// Low nibble of a positive acknowledgement
    pub const RSP_ACK: u8 = 0x0A;
    /// Mask applied to a one-byte answer
    pub const RSP_NACK_MASK: u8 = 0x0F;

    /// NXP
    pub const MANUFACTURER_NXP: u8 = 0x04;
    /// Infineon
    pub const MANUFACTURER_INFINEON: u8 = 0x05;
    /// Kovio
    pub const MANUFACTURER_KOVIO: u8 = 0x37;
    /// Broadcom
    pub const MANUFACTURER_BRCM: u8 = 0x2E;
}

/// ISO 15693 (NFC Forum Type 5) command set and layout
pub mod i93 {
    /// UID length
    pub const UID_LEN: usize = 8;
    /// Most significant UID byte
    pub const UID_FIRST_BYTE: u8 = 0xE0;
    /// DSFID written by format
    pub const DSFID_UNSUPPORTED: u8 = 0x00;

    /// Bytes requested per READ MULTIPLE BLOCKS
    pub const READ_MULTI_BLOCK_SIZE: usize = 128;
    /// CC plus empty NDEF TLV
    pub const FORMAT_DATA_LEN: usize = 8;
    /// Blocks per security status request
    pub const MAX_SECURITY_STATUS_BLOCKS: u16 = 512;
    /// Largest block size
    pub const MAX_BLOCK_LENGTH: usize = 32;

    /// INVENTORY
    pub const CMD_INVENTORY: u8 = 0x01;
    /// STAY QUIET
    pub const CMD_STAY_QUIET: u8 = 0x02;
    /// READ SINGLE BLOCK
    pub const CMD_READ_SINGLE_BLOCK: u8 = 0x20;
    /// WRITE SINGLE BLOCK
    pub const CMD_WRITE_SINGLE_BLOCK: u8 = 0x21;
    /// LOCK BLOCK
    pub const CMD_LOCK_BLOCK: u8 = 0x22;
    /// READ MULTIPLE BLOCKS
    pub const CMD_READ_MULTI_BLOCK: u8 = 0x23;
    /// WRITE MULTIPLE BLOCKS
    pub const CMD_WRITE_MULTI_BLOCK: u8 = 0x24;
    /// SELECT
    pub const CMD_SELECT: u8 = 0x25;
    /// RESET TO READY
    pub const CMD_RESET_TO_READY: u8 = 0x26;
    /// WRITE AFI
    pub const CMD_WRITE_AFI: u8 = 0x27;
    /// LOCK AFI
    pub const CMD_LOCK_AFI: u8 = 0x28;
    /// WRITE DSFID
    pub const CMD_WRITE_DSFID: u8 = 0x29;
    /// LOCK DSFID
    pub const CMD_LOCK_DSFID: u8 = 0x2A;
    /// GET SYSTEM INFORMATION
    pub const CMD_GET_SYS_INFO: u8 = 0x2B;
    /// GET MULTIPLE BLOCK SECURITY STATUS
    pub const CMD_GET_MULTI_BLK_SEC: u8 = 0x2C;

    /// Request flag: two sub-carriers
    pub const FLAG_SUB_CARRIER: u8 = 0x01;
    /// Request flag: high data rate
    pub const FLAG_DATA_RATE_HIGH: u8 = 0x02;
    /// Request flag: inventory
    pub const FLAG_INVENTORY: u8 = 0x04;
    /// Request flag: protocol extension (16-bit block numbers)
    pub const FLAG_PROT_EXT: u8 = 0x08;
    /// Request flag: selected tag only
    pub const FLAG_SELECT: u8 = 0x10;
    /// Request flag: UID present
    pub const FLAG_ADDRESS: u8 = 0x20;
    /// Request flag: option
    pub const FLAG_OPTION: u8 = 0x40;
    /// Inventory flag: AFI present
    pub const FLAG_AFI_PRESENT: u8 = 0x10;
    /// Inventory flag: one slot
    pub const FLAG_ONE_SLOT: u8 = 0x20;

    /// Response flag: error code follows
    pub const RSP_FLAG_ERROR: u8 = 0x01;
    /// Error code: option not supported
    pub const ERROR_OPTION_NOT_SUPPORTED: u8 = 0x03;
    /// Error code: block write failed
    pub const ERROR_BLOCK_FAIL_TO_WRITE: u8 = 0x13;

    /// System info carries DSFID
    pub const INFO_FLAG_DSFID: u8 = 0x01;
    /// System info carries AFI
    pub const INFO_FLAG_AFI: u8 = 0x02;
    /// System info carries memory size
    pub const INFO_FLAG_MEM_SIZE: u8 = 0x04;
    /// System info carries IC reference
    pub const INFO_FLAG_IC_REF: u8 = 0x08;

    /// Block size bits of the memory size field
    pub const BLOCK_SIZE_MASK: u8 = 0x1F;
    /// Security status: block locked
    pub const BLOCK_LOCKED: u8 = 0x01;

    /// NXP
    pub const MANUFACTURER_NXP: u8 = 0x04;
    /// STMicroelectronics
    pub const MANUFACTURER_STM: u8 = 0x02;
    /// Texas Instruments
    pub const MANUFACTURER_TI: u8 = 0x07;

    /// ICODE SLI / SLIX
    pub const ICODE_TYPE_SLI: u8 = 0x01;
    /// ICODE SLI-S / SLIX-S
    pub const ICODE_TYPE_SLI_S: u8 = 0x02;
    /// ICODE SLI-L / SLIX-L
    pub const ICODE_TYPE_SLI_L: u8 = 0x03;
    /// IC reference bit: ICODE SLI supports read multiple blocks with security
    pub const ICODE_IC_REF_MBREAD_MASK: u8 = 0x02;
    /// IC reference of ICODE SLI-L
    pub const ICODE_IC_REF_SLI_L: u8 = 0x03;

    /// Product bits of the third UID byte
    pub const TI_PRODUCT_MASK: u8 = 0xFE;
    /// Tag-it HF-I Plus Inlay
    pub const TI_TAG_IT_HF_I_PLUS_INLAY: u8 = 0x00;
    /// Tag-it HF-I Plus Chip
    pub const TI_TAG_IT_HF_I_PLUS_CHIP: u8 = 0x80;
    /// Tag-it HF-I Standard
    pub const TI_TAG_IT_HF_I_STANDARD: u8 = 0xC0;
    /// Tag-it HF-I Pro
    pub const TI_TAG_IT_HF_I_PRO: u8 = 0xC4;
    /// Block size of Tag-it Standard / Pro
    pub const TI_STD_PRO_BLOCK_SIZE: u16 = 4;
    /// Block count of Tag-it Standard / Pro
    pub const TI_STD_PRO_NUM_BLOCKS: u16 = 8;
    /// AFI location reported for Tag-it Standard / Pro
    pub const TI_STD_PRO_AFI_LOCATION: u16 = 64;

    /// Product bits of the STM IC reference
    pub const STM_IC_REF_MASK: u8 = 0xFC;
    /// LRi1K
    pub const STM_LRI1K: u8 = 0x40;
    /// LRi2K
    pub const STM_LRI2K: u8 = 0x20;
    /// LRiS2K
    pub const STM_LRIS2K: u8 = 0x28;
    /// LRiS64K
    pub const STM_LRIS64K: u8 = 0x44;
    /// M24LR64-R
    pub const STM_M24LR64_R: u8 = 0x2C;
    /// M24LR04E-R
    pub const STM_M24LR04E_R: u8 = 0x5A;
    /// M24LR16E-R
    pub const STM_M24LR16E_R: u8 = 0x4E;
    /// M24LR64E-R
    pub const STM_M24LR64E_R: u8 = 0x5E;
    /// LRi2K variant with IC reference 0x21
    pub const STM_LRI2K_IC_REF_21: u8 = 0x21;
    /// Blocks per READ MULTIPLE BLOCKS on STM parts
    pub const STM_MAX_BLOCKS_PER_READ: u16 = 32;
    /// STM parts cannot read across this boundary
    pub const STM_BLOCKS_PER_SECTOR: u16 = 32;

    /// Capability container bytes
    pub const CC_LEN: usize = 4;
    /// CC magic number
    pub const CC_MAGIC: u8 = 0xE1;
    /// Mapping version 1.0
    pub const CC_VERSION: u8 = 0x40;
    /// CC1 read access bits
    pub const CC1_READ_ACCESS_MASK: u8 = 0x0C;
    /// CC1 read access granted
    pub const CC1_READ_ACCESS_GRANTED: u8 = 0x00;
    /// CC1 write access bits
    pub const CC1_WRITE_ACCESS_MASK: u8 = 0x03;
    /// CC1 write access granted
    pub const CC1_WRITE_ACCESS_GRANTED: u8 = 0x00;
    /// CC1 write access denied
    pub const CC1_READ_ONLY: u8 = 0x03;
    /// CC3: READ MULTIPLE BLOCKS supported
    pub const CC3_MBREAD: u8 = 0x01;
    /// CC3: inventory page read supported
    pub const CC3_IPREAD: u8 = 0x02;
    /// CC3: memory larger than the CC size field
    pub const CC3_OVERFLOW: u8 = 0x04;
}
