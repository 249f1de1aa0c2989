// nfc-rw-rs/nfc-rw/src/protocol/tlv.rs
//! TLV codec for tag data areas.
//!
//! Tag memory arrives a block or a segment at a time, so [`TlvCursor`] keeps
//! its scan state between calls and works on absolute tag byte offsets.
//! Lock, reserved and OTP bytes are skipped through a caller supplied
//! predicate; they never count as TLV bytes.

use derive_more::Display;

use crate::constants::tlv;

/// TLV record types found in a tag data area.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TlvType {
    /// Padding byte
    #[display(fmt = "NULL")]
    Null,
    /// Lock Control TLV
    #[display(fmt = "LOCK_CTRL")]
    LockControl,
    /// Memory Control TLV
    #[display(fmt = "MEM_CTRL")]
    MemoryControl,
    /// NDEF message TLV
    #[display(fmt = "NDEF")]
    Ndef,
    /// Proprietary TLV
    #[display(fmt = "PROPRIETARY")]
    Proprietary,
    /// Terminator TLV
    #[display(fmt = "TERMINATOR")]
    Terminator,
}

impl TlvType {
    /// Type from its tag byte; `None` for unknown bytes.
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            tlv::NULL => Some(Self::Null),
            tlv::LOCK_CTRL => Some(Self::LockControl),
            tlv::MEM_CTRL => Some(Self::MemoryControl),
            tlv::NDEF => Some(Self::Ndef),
            tlv::PROPRIETARY => Some(Self::Proprietary),
            tlv::TERMINATOR => Some(Self::Terminator),
            _ => None,
        }
    }

    /// Tag byte of the type.
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Null => tlv::NULL,
            Self::LockControl => tlv::LOCK_CTRL,
            Self::MemoryControl => tlv::MEM_CTRL,
            Self::Ndef => tlv::NDEF,
            Self::Proprietary => tlv::PROPRIETARY,
            Self::Terminator => tlv::TERMINATOR,
        }
    }

    /// Lock and Memory Control TLVs carry a 3-byte value the codec collects.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::LockControl | Self::MemoryControl)
    }
}

/// One TLV located by the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvRecord {
    /// Record type
    pub tlv_type: TlvType,
    /// Tag offset of the type byte
    pub offset: usize,
    /// Tag offset of the first length byte
    pub length_offset: usize,
    /// 1 or 3
    pub length_field_len: usize,
    /// Value length
    pub length: usize,
    /// Tag offset of the first value byte (the byte after the length field
    /// when the value is empty)
    pub value_offset: usize,
    /// Collected value of control TLVs; empty for other types
    pub value: Vec<u8>,
    /// Offset right after the record, known once the whole value was consumed
    pub next_offset: Option<usize>,
}

/// Outcome of one [`TlvCursor::next`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlvScan {
    /// A complete record header
    Record(TlvRecord),
    /// Terminator TLV
    Terminator {
        /// Tag offset of the terminator
        offset: usize,
    },
    /// The chunk ended before the next record was complete
    NeedMoreData,
    /// Unknown type byte
    Invalid {
        /// Tag offset of the bad byte
        offset: usize,
        /// The byte found
        type_byte: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Type,
    Len,
    LenHi,
    LenLo,
    /// Waiting for the first value byte
    ValueStart,
    /// Collecting the value of a control TLV
    ControlValue,
    /// Passing over `remaining` value bytes
    SkipValue { remaining: usize },
}

/// Resumable TLV scanner.
#[derive(Debug, Clone, Default)]
pub struct TlvCursor {
    pos: usize,
    phase: Phase,
    tlv_type: Option<TlvType>,
    offset: usize,
    length_offset: usize,
    length_field_len: usize,
    length: usize,
    value_offset: usize,
    value: Vec<u8>,
}

impl TlvCursor {
    /// Cursor whose first type byte is expected at tag offset `start`.
    pub fn new(start: usize) -> Self {
        Self {
            pos: start,
            ..Self::default()
        }
    }

    /// Next tag offset the cursor will examine.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Continue the scan over `chunk`, whose first byte sits at tag offset
    /// `chunk_offset`. Bytes for which `skip` returns true are ignored.
    pub fn next<F>(&mut self, chunk: &[u8], chunk_offset: usize, mut skip: F) -> TlvScan
    where
        F: FnMut(usize) -> bool,
    {
        if self.pos < chunk_offset {
            self.pos = chunk_offset;
        }
        let end = chunk_offset + chunk.len();
        while self.pos < end {
            let at = self.pos;
            if skip(at) {
                self.pos += 1;
                continue;
            }
            let byte = chunk[at - chunk_offset];
            match self.phase {
                Phase::Type => {
                    self.pos += 1;
                    match TlvType::from_u8(byte) {
                        Some(TlvType::Null) => {}
                        Some(TlvType::Terminator) => return TlvScan::Terminator { offset: at },
                        Some(t) => {
                            self.tlv_type = Some(t);
                            self.offset = at;
                            self.value.clear();
                            self.phase = Phase::Len;
                        }
                        None => {
                            return TlvScan::Invalid {
                                offset: at,
                                type_byte: byte,
                            };
                        }
                    }
                }
                Phase::Len => {
                    self.pos += 1;
                    self.length_offset = at;
                    if byte == tlv::LONG_LEN_MARKER {
                        self.length_field_len = tlv::LONG_LEN_FIELD_LEN;
                        self.phase = Phase::LenHi;
                    } else {
                        self.length_field_len = tlv::SHORT_LEN_FIELD_LEN;
                        self.length = byte as usize;
                        self.phase = Phase::ValueStart;
                    }
                }
                Phase::LenHi => {
                    self.pos += 1;
                    self.length = (byte as usize) << 8;
                    self.phase = Phase::LenLo;
                }
                Phase::LenLo => {
                    self.pos += 1;
                    self.length |= byte as usize;
                    self.phase = Phase::ValueStart;
                }
                Phase::ValueStart => {
                    self.value_offset = at;
                    let is_control = self.tlv_type.map(|t| t.is_control()).unwrap_or(false);
                    if is_control && self.length == tlv::CONTROL_TLV_LEN {
                        self.phase = Phase::ControlValue;
                    } else {
                        // Value not consumed yet: the caller may stop here
                        // (NDEF) or let the cursor pass over it.
                        self.phase = Phase::SkipValue {
                            remaining: self.length,
                        };
                        let next_offset = (self.length == 0).then_some(at);
                        return TlvScan::Record(self.record(next_offset));
                    }
                }
                Phase::ControlValue => {
                    self.pos += 1;
                    self.value.push(byte);
                    if self.value.len() == tlv::CONTROL_TLV_LEN {
                        self.phase = Phase::Type;
                        return TlvScan::Record(self.record(Some(self.pos)));
                    }
                }
                Phase::SkipValue { remaining } => {
                    if remaining == 0 {
                        self.phase = Phase::Type;
                        continue;
                    }
                    self.pos += 1;
                    self.phase = if remaining == 1 {
                        Phase::Type
                    } else {
                        Phase::SkipValue {
                            remaining: remaining - 1,
                        }
                    };
                }
            }
        }
        TlvScan::NeedMoreData
    }

    /// Scan until a record of `wanted` type, the terminator or an invalid
    /// byte. Records of other types are passed over.
    pub fn find<F>(&mut self, chunk: &[u8], chunk_offset: usize, wanted: TlvType, mut skip: F) -> TlvScan
    where
        F: FnMut(usize) -> bool,
    {
        loop {
            match self.next(chunk, chunk_offset, &mut skip) {
                TlvScan::Record(r) if r.tlv_type != wanted => continue,
                other => return other,
            }
        }
    }

    fn record(&self, next_offset: Option<usize>) -> TlvRecord {
        TlvRecord {
            tlv_type: self.tlv_type.unwrap_or(TlvType::Null),
            offset: self.offset,
            length_offset: self.length_offset,
            length_field_len: self.length_field_len,
            length: self.length,
            value_offset: self.value_offset,
            value: self.value.clone(),
            next_offset,
        }
    }
}

/// Number of bytes the length field of a `len` byte value takes.
pub fn length_field_len(len: usize) -> usize {
    if len < tlv::LONG_LEN_THRESHOLD {
        tlv::SHORT_LEN_FIELD_LEN
    } else {
        tlv::LONG_LEN_FIELD_LEN
    }
}

/// Encode a TLV length field.
pub fn encode_length(len: usize) -> Vec<u8> {
    if len < tlv::LONG_LEN_THRESHOLD {
        vec![len as u8]
    } else {
        let be = (len as u16).to_be_bytes();
        vec![tlv::LONG_LEN_MARKER, be[0], be[1]]
    }
}

/// Type byte plus length field: 2 bytes below 0xFF, otherwise 4.
pub fn write_tlv_header(tlv_type: TlvType, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    out.push(tlv_type.as_u8());
    out.extend(encode_length(len));
    out
}

/// Complete NDEF TLV followed by a terminator.
pub fn ndef_tlv(message: &[u8]) -> Vec<u8> {
    let mut out = write_tlv_header(TlvType::Ndef, message.len());
    out.extend_from_slice(message);
    out.push(tlv::TERMINATOR);
    out
}

/// Reduce a raw free byte count so a message of that size still fits once
/// its length field grows from 1 to 3 bytes.
///
/// `current_field_len` is the length field size reserved at detection time.
pub fn fit_length_field(raw_max: usize, current_field_len: usize) -> usize {
    if raw_max >= tlv::LONG_LEN_THRESHOLD && current_field_len == tlv::SHORT_LEN_FIELD_LEN {
        if raw_max == tlv::LONG_LEN_THRESHOLD {
            raw_max - 1
        } else {
            raw_max - (tlv::LONG_LEN_FIELD_LEN - tlv::SHORT_LEN_FIELD_LEN)
        }
    } else {
        raw_max
    }
}

/// Decoded value of a Lock or Memory Control TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlTlvValue {
    /// Tag byte offset of the first controlled byte
    pub offset: u16,
    /// Lock bits (Lock Control) or reserved bytes (Memory Control)
    pub size: u8,
    /// Bytes locked by one lock bit (Lock Control only)
    pub bytes_per_bit: u16,
}

/// Decode `[position, size, page control]` of a control TLV.
///
/// Byte address = page * 2^page_size + byte offset within the page.
pub fn decode_control_tlv(value: &[u8; 3]) -> ControlTlvValue {
    let pages = ((value[0] >> 4) & 0x0F) as u16;
    let byte_in_page = (value[0] & 0x0F) as u16;
    let page_size = 1u16 << (value[2] & 0x0F);
    ControlTlvValue {
        offset: pages.saturating_mul(page_size) + byte_in_page,
        size: value[1],
        bytes_per_bit: 1u16 << ((value[2] >> 4) & 0x0F),
    }
}

/// Encode a control TLV value for the given byte address.
///
/// Picks the smallest page size that fits, the way formatting code lays out
/// default TLVs.
pub fn encode_control_tlv(offset: u16, size: u8, bytes_per_bit: u16) -> Option<[u8; 3]> {
    if !bytes_per_bit.is_power_of_two() {
        return None;
    }
    let bpb_exp = bytes_per_bit.trailing_zeros() as u8;
    for page_exp in 0u8..=15 {
        let page = 1u16 << page_exp;
        let pages = offset / page;
        let rem = offset % page;
        if pages <= 0x0F && rem <= 0x0F {
            return Some([((pages as u8) << 4) | rem as u8, size, (bpb_exp << 4) | page_exp]);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_skip(_: usize) -> bool {
        false
    }

    #[test]
    fn finds_ndef_after_nulls() {
        let data = [0x00, 0x00, 0x03, 0x02, 0xD1, 0x01, 0xFE];
        let mut c = TlvCursor::new(16);
        match c.find(&data, 16, TlvType::Ndef, no_skip) {
            TlvScan::Record(r) => {
                assert_eq!(r.offset, 18);
                assert_eq!(r.length_offset, 19);
                assert_eq!(r.length, 2);
                assert_eq!(r.value_offset, 20);
                assert_eq!(r.length_field_len, 1);
            }
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn long_length_field() {
        let data = [0x03, 0xFF, 0x01, 0x2C, 0xAA];
        let mut c = TlvCursor::new(0);
        match c.next(&data, 0, no_skip) {
            TlvScan::Record(r) => {
                assert_eq!(r.length, 300);
                assert_eq!(r.length_field_len, 3);
                assert_eq!(r.value_offset, 4);
            }
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn resumes_across_chunks() {
        let data = [0x01, 0x03, 0xA0, 0x10, 0x44, 0x03, 0x00, 0xFE];
        let mut c = TlvCursor::new(0);
        assert_eq!(c.next(&data[..3], 0, no_skip), TlvScan::NeedMoreData);
        match c.next(&data[3..6], 3, no_skip) {
            TlvScan::Record(r) => {
                assert_eq!(r.tlv_type, TlvType::LockControl);
                assert_eq!(r.value, vec![0xA0, 0x10, 0x44]);
                assert_eq!(r.next_offset, Some(5));
            }
            other => panic!("expected lock record, got {:?}", other),
        }
        // NDEF type byte consumed, length byte in the next chunk
        assert_eq!(c.next(&data[3..6], 3, no_skip), TlvScan::NeedMoreData);
        match c.next(&data[6..], 6, no_skip) {
            TlvScan::Record(r) => {
                assert_eq!(r.tlv_type, TlvType::Ndef);
                assert_eq!(r.length, 0);
                assert_eq!(r.value_offset, 7);
                assert_eq!(r.next_offset, Some(7));
            }
            other => panic!("expected ndef record, got {:?}", other),
        }
        assert_eq!(c.next(&data[6..], 6, no_skip), TlvScan::Terminator { offset: 7 });
    }

    #[test]
    fn skipped_bytes_are_invisible() {
        // offsets 2 and 3 are lock bytes
        let data = [0x03, 0x02, 0xEE, 0xEE, 0xD1, 0x01];
        let mut c = TlvCursor::new(0);
        match c.next(&data, 0, |o| o == 2 || o == 3) {
            TlvScan::Record(r) => assert_eq!(r.value_offset, 4),
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn unknown_type_is_invalid() {
        let mut c = TlvCursor::new(0);
        assert_eq!(
            c.next(&[0x00, 0x42], 0, no_skip),
            TlvScan::Invalid {
                offset: 1,
                type_byte: 0x42
            }
        );
    }

    #[test]
    fn find_passes_over_proprietary_value() {
        let data = [0xFD, 0x02, 0x03, 0x03, 0x03, 0x01, 0x55];
        let mut c = TlvCursor::new(0);
        match c.find(&data, 0, TlvType::Ndef, no_skip) {
            TlvScan::Record(r) => {
                assert_eq!(r.offset, 4);
                assert_eq!(r.length, 1);
            }
            other => panic!("expected ndef, got {:?}", other),
        }
    }

    #[test]
    fn header_sizes_switch_at_ff() {
        assert_eq!(write_tlv_header(TlvType::Ndef, 0xFE), vec![0x03, 0xFE]);
        assert_eq!(
            write_tlv_header(TlvType::Ndef, 0xFF),
            vec![0x03, 0xFF, 0x00, 0xFF]
        );
        assert_eq!(length_field_len(254), 1);
        assert_eq!(length_field_len(255), 3);
    }

    #[test]
    fn fit_length_field_boundary() {
        assert_eq!(fit_length_field(254, 1), 254);
        assert_eq!(fit_length_field(255, 1), 254);
        assert_eq!(fit_length_field(300, 1), 298);
        assert_eq!(fit_length_field(300, 3), 300);
    }

    #[test]
    fn control_tlv_decode() {
        // page 0xF, 4 bytes per page (2^2), byte 2 in page, 8 bytes per bit
        let v = decode_control_tlv(&[0xF2, 0x30, 0x32]);
        assert_eq!(v.offset, 0x0F * 4 + 2);
        assert_eq!(v.size, 0x30);
        assert_eq!(v.bytes_per_bit, 8);

        let t1 = decode_control_tlv(&[0xF2, 0x30, 0x33]);
        assert_eq!(t1.offset, 122);
    }

    #[test]
    fn control_tlv_encode_round_trip() {
        let enc = encode_control_tlv(48, 16, 2).unwrap();
        let dec = decode_control_tlv(&enc);
        assert_eq!(dec.offset, 48);
        assert_eq!(dec.size, 16);
        assert_eq!(dec.bytes_per_bit, 2);
        assert!(encode_control_tlv(10, 1, 3).is_none());
    }

    #[test]
    fn ndef_tlv_appends_terminator() {
        assert_eq!(ndef_tlv(&[0xD1]), vec![0x03, 0x01, 0xD1, 0xFE]);
    }
}
