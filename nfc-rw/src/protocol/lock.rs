// nfc-rw-rs/nfc-rw/src/protocol/lock.rs
//! Lock / reserved byte tracking for Type 1 and Type 2 tag memory.
//!
//! The tracker keeps the Lock Control and Memory Control TLVs found during
//! detection plus the dynamic lock bytes they announce. Two per-segment
//! bitmaps are derived from them on demand:
//!
//! - lock/reserved: bytes that are not NDEF data (static reserved area,
//!   dynamic lock bytes, Memory Control reserved bytes)
//! - read-only: bytes covered by a set static or dynamic lock bit
//!
//! Only one segment of each bitmap is cached; querying an offset in another
//! segment rebuilds it.

use std::ops::Range;

use crate::protocol::tlv::ControlTlvValue;
use crate::{Error, Result};

/// Bytes per attribute segment (one bit per byte).
pub const SEGMENT_SIZE: usize = 128;
const BITMAP_BYTES: usize = SEGMENT_SIZE / 8;

/// Layout parameters that differ between tag families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockLayout {
    /// Tag offset of the first byte covered by dynamic lock bits
    pub dynamic_lock_base: usize,
    /// Lock Control TLVs tracked at most
    pub max_lock_tlvs: usize,
    /// Memory Control TLVs tracked at most
    pub max_mem_tlvs: usize,
    /// Dynamic lock bytes tracked at most
    pub max_lock_bytes: usize,
}

impl LockLayout {
    /// Type 1: dynamic lock bits start right after the static 128 bytes.
    pub const TYPE1: Self = Self {
        dynamic_lock_base: 128,
        max_lock_tlvs: crate::constants::t1t::MAX_LOCK_TLVS,
        max_mem_tlvs: crate::constants::t1t::MAX_MEM_TLVS,
        max_lock_bytes: crate::constants::t1t::MAX_LOCK_BYTES,
    };

    /// Type 2: dynamic lock bits start after the 64 statically locked bytes.
    pub const TYPE2: Self = Self {
        dynamic_lock_base: crate::constants::t2t::STATIC_SIZE,
        max_lock_tlvs: crate::constants::t2t::MAX_LOCK_TLVS,
        max_mem_tlvs: crate::constants::t2t::MAX_MEM_TLVS,
        max_lock_bytes: crate::constants::t2t::MAX_LOCK_BYTES,
    };

    /// Same layout with another dynamic lock base.
    pub fn with_dynamic_lock_base(mut self, base: usize) -> Self {
        self.dynamic_lock_base = base;
        self
    }
}

/// Lock Control TLV as stored by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LockTlvInfo {
    /// Tag offset of the first dynamic lock byte
    pub offset: usize,
    /// Number of dynamic lock bits
    pub num_bits: usize,
    /// Tag bytes covered by each lock bit
    pub bytes_locked_per_bit: usize,
}

impl From<ControlTlvValue> for LockTlvInfo {
    fn from(v: ControlTlvValue) -> Self {
        Self {
            offset: v.offset as usize,
            num_bits: if v.size == 0 { 256 } else { v.size as usize },
            bytes_locked_per_bit: v.bytes_per_bit as usize,
        }
    }
}

/// Memory Control TLV: a run of reserved bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemTlvInfo {
    /// Tag offset of the first reserved byte
    pub offset: usize,
    /// Number of reserved bytes
    pub num_bytes: usize,
}

impl From<ControlTlvValue> for MemTlvInfo {
    fn from(v: ControlTlvValue) -> Self {
        Self {
            offset: v.offset as usize,
            num_bytes: if v.size == 0 { 256 } else { v.size as usize },
        }
    }
}

/// Progress of setting one dynamic lock byte during hard locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockStatus {
    /// Not written yet
    #[default]
    NotUpdated,
    /// Write sent, waiting for the answer
    UpdateInitiated,
    /// Written
    Updated,
}

/// One dynamic lock byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockByte {
    /// Lock Control TLV this byte belongs to
    pub tlv_index: usize,
    /// Index of this byte among the bytes of its TLV
    pub byte_index: usize,
    /// Value read from the tag
    pub value: u8,
    /// `value` holds what the tag stores
    pub read: bool,
    /// Hard lock progress
    pub status: LockStatus,
}

/// One attribute bit per byte of a 128 byte segment.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentBitmap([u8; BITMAP_BYTES]);

impl SegmentBitmap {
    /// All bits clear.
    pub fn new() -> Self {
        Self::default()
    }

    /// `index` is the byte position inside the segment.
    pub fn get(&self, index: usize) -> bool {
        index < SEGMENT_SIZE && self.0[index / 8] & (1 << (index % 8)) != 0
    }

    /// Set the bit for byte `index` of the segment.
    pub fn set(&mut self, index: usize) {
        if index < SEGMENT_SIZE {
            self.0[index / 8] |= 1 << (index % 8);
        }
    }

    /// Set every position of `range` that falls inside the segment.
    pub fn set_range(&mut self, range: Range<usize>) {
        for i in range.start..range.end.min(SEGMENT_SIZE) {
            self.set(i);
        }
    }

    /// Clear every bit.
    pub fn clear(&mut self) {
        self.0 = [0; BITMAP_BYTES];
    }

    /// Number of bits set.
    pub fn count(&self) -> usize {
        self.0.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Raw bitmap bytes, byte 0 bit 0 first.
    pub fn as_bytes(&self) -> &[u8; BITMAP_BYTES] {
        &self.0
    }
}

impl std::fmt::Debug for SegmentBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SegmentBitmap({})", crate::utils::bytes_to_hex(&self.0))
    }
}

/// Dynamic lock bits whose coverage touches a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockBitRange {
    /// Index (into the lock byte list) of the first lock byte involved
    pub start_byte: usize,
    /// First relevant bit of `start_byte`
    pub start_bit: u8,
    /// Index of the last lock byte involved (inclusive)
    pub end_byte: usize,
    /// Lock bits involved
    pub total_bits: usize,
}

/// Per-activation lock/reserved bookkeeping.
#[derive(Debug, Clone)]
pub struct LockTracker {
    layout: LockLayout,
    lock_tlvs: Vec<LockTlvInfo>,
    mem_tlvs: Vec<MemTlvInfo>,
    lock_bytes: Vec<LockByte>,
    static_reserved: SegmentBitmap,
    static_read_only: SegmentBitmap,
    attr: Option<(usize, SegmentBitmap)>,
    lock_attr: Option<(usize, SegmentBitmap)>,
}

impl LockTracker {
    /// Empty tracker for `layout`.
    pub fn new(layout: LockLayout) -> Self {
        Self {
            layout,
            lock_tlvs: Vec::new(),
            mem_tlvs: Vec::new(),
            lock_bytes: Vec::new(),
            static_reserved: SegmentBitmap::new(),
            static_read_only: SegmentBitmap::new(),
            attr: None,
            lock_attr: None,
        }
    }

    /// Family layout.
    pub fn layout(&self) -> &LockLayout {
        &self.layout
    }

    /// Forget every TLV and cached attribute (new detection).
    pub fn reset(&mut self) {
        self.lock_tlvs.clear();
        self.mem_tlvs.clear();
        self.lock_bytes.clear();
        self.static_reserved.clear();
        self.static_read_only.clear();
        self.invalidate();
    }

    /// Drop the cached bitmaps; the next query rebuilds them.
    pub fn invalidate(&mut self) {
        self.attr = None;
        self.lock_attr = None;
    }

    /// Segment 0 bytes that are never NDEF data (header, CC, reserved blocks).
    pub fn set_static_reserved(&mut self, bitmap: SegmentBitmap) {
        self.static_reserved = bitmap;
        self.invalidate();
    }

    /// Segment 0 bytes made read-only by the static lock bytes.
    pub fn set_static_read_only(&mut self, bitmap: SegmentBitmap) {
        self.static_read_only = bitmap;
        self.lock_attr = None;
    }

    /// Register a Lock Control TLV and its lock bytes.
    ///
    /// Lock bytes beyond the family maximum are not tracked.
    pub fn add_lock_tlv(&mut self, info: LockTlvInfo) -> Result<usize> {
        if self.lock_tlvs.len() >= self.layout.max_lock_tlvs {
            return Err(Error::DataCorruption("too many lock control TLVs".into()));
        }
        if info.bytes_locked_per_bit == 0 {
            return Err(Error::DataCorruption("lock control TLV locks no bytes".into()));
        }
        let tlv_index = self.lock_tlvs.len();
        self.lock_tlvs.push(info);
        let num_bytes = info.num_bits.div_ceil(8);
        for byte_index in 0..num_bytes {
            if self.lock_bytes.len() >= self.layout.max_lock_bytes {
                log::warn!("lock byte table full, ignoring the rest of TLV {}", tlv_index);
                break;
            }
            self.lock_bytes.push(LockByte {
                tlv_index,
                byte_index,
                value: 0,
                read: false,
                status: LockStatus::NotUpdated,
            });
        }
        self.invalidate();
        Ok(tlv_index)
    }

    /// Register a Memory Control TLV.
    pub fn add_mem_tlv(&mut self, info: MemTlvInfo) -> Result<()> {
        if self.mem_tlvs.len() >= self.layout.max_mem_tlvs {
            return Err(Error::DataCorruption("too many memory control TLVs".into()));
        }
        self.mem_tlvs.push(info);
        self.attr = None;
        Ok(())
    }

    /// Lock Control TLVs found so far.
    pub fn lock_tlvs(&self) -> &[LockTlvInfo] {
        &self.lock_tlvs
    }

    /// Memory Control TLVs found so far.
    pub fn mem_tlvs(&self) -> &[MemTlvInfo] {
        &self.mem_tlvs
    }

    /// Dynamic lock bytes, in TLV order.
    pub fn lock_bytes(&self) -> &[LockByte] {
        &self.lock_bytes
    }

    /// Lock byte `index` for update. Drops the cached read-only bitmap.
    pub fn lock_byte_mut(&mut self, index: usize) -> Option<&mut LockByte> {
        self.lock_attr = None;
        self.lock_bytes.get_mut(index)
    }

    /// Tag offset of lock byte `index`.
    pub fn lock_byte_offset(&self, index: usize) -> Option<usize> {
        let lb = self.lock_bytes.get(index)?;
        let tlv = self.lock_tlvs.get(lb.tlv_index)?;
        Some(tlv.offset + lb.byte_index)
    }

    /// Number of meaningful bits in lock byte `index` (the last byte of a
    /// TLV may be partial).
    pub fn bits_in_lock_byte(&self, index: usize) -> u8 {
        let Some(lb) = self.lock_bytes.get(index) else {
            return 0;
        };
        let Some(tlv) = self.lock_tlvs.get(lb.tlv_index) else {
            return 0;
        };
        if (lb.byte_index + 1) * 8 <= tlv.num_bits {
            8
        } else {
            (tlv.num_bits % 8) as u8
        }
    }

    /// Mask with the meaningful bits of lock byte `index` set.
    pub fn lock_byte_mask(&self, index: usize) -> u8 {
        match self.bits_in_lock_byte(index) {
            8 => 0xFF,
            n => (1u8 << n) - 1,
        }
    }

    /// Bytes taken by dynamic lock bytes and reserved memory.
    pub fn control_byte_count(&self) -> usize {
        self.lock_bytes.len() + self.mem_tlvs.iter().map(|m| m.num_bytes).sum::<usize>()
    }

    /// Store the values of unread lock bytes present in `chunk`, which
    /// starts at tag offset `chunk_offset`.
    ///
    /// Lock bytes are taken in order; collection stops at the first unread
    /// byte outside the chunk. Returns how many were stored.
    pub fn fill_lock_bytes(&mut self, chunk: &[u8], chunk_offset: usize) -> usize {
        let end = chunk_offset + chunk.len();
        let mut stored = 0;
        for i in 0..self.lock_bytes.len() {
            if self.lock_bytes[i].read {
                continue;
            }
            let Some(offset) = self.lock_byte_offset(i) else {
                break;
            };
            if offset < chunk_offset || offset >= end {
                break;
            }
            let lb = &mut self.lock_bytes[i];
            lb.value = chunk[offset - chunk_offset];
            lb.read = true;
            stored += 1;
        }
        if stored > 0 {
            self.lock_attr = None;
        }
        stored
    }

    /// Treat every lock byte as read and clear (locks are not consulted).
    pub fn assume_unlocked(&mut self) {
        for lb in &mut self.lock_bytes {
            lb.value = 0;
            lb.read = true;
        }
        self.lock_attr = None;
    }

    /// First lock byte whose value is still unknown.
    pub fn first_unread_lock_byte(&self) -> Option<usize> {
        self.lock_bytes.iter().position(|lb| !lb.read)
    }

    /// True once every lock byte value is known.
    pub fn all_lock_bytes_read(&self) -> bool {
        self.first_unread_lock_byte().is_none()
    }

    /// Tag bytes covered by the dynamic lock bits of lock TLV `tlv_index`.
    pub fn lock_tlv_coverage(&self, tlv_index: usize) -> Option<Range<usize>> {
        let tlv = self.lock_tlvs.get(tlv_index)?;
        let before: usize = self.lock_tlvs[..tlv_index]
            .iter()
            .map(|t| t.num_bits * t.bytes_locked_per_bit)
            .sum();
        let start = self.layout.dynamic_lock_base + before;
        Some(start..start + tlv.num_bits * tlv.bytes_locked_per_bit)
    }

    /// Every tag byte the dynamic lock bits can lock.
    pub fn dynamic_coverage(&self) -> Range<usize> {
        let total: usize = self
            .lock_tlvs
            .iter()
            .map(|t| t.num_bits * t.bytes_locked_per_bit)
            .sum();
        self.layout.dynamic_lock_base..self.layout.dynamic_lock_base + total
    }

    /// Dynamic lock bits in order as `(lock byte index, bit, covered tag range)`.
    /// Coverage is contiguous from the layout's dynamic lock base.
    fn lock_bits(&self) -> Vec<(usize, u8, Range<usize>)> {
        let mut cursor = self.layout.dynamic_lock_base;
        let mut bits = Vec::new();
        for (i, lb) in self.lock_bytes.iter().enumerate() {
            let bpb = self
                .lock_tlvs
                .get(lb.tlv_index)
                .map(|t| t.bytes_locked_per_bit)
                .unwrap_or(0);
            for bit in 0..self.bits_in_lock_byte(i) {
                bits.push((i, bit, cursor..cursor + bpb));
                cursor += bpb;
            }
        }
        bits
    }

    /// Dynamic lock bits whose coverage intersects `segment`.
    pub fn lock_bits_for_segment(&self, segment: usize) -> Option<LockBitRange> {
        let lower = segment * SEGMENT_SIZE;
        let upper = lower + SEGMENT_SIZE;
        let mut found: Option<LockBitRange> = None;
        for (i, bit, range) in self.lock_bits() {
            if range.end <= lower || range.start >= upper {
                if range.start >= upper {
                    break;
                }
                continue;
            }
            match found.as_mut() {
                None => {
                    found = Some(LockBitRange {
                        start_byte: i,
                        start_bit: bit,
                        end_byte: i,
                        total_bits: 1,
                    })
                }
                Some(r) => {
                    r.end_byte = i;
                    r.total_bits += 1;
                }
            }
        }
        found
    }

    /// True for bytes that are not NDEF data: static reserved bytes, dynamic
    /// lock bytes and Memory Control reserved bytes.
    pub fn is_lock_or_reserved(&mut self, offset: usize) -> bool {
        let segment = offset / SEGMENT_SIZE;
        let bitmap = match self.attr {
            Some((seg, bitmap)) if seg == segment => bitmap,
            _ => {
                let bitmap = self.build_attributes(segment);
                self.attr = Some((segment, bitmap));
                bitmap
            }
        };
        bitmap.get(offset % SEGMENT_SIZE)
    }

    /// True for bytes protected by a set static or dynamic lock bit.
    pub fn is_read_only(&mut self, offset: usize) -> bool {
        let segment = offset / SEGMENT_SIZE;
        let bitmap = match self.lock_attr {
            Some((seg, bitmap)) if seg == segment => bitmap,
            _ => {
                let bitmap = self.build_lock_attributes(segment);
                self.lock_attr = Some((segment, bitmap));
                bitmap
            }
        };
        bitmap.get(offset % SEGMENT_SIZE)
    }

    fn build_attributes(&self, segment: usize) -> SegmentBitmap {
        let lower = segment * SEGMENT_SIZE;
        let upper = lower + SEGMENT_SIZE;
        let mut bitmap = if segment == 0 {
            self.static_reserved
        } else {
            SegmentBitmap::new()
        };
        for i in 0..self.lock_bytes.len() {
            if let Some(offset) = self.lock_byte_offset(i) {
                if (lower..upper).contains(&offset) {
                    bitmap.set(offset - lower);
                }
            }
        }
        for mem in &self.mem_tlvs {
            let start = mem.offset.max(lower);
            let end = (mem.offset + mem.num_bytes).min(upper);
            if start < end {
                bitmap.set_range(start - lower..end - lower);
            }
        }
        log::trace!("segment {} lock/reserved attributes {:?}", segment, bitmap);
        bitmap
    }

    fn build_lock_attributes(&self, segment: usize) -> SegmentBitmap {
        let lower = segment * SEGMENT_SIZE;
        let upper = lower + SEGMENT_SIZE;
        let mut bitmap = if segment == 0 {
            self.static_read_only
        } else {
            SegmentBitmap::new()
        };
        if self.lock_bits_for_segment(segment).is_some() {
            for (i, bit, range) in self.lock_bits() {
                if range.start >= upper {
                    break;
                }
                if range.end <= lower || self.lock_bytes[i].value & (1 << bit) == 0 {
                    continue;
                }
                let start = range.start.max(lower) - lower;
                let end = range.end.min(upper) - lower;
                bitmap.set_range(start..end);
            }
        }
        log::trace!("segment {} read-only attributes {:?}", segment, bitmap);
        bitmap
    }
}

/// Read-only bitmap for segment 0 from the two static lock bytes: bit `n`
/// of `lock0 | lock1 << 8` locks block `n` of `block_size` bytes.
/// `always_locked` blocks are locked regardless of the lock bits.
pub fn static_lock_bitmap(lock0: u8, lock1: u8, block_size: usize, always_locked: &[usize]) -> SegmentBitmap {
    let bits = u16::from_le_bytes([lock0, lock1]);
    let mut bitmap = SegmentBitmap::new();
    for block in 0..16 {
        if bits & (1 << block) != 0 || always_locked.contains(&block) {
            bitmap.set_range(block * block_size..(block + 1) * block_size);
        }
    }
    bitmap
}
