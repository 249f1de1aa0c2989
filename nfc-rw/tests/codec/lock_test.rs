use nfc_rw::protocol::lock::{static_lock_bitmap, LockLayout, LockTlvInfo, LockTracker, MemTlvInfo};
use nfc_rw::protocol::tlv::decode_control_tlv;
use proptest::prelude::*;

#[test]
fn type2_static_locks_follow_block_bits() {
    // lock bits for blocks 3 (CC) and 4
    let bitmap = static_lock_bitmap(0x18, 0x00, 4, &[0, 1, 2]);
    let mut t = LockTracker::new(LockLayout::TYPE2);
    t.set_static_read_only(bitmap);
    assert!(t.is_read_only(0));
    assert!(t.is_read_only(12));
    assert!(t.is_read_only(19));
    assert!(!t.is_read_only(20));
    assert!(!t.is_read_only(63));
}

#[test]
fn control_tlvs_from_tag_bytes() {
    // Topaz 512: lock bytes at 122, reserved bytes right after them
    let lock = decode_control_tlv(&[0xF2, 0x30, 0x33]);
    let mem = decode_control_tlv(&[0xF0, 0x02, 0x03]);
    let mut t = LockTracker::new(LockLayout::TYPE1);
    t.add_lock_tlv(LockTlvInfo::from(lock)).unwrap();
    t.add_mem_tlv(MemTlvInfo::from(mem)).unwrap();

    assert_eq!(t.lock_bytes().len(), 6);
    assert_eq!(t.lock_byte_offset(0), Some(122));
    assert!(t.is_lock_or_reserved(122));
    assert!(t.is_lock_or_reserved(127));
    assert!(t.is_lock_or_reserved(120));
    assert!(!t.is_lock_or_reserved(128));
    assert_eq!(t.dynamic_coverage(), 128..128 + 48 * 8);
}

#[test]
fn unread_lock_bytes_are_collected_in_order() {
    let mut t = LockTracker::new(LockLayout::TYPE2);
    t.add_lock_tlv(LockTlvInfo {
        offset: 160,
        num_bits: 24,
        bytes_locked_per_bit: 4,
    })
    .unwrap();
    assert_eq!(t.first_unread_lock_byte(), Some(0));
    assert_eq!(t.fill_lock_bytes(&[0xFF, 0x01], 160), 2);
    assert_eq!(t.first_unread_lock_byte(), Some(2));
    assert_eq!(t.fill_lock_bytes(&[0x00; 16], 160), 1);
    assert!(t.all_lock_bytes_read());
    assert_eq!(t.lock_byte_mask(2), 0xFF);
}

proptest! {
    #[test]
    fn read_only_bytes_match_set_bits(values in proptest::collection::vec(any::<u8>(), 1..6), bpb_exp in 0u32..4) {
        let bpb = 1usize << bpb_exp;
        let num_bits = values.len() * 8;
        let mut t = LockTracker::new(LockLayout::TYPE2);
        t.add_lock_tlv(LockTlvInfo { offset: 600, num_bits, bytes_locked_per_bit: bpb }).unwrap();
        t.fill_lock_bytes(&values, 600);

        let base = LockLayout::TYPE2.dynamic_lock_base;
        let locked = (base..base + num_bits * bpb).filter(|&o| t.is_read_only(o)).count();
        let set_bits: usize = values.iter().map(|v| v.count_ones() as usize).sum();
        prop_assert_eq!(locked, set_bits * bpb);
    }

    #[test]
    fn partial_last_byte_mask(num_bits in 1usize..64) {
        let mut t = LockTracker::new(LockLayout::TYPE2);
        t.add_lock_tlv(LockTlvInfo { offset: 600, num_bits, bytes_locked_per_bit: 1 }).unwrap();
        let last = t.lock_bytes().len() - 1;
        let expected_bits = if num_bits % 8 == 0 { 8 } else { num_bits % 8 };
        prop_assert_eq!(t.bits_in_lock_byte(last) as usize, expected_bits);
        prop_assert_eq!(t.lock_byte_mask(last).count_ones() as usize, expected_bits);
    }
}
