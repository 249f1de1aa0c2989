use nfc_rw::protocol::tlv::{
    length_field_len, ndef_tlv, write_tlv_header, TlvCursor, TlvRecord, TlvScan, TlvType,
};
use proptest::prelude::*;

use crate::common::fixtures;

/// Every non-`NeedMoreData` outcome of scanning `data` cut at `cuts`.
fn scan_chunked(data: &[u8], cuts: &[usize]) -> Vec<TlvScan> {
    let mut bounds: Vec<usize> = cuts.iter().map(|c| c % (data.len() + 1)).collect();
    bounds.push(0);
    bounds.push(data.len());
    bounds.sort_unstable();
    bounds.dedup();

    let mut cursor = TlvCursor::new(0);
    let mut out = Vec::new();
    for w in bounds.windows(2) {
        let chunk = &data[w[0]..w[1]];
        loop {
            match cursor.next(chunk, w[0], |_| false) {
                TlvScan::NeedMoreData => break,
                other => out.push(other),
            }
        }
    }
    out
}

fn first_record(data: &[u8]) -> TlvRecord {
    match TlvCursor::new(0).next(data, 0, |_| false) {
        TlvScan::Record(r) => r,
        other => panic!("expected a record, got {:?}", other),
    }
}

#[test]
fn ndef_found_after_lock_tlv() {
    let msg = fixtures::text_record("hi");
    let area = fixtures::t2t_area_with_lock_tlv(&msg);
    let mut cursor = TlvCursor::new(0);
    match cursor.find(&area, 0, TlvType::Ndef, |_| false) {
        TlvScan::Record(r) => {
            assert_eq!(r.offset, 5);
            assert_eq!(r.length, msg.len());
            assert_eq!(&area[r.value_offset..r.value_offset + r.length], msg.as_slice());
        }
        other => panic!("expected ndef, got {:?}", other),
    }
}

#[test]
fn long_message_uses_three_byte_length() {
    let msg = fixtures::opaque_message(300);
    let tlv = ndef_tlv(&msg);
    assert_eq!(&tlv[..4], &[0x03, 0xFF, 0x01, 0x2C]);
    assert_eq!(tlv.last(), Some(&0xFE));
    let r = first_record(&tlv);
    assert_eq!(r.length, 300);
    assert_eq!(r.value_offset, 4);
}

#[test]
fn scan_reaches_terminator_over_blocks() {
    let tlv = ndef_tlv(&fixtures::text_record("block"));
    let out = scan_chunked(&tlv, &[4, 8, 12]);
    assert!(matches!(out.first(), Some(TlvScan::Record(r)) if r.tlv_type == TlvType::Ndef));
    assert_eq!(out.last(), Some(&TlvScan::Terminator { offset: tlv.len() - 1 }));
}

proptest! {
    #[test]
    fn cursor_never_panics(data in proptest::collection::vec(any::<u8>(), 0..300), cuts in proptest::collection::vec(any::<usize>(), 0..8)) {
        let _ = scan_chunked(&data, &cuts);
    }

    #[test]
    fn chunking_does_not_change_outcome(data in proptest::collection::vec(any::<u8>(), 0..200), cuts in proptest::collection::vec(any::<usize>(), 1..8)) {
        prop_assert_eq!(scan_chunked(&data, &[]), scan_chunked(&data, &cuts));
    }

    #[test]
    fn header_and_parser_agree(len in 0usize..=0xFFFF) {
        let mut data = write_tlv_header(TlvType::Ndef, len);
        let header_len = data.len();
        data.push(0xFE);
        let r = first_record(&data);
        prop_assert_eq!(r.length, len);
        prop_assert_eq!(r.length_field_len, length_field_len(len));
        prop_assert_eq!(r.value_offset, header_len);
        prop_assert_eq!(header_len, 1 + length_field_len(len));
    }
}
