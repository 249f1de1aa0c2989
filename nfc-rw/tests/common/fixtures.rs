// nfc-rw-rs/nfc-rw/tests/common/fixtures.rs
//! NDEF messages and tag images used across the integration tests.

/// Short well-known text record "en" + `text`.
pub fn text_record(text: &str) -> Vec<u8> {
    let mut payload = vec![0x02, b'e', b'n'];
    payload.extend_from_slice(text.as_bytes());
    let mut msg = vec![0xD1, 0x01, payload.len() as u8, b'T'];
    msg.extend(payload);
    msg
}

/// `len` bytes of recognisable filler, good enough as an opaque message.
pub fn opaque_message(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Type 2 data area holding one NDEF TLV after a Lock Control TLV.
pub fn t2t_area_with_lock_tlv(message: &[u8]) -> Vec<u8> {
    let mut area = vec![0x01, 0x03, 0xA0, 0x10, 0x44];
    area.extend(nfc_rw::protocol::tlv::ndef_tlv(message));
    area
}
