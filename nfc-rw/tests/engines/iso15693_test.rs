use nfc_rw::constants::i93;
use nfc_rw::events::{RwEvent, Status};
use nfc_rw::tags::{I93Engine, TagEngine};
use nfc_rw::test_support::{drive, SimI93, SLIX_UID};

use crate::common::fixtures;
use crate::common::helpers::{detect_result, mock_link, read_payload, Lossy};

fn engine_for(tag: &SimI93) -> I93Engine {
    I93Engine::new(tag.uid, tag.dsfid)
}

#[test]
fn long_message_on_m24lr04e() {
    let mut tag = SimI93::m24lr04e(&fixtures::text_record("stm"));
    let (mut link, mock) = mock_link();
    let mut eng = engine_for(&tag);
    eng.detect_ndef(&mut link).unwrap();
    assert_eq!(detect_result(&drive(&mut eng, &mut link, &mock, &mut tag)).status, Status::Ok);

    let msg = fixtures::opaque_message(300);
    eng.write_ndef(&mut link, &msg).unwrap();
    assert_eq!(
        drive(&mut eng, &mut link, &mock, &mut tag),
        vec![RwEvent::NdefUpdateComplete]
    );

    eng.on_deactivate(&mut link);
    let mut eng = engine_for(&tag);
    eng.detect_ndef(&mut link).unwrap();
    let d = detect_result(&drive(&mut eng, &mut link, &mock, &mut tag));
    assert_eq!(d.cur_size, 300);
    eng.read_ndef(&mut link).unwrap();
    assert_eq!(read_payload(&drive(&mut eng, &mut link, &mock, &mut tag)), msg);
}

#[test]
fn blank_slix_format_write_read() {
    let mut tag = SimI93::blank(SLIX_UID, 0x01, 4, 28);
    let (mut link, mock) = mock_link();
    let mut eng = engine_for(&tag);
    eng.format_ndef(&mut link).unwrap();
    assert_eq!(
        drive(&mut eng, &mut link, &mock, &mut tag),
        vec![RwEvent::FormatComplete { status: Status::Ok }]
    );
    eng.detect_ndef(&mut link).unwrap();
    assert_eq!(detect_result(&drive(&mut eng, &mut link, &mock, &mut tag)).cur_size, 0);

    let msg = fixtures::text_record("icode");
    eng.write_ndef(&mut link, &msg).unwrap();
    assert_eq!(
        drive(&mut eng, &mut link, &mock, &mut tag),
        vec![RwEvent::NdefUpdateComplete]
    );
    eng.read_ndef(&mut link).unwrap();
    assert_eq!(read_payload(&drive(&mut eng, &mut link, &mock, &mut tag)), msg);
}

#[test]
fn read_only_tag_keeps_its_message() {
    let msg = fixtures::text_record("frozen");
    let mut tag = SimI93::icode_slix(&msg);
    let (mut link, mock) = mock_link();
    let mut eng = engine_for(&tag);
    eng.detect_ndef(&mut link).unwrap();
    drive(&mut eng, &mut link, &mock, &mut tag);

    eng.set_tag_read_only(&mut link, true).unwrap();
    assert_eq!(
        drive(&mut eng, &mut link, &mock, &mut tag),
        vec![RwEvent::SetTagReadOnly { status: Status::Ok }]
    );
    assert!(tag.locked[0]);

    eng.write_ndef(&mut link, &fixtures::text_record("new")).unwrap_err();
    eng.read_ndef(&mut link).unwrap();
    assert_eq!(read_payload(&drive(&mut eng, &mut link, &mock, &mut tag)), msg);
}

#[test]
fn lost_answer_during_detection_is_retried() {
    let mut tag = Lossy::new(SimI93::icode_slix(&fixtures::text_record("lossy")), 1);
    let (mut link, mock) = mock_link();
    let mut eng = engine_for(&tag.inner);
    eng.detect_ndef(&mut link).unwrap();
    let d = detect_result(&drive(&mut eng, &mut link, &mock, &mut tag));
    assert_eq!(d.status, Status::Ok);
    assert_eq!(link.stats().num_retries, 1);
}

#[test]
fn messages_around_the_long_length_field_read_back_intact() {
    for len in [254usize, 255, 256] {
        let mut tag = SimI93::m24lr04e(&fixtures::text_record("seed"));
        let (mut link, mock) = mock_link();
        let mut eng = engine_for(&tag);
        eng.detect_ndef(&mut link).unwrap();
        drive(&mut eng, &mut link, &mock, &mut tag);

        let msg = fixtures::opaque_message(len);
        eng.write_ndef(&mut link, &msg).unwrap();
        assert_eq!(
            drive(&mut eng, &mut link, &mock, &mut tag),
            vec![RwEvent::NdefUpdateComplete],
            "len {}",
            len
        );

        let mut eng = engine_for(&tag);
        eng.detect_ndef(&mut link).unwrap();
        let d = detect_result(&drive(&mut eng, &mut link, &mock, &mut tag));
        assert_eq!(d.cur_size as usize, len);
        eng.read_ndef(&mut link).unwrap();
        assert_eq!(read_payload(&drive(&mut eng, &mut link, &mock, &mut tag)), msg, "len {}", len);
    }
}

#[test]
fn failed_presence_check_keeps_detected_sizes() {
    let mut tag = SimI93::icode_slix(&fixtures::text_record("here"));
    let (mut link, mock) = mock_link();
    let mut eng = engine_for(&tag);
    eng.detect_ndef(&mut link).unwrap();
    assert_eq!(detect_result(&drive(&mut eng, &mut link, &mock, &mut tag)).status, Status::Ok);
    let sizes = eng.ndef_sizes();
    assert!(sizes.cur_size > 0 && sizes.max_size > sizes.cur_size);

    tag.mute = true;
    eng.presence_check(&mut link).unwrap();
    assert_eq!(
        drive(&mut eng, &mut link, &mock, &mut tag),
        vec![RwEvent::PresenceCheck { status: Status::Timeout }]
    );
    assert_eq!(eng.ndef_sizes(), sizes);
    assert!(eng.is_idle());
}

#[test]
fn system_info_needing_protocol_extension_is_resent_once() {
    let msg = fixtures::text_record("ext");
    let mut tag = SimI93::m24lr04e(&msg);
    tag.needs_prot_ext = true;
    let (mut link, mock) = mock_link();
    let mut eng = engine_for(&tag);
    eng.detect_ndef(&mut link).unwrap();
    let d = detect_result(&drive(&mut eng, &mut link, &mock, &mut tag));
    assert_eq!(d.status, Status::Ok);
    assert_eq!(d.cur_size as usize, msg.len());

    let sysinfo: Vec<_> = tag.log.iter().filter(|f| f[1] == i93::CMD_GET_SYS_INFO).collect();
    assert_eq!(sysinfo.len(), 2);
    assert_eq!(sysinfo[0][0] & i93::FLAG_PROT_EXT, 0);
    assert_ne!(sysinfo[1][0] & i93::FLAG_PROT_EXT, 0);
    assert_eq!(link.stats().num_retries, 0);
    assert_eq!(link.stats().num_fail, 0);
}
