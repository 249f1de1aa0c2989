use nfc_rw::events::{NdefFlags, RwEvent, Status};
use nfc_rw::tags::{T1tEngine, TagEngine};
use nfc_rw::test_support::{drive, SimT1t};

use crate::common::fixtures;
use crate::common::helpers::{detect_result, mock_link, read_payload, Lossy};

#[test]
fn blank_topaz_is_formatted_written_and_read_after_reactivation() {
    let mut tag = SimT1t::blank_dynamic();
    let (mut link, mock) = mock_link();
    let mut eng = T1tEngine::new(tag.header_rom(), tag.uid4());

    eng.detect_ndef(&mut link).unwrap();
    let d = detect_result(&drive(&mut eng, &mut link, &mock, &mut tag));
    assert_eq!(d.status, Status::Failed);
    assert!(d.flags.contains(NdefFlags::FORMATABLE));

    eng.format_ndef(&mut link).unwrap();
    assert_eq!(
        drive(&mut eng, &mut link, &mock, &mut tag),
        vec![RwEvent::FormatComplete { status: Status::Ok }]
    );
    eng.detect_ndef(&mut link).unwrap();
    let d = detect_result(&drive(&mut eng, &mut link, &mock, &mut tag));
    assert_eq!((d.status, d.cur_size), (Status::Ok, 0));

    let msg = fixtures::text_record("hello topaz");
    eng.write_ndef(&mut link, &msg).unwrap();
    assert_eq!(
        drive(&mut eng, &mut link, &mock, &mut tag),
        vec![RwEvent::NdefUpdateComplete]
    );

    // the tag leaves and comes back
    eng.on_deactivate(&mut link);
    let mut eng = T1tEngine::new(tag.header_rom(), tag.uid4());
    eng.detect_ndef(&mut link).unwrap();
    let d = detect_result(&drive(&mut eng, &mut link, &mock, &mut tag));
    assert_eq!(d.cur_size as usize, msg.len());
    eng.read_ndef(&mut link).unwrap();
    assert_eq!(read_payload(&drive(&mut eng, &mut link, &mock, &mut tag)), msg);
}

#[test]
fn lost_frames_are_retransmitted_transparently() {
    let msg = fixtures::text_record("retry");
    let mut tag = Lossy::new(SimT1t::formatted_static(&msg), 2);
    let (mut link, mock) = mock_link();
    let mut eng = T1tEngine::new(tag.inner.header_rom(), tag.inner.uid4());

    eng.detect_ndef(&mut link).unwrap();
    let d = detect_result(&drive(&mut eng, &mut link, &mock, &mut tag));
    assert_eq!(d.status, Status::Ok);
    assert_eq!(d.cur_size as usize, msg.len());
    assert_eq!(link.stats().num_retries, 2);
    assert_eq!(link.stats().num_fail, 0);
}

#[test]
fn soft_locked_tag_refuses_writes_but_reads() {
    let msg = fixtures::text_record("locked");
    let mut tag = SimT1t::formatted_dynamic(&msg);
    let (mut link, mock) = mock_link();
    let mut eng = T1tEngine::new(tag.header_rom(), tag.uid4());
    eng.detect_ndef(&mut link).unwrap();
    drive(&mut eng, &mut link, &mock, &mut tag);

    eng.set_tag_read_only(&mut link, false).unwrap();
    assert_eq!(
        drive(&mut eng, &mut link, &mock, &mut tag),
        vec![RwEvent::SetTagReadOnly { status: Status::Ok }]
    );

    let mut eng = T1tEngine::new(tag.header_rom(), tag.uid4());
    eng.detect_ndef(&mut link).unwrap();
    let d = detect_result(&drive(&mut eng, &mut link, &mock, &mut tag));
    assert!(d.flags.contains(NdefFlags::READ_ONLY));
    assert!(eng.write_ndef(&mut link, &[0xD0, 0x00, 0x00]).is_err());
    eng.read_ndef(&mut link).unwrap();
    assert_eq!(read_payload(&drive(&mut eng, &mut link, &mock, &mut tag)), msg);
}

#[test]
fn messages_around_the_long_length_field_read_back_intact() {
    for len in [254usize, 255, 256] {
        let mut tag = SimT1t::formatted_dynamic(&fixtures::text_record("seed"));
        let (mut link, mock) = mock_link();
        let mut eng = T1tEngine::new(tag.header_rom(), tag.uid4());
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

        let mut eng = T1tEngine::new(tag.header_rom(), tag.uid4());
        eng.detect_ndef(&mut link).unwrap();
        let d = detect_result(&drive(&mut eng, &mut link, &mock, &mut tag));
        assert_eq!(d.cur_size as usize, len);
        eng.read_ndef(&mut link).unwrap();
        assert_eq!(read_payload(&drive(&mut eng, &mut link, &mock, &mut tag)), msg, "len {}", len);
    }
}

#[test]
fn failed_presence_check_keeps_detected_sizes() {
    let mut tag = SimT1t::formatted_dynamic(&fixtures::text_record("here"));
    let (mut link, mock) = mock_link();
    let mut eng = T1tEngine::new(tag.header_rom(), tag.uid4());
    eng.detect_ndef(&mut link).unwrap();
    assert_eq!(detect_result(&drive(&mut eng, &mut link, &mock, &mut tag)).status, Status::Ok);
    let sizes = eng.ndef_sizes();
    assert!(sizes.cur_size > 0 && sizes.max_size > sizes.cur_size);

    tag.mute = true;
    eng.presence_check(&mut link).unwrap();
    assert_eq!(
        drive(&mut eng, &mut link, &mock, &mut tag),
        vec![RwEvent::PresenceCheck { status: Status::Failed }]
    );
    assert_eq!(eng.ndef_sizes(), sizes);
    assert!(eng.is_idle());
}
