use nfc_rw::constants::t2t;
use nfc_rw::events::{NdefFlags, RwEvent, Status};
use nfc_rw::tags::{T2tEngine, TagEngine};
use nfc_rw::test_support::{drive, SimT2t};

use crate::common::fixtures;
use crate::common::helpers::{detect_result, mock_link, read_payload, Lossy};

const NTAG216_TMS: u8 = 0x6D;

#[test]
fn long_message_survives_reactivation() {
    let mut tag = SimT2t::formatted(t2t::MANUFACTURER_NXP, NTAG216_TMS, &fixtures::text_record("old"));
    let (mut link, mock) = mock_link();
    let mut eng = T2tEngine::new();
    eng.detect_ndef(&mut link).unwrap();
    assert_eq!(detect_result(&drive(&mut eng, &mut link, &mock, &mut tag)).status, Status::Ok);

    let msg = fixtures::opaque_message(500);
    eng.write_ndef(&mut link, &msg).unwrap();
    assert_eq!(
        drive(&mut eng, &mut link, &mock, &mut tag),
        vec![RwEvent::NdefUpdateComplete]
    );

    eng.on_deactivate(&mut link);
    let mut eng = T2tEngine::new();
    eng.detect_ndef(&mut link).unwrap();
    let d = detect_result(&drive(&mut eng, &mut link, &mock, &mut tag));
    assert_eq!(d.cur_size, 500);
    eng.read_ndef(&mut link).unwrap();
    assert_eq!(read_payload(&drive(&mut eng, &mut link, &mock, &mut tag)), msg);
}

#[test]
fn blank_ultralight_round_trip() {
    let mut tag = SimT2t::blank_ultralight();
    let (mut link, mock) = mock_link();
    let mut eng = T2tEngine::new();
    eng.format_ndef(&mut link).unwrap();
    assert_eq!(
        drive(&mut eng, &mut link, &mock, &mut tag),
        vec![RwEvent::FormatComplete { status: Status::Ok }]
    );
    eng.detect_ndef(&mut link).unwrap();
    let d = detect_result(&drive(&mut eng, &mut link, &mock, &mut tag));
    assert_eq!((d.status, d.cur_size), (Status::Ok, 0));

    let msg = fixtures::text_record("ultralight");
    eng.write_ndef(&mut link, &msg).unwrap();
    assert_eq!(
        drive(&mut eng, &mut link, &mock, &mut tag),
        vec![RwEvent::NdefUpdateComplete]
    );
    eng.read_ndef(&mut link).unwrap();
    assert_eq!(read_payload(&drive(&mut eng, &mut link, &mock, &mut tag)), msg);
}

#[test]
fn lost_frame_is_retransmitted() {
    let msg = fixtures::text_record("x");
    let mut tag = Lossy::new(SimT2t::formatted(t2t::MANUFACTURER_NXP, t2t::CC_TMS_STATIC, &msg), 1);
    let (mut link, mock) = mock_link();
    let mut eng = T2tEngine::new();
    eng.detect_ndef(&mut link).unwrap();
    let d = detect_result(&drive(&mut eng, &mut link, &mock, &mut tag));
    assert_eq!(d.status, Status::Ok);
    assert_eq!(link.stats().num_retries, 1);
}

#[test]
fn silent_tag_hits_the_retry_ceiling() {
    let mut tag = SimT2t::formatted(t2t::MANUFACTURER_NXP, t2t::CC_TMS_STATIC, &[]);
    tag.mute = true;
    let (mut link, mock) = mock_link();
    let mut eng = T2tEngine::new();
    eng.detect_ndef(&mut link).unwrap();
    let d = detect_result(&drive(&mut eng, &mut link, &mock, &mut tag));
    assert_eq!(d.status, Status::Timeout);
    assert_eq!(d.flags, NdefFlags::UNKNOWN);
    assert_eq!(tag.log.len(), 1 + link.config().max_retries as usize);
    assert_eq!(link.stats().num_fail, 1);
    assert!(eng.is_idle());
}

#[test]
fn messages_around_the_long_length_field_read_back_intact() {
    for len in [254usize, 255, 256] {
        let mut tag = SimT2t::formatted(t2t::MANUFACTURER_NXP, NTAG216_TMS, &fixtures::text_record("seed"));
        let (mut link, mock) = mock_link();
        let mut eng = T2tEngine::new();
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

        let mut eng = T2tEngine::new();
        eng.detect_ndef(&mut link).unwrap();
        let d = detect_result(&drive(&mut eng, &mut link, &mock, &mut tag));
        assert_eq!(d.cur_size as usize, len);
        eng.read_ndef(&mut link).unwrap();
        assert_eq!(read_payload(&drive(&mut eng, &mut link, &mock, &mut tag)), msg, "len {}", len);
    }
}

#[test]
fn failed_presence_check_keeps_detected_sizes() {
    let mut tag = SimT2t::formatted(t2t::MANUFACTURER_NXP, NTAG216_TMS, &fixtures::text_record("here"));
    let (mut link, mock) = mock_link();
    let mut eng = T2tEngine::new();
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
