use nfc_rw::events::{RwEvent, Status};
use nfc_rw::session::ActivationParams;
use nfc_rw::test_support::{drive_session, SimT1t, SimT2t, SimulatedTag};

use crate::common::fixtures;
use crate::common::helpers::{selected_session, type1_params};

#[test]
fn frame_while_idle_is_passed_through() {
    let tag = SimT1t::formatted_static(&[]);
    let (mut session, _mock, log) = selected_session(type1_params(&tag));
    let frame = hex::decode("0a0b0c").unwrap();
    session.on_response(&frame);
    assert_eq!(
        log.take(),
        vec![RwEvent::RawFrame {
            status: Status::Ok,
            data: frame
        }]
    );
}

#[test]
fn transport_error_while_idle_is_an_interface_error() {
    let (mut session, _mock, log) = selected_session(ActivationParams::Type2 { manufacturer_id: 0x04 });
    session.on_transport_error(0x05);
    assert_eq!(
        log.take(),
        vec![RwEvent::InterfaceError {
            status: Status::TransportError(0x05)
        }]
    );
    assert_eq!(session.stats().num_trans_err, 1);
}

#[test]
fn transport_error_mid_operation_is_retried() {
    let msg = fixtures::text_record("again");
    let mut tag = SimT2t::formatted(0x04, 0x06, &msg);
    let (mut session, mock, log) = selected_session(ActivationParams::Type2 { manufacturer_id: 0x04 });

    session.detect_ndef().unwrap();
    let first = mock.take_sent();
    session.on_transport_error(0x02);
    assert_eq!(mock.sent(), first);
    assert!(log.take().is_empty());

    drive_session(&mut session, &mock, &mut tag);
    match log.take().as_slice() {
        [RwEvent::NdefDetect(d)] => {
            assert_eq!(d.status, Status::Ok);
            assert_eq!(d.cur_size as usize, msg.len());
        }
        other => panic!("unexpected events: {:?}", other),
    }
    assert_eq!(session.stats().num_retries, 1);
}

#[test]
fn presence_check_is_idempotent() {
    let mut tag = SimT2t::formatted(0x04, 0x06, &[]);
    let (mut session, mock, log) = selected_session(ActivationParams::Type2 { manufacturer_id: 0x04 });
    for _ in 0..3 {
        session.presence_check().unwrap();
        drive_session(&mut session, &mock, &mut tag);
    }
    assert_eq!(log.take(), vec![RwEvent::PresenceCheck { status: Status::Ok }; 3]);
    assert!(session.is_idle());
}

#[test]
fn deactivation_mid_write_emits_nothing() {
    let mut tag = SimT1t::formatted_static(&fixtures::text_record("a"));
    let (mut session, mock, log) = selected_session(type1_params(&tag));
    session.detect_ndef().unwrap();
    drive_session(&mut session, &mock, &mut tag);
    log.take();

    session.write_ndef(&fixtures::text_record("b")).unwrap();
    let frame = mock.take_sent().remove(0);
    session.on_deactivate();
    if let Some(answer) = tag.respond(&frame) {
        session.on_response(&answer);
    }
    session.on_timeout();
    assert!(log.take().is_empty());
    assert!(!session.is_idle());
}
