use log::LevelFilter;
use serial_test::serial;

use nfc_rw::events::{RwEvent, Status};
use nfc_rw::test_support::{drive_session, SimI93};

use crate::common::fixtures;
use crate::common::helpers::{iso15693_params, selected_session, Lossy};

fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(LevelFilter::Trace)
        .try_init();
}

#[test]
#[serial]
fn traced_update_with_retries_completes() {
    init_logger();
    let tag = SimI93::icode_slix(&fixtures::text_record("log"));
    let (mut session, mock, log) = selected_session(iso15693_params(&tag));
    let mut tag = Lossy::new(tag, 2);

    session.detect_ndef().unwrap();
    drive_session(&mut session, &mock, &mut tag);
    session.write_ndef(&fixtures::text_record("logged")).unwrap();
    drive_session(&mut session, &mock, &mut tag);

    let events = log.take();
    assert_eq!(events.last(), Some(&RwEvent::NdefUpdateComplete));
    assert_eq!(session.stats().num_retries, 2);
    session.on_deactivate();
}

#[test]
#[serial]
fn stats_reset_on_every_select() {
    init_logger();
    let mut tag = SimI93::icode_slix(&[]);
    let (mut session, mock, log) = selected_session(iso15693_params(&tag));
    session.presence_check().unwrap();
    drive_session(&mut session, &mock, &mut tag);
    assert_eq!(log.take(), vec![RwEvent::PresenceCheck { status: Status::Ok }]);
    assert!(session.stats().bytes_sent > 0);

    session
        .select(iso15693_params(&tag), Some(log.callback()))
        .unwrap();
    assert_eq!(session.stats().bytes_sent, 0);
    assert_eq!(session.stats().num_ops, 0);
}
