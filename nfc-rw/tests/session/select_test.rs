use nfc_rw::events::{RwEvent, Status};
use nfc_rw::session::{ActivationParams, RwSession};
use nfc_rw::test_support::{drive_session, EventLog, SimI93, SimT1t, SimT2t};
use nfc_rw::transport::MockTransport;
use nfc_rw::{Error, Protocol, RwConfig};

use crate::common::fixtures;
use crate::common::helpers::{iso15693_params, read_payload, selected_session, type1_params};

#[test]
fn select_without_callback_keeps_previous_activation() -> anyhow::Result<()> {
    let tag = SimT1t::formatted_static(&[]);
    let (mut session, _mock, _log) = selected_session(type1_params(&tag));
    let err = session
        .select(ActivationParams::Type2 { manufacturer_id: 0x04 }, None)
        .unwrap_err();
    assert_eq!(err, Error::NoCallback);
    assert_eq!(session.protocol(), Some(Protocol::Type1));
    Ok(())
}

#[test]
fn unsupported_families_are_refused() {
    let mock = MockTransport::new();
    let mut session = RwSession::new(Box::new(mock), RwConfig::default());
    let log = EventLog::new();
    assert_eq!(
        session.select(ActivationParams::Type4, Some(log.callback())),
        Err(Error::UnsupportedProtocol(Protocol::Type4))
    );
    assert!(matches!(session.presence_check(), Err(Error::NotActivated)));
}

#[test]
fn same_session_serves_three_families_in_turn() -> anyhow::Result<()> {
    let mock = MockTransport::new();
    let mut session = RwSession::new(Box::new(mock.clone()), RwConfig::default());
    let log = EventLog::new();
    let msg = fixtures::text_record("multi");

    let mut t1 = SimT1t::formatted_static(&msg);
    session.select(type1_params(&t1), Some(log.callback()))?;
    session.read_ndef().unwrap_err();
    session.detect_ndef()?;
    drive_session(&mut session, &mock, &mut t1);
    session.read_ndef()?;
    drive_session(&mut session, &mock, &mut t1);
    let events = log.take();
    assert!(matches!(events[0], RwEvent::NdefDetect(d) if d.protocol == Protocol::Type1));
    assert_eq!(read_payload(&events[1..]), msg);

    let mut t2 = SimT2t::formatted(0x04, 0x06, &msg);
    session.on_deactivate();
    session.select(ActivationParams::Type2 { manufacturer_id: 0x04 }, Some(log.callback()))?;
    session.detect_ndef()?;
    drive_session(&mut session, &mock, &mut t2);
    session.read_ndef()?;
    drive_session(&mut session, &mock, &mut t2);
    let events = log.take();
    assert!(matches!(events[0], RwEvent::NdefDetect(d) if d.protocol == Protocol::Type2));
    assert_eq!(read_payload(&events[1..]), msg);

    let mut i93 = SimI93::icode_slix(&msg);
    session.on_deactivate();
    session.select(iso15693_params(&i93), Some(log.callback()))?;
    session.detect_ndef()?;
    drive_session(&mut session, &mock, &mut i93);
    session.read_ndef()?;
    drive_session(&mut session, &mock, &mut i93);
    let events = log.take();
    assert!(matches!(events[0], RwEvent::NdefDetect(d) if d.protocol == Protocol::Iso15693));
    assert_eq!(read_payload(&events[1..]), msg);
    Ok(())
}

#[test]
fn family_closures_reach_raw_commands() -> anyhow::Result<()> {
    let mut tag = SimI93::icode_slix(&[]);
    let (mut session, mock, log) = selected_session(iso15693_params(&tag));

    session.with_iso15693(|eng, link| eng.get_system_info(link, None))?;
    drive_session(&mut session, &mock, &mut tag);
    match log.take().as_slice() {
        [RwEvent::I93SystemInfo { status: Status::Ok, info }] => {
            assert_eq!(info.num_blocks, 28);
            assert_eq!(info.block_size, 4);
        }
        other => panic!("unexpected events: {:?}", other),
    }

    let err = session.with_type2(|eng, link| eng.read(link, 0)).unwrap_err();
    assert!(matches!(
        err,
        Error::WrongProtocol {
            expected: Protocol::Type2,
            actual: Protocol::Iso15693
        }
    ));
    Ok(())
}
