// nfc-rw-rs/nfc-rw/tests/common/helpers.rs
//! Session and engine setup shared by the integration tests.

use nfc_rw::events::{NdefDetectData, RwEvent};
use nfc_rw::protocol::retry::Link;
use nfc_rw::session::{ActivationParams, RwSession};
use nfc_rw::test_support::{EventLog, SimI93, SimT1t, SimulatedTag};
use nfc_rw::transport::MockTransport;
use nfc_rw::RwConfig;

/// Link over a fresh mock with the default configuration.
pub fn mock_link() -> (Link, MockTransport) {
    mock_link_with(RwConfig::default())
}

pub fn mock_link_with(config: RwConfig) -> (Link, MockTransport) {
    let mock = MockTransport::new();
    (Link::new(Box::new(mock.clone()), config), mock)
}

/// Session already selected with `params`, with its event log.
pub fn selected_session(params: ActivationParams) -> (RwSession, MockTransport, EventLog) {
    let mock = MockTransport::new();
    let mut session = RwSession::new(Box::new(mock.clone()), RwConfig::default());
    let log = EventLog::new();
    session
        .select(params, Some(log.callback()))
        .expect("select must succeed");
    (session, mock, log)
}

pub fn type1_params(tag: &SimT1t) -> ActivationParams {
    ActivationParams::Type1 {
        hr: tag.hr,
        uid: *tag.uid4().as_bytes(),
    }
}

pub fn iso15693_params(tag: &SimI93) -> ActivationParams {
    ActivationParams::Iso15693 {
        uid: *tag.uid.as_bytes(),
        dsfid: tag.dsfid,
    }
}

/// Wraps a simulated tag and swallows the next `drop_next` frames, as if
/// they were lost on the air.
pub struct Lossy<T> {
    pub inner: T,
    pub drop_next: usize,
}

impl<T> Lossy<T> {
    pub fn new(inner: T, drop_next: usize) -> Self {
        Self { inner, drop_next }
    }
}

impl<T: SimulatedTag> SimulatedTag for Lossy<T> {
    fn respond(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if self.drop_next > 0 {
            self.drop_next -= 1;
            return None;
        }
        self.inner.respond(frame)
    }
}

/// Collect the payload of every `NdefRead` segment and check the read
/// ended with `NdefReadComplete`.
pub fn read_payload(events: &[RwEvent]) -> Vec<u8> {
    assert_eq!(events.last(), Some(&RwEvent::NdefReadComplete), "events: {:?}", events);
    events
        .iter()
        .filter_map(|e| match e {
            RwEvent::NdefRead { data } => Some(data.as_slice()),
            _ => None,
        })
        .flatten()
        .copied()
        .collect()
}

/// The single `NdefDetect` event of a detection.
pub fn detect_result(events: &[RwEvent]) -> NdefDetectData {
    match events {
        [RwEvent::NdefDetect(d)] => *d,
        other => panic!("unexpected events: {:?}", other),
    }
}
