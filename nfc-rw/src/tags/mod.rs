// nfc-rw-rs/nfc-rw/src/tags/mod.rs
//! Per-family tag engines.
//!
//! Every engine is a state machine driven by the session: API calls start
//! an operation and send the first command, `on_response` / `on_timeout` /
//! `on_transport_error` advance it. Results are queued on the [`Link`] as
//! [`crate::events::RwEvent`]s.

pub mod i93;
pub mod i93_ndef;
pub mod t1t;
pub mod t1t_ndef;
pub mod t2t;
pub mod t2t_ndef;

pub use i93::I93Engine;
pub use t1t::T1tEngine;
pub use t2t::T2tEngine;

use std::fmt::Display;

use crate::events::Status;
use crate::protocol::retry::Link;
use crate::types::Protocol;
use crate::{Error, Result};

/// NDEF sizes known to an engine after detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NdefSizes {
    /// Length of the stored NDEF message
    pub cur_size: u32,
    /// Largest NDEF message the tag can hold
    pub max_size: u32,
}

/// Uniform NDEF operations shared by every tag family.
///
/// Operations return `Err` when the request is not accepted (busy, refused,
/// send failure). An accepted operation always ends with exactly one
/// terminal event.
pub trait TagEngine {
    /// Family this engine drives.
    fn protocol(&self) -> Protocol;

    /// True when a new operation may start.
    fn is_idle(&self) -> bool;

    /// Start NDEF detection.
    fn detect_ndef(&mut self, link: &mut Link) -> Result<()>;

    /// Start reading the detected NDEF message.
    fn read_ndef(&mut self, link: &mut Link) -> Result<()>;

    /// Start writing `message` as the NDEF message.
    fn write_ndef(&mut self, link: &mut Link, message: &[u8]) -> Result<()>;

    /// Start formatting the tag.
    fn format_ndef(&mut self, link: &mut Link) -> Result<()>;

    /// Start the read-only conversion.
    fn set_tag_read_only(&mut self, link: &mut Link, hard_lock: bool) -> Result<()>;

    /// Send a presence check.
    fn presence_check(&mut self, link: &mut Link) -> Result<()>;

    /// A frame arrived from the tag.
    fn on_response(&mut self, link: &mut Link, data: &[u8]);

    /// The response timer armed by the last command expired.
    fn on_timeout(&mut self, link: &mut Link);

    /// The transport reported an error for the outstanding command.
    fn on_transport_error(&mut self, link: &mut Link, code: u8);

    /// The tag left the field: stop the timer, free the retransmission copy
    /// and fall back to NOT_ACTIVATED. No event follows.
    fn on_deactivate(&mut self, link: &mut Link);

    /// Sizes learnt by the last NDEF detection.
    fn ndef_sizes(&self) -> NdefSizes;
}

/// Log a state change the same way for every family.
pub(crate) fn log_transition<S: Display + PartialEq>(family: &str, old: &S, new: &S) {
    if old != new {
        log::debug!("{} state: {} -> {}", family, old, new);
    }
}

/// Status reported in the terminal event when a step of an accepted
/// operation fails synchronously.
pub(crate) fn error_status(err: &Error) -> Status {
    match err {
        Error::Timeout => Status::Timeout,
        Error::Refused(_) => Status::Refused,
        Error::Rejected(_) => Status::Rejected,
        Error::NotInitialized => Status::NotInitialized,
        Error::Busy => Status::Busy,
        Error::TagError { code } => Status::TagError(*code),
        _ => Status::Failed,
    }
}
