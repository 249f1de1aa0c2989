// nfc-rw-rs/nfc-rw/src/lib.rs

//! nfc-rw
//!
//! Reader/writer engine for NFC Forum Type 1, Type 2 and ISO 15693 tags.
//! The crate owns no radio: a [`transport::Transport`] carries frames and
//! timers, an [`session::RwSession`] routes what comes back into the engine
//! of the selected tag, and results reach the caller as
//! [`events::RwEvent`]s.

#![warn(missing_docs)]

pub mod config;
pub mod constants;
/// Crate error type.
pub mod error;
pub mod events;
/// Common imports.
pub mod prelude;
/// Frame codecs, TLV parsing, lock tracking and the retry coordinator.
pub mod protocol;
pub mod session;
pub mod stats;
pub mod tags;
pub mod test_support;
/// The seam to the radio: frame transport and response timer.
pub mod transport;
/// Protocol identifiers and tag UIDs.
pub mod types;
pub mod utils;

// Re-export common types at crate root so `crate::Error`, `crate::Result`,
// and the newtypes in `types` are available for consumers and for
// convenient `prelude` re-exports.
pub use crate::error::*;
pub use crate::types::*;

pub use prelude::*;
