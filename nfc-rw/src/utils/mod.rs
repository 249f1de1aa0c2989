// nfc-rw-rs/nfc-rw/src/utils/mod.rs
//! Small helpers shared by the engines: hex rendering for log lines and
//! test fixtures.

pub mod hex;

pub use hex::*;
