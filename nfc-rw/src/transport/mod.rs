// nfc-rw-rs/nfc-rw/src/transport/mod.rs

/// In-memory transport that records frames and timer calls.
pub mod mock;
/// The transport trait the engines send through.
pub mod traits;

pub use mock::MockTransport;
pub use traits::Transport;
