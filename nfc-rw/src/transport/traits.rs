// nfc-rw-rs/nfc-rw/src/transport/traits.rs

use crate::Result;

/// Transport trait abstracts the RF link away from the tag engines.
///
/// The link is half-duplex and event driven: `send` only queues a frame.
/// Exactly one of response / timeout / transport error / deactivation is
/// later delivered to the session for each outstanding command.
pub trait Transport {
    /// Send one command frame. An error means nothing was transmitted.
    fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Arm the single response timer of the pending command.
    fn arm_timer(&mut self, timeout_ms: u32);

    /// Cancel the response timer (no-op when not armed).
    fn cancel_timer(&mut self);

    /// Largest frame the link can carry. Engines never build larger ones.
    fn max_frame_len(&self) -> usize {
        255
    }
}
