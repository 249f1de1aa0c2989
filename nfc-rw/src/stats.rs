// nfc-rw-rs/nfc-rw/src/stats.rs
//! Link statistics, reset on every select and logged on deactivation.

use std::time::Instant;

/// Counters kept per activation.
#[derive(Debug, Clone)]
pub struct RwStats {
    /// Frame bytes handed to the transport
    pub bytes_sent: u32,
    /// Response bytes received
    pub bytes_received: u32,
    /// Commands handed to the transport, retransmissions included
    pub num_ops: u32,
    /// Retransmissions after timeouts or bad frames
    pub num_retries: u32,
    /// Operations that ended in failure after the retry ceiling
    pub num_fail: u32,
    /// Frames rejected for length or addressing
    pub num_crc: u32,
    /// Transport errors reported
    pub num_trans_err: u32,
    started: Instant,
}

impl Default for RwStats {
    fn default() -> Self {
        Self {
            bytes_sent: 0,
            bytes_received: 0,
            num_ops: 0,
            num_retries: 0,
            num_fail: 0,
            num_crc: 0,
            num_trans_err: 0,
            started: Instant::now(),
        }
    }
}

impl RwStats {
    /// Zero every counter and restart the activation clock.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Count one frame sent.
    pub fn record_tx(&mut self, num_bytes: usize, is_retry: bool) {
        self.bytes_sent = self.bytes_sent.saturating_add(num_bytes as u32);
        self.num_ops += 1;
        if is_retry {
            self.num_retries += 1;
        }
    }

    /// Count response bytes.
    pub fn record_rx(&mut self, num_bytes: usize) {
        self.bytes_received = self.bytes_received.saturating_add(num_bytes as u32);
    }

    /// Count an operation failed after retries.
    pub fn record_failure(&mut self) {
        self.num_fail += 1;
    }

    /// Count a frame rejected by the parser.
    pub fn record_frame_error(&mut self) {
        self.num_crc += 1;
    }

    /// Count a transport error.
    pub fn record_transport_error(&mut self) {
        self.num_trans_err += 1;
    }

    /// Milliseconds since the last reset.
    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    /// Log the counters at debug level.
    pub fn log(&self) {
        log::debug!(
            "tx stats: cmds:{}, retries:{}, aborted:{}, tx_errs:{}, bytes sent:{}",
            self.num_ops,
            self.num_retries,
            self.num_fail,
            self.num_trans_err,
            self.bytes_sent
        );
        log::debug!(
            "rx stats: rx-crc errors:{}, bytes received:{}",
            self.num_crc,
            self.bytes_received
        );
        #[cfg(feature = "diagnostics")]
        log::debug!("time activated {} ms", self.elapsed_ms());
    }
}
