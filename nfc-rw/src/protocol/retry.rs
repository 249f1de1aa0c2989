// nfc-rw-rs/nfc-rw/src/protocol/retry.rs
//! Retry/timeout coordination shared by the tag engines.
//!
//! [`Link`] bundles the transport with the event queue, statistics and
//! configuration of one activation. [`RetryCoordinator`] owns the single
//! retransmission slot of an engine.

use std::collections::VecDeque;

use crate::config::RwConfig;
use crate::events::RwEvent;
use crate::protocol::commands::Command;
use crate::stats::RwStats;
use crate::transport::Transport;
use crate::utils::frame_summary;
use crate::{Error, Result};

/// Everything an engine needs to talk to the tag and to the upper layer.
pub struct Link {
    transport: Box<dyn Transport>,
    events: VecDeque<RwEvent>,
    stats: RwStats,
    config: RwConfig,
}

impl Link {
    /// Link over `transport` with an empty event queue and zeroed stats.
    pub fn new(transport: Box<dyn Transport>, config: RwConfig) -> Self {
        Self {
            transport,
            events: VecDeque::new(),
            stats: RwStats::default(),
            config,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &RwConfig {
        &self.config
    }

    /// Replace the configuration; applies to the next command sent.
    pub fn set_config(&mut self, config: RwConfig) {
        self.config = config;
    }

    /// Counters for the current activation.
    pub fn stats(&self) -> &RwStats {
        &self.stats
    }

    /// Mutable access to the counters.
    pub fn stats_mut(&mut self) -> &mut RwStats {
        &mut self.stats
    }

    /// Queue an event for the upper layer.
    pub fn notify(&mut self, event: RwEvent) {
        log::debug!("event {} status={}", event.name(), event.status());
        self.events.push_back(event);
    }

    /// Take every queued event, oldest first.
    pub fn drain_events(&mut self) -> Vec<RwEvent> {
        self.events.drain(..).collect()
    }

    /// True while undelivered events are queued.
    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Hand one frame to the transport and account for it.
    pub fn transmit(&mut self, frame: &[u8], is_retry: bool) -> Result<()> {
        if frame.len() > self.transport.max_frame_len() {
            return Err(Error::NoBuffers);
        }
        self.stats.record_tx(frame.len(), is_retry);
        log::trace!("tx [{}]{}", frame_summary(frame), if is_retry { " (retx)" } else { "" });
        self.transport.send(frame)
    }

    /// Start the response timer.
    pub fn arm_timer(&mut self, timeout_ms: u32) {
        self.transport.arm_timer(timeout_ms);
    }

    /// Stop the response timer.
    pub fn cancel_timer(&mut self) {
        self.transport.cancel_timer();
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("queued_events", &self.events.len())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Owned copy of the outstanding command kept for retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    /// Command as built by the engine
    pub command: Command,
    /// Encoded frame, resent unchanged
    pub frame: Vec<u8>,
    /// Timer armed after each send
    pub timeout_ms: u32,
}

/// Single-slot retransmission policy.
///
/// `send` always starts a fresh command with `retry_count == 0`;
/// `retransmit` resends the stored copy until the configured ceiling.
#[derive(Debug, Default)]
pub struct RetryCoordinator {
    pending: Option<PendingCommand>,
    retry_count: u8,
}

impl RetryCoordinator {
    /// Empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a fresh command, store it for retransmission and arm the timer.
    ///
    /// A send failure is returned as is and never retried.
    pub fn send(&mut self, link: &mut Link, command: Command, timeout_ms: u32) -> Result<()> {
        let frame = command.encode();
        self.retry_count = 0;
        link.transmit(&frame, false)?;
        link.arm_timer(timeout_ms);
        self.pending = Some(PendingCommand {
            command,
            frame,
            timeout_ms,
        });
        Ok(())
    }

    /// Resend the stored command if the ceiling allows it.
    ///
    /// Returns `false` when the retries are exhausted or the resend could not
    /// be handed to the transport; the caller then fails the operation.
    pub fn retransmit(&mut self, link: &mut Link) -> bool {
        let max = link.config().max_retries;
        let Some(pending) = self.pending.as_ref() else {
            return false;
        };
        if self.retry_count >= max {
            log::debug!("maximum retransmission attempts reached ({})", max);
            return false;
        }
        self.retry_count += 1;
        log::warn!(
            "retransmitting opcode {:#04x} (attempt {}/{})",
            pending.command.opcode(),
            self.retry_count,
            max
        );
        match link.transmit(&pending.frame, true) {
            Ok(()) => {
                link.arm_timer(pending.timeout_ms);
                true
            }
            Err(e) => {
                log::error!("retransmission failed: {}", e);
                false
            }
        }
    }

    /// A valid response arrived: stop the timer and return the number of
    /// retransmissions the command needed.
    pub fn acknowledge(&mut self, link: &mut Link) -> u8 {
        link.cancel_timer();
        std::mem::take(&mut self.retry_count)
    }

    /// Mark the retries as used up (presence checks and stay-quiet are
    /// never retransmitted).
    pub fn exhaust(&mut self, link: &Link) {
        self.retry_count = link.config().max_retries;
    }

    /// Retransmissions made for the pending command.
    pub fn retry_count(&self) -> u8 {
        self.retry_count
    }

    /// The command awaiting a response.
    pub fn pending(&self) -> Option<&PendingCommand> {
        self.pending.as_ref()
    }

    /// Just the command of [`Self::pending`].
    pub fn pending_command(&self) -> Option<&Command> {
        self.pending.as_ref().map(|p| &p.command)
    }

    /// Drop the retransmission copy and stop the timer.
    pub fn release(&mut self, link: &mut Link) {
        link.cancel_timer();
        self.pending = None;
        self.retry_count = 0;
    }
}
