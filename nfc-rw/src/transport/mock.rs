// nfc-rw-rs/nfc-rw/src/transport/mock.rs

use std::cell::RefCell;
use std::rc::Rc;

use crate::transport::traits::Transport;
use crate::{Error, Result};

/// Recorded state of a [`MockTransport`].
#[derive(Debug, Default)]
pub struct MockState {
    /// Frames sent, oldest first
    pub sent: Vec<Vec<u8>>,
    /// Timeout of the running timer
    pub armed_timer: Option<u32>,
    /// Number of `arm_timer` calls
    pub timer_arms: usize,
    /// Number of `cancel_timer` calls
    pub timer_cancels: usize,
    /// Testing hook: number of subsequent sends that should fail
    pub send_failures: usize,
}

/// Mock transport for unit tests. It records sent frames and timer activity.
///
/// Clones share the same state, so a test can keep a handle after boxing
/// the transport into a session.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Rc<RefCell<MockState>>,
}

impl MockTransport {
    /// Transport with empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how many subsequent sends should fail (for tests).
    pub fn set_send_failures(&self, n: usize) {
        self.state.borrow_mut().send_failures = n;
    }

    /// Copy of every frame sent so far, oldest first.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.borrow().sent.clone()
    }

    /// Number of frames in the sent log.
    pub fn sent_count(&self) -> usize {
        self.state.borrow().sent.len()
    }

    /// Drain the sent log.
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state.borrow_mut().sent)
    }

    /// Remove and return the newest frame.
    pub fn pop_sent(&self) -> Option<Vec<u8>> {
        self.state.borrow_mut().sent.pop()
    }

    /// Newest frame sent.
    pub fn last_sent(&self) -> Option<Vec<u8>> {
        self.state.borrow().sent.last().cloned()
    }

    /// Timeout of the running timer, if armed.
    pub fn armed_timer(&self) -> Option<u32> {
        self.state.borrow().armed_timer
    }

    /// Times the timer was armed.
    pub fn timer_arms(&self) -> usize {
        self.state.borrow().timer_arms
    }

    /// Times the timer was cancelled.
    pub fn timer_cancels(&self) -> usize {
        self.state.borrow().timer_cancels
    }
}

impl Transport for MockTransport {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        let mut st = self.state.borrow_mut();
        if st.send_failures > 0 {
            st.send_failures -= 1;
            return Err(Error::Transport("mock send failure".to_string()));
        }
        st.sent.push(frame.to_vec());
        Ok(())
    }

    fn arm_timer(&mut self, timeout_ms: u32) {
        let mut st = self.state.borrow_mut();
        st.armed_timer = Some(timeout_ms);
        st.timer_arms += 1;
    }

    fn cancel_timer(&mut self) {
        let mut st = self.state.borrow_mut();
        st.armed_timer = None;
        st.timer_cancels += 1;
    }
}
