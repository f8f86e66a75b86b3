//! Outbound Queue
//!
//! Per-connection FIFO of frames waiting to be written, paired with a
//! reusable level-triggered signal. Producers push and raise the signal;
//! the send loop clears it before draining and waits again afterwards.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::protocol::Frame;

/// Level-triggered wake signal.
///
/// The flag carries the level, so a raise that happens while nobody is
/// waiting is still seen by the next `clear`. `Notify` keeps at most one
/// stored permit, which coalesces a burst of raises into a single wake-up.
/// Waits are bounded so a lost wake-up is retried on the next timeout.
#[derive(Debug, Default)]
pub struct Signal {
    raised: AtomicBool,
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the level and wake the waiter
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Reset the level, returning whether it was set
    pub fn clear(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Wait for a raise, giving up after `timeout`.
    ///
    /// Returns `true` when woken by a raise and `false` on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        if self.is_raised() {
            return true;
        }
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok()
    }
}

/// Frames pending for one connection.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    frames: Mutex<VecDeque<Frame>>,
    signal: Signal,
    closed: AtomicBool,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame and raise the signal.
    ///
    /// Returns `false` without queueing once the queue has been closed.
    pub fn push(&self, frame: Frame) -> bool {
        {
            let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
            // Checked under the lock so a concurrent close cannot strand a frame.
            if self.closed.load(Ordering::Acquire) {
                return false;
            }
            frames.push_back(frame);
        }
        self.signal.raise();
        true
    }

    /// Append without raising the signal, as a lost wake-up leaves it
    #[cfg(test)]
    pub(crate) fn push_unsignalled(&self, frame: Frame) {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(frame);
    }

    /// Take the oldest pending frame
    pub fn pop(&self) -> Option<Frame> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuse further frames, drop everything pending and wake the consumer.
    ///
    /// Returns the number of frames discarded.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
            self.closed.store(true, Ordering::Release);
            let discarded = frames.len();
            frames.clear();
            frames.shrink_to_fit();
            discarded
        };
        self.signal.raise();
        discarded
    }
}
