//! Per-stream backpressure over unflushed bytes.
//!
//! "Unflushed" means written by the host but not yet handed to the socket.
//! Crossing `high_water` makes the stream report [`Admission::Full`]; falling
//! back to `low_water` raises a single drain signal.  Nothing is ever dropped
//! here; the controller only tells the producer when to pause.

/// Result of queueing bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Keep writing.
    Ready,
    /// Pause until a drain notification.
    Full,
}

#[derive(Debug)]
pub struct FlowController {
    queued: usize,
    high_water: usize,
    low_water: usize,
    full: bool,
}

impl FlowController {
    pub fn new(high_water: usize, low_water: usize) -> Self {
        debug_assert!(low_water <= high_water, "low water above high water");
        Self {
            queued: 0,
            high_water,
            low_water,
            full: false,
        }
    }

    /// Account for `n` newly written bytes.
    pub fn on_queued(&mut self, n: usize) -> Admission {
        self.queued += n;
        if self.queued > self.high_water {
            self.full = true;
        }
        self.admission()
    }

    /// Account for `n` bytes handed to the socket.
    ///
    /// Returns `true` exactly when this release ends a full period.
    pub fn on_released(&mut self, n: usize) -> bool {
        self.queued = self.queued.saturating_sub(n);
        if self.full && self.queued <= self.low_water {
            self.full = false;
            return true;
        }
        false
    }

    pub fn admission(&self) -> Admission {
        if self.full {
            Admission::Full
        } else {
            Admission::Ready
        }
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Bytes currently waiting for dispatch.
    pub fn queued(&self) -> usize {
        self.queued
    }

    /// Forget everything (stream destroyed).
    pub fn clear(&mut self) {
        self.queued = 0;
        self.full = false;
    }
}
