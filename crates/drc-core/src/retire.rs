//! Retirement heuristic.
//!
//! Retransmits cluster shortly after the original send, so a cache hit is a
//! hint that more duplicates are coming. Each hit widens the retire window;
//! every finished request narrows it by one. While the window is open the
//! cache may grow past its high watermark, but never past its hard cap.
//! Victims always come from the FIFO head (oldest arrival).

use serde::Serialize;

/// Window value after the first hit on a closed window.
pub const RETIRE_WINDOW_BIAS: usize = 16;

/// Most entries one `finish` will retire.
pub const RETIRE_BATCH: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetirePolicy {
    max_size: usize,
    hiwat: usize,
}

impl RetirePolicy {
    #[must_use]
    pub const fn new(max_size: usize, hiwat: usize) -> Self {
        Self { max_size, hiwat }
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub fn hiwat(&self) -> usize {
        self.hiwat
    }

    /// Window after a replay hit; saturates at the hard cap.
    #[must_use]
    pub fn widen(&self, window: usize) -> usize {
        if window == 0 {
            RETIRE_WINDOW_BIAS.min(self.max_size)
        } else {
            window.saturating_add(2).min(self.max_size)
        }
    }

    /// Window after any finished request.
    #[must_use]
    pub fn narrow(&self, window: usize) -> usize {
        window.saturating_sub(1)
    }

    #[must_use]
    pub fn should_retire(&self, size: usize, window: usize) -> bool {
        if size > self.max_size {
            return true;
        }
        window == 0 && size > self.hiwat
    }
}
