// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative cancellation.
//!
//! A flag on the task plus a "delivered" bit. The flag is only looked at
//! by suspension points, so a task that never suspends can't be cancelled.

use std::sync::atomic::{AtomicU8, Ordering};

const REQUESTED: u8 = 0b01;
const SURFACED: u8 = 0b10;

/// Per-task cancellation state.
#[derive(Debug, Default)]
pub struct CancelToken {
    flags: AtomicU8,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flags: AtomicU8::new(0),
        }
    }

    /// Set the cancellation flag. Idempotent.
    pub fn cancel(&self) {
        self.flags.fetch_or(REQUESTED, Ordering::AcqRel);
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flags.load(Ordering::Acquire) & REQUESTED != 0
    }

    /// True once the scheduler has been told about the request.
    pub fn is_surfaced(&self) -> bool {
        self.flags.load(Ordering::Acquire) & SURFACED != 0
    }

    /// Mark the request as surfaced. Returns true for the first caller only.
    pub(crate) fn surface(&self) -> bool {
        let prev = self.flags.fetch_or(SURFACED, Ordering::AcqRel);
        prev & SURFACED == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_then_surface_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(!token.is_surfaced());
        assert!(token.surface());
        assert!(!token.surface());
        assert!(token.is_surfaced());
    }
}
