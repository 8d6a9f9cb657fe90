//! Generation counter for stale-response rejection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Value of a [`GenerationCounter`] captured when a read was issued.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Generation(pub u64);

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gen{}", self.0)
    }
}

/// Monotonic counter for one selection scope.
///
/// A completion may change caller-visible state only if the generation it
/// captured is still current. Once closed, nothing is current.
#[derive(Debug, Default)]
pub struct GenerationCounter {
    value: AtomicU64,
    closed: AtomicBool,
}

impl GenerationCounter {
    /// Create a counter at generation zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Current generation.
    #[must_use]
    pub fn current(&self) -> Generation {
        Generation(self.value.load(Ordering::Acquire))
    }

    /// Start a new scope and return its generation.
    pub fn advance(&self) -> Generation {
        Generation(self.value.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Returns true if `captured` may still be applied.
    #[must_use]
    pub fn is_current(&self, captured: Generation) -> bool {
        !self.closed.load(Ordering::Acquire) && self.current() == captured
    }

    /// Reject every completion from now on.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Returns true once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
