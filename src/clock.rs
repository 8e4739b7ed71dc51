//! The hybrid-logical-clock source — consumed through this narrow
//! interface rather than implemented here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait HybridLogicalClock: Send + Sync {
    /// A monotonic 64-bit tick.
    fn now(&self) -> u64;

    /// Encodes a tick the way it travels on the wire in the HLC header.
    fn encode_timestamp(&self, tick: u64) -> String;
}

/// A physical-time-seeded, logically-monotonic clock: the high bits are
/// wall-clock milliseconds, the low bits a counter that advances on ties
/// so concurrent calls on one node never observe the same tick twice.
pub struct MonotonicHlc {
    last: AtomicU64,
}

impl Default for MonotonicHlc {
    fn default() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }
}

impl MonotonicHlc {
    pub fn new() -> Self {
        Self::default()
    }

    fn physical_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl HybridLogicalClock for MonotonicHlc {
    fn now(&self) -> u64 {
        let physical = Self::physical_millis() << 16;
        loop {
            let prev = self.last.load(Ordering::Acquire);
            let next = if physical > prev { physical } else { prev + 1 };
            if self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return next;
            }
        }
    }

    fn encode_timestamp(&self, tick: u64) -> String {
        format!("{tick:x}")
    }
}
