//! # VM Budget Tracking
//!
//! The pool keeps an estimate of how many bytes of heap payload are resident
//! and compares it against a configurable cap. The cap feeds two policies:
//!
//! 1. The unfix path only unloads a clean persistent BAT when residency is
//!    high (or the BAT is large relative to the remaining headroom).
//! 2. The background trimmer shortens its sleep as residency approaches the
//!    cap.
//!
//! Tracked bytes are the `size` of every resident heap, registered on load
//! and released on unload. This over- or under-counts real RSS slightly;
//! the goal is steering eviction, not precise accounting.
//!
//! All counters use atomics for lock-free operation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use sysinfo::System;

/// Default budget as a fraction of system RAM.
const DEFAULT_BUDGET_PERCENT: usize = 25;

/// Floor applied to any configured cap (4MB).
const MIN_BUDGET_FLOOR: usize = 4 * 1024 * 1024;

static SYSTEM_TOTAL_MEMORY: OnceLock<usize> = OnceLock::new();

#[derive(Debug)]
pub struct VmBudget {
    limit: usize,
    used: AtomicUsize,
}

impl VmBudget {
    /// Derives a cap from total system memory.
    pub fn auto_detect() -> Self {
        let total = *SYSTEM_TOTAL_MEMORY.get_or_init(|| {
            let mut sys = System::new();
            sys.refresh_memory();
            sys.total_memory() as usize
        });
        Self::with_limit((total * DEFAULT_BUDGET_PERCENT) / 100)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: limit.max(MIN_BUDGET_FLOOR),
            used: AtomicUsize::new(0),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn headroom(&self) -> usize {
        self.limit.saturating_sub(self.used())
    }

    pub fn register(&self, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Saturating: dirty appends grow residency without being registered,
    /// so an unload may report more bytes than were registered at load.
    pub fn release(&self, bytes: usize) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    /// True when residency exceeds half the cap; the trimmer switches to its
    /// shortest sleep above this point.
    pub fn pressured(&self) -> bool {
        self.used() > self.limit / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_register_release_round_trip() {
        let budget = VmBudget::with_limit(64 * 1024 * 1024);
        assert_eq!(budget.used(), 0);

        budget.register(1024);
        budget.register(2048);
        assert_eq!(budget.used(), 3072);

        budget.release(1024);
        budget.release(2048);
        assert_eq!(budget.used(), 0);
        assert_eq!(budget.headroom(), budget.limit());
    }

    #[test]
    fn budget_enforces_floor() {
        let budget = VmBudget::with_limit(1);
        assert!(budget.limit() >= 4 * 1024 * 1024);
    }

    #[test]
    fn budget_pressure_threshold() {
        let budget = VmBudget::with_limit(8 * 1024 * 1024);
        assert!(!budget.pressured());
        budget.register(budget.limit() / 2 + 1);
        assert!(budget.pressured());
    }
}
