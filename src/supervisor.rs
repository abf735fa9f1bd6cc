//! Tracks the global frontend count (hard cap), instantiates Frontend
//! Handlers on discovery events, coordinates start/stop across all of them.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub const MAX_FRONTENDS: usize = 8;

/// The one piece of state shared across frontend workers (§5): a live
/// counter, incremented on admit and decremented on close (the original
/// source never decrements, which this implementation treats as a bug to
/// fix rather than a contract to preserve, see Design Notes, "Global
/// frontend count").
pub struct Supervisor {
    frontend_count: AtomicUsize,
    next_id: AtomicU64,
}

impl Supervisor {
    pub fn new() -> Supervisor {
        Supervisor {
            frontend_count: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn frontend_count(&self) -> usize {
        self.frontend_count.load(Ordering::Acquire)
    }

    /// Admit a new frontend if under the cap. Returns the frontend id to
    /// use on success. Rejection is silent to the frontend but logged, per
    /// §3's Frontend Supervisor invariant.
    pub fn admit(&self) -> Option<u64> {
        loop {
            let current = self.frontend_count.load(Ordering::Acquire);
            if current >= MAX_FRONTENDS {
                log::warn!(
                    "refusing new frontend: {current} already connected (cap {MAX_FRONTENDS})"
                );
                return None;
            }
            if self
                .frontend_count
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                log::info!("admitted frontend {id} ({}/{MAX_FRONTENDS})", current + 1);
                return Some(id);
            }
        }
    }

    /// Record that a frontend has torn down. Must be called exactly once
    /// per successful `admit()`.
    pub fn release(&self) {
        let prev = self.frontend_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release() without a matching admit()");
    }
}

impl Default for Supervisor {
    fn default() -> Supervisor {
        Supervisor::new()
    }
}
