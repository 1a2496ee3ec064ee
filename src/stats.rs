//! Atomic observability counters shared by `admission` and `ddf` (§6).
//!
//! Kept as a small, dependency-free module in the style of the teacher's
//! other focused utility modules (`gcd.rs`, `ip_table.rs`).

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters for the admission queue. All increments are `Relaxed`: these are
/// diagnostic counters, not synchronization points.
#[derive(Debug, Default)]
pub struct AdmissionStats {
    pub queue_depth: AtomicI64,
    pub drops_full: AtomicU64,
    pub drops_inactive: AtomicU64,
    pub drops_no_from: AtomicU64,
    pub drops_duplicate: AtomicU64,
    pub drops_bad_signature: AtomicU64,
    pub accepts: AtomicU64,
    pub timeouts: AtomicU64,
    pub resets_sent: AtomicU64,
}

impl AdmissionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AdmissionStatsSnapshot {
        AdmissionStatsSnapshot {
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            drops_full: self.drops_full.load(Ordering::Relaxed),
            drops_inactive: self.drops_inactive.load(Ordering::Relaxed),
            drops_no_from: self.drops_no_from.load(Ordering::Relaxed),
            drops_duplicate: self.drops_duplicate.load(Ordering::Relaxed),
            drops_bad_signature: self.drops_bad_signature.load(Ordering::Relaxed),
            accepts: self.accepts.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            resets_sent: self.resets_sent.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`AdmissionStats`], cheap to log or assert on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdmissionStatsSnapshot {
    pub queue_depth: i64,
    pub drops_full: u64,
    pub drops_inactive: u64,
    pub drops_no_from: u64,
    pub drops_duplicate: u64,
    pub drops_bad_signature: u64,
    pub accepts: u64,
    pub timeouts: u64,
    pub resets_sent: u64,
}

impl fmt::Display for AdmissionStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "depth={} accepts={} timeouts={} resets={} drops(full={} inactive={} no_from={} duplicate={} bad_sig={})",
            self.queue_depth,
            self.accepts,
            self.timeouts,
            self.resets_sent,
            self.drops_full,
            self.drops_inactive,
            self.drops_no_from,
            self.drops_duplicate,
            self.drops_bad_signature,
        )
    }
}

impl fmt::Display for AdmissionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.snapshot(), f)
    }
}

/// Counters for the decaying duplicate filter.
#[derive(Debug, Default)]
pub struct DdfStats {
    pub current_duplicates: AtomicU64,
    pub rotations: AtomicU64,
}
